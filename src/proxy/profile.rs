//! Per-job profile consolidation.
//!
//! The release callback drops `*.taumetric` dump files in the profile root
//! (the inbox). A single leader instance folds them into long-lived
//! `profiles/<first char>/<jobid>.profile` files, so successive invocations
//! of the same job accumulate into one profile. Leadership over a profile
//! directory is mediated by a `lock` file carrying `hostname:pid`; a lock
//! younger than two minutes that belongs to someone else is respected, an
//! older one is taken over.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use dashmap::DashSet;
use tracing::{debug, error, info, warn};

use crate::error::ProxyError;
use crate::job::JobDescriptor;
use crate::proxy::dump::{self, MetricDump};
use crate::proxy::store::MetricArray;
use crate::util;
use crate::ProxyResult;

/// A foreign lock younger than this is considered live.
pub const LOCK_STALE_SECS: u64 = 120;

/// How often the leader sweeps the inbox.
const SCAN_INTERVAL: Duration = Duration::from_secs(3);

/// Extension of inbox dump files.
pub const INBOX_EXT: &str = "taumetric";

/// Extension of consolidated profile files.
pub const PROFILE_EXT: &str = "profile";

const COMMAND_CAP: usize = 511;

/*************
 * LOCK FILE *
 *************/

fn lock_identity() -> String {
    format!("{}:{}", util::hostname(), util::pid())
}

fn lock_path(root: &Path) -> PathBuf {
    root.join("lock")
}

#[derive(Debug, PartialEq, Eq)]
enum LockState {
    Ours,
    Foreign,
    Stale,
    Absent,
}

fn classify_lock(existing: Option<(&str, u64)>, ours: &str) -> LockState {
    match existing {
        None => LockState::Absent,
        Some((owner, _)) if owner == ours => LockState::Ours,
        Some((_, age)) if age < LOCK_STALE_SECS => LockState::Foreign,
        Some(_) => LockState::Stale,
    }
}

fn lock_age_secs(path: &Path) -> u64 {
    // An unreadable mtime counts as fresh, which errs on the safe side.
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .map_or(0, |d| d.as_secs())
}

/// Verifies or takes the single-writer lock for `root`.
///
/// Our own lock gets its mtime refreshed; an absent or stale lock is taken;
/// a live foreign lock is an error.
///
/// # Errors
/// `LockHeld` when another process owns a fresh lock; I/O errors otherwise.
pub fn check_lock(root: &Path) -> ProxyResult<()> {
    let path = lock_path(root);
    let ours = lock_identity();

    let existing = fs::read_to_string(&path)
        .ok()
        .map(|c| c.trim().to_string());
    let state = classify_lock(
        existing.as_deref().map(|owner| (owner, lock_age_secs(&path))),
        &ours,
    );

    match state {
        LockState::Foreign => Err(ProxyError::LockHeld {
            owner: existing.unwrap_or_default(),
        }),
        LockState::Ours | LockState::Stale | LockState::Absent => {
            // Rewriting also bumps the mtime for the next check.
            fs::write(&path, format!("{ours}\n"))?;
            Ok(())
        }
    }
}

/// Removes the lock file on orderly shutdown.
pub fn release_lock(root: &Path) {
    let path = lock_path(root);
    if path.is_file() {
        debug!(path = %path.display(), "removing lock file");
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "could not remove lock file");
        }
    }
}

/*********
 * INBOX *
 *********/

/// Path of the inbox dump for one job instance on this node.
#[must_use]
pub fn inbox_dump_path(root: &Path, desc: &JobDescriptor) -> PathBuf {
    root.join(format!(
        "{}-{}.{}.{INBOX_EXT}",
        desc.jobid,
        util::hostname(),
        util::pid()
    ))
}

/// Persists a released per-job store as an inbox dump file.
///
/// # Errors
/// Propagates I/O errors; the caller logs and the data is lost for this
/// instance only (the long-lived profile is untouched).
pub fn write_job_dump(root: &Path, desc: &JobDescriptor, store: &MetricArray) -> ProxyResult<()> {
    let path = inbox_dump_path(root, desc);
    debug!(jobid = %desc.jobid, path = %path.display(), "storing per-job metrics");
    dump::save(&path, desc, store)
}

/*****************
 * PROFILE STORE *
 *****************/

/// Residency tracker plus fold logic for the profile directory tree.
pub struct ProfileStore {
    root: PathBuf,
    profiles_dir: PathBuf,
    known: DashSet<String>,
}

impl ProfileStore {
    /// Opens (creating as needed) the profile tree under `root` and records
    /// which job ids already have a profile on disk.
    ///
    /// # Errors
    /// Propagates directory creation and scan I/O errors.
    pub fn open(root: &Path) -> ProxyResult<Self> {
        let profiles_dir = root.join("profiles");
        fs::create_dir_all(&profiles_dir)?;

        let store = Self {
            root: root.to_path_buf(),
            profiles_dir,
            known: DashSet::new(),
        };
        store.scan()?;
        Ok(store)
    }

    /// Root directory (also the inbox).
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a consolidated profile is known for `jobid`.
    #[must_use]
    pub fn contains(&self, jobid: &str) -> bool {
        self.known.contains(jobid)
    }

    fn scan(&self) -> ProxyResult<()> {
        debug!(dir = %self.profiles_dir.display(), "looking for existing profiles");
        scan_tree(&self.profiles_dir, 0, &mut |path| {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                debug!(jobid = stem, "scanned profile");
                self.known.insert(stem.to_string());
            }
        })?;
        Ok(())
    }

    /// Path of the consolidated profile for `jobid`, creating the shard
    /// directory if needed.
    ///
    /// # Errors
    /// Fails on an empty job id or shard directory creation failure.
    pub fn profile_path(&self, jobid: &str) -> ProxyResult<PathBuf> {
        let shard = jobid
            .chars()
            .next()
            .ok_or_else(|| ProxyError::from("empty jobid has no profile path"))?;
        let dir = self.profiles_dir.join(shard.to_string());
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{jobid}.{PROFILE_EXT}")))
    }

    /// Sweeps the inbox once, folding every complete dump into its profile.
    /// Returns how many dumps were consumed.
    pub fn consolidate(&self) -> usize {
        let started = Instant::now();
        let mut consumed = 0_usize;

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                error!(dir = %self.root.display(), error = %e, "cannot scan inbox");
                return 0;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_dump = entry.file_type().map_or(false, |t| t.is_file())
                && path.extension().is_some_and(|e| e == INBOX_EXT);
            if !is_dump {
                continue;
            }

            debug!(path = %path.display(), "processing inbox dump");
            match self.fold_dump(&path) {
                Ok(()) => {
                    // Fully merged; the inbox copy is no longer needed.
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "could not unlink merged dump");
                    }
                    consumed += 1;
                }
                Err(e) => {
                    // Likely still being written; leave it for the next tick.
                    debug!(path = %path.display(), error = %e, "leaving dump in place");
                }
            }
        }

        if consumed > 0 {
            info!(
                consumed,
                elapsed_secs = started.elapsed().as_secs_f64(),
                "aggregated inbox dumps"
            );
        }
        consumed
    }

    fn fold_dump(&self, dump_path: &Path) -> ProxyResult<()> {
        let new_dump = MetricDump::load(dump_path)?;
        let jobid = new_dump.desc.jobid.clone();
        let profile_path = self.profile_path(&jobid)?;

        if !self.known.contains(&jobid) {
            // First sighting of this job: the dump becomes the profile.
            new_dump.save(&profile_path)?;
            self.known.insert(jobid.clone());
            info!(jobid = %jobid, path = %profile_path.display(), "storing new job profile");
            return Ok(());
        }

        let profile = match MetricDump::load(&profile_path) {
            Ok(profile) => profile,
            Err(e) => {
                // The residency marker lied or the file rotted; forget it so
                // the next dump recreates the profile from scratch.
                error!(jobid = %jobid, error = %e, "removing apparently corrupted profile");
                self.known.remove(&jobid);
                if profile_path.is_file() {
                    let _ = fs::remove_file(&profile_path);
                }
                return Err(ProxyError::from(format!("corrupt profile for {jobid}")));
            }
        };

        // Fold both captures into a scratch store, oldest first.
        let fold = MetricArray::new();
        profile.apply(&fold);
        new_dump.apply(&fold);

        let desc = merge_descriptors(&profile.desc, &new_dump.desc);
        dump::save(&profile_path, &desc, &fold)?;
        debug!(jobid = %jobid, "profile consolidated");
        Ok(())
    }
}

fn merge_descriptors(profile: &JobDescriptor, fresh: &JobDescriptor) -> JobDescriptor {
    let mut merged = profile.clone();

    // Keep one command per distinct binary (MPMD runs show up as "a : b").
    if !profile.command.contains(&fresh.command) {
        let mut command = format!("{} : {}", profile.command, fresh.command);
        while command.len() > COMMAND_CAP {
            command.pop();
        }
        merged.command = command;
    }

    merged.start_time = profile.start_time.min(fresh.start_time);
    merged.end_time = profile.end_time.max(fresh.end_time);
    merged
}

fn scan_tree(dir: &Path, depth: u8, found: &mut impl FnMut(&Path)) -> std::io::Result<()> {
    if depth > 3 {
        return Ok(());
    }
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let ftype = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if ftype.is_dir() {
            scan_tree(&path, depth + 1, found)?;
        } else if ftype.is_file() && path.extension().is_some_and(|e| e == PROFILE_EXT) {
            found(&path);
        }
    }
    Ok(())
}

/*****************
 * MERGER THREAD *
 *****************/

/// Background consolidation thread run by leader instances.
pub struct Merger {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl Merger {
    /// Starts the merger loop: verify/refresh the lock, sweep the inbox,
    /// sleep up to the scan interval (leaving early on shutdown).
    #[must_use]
    pub fn start(store: Arc<ProfileStore>) -> Self {
        let (shutdown, rx) = bounded::<()>(1);
        let handle = std::thread::spawn(move || loop {
            match check_lock(store.root()) {
                Ok(()) => {
                    store.consolidate();
                }
                Err(e) => {
                    // Someone took over a lock we let go stale; hold off
                    // rather than fight over the profile files.
                    warn!(error = %e, "skipping consolidation tick");
                }
            }

            match rx.recv_timeout(SCAN_INTERVAL) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        Self { shutdown, handle }
    }

    /// Stops the loop and waits for it.
    pub fn stop(self) {
        let _ = self.shutdown.send(());
        if self.handle.join().is_err() {
            error!("merger thread panicked");
        }
    }
}
