//! Per-job metric stores, keyed by job id and reference-counted by the
//! connections contributing to them.
//!
//! The refcount is the one true owner of an entry: the last `relax` stamps
//! the descriptor's end time, hands the store to the release callback (which
//! persists it as a dump file) and unlinks the entry. The callback runs with
//! the registry lock held and must not call back into the registry.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::job::JobDescriptor;
use crate::proxy::store::MetricArray;
use crate::util;

/// Invoked with the final descriptor and store when a job's last
/// contributor disconnects, and again for survivors at shutdown.
pub type ReleaseCallback = Box<dyn Fn(&JobDescriptor, &MetricArray) + Send + Sync>;

struct JobEntry {
    desc: JobDescriptor,
    refcount: u64,
    store: Arc<MetricArray>,
}

/// Registry of currently-active per-job stores.
pub struct JobRegistry {
    entries: Mutex<Vec<JobEntry>>,
    on_release: Option<ReleaseCallback>,
}

impl JobRegistry {
    /// Creates a registry; `on_release` persists stores of finished jobs.
    #[must_use]
    pub fn new(on_release: Option<ReleaseCallback>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            on_release,
        }
    }

    /// Finds or creates the entry for the descriptor's job and takes a
    /// reference on it. Returns `None` for an empty job id (unaffiliated
    /// processes get no per-job storage).
    #[must_use]
    pub fn acquire(&self, desc: &JobDescriptor) -> Option<Arc<MetricArray>> {
        if desc.jobid.is_empty() {
            return None;
        }

        let mut entries = self.entries.lock();
        if let Some(ent) = entries.iter_mut().find(|e| e.desc.jobid == desc.jobid) {
            ent.refcount += 1;
            debug!(jobid = %desc.jobid, refcount = ent.refcount, "joining existing job");
            return Some(Arc::clone(&ent.store));
        }

        debug!(jobid = %desc.jobid, "new job entry");
        let store = Arc::new(MetricArray::new());
        entries.push(JobEntry {
            desc: desc.clone(),
            refcount: 1,
            store: Arc::clone(&store),
        });
        Some(store)
    }

    /// Drops one reference on a job. On the last one the entry is persisted
    /// through the release callback and removed. Returns `false` when the
    /// job id is unknown.
    pub fn relax(&self, jobid: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(idx) = entries.iter().position(|e| e.desc.jobid == jobid) else {
            return false;
        };

        entries[idx].refcount -= 1;
        debug!(jobid, refcount = entries[idx].refcount, "leaving job");
        if entries[idx].refcount > 0 {
            return true;
        }

        debug!(jobid, "last contributor gone, releasing job");
        let mut ent = entries.remove(idx);
        ent.desc.end_time = util::unix_time();
        if let Some(cb) = &self.on_release {
            cb(&ent.desc, &ent.store);
        }
        true
    }

    /// Number of live per-job entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no job is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Shutdown path: persists and removes every surviving entry regardless
    /// of its refcount.
    pub fn drain(&self) {
        let mut entries = self.entries.lock();
        for mut ent in entries.drain(..) {
            ent.desc.end_time = util::unix_time();
            if let Some(cb) = &self.on_release {
                cb(&ent.desc, &ent.store);
            }
        }
    }
}
