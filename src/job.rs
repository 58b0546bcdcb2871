//! Job identity: who is pushing metrics and which batch job they belong to.
//!
//! A connection announces its job with one fixed-size descriptor record sent
//! right after the `JobDescription` envelope. An empty `jobid` means the
//! process is not affiliated with any batch job and per-job storage is
//! skipped for that connection.

use std::io::{Read, Write};

use crate::util;
use crate::wire::{get_str, put_str, slice4, slice8};
use crate::ProxyResult;

/// Width of the fixed-size job descriptor record.
pub const JOB_DESC_WIRE_SIZE: usize = 1112;

const JOBID_SIZE: usize = 64;
const COMMAND_SIZE: usize = 512;
const NODELIST_SIZE: usize = 128;
const PARTITION_SIZE: usize = 64;
const CLUSTER_SIZE: usize = 64;
const RUN_DIR_SIZE: usize = 256;

/// Per-connection identity record, discovered from the batch environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Batch job id (with step suffix when present); empty when unaffiliated.
    pub jobid: String,
    /// Command line of the instrumented program.
    pub command: String,
    /// Task count of the job; -1 when unknown.
    pub size: i32,
    /// Node list as reported by the scheduler.
    pub nodelist: String,
    /// Scheduler partition.
    pub partition: String,
    /// Cluster name.
    pub cluster: String,
    /// Submission or working directory.
    pub run_dir: String,
    /// First time this job was seen, unix seconds.
    pub start_time: u64,
    /// Last time this job was seen, unix seconds.
    pub end_time: u64,
}

impl Default for JobDescriptor {
    fn default() -> Self {
        Self {
            jobid: String::new(),
            command: String::new(),
            size: -1,
            nodelist: String::new(),
            partition: String::new(),
            cluster: String::new(),
            run_dir: String::new(),
            start_time: 0,
            end_time: 0,
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl JobDescriptor {
    /// Builds a descriptor from the batch scheduler environment.
    ///
    /// The job id comes from `SLURM_JOBID` or `PMIX_ID` with `SLURM_STEP_ID`
    /// appended as `JOBID-STEPID`; a `.rank` suffix is stripped. The command
    /// line comes from `TAU_LAUNCHER_TARGET_CMD` or `/proc/self/cmdline`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut jobid = env_nonempty("SLURM_JOBID")
            .or_else(|| env_nonempty("PMIX_ID"))
            .unwrap_or_default();

        if let Some(step) = env_nonempty("SLURM_STEP_ID") {
            jobid = format!("{jobid}-{step}");
        }

        // PMIx encodes the rank as a suffix of the job id.
        if let Some(dot) = jobid.find('.') {
            jobid.truncate(dot);
        }

        let size = env_nonempty("SLURM_NTASKS")
            .or_else(|| env_nonempty("OMPI_COMM_WORLD_SIZE"))
            .map_or(-1, |v| v.trim().parse().unwrap_or(0));

        let run_dir = env_nonempty("SLURM_SUBMIT_DIR").unwrap_or_else(|| {
            std::env::current_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

        let command = env_nonempty("TAU_LAUNCHER_TARGET_CMD")
            .unwrap_or_else(command_line_from_proc);

        let now = util::unix_time();

        Self {
            jobid,
            command,
            size,
            nodelist: env_nonempty("SLURM_JOB_NODELIST").unwrap_or_default(),
            partition: env_nonempty("SLURM_JOB_PARTITION").unwrap_or_default(),
            cluster: env_nonempty("SLURM_CLUSTER_NAME").unwrap_or_default(),
            run_dir,
            start_time: now,
            end_time: now,
        }
    }

    /// Encodes the descriptor into one fixed-size record.
    #[must_use]
    pub fn encode(&self) -> [u8; JOB_DESC_WIRE_SIZE] {
        let mut buf = [0_u8; JOB_DESC_WIRE_SIZE];
        put_str(&mut buf[0..64], &self.jobid);
        put_str(&mut buf[64..576], &self.command);
        buf[576..580].copy_from_slice(&self.size.to_ne_bytes());
        put_str(&mut buf[580..708], &self.nodelist);
        put_str(&mut buf[708..772], &self.partition);
        put_str(&mut buf[772..836], &self.cluster);
        put_str(&mut buf[836..1092], &self.run_dir);
        buf[1096..1104].copy_from_slice(&self.start_time.to_ne_bytes());
        buf[1104..1112].copy_from_slice(&self.end_time.to_ne_bytes());
        buf
    }

    /// Writes the encoded record to `w`.
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(&self.encode())
    }

    /// Reads one descriptor record from `r`.
    ///
    /// # Errors
    /// Fails on a short read.
    pub fn read_from(r: &mut impl Read) -> ProxyResult<Self> {
        let mut buf = [0_u8; JOB_DESC_WIRE_SIZE];
        r.read_exact(&mut buf)?;
        Ok(Self {
            jobid: get_str(&buf[0..64]),
            command: get_str(&buf[64..576]),
            size: i32::from_ne_bytes(slice4(&buf[576..580])),
            nodelist: get_str(&buf[580..708]),
            partition: get_str(&buf[708..772]),
            cluster: get_str(&buf[772..836]),
            run_dir: get_str(&buf[836..1092]),
            start_time: u64::from_ne_bytes(slice8(&buf[1096..1104])),
            end_time: u64::from_ne_bytes(slice8(&buf[1104..1112])),
        })
    }
}

/// Recovers the command line of this process, NULs rewritten to spaces.
fn command_line_from_proc() -> String {
    let raw = std::fs::read("/proc/self/cmdline").unwrap_or_default();
    let text: String = raw
        .iter()
        .map(|&b| if b == 0 { ' ' } else { char::from(b) })
        .collect();
    text.trim_end().to_string()
}
