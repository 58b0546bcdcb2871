//! On-disk dump files: the complete metric set of one job at one point in
//! time.
//!
//! Layout: a fixed-size header (snapshot count plus the job descriptor),
//! `count` snapshot records, then a trailer canary. The trailer is what lets
//! the consolidator tell a finished dump from one still being written.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::ProxyError;
use crate::job::{JobDescriptor, JOB_DESC_WIRE_SIZE};
use crate::proxy::store::{Metric, MetricArray, Registered};
use crate::wire::{slice4, MetricSnapshot};
use crate::ProxyResult;

/// Width of the dump header (count, padding, job descriptor).
pub const DUMP_HEADER_SIZE: usize = 8 + JOB_DESC_WIRE_SIZE;

/// Trailer canary closing a complete dump file.
pub const DUMP_CANARY: i32 = 0x77;

// A dump never legitimately reaches this; a larger count means the header
// bytes are garbage.
const MAX_SNAPSHOTS: i32 = 1 << 20;

/// A parsed dump file.
#[derive(Debug, Clone)]
pub struct MetricDump {
    /// Descriptor of the job the dump belongs to.
    pub desc: JobDescriptor,
    /// Captured metrics, one record each.
    pub snapshots: Vec<MetricSnapshot>,
}

impl MetricDump {
    /// Loads and validates a dump file.
    ///
    /// # Errors
    /// Short reads, a bad trailer canary and bad per-snapshot canaries all
    /// fail fast; callers treat a failure as "possibly still being written".
    pub fn load(path: &Path) -> ProxyResult<Self> {
        let mut r = BufReader::new(File::open(path)?);

        let mut header = [0_u8; DUMP_HEADER_SIZE];
        r.read_exact(&mut header)?;
        let count = i32::from_ne_bytes(slice4(&header[0..4]));
        if !(0..MAX_SNAPSHOTS).contains(&count) {
            return Err(ProxyError::from(format!("implausible snapshot count {count}")));
        }
        let desc = JobDescriptor::read_from(&mut &header[8..])?;

        debug!(path = %path.display(), count, "reading dump");

        #[allow(clippy::cast_sign_loss)]
        let mut snapshots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            snapshots.push(MetricSnapshot::read_from(&mut r)?);
        }

        let mut trailer = [0_u8; 4];
        r.read_exact(&mut trailer)?;
        let canary = i32::from_ne_bytes(trailer);
        if canary != DUMP_CANARY {
            return Err(ProxyError::BadCanary {
                context: "dump trailer",
                found: i64::from(canary),
            });
        }

        Ok(Self { desc, snapshots })
    }

    /// Writes this dump verbatim to `path`.
    ///
    /// # Errors
    /// Propagates I/O errors; the file may be left incomplete (no trailer),
    /// which readers detect.
    pub fn save(&self, path: &Path) -> ProxyResult<()> {
        let mut w = BufWriter::new(File::create(path)?);
        write_header(&mut w, &self.desc, self.snapshots.len())?;
        for snap in &self.snapshots {
            snap.write_to(&mut w)?;
        }
        w.write_all(&DUMP_CANARY.to_ne_bytes())?;
        w.flush()?;
        Ok(())
    }

    /// Folds every snapshot into `store`: existing metrics are updated with
    /// the snapshot value (counters add, gauges fold), missing ones are
    /// created seeded with it.
    pub fn apply(&self, store: &MetricArray) {
        for snap in &self.snapshots {
            match store.get(&snap.event.name) {
                Some(metric) => metric.update(&snap.event),
                None => {
                    let fresh = Arc::new(Metric::from_snapshot(snap));
                    if store.register(fresh) == Registered::AlreadyPresent {
                        // Lost a race with another writer; fold instead.
                        if let Some(metric) = store.get(&snap.event.name) {
                            metric.update(&snap.event);
                        }
                    }
                }
            }
        }
    }
}

/// Captures `store` and writes it as a dump file for `desc`'s job.
///
/// # Errors
/// Propagates I/O errors; callers keep the source data for a later retry.
pub fn save(path: &Path, desc: &JobDescriptor, store: &MetricArray) -> ProxyResult<()> {
    let snapshots = store.snapshots();
    debug!(path = %path.display(), count = snapshots.len(), "saving dump");
    MetricDump {
        desc: desc.clone(),
        snapshots,
    }
    .save(path)
}

fn write_header(w: &mut impl Write, desc: &JobDescriptor, count: usize) -> std::io::Result<()> {
    let mut header = [0_u8; DUMP_HEADER_SIZE];
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    header[0..4].copy_from_slice(&(count as i32).to_ne_bytes());
    header[8..].copy_from_slice(&desc.encode());
    w.write_all(&header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::store::MetricValue;
    use crate::wire::{MetricDescriptor, MetricEvent, MetricKind};

    fn sample_store() -> MetricArray {
        let store = MetricArray::new();
        store
            .register_or_verify(&MetricDescriptor {
                name: "requests_total".to_string(),
                doc: "Total requests".to_string(),
                kind: MetricKind::Counter,
            })
            .unwrap();
        store
            .register_or_verify(&MetricDescriptor {
                name: "temp".to_string(),
                doc: "Temperature".to_string(),
                kind: MetricKind::Gauge,
            })
            .unwrap();
        store
            .update(&MetricEvent {
                name: "requests_total".to_string(),
                value: 8.0,
                update_ts: 0.0,
            })
            .unwrap();
        store
            .update(&MetricEvent {
                name: "temp".to_string(),
                value: 10.0,
                update_ts: 0.0,
            })
            .unwrap();
        store
    }

    fn sample_desc() -> JobDescriptor {
        JobDescriptor {
            jobid: "J1".to_string(),
            command: "./app".to_string(),
            ..JobDescriptor::default()
        }
    }

    #[test]
    fn save_load_apply_roundtrips_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("J1-host.1.taumetric");

        save(&path, &sample_desc(), &sample_store()).unwrap();
        let dump = MetricDump::load(&path).unwrap();
        assert_eq!(dump.desc.jobid, "J1");
        assert_eq!(dump.snapshots.len(), 2);

        let fresh = MetricArray::new();
        dump.apply(&fresh);

        assert_eq!(
            fresh.get("requests_total").unwrap().cell().value,
            MetricValue::Counter { value: 8.0 }
        );
        // The gauge is reseeded with its captured average.
        match fresh.get("temp").unwrap().cell().value {
            MetricValue::Gauge { avg, .. } => assert_eq!(avg, 5.0),
            MetricValue::Counter { .. } => panic!("wrong kind"),
        }
    }

    #[test]
    fn applying_to_populated_store_accumulates_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("J1-host.1.taumetric");
        save(&path, &sample_desc(), &sample_store()).unwrap();

        let dump = MetricDump::load(&path).unwrap();
        let store = MetricArray::new();
        dump.apply(&store);
        dump.apply(&store);

        assert_eq!(
            store.get("requests_total").unwrap().cell().value,
            MetricValue::Counter { value: 16.0 }
        );
    }

    #[test]
    fn truncated_dump_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half.taumetric");
        save(&path, &sample_desc(), &sample_store()).unwrap();

        let full = std::fs::read(&path).unwrap();
        // Drop the trailer and part of the last snapshot.
        std::fs::write(&path, &full[..full.len() - 40]).unwrap();
        assert!(MetricDump::load(&path).is_err());
    }

    #[test]
    fn bad_trailer_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.taumetric");
        save(&path, &sample_desc(), &sample_store()).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n - 4..].copy_from_slice(&0x55_i32.to_ne_bytes());
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            MetricDump::load(&path),
            Err(ProxyError::BadCanary { context: "dump trailer", .. })
        ));
    }

    #[test]
    fn empty_store_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.taumetric");
        save(&path, &sample_desc(), &MetricArray::new()).unwrap();
        let dump = MetricDump::load(&path).unwrap();
        assert!(dump.snapshots.is_empty());
    }
}
