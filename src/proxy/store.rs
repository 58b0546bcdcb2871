//! In-memory metric storage: a fixed-width bucketed map from metric name to
//! metric cell.
//!
//! Lock order is bucket lock → cell lock; two bucket locks are never held at
//! once. Buckets only ever grow at runtime (registration prepends, removal
//! happens only when a whole store is dropped), which keeps iteration simple.

use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::error::ProxyError;
use crate::util;
use crate::wire::{MetricDescriptor, MetricEvent, MetricKind, MetricSnapshot};
use crate::ProxyResult;

/// Number of buckets per store.
pub const METRIC_BUCKETS: usize = 1024;

/// Mutable state of one metric, guarded by the cell lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricCell {
    /// Wall-clock seconds of the last applied update.
    pub last_update: f64,
    /// Type-specific accumulator.
    pub value: MetricValue,
}

/// Accumulator for one metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    /// Additive total of all contributed deltas.
    Counter {
        /// Accumulated value.
        value: f64,
    },
    /// Folded gauge observations.
    Gauge {
        /// Smallest nonzero observation so far.
        min: f64,
        /// Largest observation so far.
        max: f64,
        /// Rolling average, each new sample weighted one half.
        avg: f64,
    },
}

impl MetricValue {
    const fn zero(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter { value: 0.0 },
            MetricKind::Gauge => Self::Gauge {
                min: 0.0,
                max: 0.0,
                avg: 0.0,
            },
        }
    }

    /// The scalar reported for this metric: counter total or gauge average.
    #[must_use]
    pub const fn scalar(&self) -> f64 {
        match self {
            Self::Counter { value } => *value,
            Self::Gauge { avg, .. } => *avg,
        }
    }
}

/// One registered metric: immutable identity plus a locked cell.
#[derive(Debug)]
pub struct Metric {
    name: String,
    doc: String,
    kind: MetricKind,
    cell: Mutex<MetricCell>,
}

impl Metric {
    /// Creates a zeroed metric from a registration descriptor.
    #[must_use]
    pub fn new(desc: &MetricDescriptor) -> Self {
        Self {
            name: desc.name.clone(),
            doc: desc.doc.clone(),
            kind: desc.kind,
            cell: Mutex::new(MetricCell {
                last_update: 0.0,
                value: MetricValue::zero(desc.kind),
            }),
        }
    }

    /// Rebuilds a metric from a snapshot, seeding the accumulator with the
    /// captured scalar (counter total, or gauge average with min/max unset).
    #[must_use]
    pub fn from_snapshot(snap: &MetricSnapshot) -> Self {
        let value = match snap.kind {
            MetricKind::Counter => MetricValue::Counter {
                value: snap.event.value,
            },
            MetricKind::Gauge => MetricValue::Gauge {
                min: 0.0,
                max: 0.0,
                avg: snap.event.value,
            },
        };
        Self {
            name: snap.event.name.clone(),
            doc: snap.doc.clone(),
            kind: snap.kind,
            cell: Mutex::new(MetricCell {
                last_update: 0.0,
                value,
            }),
        }
    }

    /// Metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Documentation line set at registration.
    #[must_use]
    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// Metric kind, immutable once registered.
    #[must_use]
    pub const fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Applies one observation under the cell lock.
    ///
    /// Counters accumulate the delta. Gauges fold: min/max treat zero as
    /// unset, the average halves towards the new sample.
    pub fn update(&self, event: &MetricEvent) {
        let mut cell = self.cell.lock();
        cell.last_update = util::now_ts();
        match cell.value {
            MetricValue::Counter { ref mut value } => *value += event.value,
            MetricValue::Gauge {
                ref mut min,
                ref mut max,
                ref mut avg,
            } => {
                *avg = (*avg + event.value) / 2.0;
                if *min == 0.0 || event.value < *min {
                    *min = event.value;
                }
                if *max == 0.0 || *max < event.value {
                    *max = event.value;
                }
            }
        }
    }

    /// Copies the current cell state.
    #[must_use]
    pub fn cell(&self) -> MetricCell {
        *self.cell.lock()
    }

    /// Captures the current point value as a snapshot record.
    #[must_use]
    pub fn snapshot(&self) -> MetricSnapshot {
        let cell = self.cell.lock();
        MetricSnapshot {
            kind: self.kind,
            doc: self.doc.clone(),
            event: MetricEvent {
                name: self.name.clone(),
                value: cell.value.scalar(),
                update_ts: cell.last_update,
            },
        }
    }
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    /// The metric was not present and has been inserted.
    Inserted,
    /// A metric of that name already exists; nothing was mutated.
    AlreadyPresent,
}

/// Bucketed map from metric name to metric, with per-bucket locks.
pub struct MetricArray {
    buckets: Vec<Mutex<Vec<Arc<Metric>>>>,
}

impl Default for MetricArray {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricArray {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(METRIC_BUCKETS);
        buckets.resize_with(METRIC_BUCKETS, || Mutex::new(Vec::new()));
        Self { buckets }
    }

    fn bucket(&self, name: &str) -> &Mutex<Vec<Arc<Metric>>> {
        #[allow(clippy::cast_possible_truncation)]
        let idx = (util::string_hash(name) % METRIC_BUCKETS as u64) as usize;
        &self.buckets[idx]
    }

    /// Looks a metric up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Metric>> {
        self.bucket(name)
            .lock()
            .iter()
            .find(|m| m.name() == name)
            .cloned()
    }

    /// Registers a metric unless one of that name already exists.
    pub fn register(&self, metric: Arc<Metric>) -> Registered {
        let mut bucket = self.bucket(metric.name()).lock();
        if bucket.iter().any(|m| m.name() == metric.name()) {
            return Registered::AlreadyPresent;
        }
        // Prepend, matching the append-only-at-the-head discipline.
        bucket.insert(0, metric);
        Registered::Inserted
    }

    /// Registers the metric described by `desc` or finds the existing one,
    /// verifying the kind matches.
    ///
    /// # Errors
    /// `TypeMismatch` when a metric of that name exists with another kind;
    /// the caller disconnects the offending client.
    pub fn register_or_verify(&self, desc: &MetricDescriptor) -> ProxyResult<Arc<Metric>> {
        let existing = match self.get(&desc.name) {
            Some(m) => m,
            None => {
                let fresh = Arc::new(Metric::new(desc));
                match self.register(Arc::clone(&fresh)) {
                    Registered::Inserted => fresh,
                    // Lost the registration race; take the winner.
                    Registered::AlreadyPresent => self
                        .get(&desc.name)
                        .ok_or_else(|| ProxyError::UnknownMetric(desc.name.clone()))?,
                }
            }
        };

        if existing.kind() != desc.kind {
            error!(metric = %desc.name, "mismatching types on re-registration");
            return Err(ProxyError::TypeMismatch(desc.name.clone()));
        }

        Ok(existing)
    }

    /// Applies an observation to the named metric.
    ///
    /// # Errors
    /// `UnknownMetric` when no metric of that name was registered; the
    /// caller disconnects the offending client.
    pub fn update(&self, event: &MetricEvent) -> ProxyResult<()> {
        let metric = self
            .get(&event.name)
            .ok_or_else(|| ProxyError::UnknownMetric(event.name.clone()))?;
        metric.update(event);
        Ok(())
    }

    /// Visits every metric, bucket by bucket, under the bucket lock.
    ///
    /// A `Break` from the visitor ends the current bucket's chain only; the
    /// remaining buckets are still visited. The query reply writers rely on
    /// this to stop after their announced element count.
    pub fn visit(&self, mut visitor: impl FnMut(&Metric) -> ControlFlow<()>) {
        for bucket in &self.buckets {
            let guard = bucket.lock();
            for metric in guard.iter() {
                if visitor(metric).is_break() {
                    break;
                }
            }
        }
    }

    /// Number of metrics currently registered.
    #[must_use]
    pub fn count(&self) -> usize {
        let mut n = 0;
        self.visit(|_| {
            n += 1;
            ControlFlow::Continue(())
        });
        n
    }

    /// Captures a snapshot of every metric, taken bucket-atomically.
    #[must_use]
    pub fn snapshots(&self) -> Vec<MetricSnapshot> {
        let mut out = Vec::new();
        self.visit(|m| {
            out.push(m.snapshot());
            ControlFlow::Continue(())
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_desc(name: &str) -> MetricDescriptor {
        MetricDescriptor {
            name: name.to_string(),
            doc: format!("{name} docs"),
            kind: MetricKind::Counter,
        }
    }

    fn gauge_desc(name: &str) -> MetricDescriptor {
        MetricDescriptor {
            name: name.to_string(),
            doc: format!("{name} docs"),
            kind: MetricKind::Gauge,
        }
    }

    fn event(name: &str, value: f64) -> MetricEvent {
        MetricEvent {
            name: name.to_string(),
            value,
            update_ts: 0.0,
        }
    }

    #[test]
    fn counter_accumulates_deltas() {
        let store = MetricArray::new();
        store.register_or_verify(&counter_desc("requests_total")).unwrap();
        store.update(&event("requests_total", 5.0)).unwrap();
        store.update(&event("requests_total", 3.0)).unwrap();

        let cell = store.get("requests_total").unwrap().cell();
        assert_eq!(cell.value, MetricValue::Counter { value: 8.0 });
        assert!(cell.last_update > 0.0);
    }

    #[test]
    fn gauge_folds_min_max_and_rolling_average() {
        let store = MetricArray::new();
        store.register_or_verify(&gauge_desc("temp")).unwrap();
        for v in [10.0, 20.0, 30.0] {
            store.update(&event("temp", v)).unwrap();
        }

        let cell = store.get("temp").unwrap().cell();
        // avg starts at 0 and halves towards each sample:
        // (0+10)/2 = 5, (5+20)/2 = 12.5, (12.5+30)/2 = 21.25.
        assert_eq!(
            cell.value,
            MetricValue::Gauge {
                min: 10.0,
                max: 30.0,
                avg: 21.25,
            }
        );
    }

    #[test]
    fn gauge_min_treats_zero_as_unset() {
        let store = MetricArray::new();
        store.register_or_verify(&gauge_desc("depth")).unwrap();
        store.update(&event("depth", 40.0)).unwrap();
        store.update(&event("depth", 7.0)).unwrap();

        match store.get("depth").unwrap().cell().value {
            MetricValue::Gauge { min, max, .. } => {
                assert_eq!(min, 7.0);
                assert_eq!(max, 40.0);
            }
            MetricValue::Counter { .. } => panic!("wrong kind"),
        }
    }

    #[test]
    fn double_registration_is_idempotent() {
        let store = MetricArray::new();
        let desc = counter_desc("ops");
        store.register_or_verify(&desc).unwrap();
        store.update(&event("ops", 2.0)).unwrap();

        // Second registration with matching kind leaves the cell alone.
        let again = store.register_or_verify(&desc).unwrap();
        assert_eq!(again.cell().value, MetricValue::Counter { value: 2.0 });
        assert_eq!(store.count(), 1);

        let raced = store.register(Arc::new(Metric::new(&desc)));
        assert_eq!(raced, Registered::AlreadyPresent);
    }

    #[test]
    fn re_registration_with_other_kind_is_rejected() {
        let store = MetricArray::new();
        store.register_or_verify(&counter_desc("x")).unwrap();
        let err = store.register_or_verify(&gauge_desc("x")).unwrap_err();
        assert!(matches!(err, ProxyError::TypeMismatch(name) if name == "x"));
        // The original kind survives.
        assert_eq!(store.get("x").unwrap().kind(), MetricKind::Counter);
    }

    #[test]
    fn update_of_unknown_metric_fails() {
        let store = MetricArray::new();
        assert!(matches!(
            store.update(&event("ghost", 1.0)),
            Err(ProxyError::UnknownMetric(name)) if name == "ghost"
        ));
    }

    #[test]
    fn visit_break_ends_one_bucket_only() {
        let store = MetricArray::new();
        // More metrics than buckets guarantees at least one bucket chain
        // longer than one.
        let total = 2 * METRIC_BUCKETS;
        for i in 0..total {
            store
                .register_or_verify(&counter_desc(&format!("metric_{i}")))
                .unwrap();
        }

        // Break immediately in every bucket: we see one metric per
        // populated bucket, which is more than one and fewer than all.
        let mut seen = 0;
        store.visit(|_| {
            seen += 1;
            ControlFlow::Break(())
        });
        assert!(seen > 1);
        assert!(seen < total);
        assert_eq!(store.count(), total);
    }

    #[test]
    fn snapshots_capture_scalar_values() {
        let store = MetricArray::new();
        store.register_or_verify(&counter_desc("c")).unwrap();
        store.register_or_verify(&gauge_desc("g")).unwrap();
        store.update(&event("c", 4.0)).unwrap();
        store.update(&event("g", 10.0)).unwrap();

        let mut snaps = store.snapshots();
        snaps.sort_by(|a, b| a.event.name.cmp(&b.event.name));
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].event.value, 4.0);
        assert_eq!(snaps[1].event.value, 5.0); // (0+10)/2
    }
}
