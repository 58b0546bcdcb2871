//! Server-side components: the metric stores, the ingest server, the dump
//! and profile machinery and the Prometheus exporter.

pub mod dump;
pub mod exporter;
pub mod profile;
pub mod registry;
pub mod server;
pub mod store;

use registry::{JobRegistry, ReleaseCallback};
use store::MetricArray;

/// Shared state of one proxy instance: the node-wide store plus the per-job
/// registry. Handlers and callbacks borrow this through an `Arc` instead of
/// reaching for globals.
pub struct ProxyState {
    /// Node-wide metric store fed by every connection.
    pub main: MetricArray,
    /// Per-job stores with connection refcounts.
    pub jobs: JobRegistry,
}

impl ProxyState {
    /// Creates the state; `on_release` persists per-job stores when their
    /// last contributor disconnects.
    #[must_use]
    pub fn new(on_release: Option<ReleaseCallback>) -> Self {
        Self {
            main: MetricArray::new(),
            jobs: JobRegistry::new(on_release),
        }
    }
}
