//! # tau-metric-proxy
//!
//! A per-node metric push gateway for HPC jobs. Instrumented processes push
//! counters and gauges over a local stream socket; the proxy aggregates them
//! in memory, exposes them in Prometheus text exposition over HTTP and folds
//! the metrics of finished jobs into persistent per-job profile files.
//!
//! ## Features
//!
//! - **Push gateway**: framed binary protocol over a unix socket, one
//!   handler thread per connection
//! - **Metric types**: monotonic counters and min/max/rolling-average gauges
//! - **Per-job profiles**: reference-counted per-job stores, dumped on the
//!   last disconnect and consolidated on disk across job invocations
//! - **Prometheus exposition**: `/metrics` grouped by basename
//! - **Fire-and-forget client**: instrumented programs never block or fail
//!   because of the proxy
//!
//! ## Quick Start
//!
//! ```no_run
//! use tau_metric_proxy::{ClientOptions, MetricProxyClient};
//!
//! let client = MetricProxyClient::connect(ClientOptions::default());
//!
//! let requests = client.counter("requests_total", "Total requests served");
//! requests.incr();
//! requests.add(4.0);
//!
//! let depth = client.gauge("queue_depth", "Entries waiting");
//! depth.set(17.0);
//!
//! client.shutdown();
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod client;
mod error;
pub mod job;
pub mod macros;
pub mod proxy;
pub mod util;
pub mod wire;

pub use client::{ClientOptions, Counter, Gauge, MetricProxyClient, ProxyQuery};
pub use error::ProxyError;
pub use job::JobDescriptor;
pub use proxy::ProxyState;
pub use wire::{MetricDescriptor, MetricEvent, MetricKind, MetricSnapshot};

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
