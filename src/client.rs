//! Client library for instrumented programs.
//!
//! The client buffers counters and gauges locally and a background thread
//! flushes them to the proxy on a fixed period: counters send the delta
//! accumulated since the previous flush and reset to zero, gauges send
//! their current value. The very first bytes after connecting announce the
//! job this process belongs to.
//!
//! Failure is never surfaced to the instrumented program: if the proxy
//! socket cannot be reached every handle silently degrades to a no-op.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, tick, Sender};
use crossbeam::select;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::job::JobDescriptor;
use crate::proxy::server::default_socket_path;
use crate::util;
use crate::wire::{Message, MetricDescriptor, MetricEvent, MetricKind};
use crate::ProxyResult;

/// Default flush period; override with `TAU_METRIC_FREQ` (seconds).
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for [`MetricProxyClient`].
#[derive(Debug)]
pub struct ClientOptions {
    /// Proxy socket path; `None` selects the per-user default.
    pub socket_path: Option<PathBuf>,
    /// How often buffered metrics are pushed to the proxy.
    pub flush_interval: Duration,
    /// Job identity to announce; `None` discovers it from the environment.
    pub job: Option<JobDescriptor>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            socket_path: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            job: None,
        }
    }
}

impl ClientOptions {
    /// Reads `TAU_METRIC_PROXY` and `TAU_METRIC_FREQ` on top of the
    /// defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let socket_path = std::env::var("TAU_METRIC_PROXY")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let flush_interval = std::env::var("TAU_METRIC_FREQ")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|secs| *secs > 0.0)
            .map_or(DEFAULT_FLUSH_INTERVAL, Duration::from_secs_f64);

        Self {
            socket_path,
            flush_interval,
            job: None,
        }
    }
}

fn client_inhibited() -> bool {
    std::env::var("TAU_METRIC_PROXY_INIHIBIT_CLIENT")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .is_some_and(|v| v != 0)
}

struct ClientMetric {
    name: String,
    doc: String,
    kind: MetricKind,
    value: Mutex<f64>,
}

struct ClientShared {
    stream: Mutex<UnixStream>,
    metrics: Mutex<Vec<Arc<ClientMetric>>>,
    connected: AtomicBool,
}

impl ClientShared {
    fn send(&self, msg: &Message) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let mut stream = self.stream.lock();
        if let Err(e) = msg.write_to(&mut *stream) {
            debug!(error = %e, "proxy connection lost");
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Pushes every buffered metric: counter deltas (then reset), current
    /// gauge values.
    fn flush(&self) {
        let metrics: Vec<Arc<ClientMetric>> = self.metrics.lock().clone();
        for metric in metrics {
            let value = {
                let mut cell = metric.value.lock();
                match metric.kind {
                    MetricKind::Counter => {
                        let delta = *cell;
                        *cell = 0.0;
                        delta
                    }
                    MetricKind::Gauge => *cell,
                }
            };
            self.send(&Message::Val(MetricEvent {
                name: metric.name.clone(),
                value,
                update_ts: util::now_ts(),
            }));
            if !self.connected.load(Ordering::SeqCst) {
                break;
            }
        }
    }
}

/// Handle to a client-side counter; all operations are no-ops when the
/// proxy is unreachable.
#[derive(Clone)]
pub struct Counter {
    metric: Option<Arc<ClientMetric>>,
}

impl Counter {
    /// Adds `delta` to the local buffer.
    pub fn add(&self, delta: f64) {
        if let Some(metric) = &self.metric {
            *metric.value.lock() += delta;
        }
    }

    /// Adds one.
    pub fn incr(&self) {
        self.add(1.0);
    }
}

/// Handle to a client-side gauge; all operations are no-ops when the proxy
/// is unreachable.
#[derive(Clone)]
pub struct Gauge {
    metric: Option<Arc<ClientMetric>>,
}

impl Gauge {
    /// Replaces the buffered value.
    pub fn set(&self, value: f64) {
        if let Some(metric) = &self.metric {
            *metric.value.lock() = value;
        }
    }

    /// Adds `delta` to the buffered value.
    pub fn add(&self, delta: f64) {
        if let Some(metric) = &self.metric {
            *metric.value.lock() += delta;
        }
    }
}

/// Connection to the proxy with a background flusher thread.
///
/// Dropping the client performs a final flush so even very short-lived
/// programs report their metrics.
pub struct MetricProxyClient {
    shared: Option<Arc<ClientShared>>,
    shutdown: Option<Sender<()>>,
    flusher: Option<JoinHandle<()>>,
}

impl MetricProxyClient {
    /// Connects to the proxy. Never fails: an unreachable socket or an
    /// inhibited client yields a client whose handles are all no-ops.
    #[must_use]
    pub fn connect(options: ClientOptions) -> Self {
        if client_inhibited() {
            debug!("client inhibited by environment");
            return Self::disabled();
        }

        let path = options.socket_path.unwrap_or_else(default_socket_path);
        let stream = match UnixStream::connect(&path) {
            Ok(stream) => stream,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "failed to connect to metric proxy");
                return Self::disabled();
            }
        };
        debug!(path = %path.display(), "connected to metric proxy");

        let shared = Arc::new(ClientShared {
            stream: Mutex::new(stream),
            metrics: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        });

        // Say hello with our job identity before anything else.
        let job = options.job.unwrap_or_else(JobDescriptor::from_env);
        {
            let mut stream = shared.stream.lock();
            let hello = Message::JobDescription.write_to(&mut *stream);
            let body = job.write_to(&mut *stream);
            if hello.is_err() || body.is_err() {
                debug!("failed to announce job description");
                shared.connected.store(false, Ordering::SeqCst);
            }
        }

        let (shutdown, rx) = bounded::<()>(1);
        let flusher = {
            let shared = Arc::clone(&shared);
            let period = tick(options.flush_interval);
            std::thread::spawn(move || {
                loop {
                    select! {
                        recv(period) -> _ => shared.flush(),
                        recv(rx) -> _ => break,
                    }
                    if !shared.connected.load(Ordering::SeqCst) {
                        return;
                    }
                }
                // One last push for metrics produced since the last tick.
                shared.flush();
            })
        };

        Self {
            shared: Some(shared),
            shutdown: Some(shutdown),
            flusher: Some(flusher),
        }
    }

    /// Connects using [`ClientOptions::from_env`].
    #[must_use]
    pub fn from_env() -> Self {
        Self::connect(ClientOptions::from_env())
    }

    const fn disabled() -> Self {
        Self {
            shared: None,
            shutdown: None,
            flusher: None,
        }
    }

    /// Whether the proxy connection is (still) alive.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| s.connected.load(Ordering::SeqCst))
    }

    fn register(&self, name: &str, doc: &str, kind: MetricKind) -> Option<Arc<ClientMetric>> {
        let shared = self.shared.as_ref()?;

        let mut metrics = shared.metrics.lock();
        if let Some(existing) = metrics.iter().find(|m| m.name == name) {
            if existing.kind == kind {
                return Some(Arc::clone(existing));
            }
            warn!(name, "metric already registered with another kind");
            return None;
        }

        let metric = Arc::new(ClientMetric {
            name: name.to_string(),
            doc: doc.to_string(),
            kind,
            value: Mutex::new(0.0),
        });
        metrics.push(Arc::clone(&metric));

        // Still under the metrics lock: the flusher must not see this
        // metric before its descriptor is on the wire.
        shared.send(&Message::Desc(MetricDescriptor {
            name: metric.name.clone(),
            doc: metric.doc.clone(),
            kind,
        }));
        drop(metrics);
        Some(metric)
    }

    /// Gets or registers a counter. The registration descriptor goes on the
    /// wire once; values follow with the flusher.
    #[must_use]
    pub fn counter(&self, name: &str, doc: &str) -> Counter {
        Counter {
            metric: self.register(name, doc, MetricKind::Counter),
        }
    }

    /// Gets or registers a gauge.
    #[must_use]
    pub fn gauge(&self, name: &str, doc: &str) -> Gauge {
        Gauge {
            metric: self.register(name, doc, MetricKind::Gauge),
        }
    }

    /// Flushes remaining metrics and closes the connection.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for MetricProxyClient {
    fn drop(&mut self) {
        // Dropping the sender wakes the flusher, which pushes one final
        // round before exiting.
        drop(self.shutdown.take());
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.join();
        }
    }
}

/// One-shot administrative connection for the query operations.
pub struct ProxyQuery {
    stream: UnixStream,
}

impl ProxyQuery {
    /// Connects to the proxy socket.
    ///
    /// # Errors
    /// Propagates the connection failure.
    pub fn connect(path: &std::path::Path) -> ProxyResult<Self> {
        Ok(Self {
            stream: UnixStream::connect(path)?,
        })
    }

    fn read_count(&mut self) -> ProxyResult<i32> {
        use std::io::Read;
        let mut buf = [0_u8; 4];
        self.stream.read_exact(&mut buf)?;
        Ok(i32::from_ne_bytes(buf))
    }

    /// Lists every metric registered on the proxy.
    ///
    /// # Errors
    /// Propagates I/O and decode failures.
    pub fn list_all(&mut self) -> ProxyResult<Vec<MetricDescriptor>> {
        Message::ListAll.write_to(&mut self.stream)?;
        let count = self.read_count()?;
        let mut out = Vec::new();
        for _ in 0..count {
            // Padding blocks stand for metrics gone mid-walk.
            if let Some(desc) = MetricDescriptor::read_block(&mut self.stream)? {
                out.push(desc);
            }
        }
        Ok(out)
    }

    /// Fetches the current value of every metric.
    ///
    /// # Errors
    /// Propagates I/O and decode failures.
    pub fn get_all(&mut self) -> ProxyResult<Vec<MetricEvent>> {
        Message::GetAll.write_to(&mut self.stream)?;
        let count = self.read_count()?;
        let mut out = Vec::new();
        for _ in 0..count {
            let event = MetricEvent::read_block(&mut self.stream)?;
            if !event.name.is_empty() {
                out.push(event);
            }
        }
        Ok(out)
    }

    /// Fetches one metric by name; `None` when the proxy does not know it.
    ///
    /// # Errors
    /// Propagates I/O and decode failures.
    pub fn get_one(&mut self, name: &str) -> ProxyResult<Option<MetricEvent>> {
        Message::GetOne {
            name: name.to_string(),
        }
        .write_to(&mut self.stream)?;
        let event = MetricEvent::read_block(&mut self.stream)?;
        Ok((!event.name.is_empty()).then_some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_proxy_degrades_to_noops() {
        let client = MetricProxyClient::connect(ClientOptions {
            socket_path: Some(PathBuf::from("/nonexistent/socket/path.unix")),
            ..ClientOptions::default()
        });
        assert!(!client.is_connected());

        // Handles work without a connection and never panic.
        let counter = client.counter("requests_total", "Total requests");
        counter.add(5.0);
        counter.incr();
        let gauge = client.gauge("temp", "Temperature");
        gauge.set(42.0);
        gauge.add(1.0);
        client.shutdown();
    }

    #[test]
    fn options_from_env_parse_flush_interval() {
        std::env::set_var("TAU_METRIC_FREQ", "0.25");
        let options = ClientOptions::from_env();
        std::env::remove_var("TAU_METRIC_FREQ");
        assert_eq!(options.flush_interval, Duration::from_millis(250));
    }
}
