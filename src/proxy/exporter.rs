//! Prometheus-style exposition over a minimal HTTP/1.1 listener.
//!
//! One thread accepts TCP connections; each request gets a detached thread,
//! a single response and a close (no keep-alive). Rendering groups metrics
//! by basename — the name up to the first `{` — so labelled series share
//! one `# HELP` / `# TYPE` header block.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::proxy::store::MetricArray;
use crate::proxy::ProxyState;
use crate::wire::MetricKind;
use crate::ProxyResult;

/// Default exporter port.
pub const DEFAULT_EXPORTER_PORT: u16 = 1337;

/// Cap on same-basename series in one exposition block; the excess is
/// dropped with a warning.
pub const MAX_SIBLINGS: usize = 4096;

const INDEX_PAGE: &str = "<html>\
<head><title>Node Exporter</title></head>\
<body>\
<h1>TAU Metrics Proxy Exporter</h1>\
<p><a href='/metrics'>Metrics</a></p>\
</body>\
</html>";

/// Name prefix up to the first `{`, or the whole name without labels.
#[must_use]
pub fn basename(name: &str) -> &str {
    name.find('{').map_or(name, |i| &name[..i])
}

struct BasenameGroup {
    base: String,
    doc: String,
    kind: MetricKind,
    series: Vec<(String, f64)>,
}

/// Renders the whole store in Prometheus text exposition format.
#[must_use]
pub fn render_metrics(store: &MetricArray) -> String {
    let mut groups: Vec<BasenameGroup> = Vec::new();

    for snap in store.snapshots() {
        let base = basename(&snap.event.name);
        match groups.iter_mut().find(|g| g.base == base) {
            Some(group) => {
                if group.series.len() >= MAX_SIBLINGS {
                    warn!(metric = %snap.event.name, "sibling overflow, metric dropped from rendering");
                    continue;
                }
                group.series.push((snap.event.name, snap.event.value));
            }
            None => groups.push(BasenameGroup {
                base: base.to_string(),
                // HELP and TYPE come from the first sibling seen.
                doc: snap.doc,
                kind: snap.kind,
                series: vec![(snap.event.name, snap.event.value)],
            }),
        }
    }

    let mut out = String::with_capacity(1024);
    for group in &groups {
        out.push_str(&format!(
            "# HELP {} {}\n# TYPE {} {}\n",
            group.base,
            group.doc,
            group.base,
            group.kind.as_str()
        ));
        for (name, value) in &group.series {
            out.push_str(&format!("{name} {value}\n"));
        }
    }
    out
}

fn write_response(
    stream: &mut TcpStream,
    code: u16,
    content_type: &str,
    body: &str,
) -> std::io::Result<()> {
    let status = match code {
        200 => "200 OK",
        _ => "404 Not Found",
    };
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body.as_bytes())?;
    stream.flush()
}

/// Serves one request then closes: reading → serving → closed.
fn handle_connection(mut stream: TcpStream, state: &ProxyState) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(());
    }

    // Drain the header block; nothing in it matters to us.
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 || line.trim_end().is_empty() {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    debug!(method, path, "exporter request");

    if method != "GET" {
        return write_response(&mut stream, 404, "text/html", "");
    }

    if path == "/" {
        return write_response(&mut stream, 200, "text/html", INDEX_PAGE);
    }

    if path.strip_prefix('/').unwrap_or(path).contains("metrics") {
        let body = render_metrics(&state.main);
        return write_response(&mut stream, 200, "text/plain", &body);
    }

    write_response(&mut stream, 404, "text/html", "")
}

/// The exporter listener and its accept thread.
pub struct Exporter {
    running: Arc<AtomicBool>,
    fd: i32,
    local_addr: SocketAddr,
    accept_thread: JoinHandle<()>,
}

impl Exporter {
    /// Binds `addr` and starts accepting; each request is served by a
    /// detached thread.
    ///
    /// # Errors
    /// Propagates the bind failure.
    pub fn start(addr: SocketAddr, state: Arc<ProxyState>) -> ProxyResult<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| {
            error!(%addr, error = %e, "failed to bind exporter socket");
            e
        })?;
        let local_addr = listener.local_addr()?;
        let fd = listener.as_raw_fd();
        let running = Arc::new(AtomicBool::new(true));

        let accept_thread = {
            let running = Arc::clone(&running);
            std::thread::spawn(move || accept_loop(&listener, &running, &state))
        };

        info!(%local_addr, "exporter listening");
        Ok(Self {
            running,
            fd,
            local_addr,
            accept_thread,
        })
    }

    /// Address actually bound (useful with port 0).
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Raw fd of the listening socket (for signal handlers).
    #[must_use]
    pub const fn raw_fd(&self) -> i32 {
        self.fd
    }

    /// Stops accepting and joins the accept thread. In-flight request
    /// threads finish on their own.
    pub fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        // SAFETY: worst case the fd is already closed and shutdown reports
        // EBADF, which we ignore.
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
        }
        if self.accept_thread.join().is_err() {
            error!("exporter accept thread panicked");
        }
    }
}

fn accept_loop(listener: &TcpListener, running: &Arc<AtomicBool>, state: &Arc<ProxyState>) {
    while running.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    error!(error = %e, "exporter accept failed");
                }
                break;
            }
        };

        let state = Arc::clone(state);
        // Detached on purpose; the response is tiny and self-contained.
        std::thread::spawn(move || {
            if let Err(e) = handle_connection(stream, &state) {
                debug!(error = %e, "request handling failed");
            }
        });
    }
    info!("exporter thread leaving");
}
