//! Ingest server: a local stream socket accepting instrumented processes.
//!
//! One thread accepts connections; every accepted client gets its own
//! handler thread reading fixed-size envelopes until EOF or a protocol
//! violation. Protocol errors only ever cost the offending client its
//! connection, never the server.

use std::io::Write;
use std::ops::ControlFlow;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info};

use crate::job::JobDescriptor;
use crate::proxy::store::MetricArray;
use crate::proxy::ProxyState;
use crate::wire::{Message, MetricDescriptor, MetricEvent};
use crate::ProxyResult;

/// Default ingest socket path for this user.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    PathBuf::from(format!("/tmp/tau_metric_proxy.{}.unix", crate::util::uid()))
}

/// Handle used to interrupt a blocked `IngestServer::run` from another
/// thread or a signal handler.
#[derive(Clone)]
pub struct ServerStopper {
    running: Arc<AtomicBool>,
    fd: i32,
}

impl ServerStopper {
    /// Raw fd of the listening socket (for signal handlers).
    #[must_use]
    pub const fn raw_fd(&self) -> i32 {
        self.fd
    }

    /// Stops the accept loop by shutting the listening socket down.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // SAFETY: shutting down an fd we no longer own at worst returns
        // EBADF/ENOTCONN, which we ignore.
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
        }
    }
}

struct ClientHandle {
    running: Arc<AtomicBool>,
    stream: Arc<UnixStream>,
    thread: JoinHandle<()>,
}

/// Mutable per-connection state.
#[derive(Default)]
struct ClientCtx {
    job: JobDescriptor,
    job_store: Option<Arc<MetricArray>>,
}

/// The ingest server; owns the listening socket and the client list.
pub struct IngestServer {
    listener: UnixListener,
    path: PathBuf,
    running: Arc<AtomicBool>,
    state: Arc<ProxyState>,
}

impl IngestServer {
    /// Binds the listening socket at `path`.
    ///
    /// # Errors
    /// Propagates bind failures (a stale socket file is the usual cause;
    /// the supervisor unlinks one before calling this).
    pub fn bind(path: &Path, state: Arc<ProxyState>) -> ProxyResult<Self> {
        let listener = UnixListener::bind(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "failed to bind push gateway socket");
            e
        })?;
        info!(path = %path.display(), "push gateway running");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            running: Arc::new(AtomicBool::new(true)),
            state,
        })
    }

    /// Handle to stop a running server.
    #[must_use]
    pub fn stopper(&self) -> ServerStopper {
        ServerStopper {
            running: Arc::clone(&self.running),
            fd: self.listener.as_raw_fd(),
        }
    }

    /// Accepts clients until stopped; joins every handler, then unlinks the
    /// socket path. Blocks the calling thread.
    pub fn run(self) {
        let mut clients: Vec<ClientHandle> = Vec::new();

        while self.running.load(Ordering::SeqCst) {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!(error = %e, "accept failed");
                    }
                    break;
                }
            };

            let stream = Arc::new(stream);
            let running = Arc::new(AtomicBool::new(true));
            let thread = {
                let stream = Arc::clone(&stream);
                let running = Arc::clone(&running);
                let state = Arc::clone(&self.state);
                std::thread::spawn(move || handle_client(&stream, &running, &state))
            };
            clients.push(ClientHandle {
                running,
                stream,
                thread,
            });

            prune_clients(&mut clients);
        }

        info!("push gateway leaving");
        self.running.store(false, Ordering::SeqCst);

        for client in clients {
            client.running.store(false, Ordering::SeqCst);
            let _ = client.stream.shutdown(std::net::Shutdown::Both);
            if client.thread.join().is_err() {
                error!("client handler panicked");
            }
        }

        let _ = std::fs::remove_file(&self.path);
    }
}

/// Joins handlers whose connection already ended; live ones stay.
fn prune_clients(clients: &mut Vec<ClientHandle>) {
    let mut live = Vec::with_capacity(clients.len());
    for client in clients.drain(..) {
        if client.running.load(Ordering::SeqCst) {
            live.push(client);
        } else if client.thread.join().is_err() {
            error!("client handler panicked");
        }
    }
    *clients = live;
}

fn handle_client(stream: &Arc<UnixStream>, running: &AtomicBool, state: &Arc<ProxyState>) {
    debug!("new proxy client");
    let mut ctx = ClientCtx::default();
    let mut reader = stream.as_ref();

    while running.load(Ordering::SeqCst) {
        match Message::read_from(&mut reader) {
            Ok(Some(msg)) => {
                if let Err(e) = dispatch(state, stream, &mut ctx, msg) {
                    error!(error = %e, "client disqualified");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "client read failed");
                break;
            }
        }
    }

    if ctx.job_store.is_some() {
        state.jobs.relax(&ctx.job.jobid);
    }
    running.store(false, Ordering::SeqCst);
    let _ = stream.shutdown(std::net::Shutdown::Both);
    debug!("proxy client left");
}

fn dispatch(
    state: &ProxyState,
    stream: &Arc<UnixStream>,
    ctx: &mut ClientCtx,
    msg: Message,
) -> ProxyResult<()> {
    match msg {
        Message::JobDescription => {
            // The descriptor record is piggybacked right after the envelope.
            let desc = JobDescriptor::read_from(&mut stream.as_ref())?;
            // A repeated announcement releases the previous acquisition so
            // the refcount stays balanced with one relax at disconnect.
            if ctx.job_store.take().is_some() {
                state.jobs.relax(&ctx.job.jobid);
            }
            ctx.job_store = state.jobs.acquire(&desc);
            ctx.job = desc;
            Ok(())
        }
        Message::Desc(desc) => {
            state.main.register_or_verify(&desc)?;
            if let Some(job_store) = &ctx.job_store {
                job_store.register_or_verify(&desc)?;
            }
            Ok(())
        }
        Message::Val(event) => {
            state.main.update(&event)?;
            if let Some(job_store) = &ctx.job_store {
                job_store.update(&event)?;
            }
            Ok(())
        }
        Message::ListAll => reply_list_all(&state.main, &mut stream.as_ref()),
        Message::GetAll => reply_get_all(&state.main, &mut stream.as_ref()),
        Message::GetOne { name } => reply_get_one(&state.main, &mut stream.as_ref(), &name),
    }
}

/// Current wire event for a metric: counter total or gauge average.
fn event_of(metric: &crate::proxy::store::Metric) -> MetricEvent {
    let snap = metric.snapshot();
    snap.event
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn write_count(w: &mut impl Write, count: usize) -> std::io::Result<()> {
    w.write_all(&(count as i32).to_ne_bytes())
}

/// Replies `count`, then exactly `count` descriptor blocks. The visit stops
/// once the announced count is written; if the walk comes up short the
/// remainder is padded with null descriptors.
fn reply_list_all(store: &MetricArray, w: &mut impl Write) -> ProxyResult<()> {
    let count = store.count();
    write_count(w, count)?;

    let mut left = count;
    let mut io_err: Option<std::io::Error> = None;
    store.visit(|m| {
        if left == 0 {
            return ControlFlow::Break(());
        }
        let desc = MetricDescriptor {
            name: m.name().to_string(),
            doc: m.doc().to_string(),
            kind: m.kind(),
        };
        match desc.write_block(w) {
            Ok(()) => {
                left -= 1;
                ControlFlow::Continue(())
            }
            Err(e) => {
                io_err = Some(e);
                ControlFlow::Break(())
            }
        }
    });
    if let Some(e) = io_err {
        return Err(e.into());
    }

    while left > 0 {
        MetricDescriptor::write_padding_block(w)?;
        left -= 1;
    }
    Ok(())
}

/// Replies `count`, then exactly `count` event blocks, padded like
/// `reply_list_all`.
fn reply_get_all(store: &MetricArray, w: &mut impl Write) -> ProxyResult<()> {
    let count = store.count();
    write_count(w, count)?;

    let mut left = count;
    let mut io_err: Option<std::io::Error> = None;
    store.visit(|m| {
        if left == 0 {
            return ControlFlow::Break(());
        }
        match event_of(m).write_block(w) {
            Ok(()) => {
                left -= 1;
                ControlFlow::Continue(())
            }
            Err(e) => {
                io_err = Some(e);
                ControlFlow::Break(())
            }
        }
    });
    if let Some(e) = io_err {
        return Err(e.into());
    }

    let padding = MetricEvent {
        name: String::new(),
        value: 0.0,
        update_ts: 0.0,
    };
    while left > 0 {
        padding.write_block(w)?;
        left -= 1;
    }
    Ok(())
}

/// Replies one event block; empty name and zero value when unknown.
fn reply_get_one(store: &MetricArray, w: &mut impl Write, name: &str) -> ProxyResult<()> {
    let reply = store.get(name).map_or_else(
        || MetricEvent {
            name: String::new(),
            value: 0.0,
            update_ts: 0.0,
        },
        |m| event_of(&m),
    );
    debug!(name, found = !reply.name.is_empty(), "get one");
    reply.write_block(w)?;
    Ok(())
}
