//! The proxy daemon: push gateway, exporter and profile consolidation under
//! one supervisor.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tau_metric_proxy::proxy::exporter::{Exporter, DEFAULT_EXPORTER_PORT};
use tau_metric_proxy::proxy::profile::{self, Merger, ProfileStore};
use tau_metric_proxy::proxy::registry::ReleaseCallback;
use tau_metric_proxy::proxy::server::{default_socket_path, IngestServer, ServerStopper};
use tau_metric_proxy::{ProxyError, ProxyState};

#[derive(Parser)]
#[command(
    name = "tau-metric-proxy",
    about = "A high performance push gateway for Prometheus",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Port of the Prometheus exporter.
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_EXPORTER_PORT)]
    port: u16,

    /// Push gateway socket path (default: /tmp/tau_metric_proxy.<uid>.unix).
    #[arg(short = 'u', long = "unix-socket")]
    socket: Option<PathBuf>,

    /// Profile storage directory (default: ~/.tauproxy).
    #[arg(short = 'P', long = "profile-dir")]
    profile_dir: Option<PathBuf>,

    /// Do not aggregate profiles on this instance (worker nodes).
    #[arg(short = 'i', long = "inhibit-aggregation")]
    inhibit_aggregation: bool,

    /// Verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

// The SIGINT hook only gets a weak handle on the ingest listener; the rest
// of the teardown runs in main once the accept loop returns.
static INGEST_STOPPER: OnceLock<ServerStopper> = OnceLock::new();
static EXPORTER_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigint(_sig: libc::c_int) {
    if let Some(stopper) = INGEST_STOPPER.get() {
        stopper.stop();
    }
    let fd = EXPORTER_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        // SAFETY: shutdown is async-signal-safe; a dead fd just errors.
        unsafe {
            libc::shutdown(fd, libc::SHUT_RDWR);
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tau_metric_proxy={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

fn default_profile_root() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".tauproxy"))
}

/// Makes sure no stale socket blocks the bind.
fn clear_stale_socket(path: &std::path::Path) -> Result<(), std::io::Error> {
    if !path.exists() {
        return Ok(());
    }
    info!(path = %path.display(), "removing a previous proxy socket");
    std::fs::remove_file(path)
}

fn run(cli: Cli) -> Result<(), ProxyError> {
    let socket_path = cli.socket.unwrap_or_else(default_socket_path);
    let Some(profile_root) = cli.profile_dir.or_else(default_profile_root) else {
        return Err(ProxyError::from("cannot resolve a profile directory (no HOME)"));
    };

    clear_stale_socket(&socket_path).map_err(|e| {
        error!(path = %socket_path.display(), error = %e, "failed to remove existing socket");
        e
    })?;

    std::fs::create_dir_all(&profile_root)?;
    info!(dir = %profile_root.display(), "profiles are stored here");

    // Every instance persists finished jobs into the inbox; only the leader
    // folds the inbox into profiles.
    let dump_root = profile_root.clone();
    let on_release: ReleaseCallback = Box::new(move |desc, store| {
        if let Err(e) = profile::write_job_dump(&dump_root, desc, store) {
            // The inbox file is left to a later retry cycle; only this
            // instance's data is at risk.
            error!(jobid = %desc.jobid, error = %e, "failed to store per-job dump");
        }
    });
    let state = Arc::new(ProxyState::new(Some(on_release)));

    let merger = if cli.inhibit_aggregation {
        info!("profile aggregation on this proxy is inhibited");
        None
    } else {
        if let Err(e) = profile::check_lock(&profile_root) {
            error!(error = %e, "another aggregator holds the profile lock");
            error!("make sure to have only a single profile aggregator");
            error!(
                "if it is a leftover, remove {}",
                profile_root.join("lock").display()
            );
            return Err(e);
        }
        let profiles = Arc::new(ProfileStore::open(&profile_root)?);
        Some(Merger::start(profiles))
    };

    let exporter = Exporter::start(
        std::net::SocketAddr::from(([0, 0, 0, 0], cli.port)),
        Arc::clone(&state),
    )?;
    EXPORTER_FD.store(exporter.raw_fd(), Ordering::SeqCst);

    let server = IngestServer::bind(&socket_path, Arc::clone(&state))?;
    let _ = INGEST_STOPPER.set(server.stopper());

    let handler: extern "C" fn(libc::c_int) = on_sigint;
    // SAFETY: the handler only touches atomics and issues shutdown(2).
    unsafe {
        libc::signal(libc::SIGINT, handler as usize);
    }

    // Blocks until SIGINT (or a fatal accept error) stops the listener.
    server.run();

    info!("stopping servers");
    exporter.stop();
    state.jobs.drain();
    if let Some(merger) = merger {
        merger.stop();
        profile::release_lock(&profile_root);
    }
    info!("done, will now exit");
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        error!(error = %e, "proxy failed");
        std::process::exit(1);
    }
    // Teardown is signal-driven; leaving the serve loop is not a clean exit.
    std::process::exit(1);
}
