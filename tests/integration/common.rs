//! Shared fixture: a full proxy (ingest socket + exporter + profile tree in
//! a temp directory) driven by real client connections.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tempfile::TempDir;

use tau_metric_proxy::proxy::exporter::Exporter;
use tau_metric_proxy::proxy::profile::{write_job_dump, ProfileStore};
use tau_metric_proxy::proxy::server::{IngestServer, ServerStopper};
use tau_metric_proxy::{ClientOptions, JobDescriptor, MetricProxyClient, ProxyState};

pub struct TestProxy {
    pub dir: TempDir,
    pub socket: PathBuf,
    pub state: Arc<ProxyState>,
    pub profiles: Arc<ProfileStore>,
    exporter: Option<Exporter>,
    stopper: ServerStopper,
    server_thread: Option<JoinHandle<()>>,
}

impl TestProxy {
    pub fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("gateway.unix");
        let profiles = Arc::new(ProfileStore::open(dir.path()).unwrap());

        let dump_root = dir.path().to_path_buf();
        let state = Arc::new(ProxyState::new(Some(Box::new(move |desc, store| {
            write_job_dump(&dump_root, desc, store).unwrap();
        }))));

        let server = IngestServer::bind(&socket, Arc::clone(&state)).unwrap();
        let stopper = server.stopper();
        let server_thread = std::thread::spawn(move || server.run());

        let exporter =
            Exporter::start("127.0.0.1:0".parse().unwrap(), Arc::clone(&state)).unwrap();

        Self {
            dir,
            socket,
            state,
            profiles,
            exporter: Some(exporter),
            stopper,
            server_thread: Some(server_thread),
        }
    }

    /// Client with a fast flusher and a fixed job identity.
    pub fn client(&self, jobid: &str, command: &str) -> MetricProxyClient {
        MetricProxyClient::connect(ClientOptions {
            socket_path: Some(self.socket.clone()),
            flush_interval: Duration::from_millis(20),
            job: Some(JobDescriptor {
                jobid: jobid.to_string(),
                command: command.to_string(),
                ..JobDescriptor::default()
            }),
        })
    }

    /// Fetches `/metrics` from the exporter and returns the body.
    pub fn metrics_text(&self) -> String {
        let addr = self.exporter.as_ref().unwrap().local_addr();
        let mut conn = TcpStream::connect(addr).unwrap();
        conn.write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        conn.read_to_string(&mut response).unwrap();
        response
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default()
    }

    pub fn consolidate(&self) -> usize {
        self.profiles.consolidate()
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        if let Some(exporter) = self.exporter.take() {
            exporter.stop();
        }
        self.stopper.stop();
        if let Some(thread) = self.server_thread.take() {
            let _ = thread.join();
        }
    }
}

/// Polls `cond` for a couple of seconds before giving up.
pub fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for: {what}");
}
