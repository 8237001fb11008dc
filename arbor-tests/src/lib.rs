//! Shared fixtures for the integration tests: a programmable fake backend,
//! a server harness on a throwaway unix socket and small timing helpers.

use arbor_client::Client;
use arbor_server::{config::Config, server::Server};
use fake::FakeBackend;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tempfile::TempDir;
use tokio::time;
use url::Url;

pub mod fake;
pub mod logger;

/// A server bound to a unix socket in a temp directory, talking to a fake
/// backend.
pub struct TestServer {
    pub url: Url,
    pub backend: Arc<FakeBackend>,
    server: Option<Server>,
    _dir: TempDir,
}

impl TestServer {
    /// Start a server with the given default grace time.
    pub async fn start(backend: Arc<FakeBackend>, grace_time: Duration) -> TestServer {
        logger::init();

        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let socket = dir.path().join("arbor.sock");
        let url: Url = format!("unix://{}", socket.display())
            .parse()
            .expect("invalid socket url");

        let mut server = Server::new(Config::with_grace_time(grace_time), backend.clone());
        server.listen(&url).await.expect("failed to listen");

        TestServer {
            url,
            backend,
            server: Some(server),
            _dir: dir,
        }
    }

    /// Start a server with the default grace time of the scenarios, 42s.
    pub async fn start_default() -> TestServer {
        TestServer::start(FakeBackend::new(), Duration::from_secs(42)).await
    }

    pub fn client(&self) -> Client {
        Client::new(self.url.clone())
    }

    /// Stop the server. Live process streams survive this.
    pub async fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapsed.
pub async fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return condition();
        }
        time::sleep(Duration::from_millis(10)).await;
    }
}
