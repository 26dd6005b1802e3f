//! In-process HTTP server for fetch tests
//!
//! Routes:
//! - `/files/:name` serves a fixture, 404 when unknown
//! - `/slow/:name` waits `delay` before answering
//! - `/flaky/:name` answers 503 to the first two requests

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Clone)]
struct ServerState {
    files: Arc<HashMap<String, Vec<u8>>>,
    hits: Arc<AtomicUsize>,
    flaky_hits: Arc<AtomicUsize>,
    delay: Duration,
}

impl ServerState {
    fn respond(&self, name: &str) -> Response {
        match self.files.get(name) {
            Some(bytes) => (StatusCode::OK, bytes.clone()).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }
}

async fn serve_file(State(state): State<ServerState>, Path(name): Path<String>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state.respond(&name)
}

async fn serve_slow(State(state): State<ServerState>, Path(name): Path<String>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(state.delay).await;
    state.respond(&name)
}

async fn serve_flaky(State(state): State<ServerState>, Path(name): Path<String>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if state.flaky_hits.fetch_add(1, Ordering::SeqCst) < 2 {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    state.respond(&name)
}

pub struct FixtureServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FixtureServer {
    pub async fn start(files: HashMap<String, Vec<u8>>, delay: Duration) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let state = ServerState {
            files: Arc::new(files),
            hits: hits.clone(),
            flaky_hits: Arc::new(AtomicUsize::new(0)),
            delay,
        };
        let app = Router::new()
            .route("/files/:name", get(serve_file))
            .route("/slow/:name", get(serve_slow))
            .route("/flaky/:name", get(serve_flaky))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fixture server");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, hits, task }
    }

    /// URL of a route, e.g. `url("files", "images.zip")`
    pub fn url(&self, route: &str, name: &str) -> String {
        format!("http://{}/{}/{}", self.addr, route, name)
    }

    /// Requests received on any route
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
