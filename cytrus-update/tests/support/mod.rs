//! In-memory repository fixture for integration tests.
//!
//! Serves a map of repository-relative paths over a local HTTP port, with
//! enough `Range` support to exercise resumable downloads, and records every
//! request so tests can assert on what was actually fetched.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::routing::any;
use axum::Router;

use cytrus_update::hash::sha1_hex;

/// One recorded request.
#[derive(Clone, Debug)]
pub struct Hit {
    pub path: String,
    pub range: Option<String>,
}

#[derive(Default)]
pub struct FixtureState {
    files: Mutex<HashMap<String, Vec<u8>>>,
    hits: Mutex<Vec<Hit>>,
}

/// A running fixture repository.
pub struct FixtureRepo {
    pub addr: SocketAddr,
    state: Arc<FixtureState>,
}

impl FixtureRepo {
    /// Starts the fixture on an ephemeral local port.
    pub async fn start() -> Self {
        let state = Arc::new(FixtureState::default());
        let app = Router::new()
            .fallback(any(serve))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Registers a document at a repository-relative path.
    pub fn put(&self, path: &str, body: impl Into<Vec<u8>>) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), body.into());
    }

    /// Registers a content-addressed blob and returns its hash.
    pub fn put_blob(&self, game: &str, body: impl Into<Vec<u8>>) -> String {
        let body = body.into();
        let hash = sha1_hex(&body);
        let shard = &hash[..2];
        self.put(&format!("{game}/hashes/{shard}/{hash}"), body);
        hash
    }

    /// Every request seen so far.
    pub fn hits(&self) -> Vec<Hit> {
        self.state.hits.lock().unwrap().clone()
    }

    /// Requests whose path contains `needle`.
    pub fn hits_containing(&self, needle: &str) -> Vec<Hit> {
        self.hits()
            .into_iter()
            .filter(|h| h.path.contains(needle))
            .collect()
    }
}

async fn serve(State(state): State<Arc<FixtureState>>, request: Request<Body>) -> Response {
    let path = request.uri().path().trim_start_matches('/').to_string();
    let range = header_string(request.headers(), "range");
    state.hits.lock().unwrap().push(Hit {
        path: path.clone(),
        range: range.clone(),
    });

    let Some(body) = state.files.lock().unwrap().get(&path).cloned() else {
        return response(StatusCode::NOT_FOUND, Vec::new());
    };

    match range.as_deref().and_then(parse_range_start) {
        None => {
            let mut res = response(StatusCode::OK, body);
            res.headers_mut()
                .insert("accept-ranges", "bytes".parse().unwrap());
            res
        }
        Some(start) if (start as usize) < body.len() => {
            let mut res = response(StatusCode::PARTIAL_CONTENT, body[start as usize..].to_vec());
            res.headers_mut()
                .insert("accept-ranges", "bytes".parse().unwrap());
            res
        }
        Some(_) => response(StatusCode::RANGE_NOT_SATISFIABLE, Vec::new()),
    }
}

fn response(status: StatusCode, body: Vec<u8>) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap()
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Parses `bytes=N-` into N.
fn parse_range_start(range: &str) -> Option<u64> {
    range
        .strip_prefix("bytes=")?
        .strip_suffix('-')?
        .parse()
        .ok()
}
