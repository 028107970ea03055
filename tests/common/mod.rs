//! Shared test scaffolding: an in-process fake origin server (so the test
//! suite never touches the network) and a minimal HTTP client for talking
//! to the proxy under test.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes as BBytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpListener;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum OriginMode {
    /// Honors Range with 206/Content-Range.
    RangeSupported,
    /// Always returns 200 with the full body, ignoring Range.
    IgnoresRange,
}

pub struct FakeOrigin {
    pub addr: SocketAddr,
    pub request_count: Arc<AtomicUsize>,
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeOrigin {
    pub fn url(&self) -> String {
        format!("http://{}/file", self.addr)
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct OriginState {
    body: Arc<Vec<u8>>,
    mode: OriginMode,
    request_count: Arc<AtomicUsize>,
}

/// Spawns a fake origin serving `body` at `/file`, bound to an OS-chosen
/// loopback port.
pub async fn spawn_fake_origin(body: Vec<u8>, mode: OriginMode) -> FakeOrigin {
    let request_count = Arc::new(AtomicUsize::new(0));
    let state = OriginState {
        body: Arc::new(body),
        mode,
        request_count: request_count.clone(),
    };

    let router = Router::new().route("/file", get(serve_file)).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    FakeOrigin {
        addr,
        request_count,
        _handle: handle,
    }
}

async fn serve_file(State(state): State<OriginState>, headers: HeaderMap) -> Response {
    state.request_count.fetch_add(1, Ordering::SeqCst);
    let total = state.body.len() as u64;

    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

    if state.mode == OriginMode::IgnoresRange || range.is_none() {
        return (
            StatusCode::OK,
            [(header::CONTENT_LENGTH, total.to_string())],
            BBytes::from(state.body.as_ref().clone()),
        )
            .into_response();
    }

    let raw = range.unwrap();
    let Some((start, end)) = parse_test_range(raw, total) else {
        return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    };

    let slice = state.body[start as usize..=end as usize].to_vec();
    let headers = [
        (header::CONTENT_LENGTH, slice.len().to_string()),
        (header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}")),
    ];
    (StatusCode::PARTIAL_CONTENT, headers, BBytes::from(slice)).into_response()
}

fn parse_test_range(raw: &str, total: u64) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (s, e) = spec.split_once('-')?;
    let start: u64 = s.parse().ok()?;
    let end: u64 = if e.is_empty() {
        total - 1
    } else {
        e.parse::<u64>().ok()?.min(total - 1)
    };
    Some((start, end))
}

type PlainClient = Client<HttpConnector, Empty<BBytes>>;

pub struct TestClient {
    inner: PlainClient,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Default for TestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClient {
    pub fn new() -> Self {
        TestClient {
            inner: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    pub async fn request(&self, method: &str, url: &str, range: Option<&str>) -> TestResponse {
        let uri: http::Uri = url.parse().unwrap();
        let mut builder = http::Request::builder().method(method).uri(uri);
        if let Some(r) = range {
            builder = builder.header(header::RANGE, r);
        }
        let req = builder.body(Empty::new()).unwrap();
        let resp = self.inner.request(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        TestResponse { status, headers, body }
    }
}
