//! Parses the player's Range header, assembles the response, and streams
//! bytes back (C6). Routes: `GET /health`, `HEAD /media`, `GET /media`.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, head},
    Router,
};
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::entry::{Entry, RangeSupport};
use crate::error::ProxyError;
use crate::origin;
use crate::supervisor::Supervisor;
use crate::{fetcher, prefetch};

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/media", head(media_head).get(media_get))
        .with_state(supervisor)
}

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        "ok",
    )
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
    id: String,
}

#[instrument(skip(supervisor))]
async fn media_head(
    State(supervisor): State<Arc<Supervisor>>,
    Query(q): Query<MediaQuery>,
) -> Response {
    let Some(entry) = supervisor.resolve_entry(&q.id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    entry.touch();
    entry.ensure_probed().await;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, header_value(&entry.content_type().await));
    if let Some(total) = entry.total_length().await {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(total));
    }
    if entry.range_supported().await == RangeSupport::Yes {
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }

    (StatusCode::OK, headers).into_response()
}

#[instrument(skip(supervisor))]
async fn media_get(
    State(supervisor): State<Arc<Supervisor>>,
    Query(q): Query<MediaQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(entry) = supervisor.resolve_entry(&q.id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    entry.touch();
    entry.ensure_probed().await;

    let total_length = entry.total_length().await;
    let inline_window = supervisor.config().inline_window_bytes;

    let range_header = headers.get(RANGE).and_then(|v| v.to_str().ok());
    let (start, requested_end) = match range_header {
        Some(raw) => parse_range(raw, total_length).unwrap_or((0, total_length.map(|t| t.saturating_sub(1)))),
        None => (0, total_length.map(|t| t.saturating_sub(1))),
    };

    // A request that explicitly asked for a range starting past the known
    // total length is unsatisfiable; a plain GET of an empty resource
    // (`start == 0`) is not.
    if range_header.is_some() {
        if let Some(total) = total_length {
            if start >= total {
                let err = ProxyError::RangeNotSatisfiable;
                warn!(%err, start, total, "requested range starts past the known total length");
                return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            }
        }
    }

    if entry.range_supported().await == RangeSupport::No {
        return match entry.origin.passthrough(&entry.url, &entry.headers, start, requested_end).await {
            Ok((status, resp_headers, body)) => stream_response(status, resp_headers, body),
            Err(origin_err) => {
                let err = ProxyError::Origin(origin_err);
                warn!(%err, "passthrough request failed");
                StatusCode::BAD_GATEWAY.into_response()
            }
        };
    }

    let window_end = start.saturating_add(inline_window).saturating_sub(1);
    let reply_end = match requested_end {
        Some(end) => end.min(window_end),
        None => window_end,
    };

    // `ensure_cached` may cache further than `reply_end` (the inline
    // prefetch cap deliberately reads ahead), but a single response must
    // still stay within the inline window.
    for attempt in 0..2 {
        let covered_end = fetcher::ensure_cached(&entry, start, reply_end).await;
        let served_end = covered_end.min(reply_end);
        if served_end < start {
            break;
        }
        match entry.read_cached(start, served_end).await {
            Ok(bytes) => {
                prefetch::start_if_absent(&entry, supervisor.config().background_chunk_bytes).await;
                return respond_cached(&entry, start, served_end, bytes, total_length).await;
            }
            Err(err) => {
                debug!(%err, attempt, "cache read failed; metadata pruned, retrying once");
            }
        }
    }

    match entry.origin.passthrough(&entry.url, &entry.headers, start, Some(reply_end)).await {
        Ok((status, resp_headers, body)) => stream_response(status, resp_headers, body),
        Err(origin_err) => {
            let err = ProxyError::Origin(origin_err);
            warn!(%err, "passthrough fallback failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn respond_cached(
    entry: &Entry,
    start: u64,
    end: u64,
    bytes: Vec<u8>,
    total_length: Option<u64>,
) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, header_value(&entry.content_type().await));
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len() as u64));

    let total_str = total_length.map(|t| t.to_string()).unwrap_or_else(|| "*".to_string());
    headers.insert(
        CONTENT_RANGE,
        header_value(&format!("bytes {start}-{end}/{total_str}")),
    );

    (StatusCode::PARTIAL_CONTENT, headers, bytes).into_response()
}

fn stream_response(status: StatusCode, resp_headers: HeaderMap, body: hyper::body::Incoming) -> Response {
    let mut out = Response::builder().status(status);
    for (name, value) in resp_headers.iter() {
        if !origin::is_hop_by_hop(name) {
            out = out.header(name, value);
        }
    }
    out.body(Body::new(body)).unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn header_value(s: &str) -> HeaderValue {
    HeaderValue::from_str(s).unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}

/// Parse `Range: bytes=start-end` / `bytes=start-`. Missing or malformed
/// input is the caller's responsibility to default to `(0, ...)`.
fn parse_range(raw: &str, total_length: Option<u64>) -> Option<(u64, Option<u64>)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (start_s, end_s) = spec.split_once('-')?;
    let start: u64 = start_s.trim().parse().ok()?;
    if end_s.trim().is_empty() {
        return Some((start, None));
    }
    let mut end: u64 = end_s.trim().parse().ok()?;
    if let Some(total) = total_length {
        end = end.min(total.saturating_sub(1));
    }
    if end < start {
        return None;
    }
    Some((start, Some(end)))
}
