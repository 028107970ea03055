//! Performs conditional and ranged GETs against the origin and classifies
//! the responses (C2). Built on `hyper` + `hyper-util` + `hyper-rustls`
//! rather than a higher-level client crate, reusing the TLS stack already
//! pulled in for this codebase's server-side work.

use std::time::Duration;

use bytes::Bytes;
use http::{
    header::{
        HeaderName, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE,
        RANGE, TRANSFER_ENCODING, USER_AGENT,
    },
    HeaderMap, HeaderValue, Method, Request, StatusCode,
};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tracing::{instrument, warn};

use crate::error::OriginError;

const DEFAULT_UA: &str = "rangecache/0.1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_REDIRECTS: u8 = 5;
const MAX_RETRIES: u8 = 2;

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Empty<Bytes>>;
type Result<T> = std::result::Result<T, OriginError>;

/// One shared, thread-safe connection pool reused across every entry — the
/// pool itself is keyed by host, so a single client still yields per-host
/// keep-alive reuse.
#[derive(Clone)]
pub struct OriginClient {
    inner: HttpsClient,
}

impl Default for OriginClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OriginClient {
    pub fn new() -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let inner = Client::builder(TokioExecutor::new()).build(https);
        OriginClient { inner }
    }

    /// `GET Range: bytes=0-0` to learn whether the origin honors Range and,
    /// if possible, the total length. Only a transport-level failure is an
    /// `Err` here; any status code the origin actually answered with is a
    /// valid, classified `Ok(ProbeOutcome)`.
    #[instrument(skip(self, headers))]
    pub async fn probe(&self, url: &str, headers: &HeaderMap) -> Result<ProbeOutcome> {
        let (status, resp_headers, body) = self.request_raw(url, headers, Some((0, 0))).await?;
        drop(body);
        Ok(classify_probe(status, &resp_headers))
    }

    /// `GET Range: bytes=s-e`.
    #[instrument(skip(self, headers))]
    pub async fn fetch(&self, url: &str, headers: &HeaderMap, start: u64, end: u64) -> Result<FetchResult> {
        let (status, resp_headers, body) = self.request_raw(url, headers, Some((start, end))).await?;

        let content_type = resp_headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let (served_start, served_end, total) =
                    parse_content_range(&resp_headers).ok_or(OriginError::MalformedResponse)?;
                let bytes = read_body_bytes(body).await?;
                Ok(FetchResult {
                    kind: FetchKind::Partial {
                        start: served_start,
                        end: served_end,
                        total_length: total,
                    },
                    body: bytes,
                    content_type,
                })
            }
            StatusCode::OK => Ok(FetchResult {
                kind: FetchKind::RangeIgnored,
                body: Bytes::new(),
                content_type,
            }),
            _ => Err(OriginError::MalformedResponse),
        }
    }

    /// Issue a ranged GET and return the raw status/headers/streaming body,
    /// for the Request Handler's passthrough path — no caching semantics.
    #[instrument(skip(self, headers))]
    pub async fn passthrough(
        &self,
        url: &str,
        headers: &HeaderMap,
        start: u64,
        end: Option<u64>,
    ) -> Result<(StatusCode, HeaderMap, Incoming)> {
        let range = end.map(|e| (start, e));
        self.request_raw(url, headers, range).await
    }

    #[instrument(skip(self, headers))]
    async fn request_raw(
        &self,
        url: &str,
        headers: &HeaderMap,
        range: Option<(u64, u64)>,
    ) -> Result<(StatusCode, HeaderMap, Incoming)> {
        let mut current_url = url.to_string();

        for hop in 0..=MAX_REDIRECTS {
            let req = build_request(&current_url, headers, range)?;
            let resp = self.send_with_retry(req).await?;
            let status = resp.status();

            if status.is_redirection() {
                if hop == MAX_REDIRECTS {
                    return Err(OriginError::TooManyRedirects);
                }
                let location = resp
                    .headers()
                    .get(http::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or(OriginError::MalformedResponse)?;
                current_url = resolve_redirect(&current_url, location)?;
                continue;
            }

            let (parts, body) = resp.into_parts();
            return Ok((parts.status, parts.headers, body));
        }

        unreachable!()
    }

    async fn send_with_retry(&self, req: Request<Empty<Bytes>>) -> Result<hyper::Response<Incoming>> {
        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            let cloned = clone_request(&req);
            let fut = self.inner.request(cloned);
            match tokio::time::timeout(CONNECT_TIMEOUT + READ_TIMEOUT, fut).await {
                Ok(Ok(resp)) => return Ok(resp),
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "origin request failed");
                    last_err = Some(OriginError::Transport(e));
                }
                Err(_) => {
                    warn!(attempt, "origin request timed out");
                    last_err = Some(OriginError::Timeout);
                }
            }
            if attempt < MAX_RETRIES {
                tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
            }
        }
        Err(last_err.unwrap_or(OriginError::Timeout))
    }
}

fn clone_request(req: &Request<Empty<Bytes>>) -> Request<Empty<Bytes>> {
    let mut builder = Request::builder().method(req.method().clone()).uri(req.uri().clone());
    for (name, value) in req.headers() {
        builder = builder.header(name, value.clone());
    }
    builder.body(Empty::new()).expect("cloned request is always valid")
}

fn build_request(url: &str, headers: &HeaderMap, range: Option<(u64, u64)>) -> Result<Request<Empty<Bytes>>> {
    let uri: http::Uri = url.parse().map_err(|_| OriginError::InvalidUrl(url.to_string()))?;

    let mut builder = Request::builder().method(Method::GET).uri(uri);

    if !headers.contains_key(USER_AGENT) {
        builder = builder.header(USER_AGENT, DEFAULT_UA);
    }
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder = builder.header(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    if let Some((s, e)) = range {
        builder = builder.header(RANGE, format!("bytes={s}-{e}"));
    }

    builder.body(Empty::new()).map_err(|_| OriginError::InvalidUrl(url.to_string()))
}

fn resolve_redirect(base: &str, location: &str) -> Result<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(location.to_string());
    }
    let base_uri: http::Uri = base.parse().map_err(|_| OriginError::InvalidUrl(base.to_string()))?;
    let scheme = base_uri.scheme_str().unwrap_or("http");
    let authority = base_uri.authority().map(|a| a.as_str()).unwrap_or("");
    if location.starts_with('/') {
        Ok(format!("{scheme}://{authority}{location}"))
    } else {
        Err(OriginError::InvalidUrl(location.to_string()))
    }
}

async fn read_body_bytes(body: Incoming) -> Result<Bytes> {
    let collected = tokio::time::timeout(READ_TIMEOUT, body.collect())
        .await
        .map_err(|_| OriginError::Timeout)?
        .map_err(|_| OriginError::MalformedResponse)?;
    Ok(collected.to_bytes())
}

/// Outcome of a range-support probe.
pub struct ProbeOutcome {
    pub range_supported: bool,
    pub total_length: Option<u64>,
    pub content_type: Option<String>,
}

fn classify_probe(status: StatusCode, headers: &HeaderMap) -> ProbeOutcome {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    match status {
        StatusCode::PARTIAL_CONTENT => {
            let total = parse_content_range(headers).and_then(|(_, _, t)| t);
            ProbeOutcome {
                range_supported: true,
                total_length: total,
                content_type,
            }
        }
        StatusCode::OK => {
            let total = headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            ProbeOutcome {
                range_supported: false,
                total_length: total,
                content_type,
            }
        }
        _ => ProbeOutcome {
            range_supported: false,
            total_length: None,
            content_type,
        },
    }
}

/// What a `fetch()` call actually got back from the origin.
pub enum FetchKind {
    /// `206` — the served interval (origin may have clamped it down) and,
    /// when known, the total resource length.
    Partial { start: u64, end: u64, total_length: Option<u64> },
    /// `200` — origin ignored the Range header; caller must latch
    /// `range_supported = false` and abandon the caching path.
    RangeIgnored,
}

pub struct FetchResult {
    pub kind: FetchKind,
    pub body: Bytes,
    pub content_type: Option<String>,
}

/// Parse `Content-Range: bytes A-B/T` (or `bytes A-B/*`).
pub fn parse_content_range(headers: &HeaderMap) -> Option<(u64, u64, Option<u64>)> {
    let raw = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let rest = raw.strip_prefix("bytes ")?;
    let (range_part, total_part) = rest.split_once('/')?;
    let (start_s, end_s) = range_part.split_once('-')?;
    let start: u64 = start_s.trim().parse().ok()?;
    let end: u64 = end_s.trim().parse().ok()?;
    let total = if total_part.trim() == "*" {
        None
    } else {
        total_part.trim().parse::<u64>().ok()
    };
    Some((start, end, total))
}

/// Headers that must never be relayed verbatim between proxy and player.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == TRANSFER_ENCODING
        || name == CONNECTION
        || name.as_str().eq_ignore_ascii_case("keep-alive")
        || name.as_str().eq_ignore_ascii_case("te")
        || name.as_str().eq_ignore_ascii_case("trailers")
        || name.as_str().eq_ignore_ascii_case("upgrade")
        || name.as_str().to_ascii_lowercase().starts_with("proxy-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_range_with_total() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 100-199/1000"));
        assert_eq!(parse_content_range(&headers), Some((100, 199, Some(1000))));
    }

    #[test]
    fn parses_content_range_with_unknown_total() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-9/*"));
        assert_eq!(parse_content_range(&headers), Some((0, 9, None)));
    }

    #[test]
    fn rejects_malformed_content_range() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_static("garbage"));
        assert_eq!(parse_content_range(&headers), None);
    }

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        assert!(is_hop_by_hop(&CONNECTION));
        assert!(is_hop_by_hop(&TRANSFER_ENCODING));
        assert!(!is_hop_by_hop(&CONTENT_TYPE));
    }
}
