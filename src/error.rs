use thiserror::Error;

/// Errors surfaced at the library boundary (`Proxy::*`, `Entry::read_cached`).
///
/// Internal plumbing (service-internal helpers, the fetcher loop) uses
/// `anyhow::Result` throughout, the same as the teacher codebase; this type
/// exists only where a caller might reasonably want to branch on the kind.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("origin request failed: {0}")]
    Origin(#[from] OriginError),

    #[error("cache miss while reading [{start}, {end}]")]
    CacheMiss { start: u64, end: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsatisfiable range")]
    RangeNotSatisfiable,
}

/// Classification of an Origin Client (C2) failure. `probe`/`fetch` collapse
/// these into the three-valued outcomes described in spec.md §4.2; this
/// enum is what feeds that collapse.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("connect/transport error: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    #[error("request timed out")]
    Timeout,

    #[error("too many redirects")]
    TooManyRedirects,

    #[error("origin returned malformed headers")]
    MalformedResponse,

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}
