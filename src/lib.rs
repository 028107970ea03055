//! A range-aware HTTP caching proxy: terminates a media player's Range
//! requests on `127.0.0.1`, serves bytes already on disk, fetches missing
//! intervals from the origin in controllable chunks, and optionally grows
//! coverage forward in a background worker.

pub mod config;
pub mod entry;
pub mod error;
pub mod fetcher;
pub mod handler;
pub mod origin;
pub mod prefetch;
pub mod segment;
pub mod sid;
pub mod supervisor;

use std::sync::Arc;

use http::HeaderMap;

pub use config::Config;
pub use error::{OriginError, ProxyError};

use supervisor::Supervisor;

/// The caller-facing handle, as consumed by the player/GUI integration
/// (spec.md §6.3).
#[derive(Clone)]
pub struct Proxy {
    supervisor: Arc<Supervisor>,
}

/// Construct a `Proxy` from a (already-normalized) `Config`.
pub fn get(config: Config) -> Proxy {
    Proxy {
        supervisor: Supervisor::new(config.normalize()),
    }
}

impl Proxy {
    pub async fn start(&self) -> anyhow::Result<()> {
        self.supervisor.start().await
    }

    pub async fn stop(&self) {
        self.supervisor.stop().await
    }

    pub fn is_ready(&self) -> bool {
        self.supervisor.is_ready()
    }

    pub async fn base_url(&self) -> Option<String> {
        self.supervisor.base_url().await
    }

    /// Registers `(url, headers)` and returns the local URL to hand to the
    /// player. Infallible by contract: internal errors are logged, not
    /// propagated (spec.md §7).
    pub async fn proxify(&self, url: &str, headers: HeaderMap) -> String {
        self.supervisor.proxify(url, headers).await
    }

    pub async fn prune(&self, max_entries: usize, max_idle_seconds: u64) {
        self.supervisor.prune(max_entries, max_idle_seconds).await
    }
}
