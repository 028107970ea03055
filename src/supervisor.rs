//! Process-wide singleton owning the listening socket, port stability, the
//! entry registry, mapping persistence, and the health endpoint (C7).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::entry::Entry;
use crate::handler;
use crate::origin::OriginClient;
use crate::sid;

const HEALTH_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize)]
struct Mapping {
    url: String,
    headers: BTreeMap<String, String>,
}

struct RunningServer {
    port: u16,
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Owns the listening socket and the `sid -> Entry` registry. Reachable
/// through the public `Proxy` handle in `lib.rs`.
pub struct Supervisor {
    config: Config,
    origin: Arc<OriginClient>,
    registry: DashMap<String, Arc<Entry>>,
    mappings_dir: PathBuf,
    preferred_port: AtomicU16,
    ready: AtomicBool,
    server: tokio::sync::Mutex<Option<RunningServer>>,
}

impl Supervisor {
    pub fn new(config: Config) -> Arc<Self> {
        let mappings_dir = config.cache_dir.join("mappings");
        Arc::new(Supervisor {
            config,
            origin: Arc::new(OriginClient::new()),
            registry: DashMap::new(),
            mappings_dir,
            preferred_port: AtomicU16::new(0),
            ready: AtomicBool::new(false),
            server: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub async fn base_url(&self) -> Option<String> {
        let guard = self.server.lock().await;
        guard.as_ref().map(|s| format!("http://127.0.0.1:{}", s.port))
    }

    /// Binds the socket and launches the server, blocking until `/health`
    /// answers 200. Never restarts an already-alive server — a player's
    /// in-flight connection would be dropped.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let guard = self.server.lock().await;
            if guard.is_some() && self.is_ready() {
                return Ok(());
            }
        }

        let preferred = self.preferred_port.load(Ordering::Acquire);
        let listener = bind_preferred_or_any(preferred).await?;
        let port = listener.local_addr()?.port();
        self.preferred_port.store(port, Ordering::Release);

        let router = handler::router(Arc::clone(self));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = result {
                warn!(%err, "proxy server exited with error");
            }
        });

        {
            let mut guard = self.server.lock().await;
            *guard = Some(RunningServer {
                port,
                shutdown: shutdown_tx,
                join,
            });
        }

        wait_ready(port, HEALTH_WAIT_TIMEOUT).await?;
        self.ready.store(true, Ordering::Release);
        info!(port, "proxy ready");
        Ok(())
    }

    pub async fn stop(&self) {
        let running = self.server.lock().await.take();
        if let Some(running) = running {
            let _ = running.shutdown.send(());
            let _ = running.join.await;
        }
        self.ready.store(false, Ordering::Release);
    }

    /// Registers `(url, headers)`, persisting a mapping and creating the
    /// entry if absent. Returns the local URL the caller should hand to the
    /// player. Infallible by contract (spec.md §7): errors are logged, not
    /// propagated.
    #[instrument(skip(self, headers))]
    pub async fn proxify(&self, url: &str, headers: HeaderMap) -> String {
        let header_pairs: Vec<(String, String)> = headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let sid = sid::compute(url, &header_pairs);

        if let Err(err) = self.write_mapping(&sid, url, &header_pairs).await {
            warn!(%err, "failed to persist mapping");
        }

        if !self.registry.contains_key(&sid) {
            let dir = self.config.cache_dir.join(sid::url_dir_name(url));
            let entry = Arc::new(Entry::new(url.to_string(), headers, dir, Arc::clone(&self.origin)));
            if let Err(err) = entry.reload_from_disk().await {
                debug!(%err, "no existing cache directory to rehydrate");
            }
            self.registry.insert(sid.clone(), entry);
        }

        let port = self.preferred_port.load(Ordering::Acquire);
        format!("http://127.0.0.1:{port}/media?id={sid}")
    }

    /// Looks up `sid` in the in-memory registry, falling back to rebuilding
    /// the entry from its persisted mapping file (spec.md §4.7, §6.1).
    pub async fn resolve_entry(&self, sid: &str) -> Option<Arc<Entry>> {
        if let Some(entry) = self.registry.get(sid) {
            return Some(Arc::clone(&entry));
        }

        let mapping = self.read_mapping(sid).await.ok()?;
        let mut headers = HeaderMap::new();
        for (k, v) in &mapping.headers {
            if let (Ok(name), Ok(value)) = (
                http::HeaderName::try_from(k.as_str()),
                http::HeaderValue::from_str(v),
            ) {
                headers.insert(name, value);
            }
        }

        let dir = self.config.cache_dir.join(sid::url_dir_name(&mapping.url));
        let entry = Arc::new(Entry::new(mapping.url, headers, dir, Arc::clone(&self.origin)));
        let _ = entry.reload_from_disk().await;
        self.registry.insert(sid.to_string(), Arc::clone(&entry));
        Some(entry)
    }

    /// Coarse eviction of warm entries over idle-time/count budget, stopping
    /// their background workers first.
    pub async fn prune(&self, max_entries: usize, max_idle_seconds: u64) {
        if self.registry.len() <= max_entries {
            return;
        }

        let max_idle_millis = max_idle_seconds * 1000;
        let mut idle_sids: Vec<(String, u64)> = self
            .registry
            .iter()
            .filter(|kv| kv.value().idle_millis() > max_idle_millis)
            .map(|kv| (kv.key().clone(), kv.value().idle_millis()))
            .collect();
        idle_sids.sort_by_key(|(_, idle)| std::cmp::Reverse(*idle));

        let overflow = self.registry.len().saturating_sub(max_entries);
        for (sid, _) in idle_sids.into_iter().take(overflow) {
            if let Some((_, entry)) = self.registry.remove(&sid) {
                crate::prefetch::stop(&entry).await;
            }
        }
    }

    async fn write_mapping(&self, sid: &str, url: &str, headers: &[(String, String)]) -> Result<()> {
        tokio::fs::create_dir_all(&self.mappings_dir).await?;
        let mapping = Mapping {
            url: url.to_string(),
            headers: headers.iter().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&mapping)?;
        tokio::fs::write(self.mappings_dir.join(format!("{sid}.json")), json).await?;
        Ok(())
    }

    async fn read_mapping(&self, sid: &str) -> Result<Mapping> {
        let raw = tokio::fs::read(self.mappings_dir.join(format!("{sid}.json"))).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

async fn bind_preferred_or_any(preferred_port: u16) -> Result<TcpListener> {
    if preferred_port != 0 {
        let addr = SocketAddr::from(([127, 0, 0, 1], preferred_port));
        if let Ok(listener) = TcpListener::bind(addr).await {
            return Ok(listener);
        }
    }
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    Ok(TcpListener::bind(addr).await?)
}

/// Authoritative readiness check: a real `/health` round-trip over a raw
/// socket, not just the internal readiness flag (spec.md §9 Open Question).
async fn wait_ready(port: u16, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Ok(true)) = tokio::time::timeout(Duration::from_millis(200), probe_health(port)).await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("proxy did not become ready within {:?}", timeout));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn probe_health(port: u16) -> Result<bool> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
        .await?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);
    Ok(response.starts_with("HTTP/1.1 200") || response.starts_with("HTTP/1.0 200"))
}
