//! Per-URL cache state (C3): total length, range-support flag, content
//! type, segment list, and the background worker handle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http::HeaderMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ProxyError;
use crate::origin::OriginClient;
use crate::prefetch::PrefetchHandle;
use crate::segment::{self, Segment};

/// Three-valued range-support state (spec.md §3.1). `Unknown` still
/// permits a probe; `No` is a latch that nothing un-sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeSupport {
    Unknown,
    Yes,
    No,
}

pub(crate) struct EntryState {
    pub segments: Vec<Segment>,
    pub total_length: Option<u64>,
    pub range_supported: RangeSupport,
    pub content_type: String,
}

/// Metadata protected by a single mutex; origin I/O and disk I/O always
/// happen with the lock released (spec.md §4.3).
pub struct Entry {
    pub url: String,
    pub headers: HeaderMap,
    pub dir: PathBuf,
    pub(crate) origin: Arc<OriginClient>,
    pub(crate) state: Mutex<EntryState>,
    last_access: AtomicU64,
    pub(crate) background: Mutex<Option<PrefetchHandle>>,
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Entry {
    pub fn new(url: String, headers: HeaderMap, dir: PathBuf, origin: Arc<OriginClient>) -> Self {
        Entry {
            url,
            headers,
            dir,
            origin,
            state: Mutex::new(EntryState {
                segments: Vec::new(),
                total_length: None,
                range_supported: RangeSupport::Unknown,
                content_type: "application/octet-stream".to_string(),
            }),
            last_access: AtomicU64::new(now_millis()),
            background: Mutex::new(None),
        }
    }

    /// Rebuild `segments` from disk; called lazily on rehydration.
    pub async fn reload_from_disk(&self) -> std::io::Result<()> {
        let loaded = segment::load_from_disk(&self.dir).await?;
        let mut state = self.state.lock().await;
        state.segments = loaded;
        Ok(())
    }

    pub fn touch(&self) {
        self.last_access.store(now_millis(), Ordering::Relaxed);
    }

    pub fn idle_millis(&self) -> u64 {
        now_millis().saturating_sub(self.last_access.load(Ordering::Relaxed))
    }

    /// Idempotent: runs the Origin Client probe and records the outcome.
    /// Safe to call repeatedly; once any caller's result lands, later
    /// callers see a settled `range_supported` and skip the probe. Two
    /// callers racing on the same still-`Unknown` entry can each issue a
    /// probe before either writes back — this is a bounded one-time
    /// duplication per entry, not an unbounded one.
    pub async fn ensure_probed(&self) {
        {
            let state = self.state.lock().await;
            if state.range_supported != RangeSupport::Unknown {
                return;
            }
        }

        let outcome = self.origin.probe(&self.url, &self.headers).await;

        let mut state = self.state.lock().await;
        if state.range_supported != RangeSupport::Unknown {
            return;
        }
        match outcome {
            Ok(outcome) => {
                state.range_supported = if outcome.range_supported {
                    RangeSupport::Yes
                } else {
                    RangeSupport::No
                };
                if let Some(total) = outcome.total_length {
                    state.total_length = Some(state.total_length.map_or(total, |t| t.max(total)));
                }
                if let Some(ct) = outcome.content_type {
                    state.content_type = ct;
                }
            }
            Err(err) => {
                debug!(url = %self.url, error = %err, "probe failed, treating range support as unsupported");
                state.range_supported = RangeSupport::No;
            }
        }
    }

    pub async fn range_supported(&self) -> RangeSupport {
        self.state.lock().await.range_supported
    }

    pub async fn total_length(&self) -> Option<u64> {
        self.state.lock().await.total_length
    }

    pub async fn content_type(&self) -> String {
        self.state.lock().await.content_type.clone()
    }

    /// Snapshot of the current segment set, for coverage queries.
    pub async fn snapshot_segments(&self) -> Vec<Segment> {
        self.state.lock().await.segments.clone()
    }

    /// Read `[start, end]`, reloading and pruning metadata once on failure
    /// (spec.md §4.6 edge case: corrupt-chunk retry).
    pub async fn read_cached(&self, start: u64, end: u64) -> Result<Vec<u8>, ProxyError> {
        let segs = self.snapshot_segments().await;
        match segment::read(&self.dir, &segs, start, end).await {
            Ok(bytes) => Ok(bytes),
            Err(_) => {
                let pruned = segment::prune_invalid(&self.dir, &segs).await;
                {
                    let mut state = self.state.lock().await;
                    state.segments = pruned.clone();
                }
                segment::read(&self.dir, &pruned, start, end).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        ProxyError::CacheMiss { start, end }
                    } else {
                        ProxyError::Io(e)
                    }
                })
            }
        }
    }
}
