use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Floors enforced by `normalize()`, matching the Caller API contract in
/// spec.md §6.3.
const MIN_PREFETCH_BYTES: u64 = 512 * 1024;
const MIN_INLINE_WINDOW_BYTES: u64 = 256 * 1024;
const MIN_BACKGROUND_CHUNK_BYTES: u64 = 1024 * 1024;

const DEFAULT_PREFETCH_KB: u64 = 16 * 1024;
const DEFAULT_INLINE_WINDOW_KB: u64 = 1024;
const DEFAULT_BACKGROUND_CHUNK_KB: u64 = 8 * 1024;

/// Tunable knobs for a `Proxy`, mirroring `RangeCacheProxy.__init__` in the
/// original Python implementation (see
/// `examples/original_source/core/range_cache_proxy.py`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for per-URL cache directories and `mappings/`.
    /// Defaults to a subdirectory of the system temp dir.
    pub cache_dir: PathBuf,

    /// Target total read-ahead (inline + background). Floor: 512 KiB.
    pub prefetch_bytes: u64,

    /// Per-response cap on bytes written before returning control to the
    /// player. Floor: 256 KiB.
    pub inline_window_bytes: u64,

    /// Whether the background prefetcher (C5) runs at all.
    pub background_download: bool,

    /// Chunk size used by the background prefetcher. Floor: 1 MiB.
    pub background_chunk_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: std::env::temp_dir().join("rangecache"),
            prefetch_bytes: DEFAULT_PREFETCH_KB * 1024,
            inline_window_bytes: DEFAULT_INLINE_WINDOW_KB * 1024,
            background_download: true,
            background_chunk_bytes: DEFAULT_BACKGROUND_CHUNK_KB * 1024,
        }
    }
}

impl Config {
    pub fn normalize(mut self) -> Self {
        self.prefetch_bytes = self.prefetch_bytes.max(MIN_PREFETCH_BYTES);
        self.inline_window_bytes = self.inline_window_bytes.max(MIN_INLINE_WINDOW_BYTES);
        self.background_chunk_bytes = self.background_chunk_bytes.max(MIN_BACKGROUND_CHUNK_BYTES);
        self
    }

    pub async fn from_toml_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let doc = tokio::fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&doc)?;
        Ok(config.normalize())
    }
}
