//! Scenario 5 (§8.4): a `.bin` file disappears between requests; the next
//! read must prune the stale segment, re-fetch the gap, and still serve
//! the correct bytes.

mod common;

use http::HeaderMap;
use rangecache::Config;

use common::{spawn_fake_origin, OriginMode, TestClient};

#[tokio::test]
async fn missing_chunk_file_triggers_prune_and_refetch() {
    let body: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
    let origin = spawn_fake_origin(body.clone(), OriginMode::RangeSupported).await;

    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        cache_dir: dir.path().to_path_buf(),
        inline_window_bytes: 256 * 1024,
        ..Config::default()
    };
    let proxy = rangecache::get(config);
    proxy.start().await.unwrap();

    let local_url = proxy.proxify(&origin.url(), HeaderMap::new()).await;
    let client = TestClient::new();

    let first = client.request("GET", &local_url, Some("bytes=0-999")).await;
    assert_eq!(first.status, http::StatusCode::PARTIAL_CONTENT);

    let mut bin_path = None;
    let mut entry_dir_walker = tokio::fs::read_dir(dir.path()).await.unwrap();
    while let Some(entry) = entry_dir_walker.next_entry().await.unwrap() {
        if entry.file_name() == "mappings" {
            continue;
        }
        let mut inner = tokio::fs::read_dir(entry.path()).await.unwrap();
        while let Some(f) = inner.next_entry().await.unwrap() {
            if f.file_name().to_string_lossy().ends_with(".bin") {
                bin_path = Some(f.path());
            }
        }
    }
    let bin_path = bin_path.expect("a chunk file should exist after the first request");
    tokio::fs::remove_file(&bin_path).await.unwrap();

    let second = client.request("GET", &local_url, Some("bytes=0-999")).await;
    assert_eq!(second.status, http::StatusCode::PARTIAL_CONTENT);
    assert_eq!(&second.body[..], &body[0..1000]);

    proxy.stop().await;
}
