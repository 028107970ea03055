//! On-disk representation of cached byte intervals for a single entry (C1).
//!
//! Each entry owns a directory containing zero or more chunk files named
//! `<start>-<end>.bin` (12-digit zero-padded, inclusive on both ends) plus
//! transient `.tmp-*` files staged during a write. Segments never overlap on
//! disk; `merged`/`missing` answer coverage queries without touching the
//! filesystem.

use std::path::{Path, PathBuf};

use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// An inclusive byte interval `[start, end]`.
pub type Segment = (u64, u64);

fn chunk_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{12})-(\d{12})\.bin$").unwrap())
}

fn file_name(start: u64, end: u64) -> String {
    format!("{:012}-{:012}.bin", start, end)
}

/// Path of the chunk file for `[start, end]` inside `dir`.
pub fn path(dir: &Path, start: u64, end: u64) -> PathBuf {
    dir.join(file_name(start, end))
}

/// Scan `dir` for chunk files, keeping only those whose name parses and
/// whose size matches `end - start + 1` (spec.md §4.1, Invariant 1).
pub async fn load_from_disk(dir: &Path) -> std::io::Result<Vec<Segment>> {
    let mut out = Vec::new();
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e),
    };

    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(caps) = chunk_name_re().captures(name) else {
            continue;
        };
        let start: u64 = caps[1].parse().unwrap();
        let end: u64 = caps[2].parse().unwrap();
        if end < start {
            continue;
        }
        let meta = match entry.metadata().await {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.len() == end - start + 1 {
            out.push((start, end));
        }
    }

    out.sort_unstable();
    Ok(out)
}

/// Remove segments whose backing file is missing or size-mismatched,
/// best-effort deleting the offending file. Returns the surviving set.
pub async fn prune_invalid(dir: &Path, segments: &[Segment]) -> Vec<Segment> {
    let mut out = Vec::with_capacity(segments.len());
    for &(s, e) in segments {
        let p = path(dir, s, e);
        let valid = match tokio::fs::metadata(&p).await {
            Ok(m) => m.len() == e - s + 1,
            Err(_) => false,
        };
        if valid {
            out.push((s, e));
        } else {
            let _ = tokio::fs::remove_file(&p).await;
        }
    }
    out
}

/// Write `data` as the chunk `[start, end]` in `dir`, atomically.
///
/// Stages into a uniquely-named temp file first so two concurrent fetches of
/// the same interval can never clobber each other's partial write. If the
/// destination already exists by the time the rename would occur (another
/// fetch finished first), the temp file is discarded and whichever copy
/// landed first is kept.
pub async fn write_chunk(dir: &Path, start: u64, end: u64, data: &[u8]) -> std::io::Result<()> {
    if data.len() as u64 != end - start + 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "chunk length does not match advertised interval",
        ));
    }

    tokio::fs::create_dir_all(dir).await?;

    let suffix: u64 = rand::rng().random();
    let tmp_path = dir.join(format!(".tmp-{:012}-{:012}-{:016x}", start, end, suffix));

    let result = async {
        let mut f = tokio::fs::File::create(&tmp_path).await?;
        f.write_all(data).await?;
        f.flush().await?;
        Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    let dest = path(dir, start, end);
    if tokio::fs::metadata(&dest).await.is_ok() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Ok(());
    }

    match tokio::fs::rename(&tmp_path, &dest).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            Err(e)
        }
    }
}

/// Read `[start, end]` from `dir`, assuming `segments` fully covers it.
///
/// Walks left-to-right; at each step picks the covering segment with the
/// farthest `end` to minimize file opens (spec.md §4.1 tie-break rule).
pub async fn read(dir: &Path, segments: &[Segment], start: u64, end: u64) -> std::io::Result<Vec<u8>> {
    let total_len = (end - start + 1) as usize;
    let mut out = Vec::with_capacity(total_len);
    let mut cursor = start;

    while cursor <= end {
        let best = segments
            .iter()
            .filter(|&&(s, e)| s <= cursor && cursor <= e)
            .max_by_key(|&&(_, e)| e);

        let Some(&(s, e)) = best else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no segment covers offset {cursor}"),
            ));
        };

        let read_end = end.min(e);
        let want = (read_end - cursor + 1) as usize;

        let mut f = tokio::fs::File::open(path(dir, s, e)).await?;
        f.seek(std::io::SeekFrom::Start(cursor - s)).await?;
        let mut buf = vec![0u8; want];
        f.read_exact(&mut buf).await?;
        out.extend_from_slice(&buf);

        cursor = read_end + 1;
    }

    Ok(out)
}

/// Merge overlapping/adjacent segments into logical coverage intervals.
/// Used only for "what is cached?" queries, never applied to disk.
pub fn merged(segments: &[Segment]) -> Vec<Segment> {
    let mut sorted: Vec<Segment> = segments.to_vec();
    sorted.sort_unstable();

    let mut out: Vec<Segment> = Vec::with_capacity(sorted.len());
    for (s, e) in sorted {
        if let Some(last) = out.last_mut() {
            if s <= last.1.saturating_add(1) {
                last.1 = last.1.max(e);
                continue;
            }
        }
        out.push((s, e));
    }
    out
}

/// Gaps in `[start, end]` not covered by `segments`, after merging.
pub fn missing(segments: &[Segment], start: u64, end: u64) -> Vec<Segment> {
    if start > end {
        return Vec::new();
    }

    let mut gaps = Vec::new();
    let mut cursor = start;

    for (s, e) in merged(segments) {
        if e < start || s > end {
            continue;
        }
        if s > cursor {
            gaps.push((cursor, s - 1));
        }
        cursor = cursor.max(e + 1);
        if cursor > end {
            break;
        }
    }

    if cursor <= end {
        gaps.push((cursor, end));
    }

    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn merged_joins_adjacent_and_overlapping() {
        assert_eq!(merged(&[(0, 99), (100, 199)]), vec![(0, 199)]);
        assert_eq!(merged(&[(0, 99), (50, 199)]), vec![(0, 199)]);
        assert_eq!(merged(&[(0, 99), (200, 299)]), vec![(0, 99), (200, 299)]);
    }

    #[test]
    fn merged_is_idempotent() {
        let once = merged(&[(10, 20), (0, 9), (25, 30)]);
        assert_eq!(merged(&once), once);
    }

    #[test]
    fn missing_finds_interior_gap() {
        let segs = vec![(0, 999), (2000, 2999)];
        assert_eq!(missing(&segs, 0, 2999), vec![(1000, 1999)]);
    }

    #[test]
    fn missing_is_empty_when_fully_covered() {
        let segs = vec![(0, 999), (1000, 1999), (2000, 2999)];
        assert!(missing(&segs, 0, 2999).is_empty());
    }

    #[test]
    fn missing_handles_no_overlap_at_all() {
        let segs: Vec<Segment> = vec![];
        assert_eq!(missing(&segs, 5, 10), vec![(5, 10)]);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        write_chunk(dir.path(), 0, 9, b"0123456789").await.unwrap();
        let segs = load_from_disk(dir.path()).await.unwrap();
        assert_eq!(segs, vec![(0, 9)]);
        let data = read(dir.path(), &segs, 2, 5).await.unwrap();
        assert_eq!(data, b"2345");
    }

    #[tokio::test]
    async fn load_from_disk_rejects_size_mismatch() {
        let dir = tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(path(dir.path(), 0, 9), b"short").await.unwrap();
        let segs = load_from_disk(dir.path()).await.unwrap();
        assert!(segs.is_empty());
    }

    #[tokio::test]
    async fn prune_invalid_removes_missing_files() {
        let dir = tempdir().unwrap();
        write_chunk(dir.path(), 0, 9, b"0123456789").await.unwrap();
        tokio::fs::remove_file(path(dir.path(), 0, 9)).await.unwrap();
        let pruned = prune_invalid(dir.path(), &[(0, 9)]).await;
        assert!(pruned.is_empty());
    }

    #[tokio::test]
    async fn read_picks_farthest_covering_segment() {
        let dir = tempdir().unwrap();
        write_chunk(dir.path(), 0, 19, &[b'a'; 20]).await.unwrap();
        write_chunk(dir.path(), 0, 9, &[b'b'; 10]).await.unwrap();
        let segs = vec![(0, 9), (0, 19)];
        let data = read(dir.path(), &segs, 0, 19).await.unwrap();
        assert_eq!(data, [b'a'; 20]);
    }

    #[tokio::test]
    async fn write_chunk_rejects_wrong_length() {
        let dir = tempdir().unwrap();
        let err = write_chunk(dir.path(), 0, 9, b"short").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        let entries: Vec<_> = tokio::fs::read_dir(dir.path())
            .await
            .unwrap()
            .next_entry()
            .await
            .unwrap()
            .into_iter()
            .collect();
        assert!(entries.is_empty());
    }
}
