//! Turns a requested byte interval into a bounded sequence of origin
//! fetches, writing results to the Segment Store (C4).

use crate::entry::{Entry, RangeSupport};
use crate::origin::FetchKind;
use crate::segment;

/// Extra bytes the fetcher is willing to read ahead of a request's `end` in
/// a single inline call, regardless of the configured `prefetch_bytes` —
/// larger read-ahead is left to the background worker (spec.md §9 Open
/// Question: preserve this split).
pub const INLINE_PREFETCH_CAP_BYTES: u64 = 2 * 1024 * 1024;

/// A single player request must not generate unbounded origin traffic if
/// the origin clamps ranges to tiny sizes.
const MAX_FETCHES_PER_CALL: u32 = 12;

/// Best-effort extension of `entry`'s cached coverage so that at least
/// `[start, served_end]` is on disk. Returns `served_end >= start`, or
/// `start - 1` (saturating) if nothing could be fetched.
pub async fn ensure_cached(entry: &Entry, start: u64, end: u64) -> u64 {
    entry.ensure_probed().await;

    if entry.range_supported().await == RangeSupport::No {
        return start.saturating_sub(1);
    }

    let total_length = entry.total_length().await;
    let mut want_end = end.saturating_add(INLINE_PREFETCH_CAP_BYTES);
    if let Some(total) = total_length {
        want_end = want_end.min(total.saturating_sub(1));
    }
    if want_end < end {
        want_end = end;
    }

    let segs = entry.snapshot_segments().await;
    let gaps = segment::missing(&segs, start, want_end);

    'gaps: for &(gs, ge) in gaps.iter().take(MAX_FETCHES_PER_CALL as usize) {
        match entry.origin.fetch(&entry.url, &entry.headers, gs, ge).await {
            Ok(result) => match result.kind {
                FetchKind::Partial {
                    start: served_start,
                    end: served_end,
                    total_length: fetched_total,
                } => {
                    if segment::write_chunk(&entry.dir, served_start, served_end, &result.body)
                        .await
                        .is_err()
                    {
                        break 'gaps;
                    }

                    let mut state = entry.state.lock().await;
                    insert_segment(&mut state.segments, (served_start, served_end));
                    if let Some(total) = fetched_total {
                        state.total_length = Some(state.total_length.map_or(total, |t| t.max(total)));
                    }
                    if let Some(ct) = &result.content_type {
                        state.content_type = ct.clone();
                    }
                    drop(state);

                    if served_end < ge {
                        break 'gaps;
                    }
                }
                FetchKind::RangeIgnored => {
                    let mut state = entry.state.lock().await;
                    state.range_supported = RangeSupport::No;
                    break 'gaps;
                }
            },
            Err(_) => break 'gaps,
        }
    }

    let final_segs = entry.snapshot_segments().await;
    largest_contiguous_end(&final_segs, start).unwrap_or(start.saturating_sub(1))
}

fn insert_segment(segments: &mut Vec<segment::Segment>, seg: segment::Segment) {
    segments.push(seg);
    segments.sort_unstable();
}

/// The largest `e` such that `[start, e]` is contiguously covered by
/// `segments`, merged.
fn largest_contiguous_end(segments: &[segment::Segment], start: u64) -> Option<u64> {
    segment::merged(segments)
        .into_iter()
        .find(|&(s, e)| s <= start && start <= e)
        .map(|(_, e)| e)
}
