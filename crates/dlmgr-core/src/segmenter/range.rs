//! Segment type, range planning, and resume validation/repair.

use serde::{Deserialize, Serialize};

/// A single segment of a download: inclusive byte range `[start, end]`,
/// assigned to one worker (§3 "Segment").
///
/// Invariants: `0 <= downloaded <= end - start + 1`, and
/// `finished => downloaded == end - start + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub downloaded: u64,
    pub finished: bool,
}

/// Sentinel `end` marking an open-ended segment: the sequential fallback
/// used when the probe can't determine `total_size` or the server disallows
/// ranges (§4.1 step 2). Completion for such a segment is decided by the
/// transfer finishing cleanly, not by a byte count.
pub const UNBOUNDED_END: u64 = u64::MAX;

impl Segment {
    /// Number of bytes this segment covers (`end - start + 1`), or
    /// `u64::MAX` for an unbounded segment.
    pub fn expected_len(&self) -> u64 {
        if self.end == UNBOUNDED_END {
            return UNBOUNDED_END;
        }
        self.end.saturating_sub(self.start) + 1
    }

    /// True for the sequential-fallback sentinel segment.
    pub fn is_unbounded(&self) -> bool {
        self.end == UNBOUNDED_END
    }

    /// HTTP Range header value for the still-missing tail of this segment:
    /// `bytes={start+downloaded}-{end}`, or an open-ended `bytes=N-` when
    /// unbounded (§4.1 step 4).
    pub fn range_header_value(&self) -> String {
        if self.is_unbounded() {
            format!("bytes={}-", self.start + self.downloaded)
        } else {
            format!("bytes={}-{}", self.start + self.downloaded, self.end)
        }
    }

    /// True once `downloaded` covers the whole segment, regardless of
    /// `finished`. Always false for an unbounded segment; such a segment's
    /// completion is driven by `finished` alone, set once the transfer ends
    /// cleanly.
    pub fn is_complete(&self) -> bool {
        if self.is_unbounded() {
            return self.finished;
        }
        self.downloaded >= self.expected_len()
    }
}

/// Builds the single open-ended segment used for the sequential fallback
/// (unknown size, or server disallows ranges). Resume is not attempted for
/// this segment: a half-written sequential download cannot be safely
/// verified against a server that may not honor `Range`, so it always
/// restarts from zero (see `validate_segments`).
pub fn unbounded_segment() -> Segment {
    Segment { index: 0, start: 0, end: UNBOUNDED_END, downloaded: 0, finished: false }
}

/// Builds a segment plan for `[0, total_size)` split into `worker_count`
/// roughly equal contiguous segments; the last segment absorbs the
/// remainder (§4.1 step 3). Returns an empty vec if `total_size` is 0 or
/// `worker_count` is 0.
pub fn plan_segments(total_size: u64, worker_count: usize) -> Vec<Segment> {
    if total_size == 0 || worker_count == 0 {
        return Vec::new();
    }

    let workers = worker_count as u64;
    let base = total_size / workers;
    if base == 0 {
        // More workers than bytes: one segment per byte is wasteful and the
        // partition math breaks down, so fall back to a single segment.
        return vec![Segment {
            index: 0,
            start: 0,
            end: total_size - 1,
            downloaded: 0,
            finished: false,
        }];
    }

    let mut out = Vec::with_capacity(worker_count);
    let mut offset = 0u64;
    for i in 0..workers {
        let is_last = i == workers - 1;
        let end = if is_last { total_size - 1 } else { offset + base - 1 };
        out.push(Segment {
            index: i as usize,
            start: offset,
            end,
            downloaded: 0,
            finished: false,
        });
        offset = end + 1;
    }
    out
}

/// Validates and repairs loaded segments against their expected lengths
/// (§4.1 "Resume protocol"): a segment marked `finished` with less data than
/// expected is un-finished so it resumes; one with more data than expected
/// (an over-counted counter from an unclean shutdown) is clamped and marked
/// finished.
pub fn validate_segments(segments: &mut [Segment]) {
    for seg in segments.iter_mut() {
        if seg.is_unbounded() {
            if !seg.finished {
                seg.downloaded = 0;
            }
            continue;
        }
        let expected = seg.expected_len();
        if seg.finished && seg.downloaded < expected {
            seg.finished = false;
        }
        if seg.downloaded > expected {
            seg.downloaded = expected;
            seg.finished = true;
        }
    }
}

/// True iff segments partition `[0, total_size)` exactly: sorted by index,
/// contiguous, no gaps or overlaps, and the union equals the whole range
/// (testable property §8.1).
pub fn partitions_exactly(segments: &[Segment], total_size: u64) -> bool {
    if segments.is_empty() {
        return total_size == 0;
    }
    let mut sorted: Vec<&Segment> = segments.iter().collect();
    sorted.sort_by_key(|s| s.index);
    if sorted[0].start != 0 {
        return false;
    }
    for pair in sorted.windows(2) {
        if pair[1].start != pair[0].end + 1 {
            return false;
        }
    }
    sorted.last().map(|s| s.end + 1 == total_size).unwrap_or(false)
}
