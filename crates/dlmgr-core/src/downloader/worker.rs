//! Per-segment blocking worker (§4.1 step 4, §5 numeric constants).
//!
//! One blocking OS thread per segment. Each issues a single Range GET, reads
//! data as curl hands it over (roughly 1 MiB at a time), accumulates into a
//! 16 MiB buffer before issuing an offset write, and checkpoints progress to
//! the caller every 5 s. A 30 s stall (no bytes received) aborts the transfer;
//! the engine itself does not retry a failed or aborted segment.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::retry::SegmentError;
use crate::segmenter::Segment;
use crate::storage::StorageWriter;

/// Bytes buffered in memory before an offset write is issued.
pub const FLUSH_BUFFER_SIZE: usize = 16 * 1024 * 1024;
/// Interval between progress checkpoints handed to the caller.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);
/// Stall timeout: abort if the transfer stalls this long (§5 "segment read 30 s").
const SEGMENT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a segment worker stopped without finishing.
#[derive(Debug)]
pub enum SegmentFailure {
    /// The caller's abort token was set mid-transfer.
    Aborted,
    Error(SegmentError),
}

impl From<SegmentError> for SegmentFailure {
    fn from(e: SegmentError) -> Self {
        SegmentFailure::Error(e)
    }
}

struct FlushBuffer {
    offset: Cell<u64>,
    data: RefCell<Vec<u8>>,
    downloaded: Cell<u64>,
}

impl FlushBuffer {
    fn new(offset: u64, downloaded: u64) -> Self {
        Self {
            offset: Cell::new(offset),
            data: RefCell::new(Vec::with_capacity(FLUSH_BUFFER_SIZE)),
            downloaded: Cell::new(downloaded),
        }
    }

    /// Appends `chunk`, flushing to `storage` once the buffer reaches
    /// `FLUSH_BUFFER_SIZE`.
    fn push(&self, chunk: &[u8], storage: &StorageWriter) -> io::Result<()> {
        {
            let mut buf = self.data.borrow_mut();
            buf.extend_from_slice(chunk);
            if buf.len() < FLUSH_BUFFER_SIZE {
                self.downloaded.set(self.downloaded.get() + chunk.len() as u64);
                return Ok(());
            }
        }
        self.flush(storage)?;
        self.downloaded.set(self.downloaded.get() + chunk.len() as u64);
        Ok(())
    }

    fn flush(&self, storage: &StorageWriter) -> io::Result<()> {
        let mut buf = self.data.borrow_mut();
        if buf.is_empty() {
            return Ok(());
        }
        storage
            .write_at(self.offset.get(), &buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.offset.set(self.offset.get() + buf.len() as u64);
        buf.clear();
        Ok(())
    }
}

/// Downloads the remaining bytes of `segment` (from `start + downloaded`
/// through `end` inclusive). `on_checkpoint` is called at most once per
/// `CHECKPOINT_INTERVAL` with the segment's in-flight progress; it is the
/// caller's responsibility to persist the returned, final `Segment` too.
pub fn download_segment(
    url: &str,
    custom_headers: &HashMap<String, String>,
    proxy_url: Option<&str>,
    segment: Segment,
    storage: &StorageWriter,
    abort: &Arc<AtomicBool>,
    mut on_checkpoint: impl FnMut(&Segment),
) -> Result<Segment, SegmentFailure> {
    if segment.is_complete() {
        let mut done = segment;
        done.finished = true;
        return Ok(done);
    }

    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(SegmentError::Curl)?;
    easy.follow_location(true).map_err(SegmentError::Curl)?;
    easy.low_speed_limit(1).map_err(SegmentError::Curl)?;
    easy.low_speed_time(SEGMENT_READ_TIMEOUT).map_err(SegmentError::Curl)?;
    if let Some(proxy) = proxy_url {
        easy.proxy(proxy).map_err(SegmentError::Curl)?;
    }

    let mut list = curl::easy::List::new();
    list.append(&format!("Range: {}", segment.range_header_value()))
        .map_err(SegmentError::Curl)?;
    for (k, v) in custom_headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))
            .map_err(SegmentError::Curl)?;
    }
    easy.http_headers(list).map_err(SegmentError::Curl)?;

    let buffer = FlushBuffer::new(segment.start + segment.downloaded, segment.downloaded);
    let last_checkpoint = Cell::new(Instant::now());
    let aborted = Cell::new(false);
    let io_err: RefCell<Option<io::Error>> = RefCell::new(None);

    {
        let mut transfer = easy.transfer();
        transfer
            .write_function(|data| {
                if abort.load(Ordering::Relaxed) {
                    aborted.set(true);
                    return Ok(0);
                }
                if let Err(e) = buffer.push(data, storage) {
                    *io_err.borrow_mut() = Some(e);
                    return Ok(0);
                }
                if last_checkpoint.get().elapsed() >= CHECKPOINT_INTERVAL {
                    last_checkpoint.set(Instant::now());
                    let snapshot = Segment {
                        index: segment.index,
                        start: segment.start,
                        end: segment.end,
                        downloaded: buffer.downloaded.get(),
                        finished: false,
                    };
                    on_checkpoint(&snapshot);
                }
                Ok(data.len())
            })
            .map_err(SegmentError::Curl)?;
        transfer.perform().map_err(SegmentError::Curl)?;
    }

    if aborted.get() {
        return Err(SegmentFailure::Aborted);
    }
    if let Some(e) = io_err.into_inner() {
        return Err(SegmentError::Storage(e).into());
    }

    buffer
        .flush(storage)
        .map_err(SegmentError::Storage)?;

    // A 200 is only acceptable for the unbounded sequential-fallback segment;
    // on a real ranged request it means the server ignored `Range` and is
    // sending the whole file from byte 0, which would silently corrupt any
    // segment writing at a non-zero offset.
    let code = easy.response_code().map_err(SegmentError::Curl)?;
    if segment.is_unbounded() {
        if code != 200 && code != 206 {
            return Err(SegmentError::Http(code).into());
        }
    } else if code != 206 {
        return Err(SegmentError::Http(code).into());
    }

    let downloaded = buffer.downloaded.get();
    if segment.is_unbounded() {
        // No expected length to compare against: a clean `perform()` return
        // and an acceptable status code is itself the completion signal.
        return Ok(Segment {
            index: segment.index,
            start: segment.start,
            end: segment.end,
            downloaded,
            finished: true,
        });
    }

    let expected = segment.expected_len();
    let mut result = Segment {
        index: segment.index,
        start: segment.start,
        end: segment.end,
        downloaded,
        finished: downloaded >= expected,
    };
    if downloaded > expected {
        result.downloaded = expected;
        result.finished = true;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_complete_segment_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.part");
        let mut b = crate::storage::StorageWriterBuilder::create(&path).unwrap();
        b.preallocate(10).unwrap();
        let storage = b.build();
        let segment = Segment { index: 0, start: 0, end: 9, downloaded: 10, finished: false };
        let abort = Arc::new(AtomicBool::new(false));
        let result = download_segment(
            "https://example.invalid/x",
            &HashMap::new(),
            None,
            segment,
            &storage,
            &abort,
            |_| {},
        )
        .unwrap();
        assert!(result.finished);
        assert_eq!(result.downloaded, 10);
    }

    #[test]
    fn flush_buffer_accumulates_then_writes_on_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.part");
        let mut b = crate::storage::StorageWriterBuilder::create(&path).unwrap();
        b.preallocate(FLUSH_BUFFER_SIZE as u64 + 10).unwrap();
        let storage = b.build();
        let fb = FlushBuffer::new(0, 0);
        let small = vec![7u8; 10];
        fb.push(&small, &storage).unwrap();
        assert_eq!(fb.downloaded.get(), 10);
        // Hasn't reached the threshold, so nothing written to disk yet.
        assert_eq!(fb.data.borrow().len(), 10);

        let big = vec![9u8; FLUSH_BUFFER_SIZE];
        fb.push(&big, &storage).unwrap();
        assert_eq!(fb.downloaded.get(), 10 + FLUSH_BUFFER_SIZE as u64);
        assert!(fb.data.borrow().is_empty());
    }
}
