//! Segmented downloader engine (§4.1): probe, allocate, partition, fetch,
//! finalize.
//!
//! One blocking OS thread per segment (§5); the engine itself never retries a
//! failed or aborted segment, it just leaves the item resumable.

mod state;
mod worker;

pub use state::{delete_state, part_path, read_state_file, save_state, DownloadState};
pub use worker::{SegmentFailure, CHECKPOINT_INTERVAL, FLUSH_BUFFER_SIZE};

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::fetch_head::{self, ProbeResult};
use crate::retry::{classify, ErrorKind, SegmentError};
use crate::segmenter::{partitions_exactly, plan_segments, unbounded_segment, Segment};
use crate::storage::{StorageWriter, StorageWriterBuilder};
use crate::url_model::derive_filename;

/// Everything the engine needs for one run of a download: nothing here
/// outlives the call, so the caller (the scheduler) owns persistence of the
/// resulting `DownloadState` between runs.
pub struct DownloadRequest<'a> {
    pub url: &'a str,
    pub custom_headers: &'a HashMap<String, String>,
    pub proxy_url: Option<&'a str>,
    pub target_dir: &'a Path,
    pub worker_count: usize,
    pub fingerprint: &'a str,
    pub abort: Arc<AtomicBool>,
}

/// Outcome of one `run` call. `Stopped` covers both a clean pause (abort
/// requested) and an unrecovered segment failure — both leave a resumable
/// `.progress` file on disk; the difference is only in `last_error`.
#[derive(Debug)]
pub enum DownloadOutcome {
    Completed {
        resolved_filename: String,
        total_bytes: u64,
    },
    Stopped {
        resolved_filename: String,
        bytes_observed: u64,
        last_error: Option<String>,
    },
}

/// Distinguishes a preparation failure (probe, sanitization, disk
/// allocation — none of which leave partial progress) from a segment/fetch
/// failure (which does), per §7.
#[derive(Debug)]
pub enum DownloadError {
    Preparation(anyhow::Error),
    Fetch(anyhow::Error),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::Preparation(e) => write!(f, "preparation failed: {e}"),
            DownloadError::Fetch(e) => write!(f, "fetch failed: {e}"),
        }
    }
}

impl std::error::Error for DownloadError {}

/// Runs (or resumes) one download to completion or to a stopping point.
/// Synchronous and blocking by design (§5); call via `spawn_blocking` from
/// async code.
pub fn run(request: DownloadRequest) -> Result<DownloadOutcome, DownloadError> {
    std::fs::create_dir_all(request.target_dir)
        .context("create target directory")
        .map_err(DownloadError::Preparation)?;

    let existing = read_state_file(request.target_dir, request.fingerprint)
        .map_err(DownloadError::Preparation)?;

    let (resolved_filename, total_size, mut segments) = match existing {
        Some(state) if part_path(request.target_dir, &state.resolved_filename).exists() => {
            (state.resolved_filename, state.total_size, state.segments)
        }
        Some(_) => {
            // State file survived but its `.part` file didn't: nothing to
            // resume, start over (§4.1 "Resume protocol").
            delete_state(request.target_dir, request.fingerprint).map_err(DownloadError::Preparation)?;
            prepare_fresh(&request)?
        }
        None => prepare_fresh(&request)?,
    };

    let final_path = request.target_dir.join(&resolved_filename);
    let part_path = part_path(request.target_dir, &resolved_filename);

    if segments.iter().all(|s| s.finished) {
        // Fully downloaded already but the `.progress` file wasn't cleaned
        // up (e.g. crash between the last segment finishing and finalize).
        finalize(&part_path, &final_path, request.target_dir, request.fingerprint)
            .map_err(DownloadError::Fetch)?;
        let total_bytes = segments.iter().map(|s| s.downloaded).sum();
        return Ok(DownloadOutcome::Completed { resolved_filename, total_bytes });
    }

    let storage = if part_path.exists() {
        StorageWriter::open_existing(&part_path)
            .context("open existing part file")
            .map_err(DownloadError::Preparation)?
    } else {
        let mut builder = StorageWriterBuilder::create(&part_path)
            .context("create part file")
            .map_err(DownloadError::Preparation)?;
        if let Some(size) = total_size {
            builder.preallocate(size).map_err(DownloadError::Preparation)?;
        }
        builder.build()
    };

    // Persist the plan before fetching starts: a crash mid-transfer must find
    // a state file whose segments the periodic checkpoints can update.
    save_state(
        request.target_dir,
        request.fingerprint,
        &DownloadState {
            url: request.url.to_string(),
            resolved_filename: resolved_filename.clone(),
            total_size,
            segments: segments.clone(),
        },
    )
    .map_err(DownloadError::Preparation)?;

    let result = fetch_all_segments(&request, &mut segments, &storage, request.target_dir, request.fingerprint);

    save_state(
        request.target_dir,
        request.fingerprint,
        &DownloadState { url: request.url.to_string(), resolved_filename: resolved_filename.clone(), total_size, segments: segments.clone() },
    )
    .map_err(DownloadError::Fetch)?;

    match result {
        SegmentRunResult::AllFinished => {
            finalize(&part_path, &final_path, request.target_dir, request.fingerprint)
                .map_err(DownloadError::Fetch)?;
            let total_bytes = segments.iter().map(|s| s.downloaded).sum();
            Ok(DownloadOutcome::Completed { resolved_filename, total_bytes })
        }
        SegmentRunResult::Aborted => Ok(DownloadOutcome::Stopped {
            resolved_filename,
            bytes_observed: segments.iter().map(|s| s.downloaded).sum(),
            last_error: None,
        }),
        SegmentRunResult::Failed(msg) => Ok(DownloadOutcome::Stopped {
            resolved_filename,
            bytes_observed: segments.iter().map(|s| s.downloaded).sum(),
            last_error: Some(msg),
        }),
    }
}

fn prepare_fresh(request: &DownloadRequest) -> Result<(String, Option<u64>, Vec<Segment>), DownloadError> {
    let probe: ProbeResult = fetch_head::probe(request.url, request.custom_headers, request.proxy_url)
        .context("metadata probe failed")
        .map_err(DownloadError::Preparation)?;

    let resolved_filename = derive_filename(request.url, probe.content_disposition.as_deref());

    let segments = match probe.total_size {
        Some(size) if size > 0 && probe.accept_ranges => plan_segments(size, request.worker_count.max(1)),
        _ => vec![unbounded_segment()],
    };

    Ok((resolved_filename, probe.total_size.filter(|_| probe.accept_ranges), segments))
}

enum SegmentRunResult {
    AllFinished,
    Aborted,
    Failed(String),
}

/// Spawns one blocking thread per incomplete segment, waits for all of them,
/// and checkpoints progress via `save_state` as each segment reports in
/// (§4.1 step 4, §5 "one OS thread per segment").
fn fetch_all_segments(
    request: &DownloadRequest,
    segments: &mut [Segment],
    storage: &StorageWriter,
    target_dir: &Path,
    fingerprint: &str,
) -> SegmentRunResult {
    let incomplete: Vec<usize> = segments
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.finished)
        .map(|(i, _)| i)
        .collect();

    if incomplete.is_empty() {
        return SegmentRunResult::AllFinished;
    }

    let results: Vec<(usize, Result<Segment, SegmentFailure>)> = thread::scope(|scope| {
        let handles: Vec<_> = incomplete
            .iter()
            .map(|&idx| {
                let segment = segments[idx];
                let abort = Arc::clone(&request.abort);
                let url = request.url;
                let headers = request.custom_headers;
                let proxy = request.proxy_url;
                scope.spawn(move || {
                    let checkpoint_dir = target_dir.to_path_buf();
                    let checkpoint_fp = fingerprint.to_string();
                    let segment_index = segment.index;
                    let outcome = worker::download_segment(
                        url,
                        headers,
                        proxy,
                        segment,
                        storage,
                        &abort,
                        move |snapshot| {
                            let _ = checkpoint_one(&checkpoint_dir, &checkpoint_fp, segment_index, snapshot);
                        },
                    );
                    (idx, outcome)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("segment worker thread panicked")).collect()
    });

    let mut any_aborted = false;
    let mut failure: Option<String> = None;
    for (idx, outcome) in results {
        match outcome {
            Ok(finished_segment) => segments[idx] = finished_segment,
            Err(SegmentFailure::Aborted) => any_aborted = true,
            Err(SegmentFailure::Error(e)) => {
                let kind = classify(&e);
                tracing::warn!(segment = idx, error = %e, kind = ?kind, "segment failed");
                if failure.is_none() {
                    failure = Some(e.to_string());
                }
            }
        }
    }

    if let Some(msg) = failure {
        return SegmentRunResult::Failed(msg);
    }
    if any_aborted || request.abort.load(Ordering::Relaxed) {
        return SegmentRunResult::Aborted;
    }
    if segments.iter().all(|s| s.finished) {
        SegmentRunResult::AllFinished
    } else {
        SegmentRunResult::Aborted
    }
}

/// Best-effort mid-transfer checkpoint: reloads the current state file (so
/// sibling segments' progress isn't clobbered), updates one segment's entry,
/// and rewrites it. Failures are logged, not propagated — a missed
/// checkpoint just means more re-download on the next resume.
///
/// Every segment of one download checkpoints on its own timer, concurrently
/// with its siblings, so the read-modify-write below is wrapped in the
/// fingerprint's write lock (§4.2/§5 "single-writer per file") rather than
/// relying on `fetch_all_segments`'s join to keep checkpoints from
/// overlapping — it doesn't, since joins only happen after every segment
/// finishes, not between checkpoints.
fn checkpoint_one(target_dir: &Path, fingerprint: &str, segment_index: usize, snapshot: &Segment) -> Result<()> {
    let lock = crate::state_store::write_locks().lock_for(fingerprint);
    let _guard = lock.lock().unwrap();

    let path = crate::state_store::progress_path(target_dir, fingerprint);
    let mut state: DownloadState = crate::state_store::read_json_or_default(&path)?;
    if let Some(seg) = state.segments.iter_mut().find(|s| s.index == segment_index) {
        *seg = *snapshot;
    }
    crate::state_store::atomic_write_json(&path, &state)
}

fn finalize(part_path: &Path, final_path: &Path, target_dir: &Path, fingerprint: &str) -> Result<()> {
    let writer = StorageWriter::open_existing(part_path).context("reopen part file for finalize")?;
    writer.sync().context("sync before finalize")?;
    writer.finalize(final_path).context("rename part to final path")?;
    delete_state(target_dir, fingerprint)
}

/// True if `e`'s classification indicates the caller should not bother
/// retrying soon (used by the scheduler to decide backoff on the *next*
/// scheduled attempt — the engine itself never retries within one `run`).
pub fn is_throttled(e: &SegmentError) -> bool {
    matches!(classify(e), ErrorKind::Throttled)
}
