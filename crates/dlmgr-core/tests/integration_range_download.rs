//! Integration test: a local HTTP server with Range support, driving the
//! segmented downloader end to end across HEAD/Range-probe/single-stream
//! fallback paths (§4.1 "Probe").

mod common;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dlmgr_core::downloader::{run, DownloadOutcome, DownloadRequest};
use dlmgr_core::fingerprint;
use tempfile::tempdir;

fn run_download(url: &str, target_dir: &std::path::Path) -> DownloadOutcome {
    let headers = HashMap::new();
    let fp = fingerprint::fingerprint(url);
    run(DownloadRequest {
        url,
        custom_headers: &headers,
        proxy_url: None,
        target_dir,
        worker_count: 4,
        fingerprint: &fp,
        abort: Arc::new(AtomicBool::new(false)),
    })
    .expect("download should succeed")
}

#[tokio::test]
async fn multi_segment_download_completes_and_file_matches() {
    let body: Vec<u8> = (0u8..100).cycle().take(64 * 1024).collect();
    let url = common::range_server::start(body.clone());
    let download_dir = tempdir().unwrap();

    let outcome = run_download(&url, download_dir.path());
    let resolved_filename = match outcome {
        DownloadOutcome::Completed { resolved_filename, total_bytes } => {
            assert_eq!(total_bytes, body.len() as u64);
            resolved_filename
        }
        DownloadOutcome::Stopped { last_error, .. } => panic!("download did not complete: {last_error:?}"),
    };

    let final_path = download_dir.path().join(resolved_filename);
    assert!(final_path.exists(), "final file should exist");
    let content = std::fs::read(&final_path).unwrap();
    assert_eq!(content, body, "file content must match");
}

#[tokio::test]
async fn head_blocked_falls_back_to_range_probe_and_completes() {
    let body: Vec<u8> = (0u8..100).cycle().take(32 * 1024).collect();
    let url = common::range_server::start_with_options(
        body.clone(),
        common::range_server::RangeServerOptions { head_allowed: false, support_ranges: true, advertise_ranges: true },
    );
    let download_dir = tempdir().unwrap();

    let outcome = run_download(&url, download_dir.path());
    let resolved_filename = match outcome {
        DownloadOutcome::Completed { resolved_filename, .. } => resolved_filename,
        DownloadOutcome::Stopped { last_error, .. } => panic!("download did not complete: {last_error:?}"),
    };

    let content = std::fs::read(download_dir.path().join(resolved_filename)).unwrap();
    assert_eq!(content, body);
}

#[tokio::test]
async fn no_range_server_falls_back_to_single_stream_get() {
    let body: Vec<u8> = (0u8..100).cycle().take(32 * 1024).collect();
    let url = common::range_server::start_with_options(
        body.clone(),
        common::range_server::RangeServerOptions { head_allowed: true, support_ranges: false, advertise_ranges: false },
    );
    let download_dir = tempdir().unwrap();

    let outcome = run_download(&url, download_dir.path());
    let resolved_filename = match outcome {
        DownloadOutcome::Completed { resolved_filename, .. } => resolved_filename,
        DownloadOutcome::Stopped { last_error, .. } => panic!("download did not complete: {last_error:?}"),
    };

    let content = std::fs::read(download_dir.path().join(resolved_filename)).unwrap();
    assert_eq!(content, body);
}

#[tokio::test]
async fn resume_after_partial_failure_uses_existing_progress_file() {
    let body: Vec<u8> = (0u8..100).cycle().take(64 * 1024).collect();
    let url = common::range_server::start(body.clone());
    let download_dir = tempdir().unwrap();

    // First pass, aborted immediately: leaves a resumable `.progress` + `.part`.
    let headers = HashMap::new();
    let fp = fingerprint::fingerprint(&url);
    let abort = Arc::new(AtomicBool::new(true));
    let first = run(DownloadRequest {
        url: &url,
        custom_headers: &headers,
        proxy_url: None,
        target_dir: download_dir.path(),
        worker_count: 4,
        fingerprint: &fp,
        abort,
    })
    .expect("first pass should not error");
    assert!(matches!(first, DownloadOutcome::Stopped { .. }));

    // Second pass, allowed to run to completion, resumes from the same state.
    let outcome = run_download(&url, download_dir.path());
    let resolved_filename = match outcome {
        DownloadOutcome::Completed { resolved_filename, total_bytes } => {
            assert_eq!(total_bytes, body.len() as u64);
            resolved_filename
        }
        DownloadOutcome::Stopped { last_error, .. } => panic!("resumed download did not complete: {last_error:?}"),
    };
    let content = std::fs::read(download_dir.path().join(resolved_filename)).unwrap();
    assert_eq!(content, body);
}
