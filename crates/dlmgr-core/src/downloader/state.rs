//! Per-URL download state, persisted at `{target_dir}/{fingerprint}.progress`
//! (§3 "DownloadState", §4.2).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::segmenter::{validate_segments, Segment};
use crate::state_store::{atomic_write_json, progress_path, read_json_or_default};

/// `{ url, resolved_filename, total_size, segments[] }`. Absence of the file
/// means "never started or already completed". `total_size` is `None` when
/// the probe couldn't determine it (sequential fallback, §4.1 step 2).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadState {
    pub url: String,
    pub resolved_filename: String,
    pub total_size: Option<u64>,
    pub segments: Vec<Segment>,
}

impl DownloadState {
    pub fn bytes_observed(&self) -> u64 {
        self.segments.iter().map(|s| s.downloaded).sum()
    }

    pub fn all_finished(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(|s| s.finished)
    }
}

/// Reads the raw state file for `fingerprint`, if any, without checking for
/// a matching `.part` file (the resolved filename — and so the `.part`
/// path — lives inside the state itself, so that check has to happen after
/// this read). Segments are validated/repaired against their expected
/// lengths before being returned.
pub fn read_state_file(target_dir: &Path, fingerprint: &str) -> Result<Option<DownloadState>> {
    let path = progress_path(target_dir, fingerprint);
    if !path.exists() {
        return Ok(None);
    }
    let mut state: DownloadState = read_json_or_default(&path)?;
    if state.url.is_empty() {
        return Ok(None);
    }
    validate_segments(&mut state.segments);
    Ok(Some(state))
}

/// Loads state for `fingerprint` in `target_dir`. Requires the `.part` file
/// to still exist at `part_path`; if it doesn't, the stored state is
/// considered stale and discarded so the download starts fresh (§4.1
/// "Resume protocol").
pub fn load_resume_state(
    target_dir: &Path,
    fingerprint: &str,
    part_path: &Path,
) -> Result<Option<DownloadState>> {
    let state = match read_state_file(target_dir, fingerprint)? {
        Some(s) => s,
        None => return Ok(None),
    };
    if !part_path.exists() {
        tracing::info!(fingerprint, "part file missing, discarding stale state");
        delete_state(target_dir, fingerprint)?;
        return Ok(None);
    }
    Ok(Some(state))
}

pub fn save_state(target_dir: &Path, fingerprint: &str, state: &DownloadState) -> Result<()> {
    let lock = crate::state_store::write_locks().lock_for(fingerprint);
    let _guard = lock.lock().unwrap();
    atomic_write_json(&progress_path(target_dir, fingerprint), state)
}

pub fn delete_state(target_dir: &Path, fingerprint: &str) -> Result<()> {
    let path = progress_path(target_dir, fingerprint);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Path to the `.part` file for a resolved filename in `target_dir`.
pub fn part_path(target_dir: &Path, resolved_filename: &str) -> PathBuf {
    target_dir.join(format!("{resolved_filename}.part"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::plan_segments;

    #[test]
    fn missing_state_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("file.bin.part");
        let result = load_resume_state(dir.path(), "abc", &part).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn missing_part_file_discards_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = DownloadState {
            url: "https://example.com/a".to_string(),
            resolved_filename: "a.bin".to_string(),
            total_size: Some(100),
            segments: plan_segments(100, 1),
        };
        save_state(dir.path(), "fp1", &state).unwrap();
        let part = dir.path().join("a.bin.part"); // never created
        let result = load_resume_state(dir.path(), "fp1", &part).unwrap();
        assert!(result.is_none());
        assert!(!progress_path(dir.path(), "fp1").exists());
    }

    #[test]
    fn present_state_and_part_file_resumes_and_repairs() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("a.bin.part");
        std::fs::write(&part, b"x").unwrap();

        let mut segments = plan_segments(100, 1);
        segments[0].downloaded = 50;
        segments[0].finished = true; // inconsistent: claims finished but incomplete
        let state = DownloadState {
            url: "https://example.com/a".to_string(),
            resolved_filename: "a.bin".to_string(),
            total_size: Some(100),
            segments,
        };
        save_state(dir.path(), "fp2", &state).unwrap();

        let resumed = load_resume_state(dir.path(), "fp2", &part).unwrap().unwrap();
        assert!(!resumed.segments[0].finished);
        assert_eq!(resumed.bytes_observed(), 50);
    }

    #[test]
    fn save_then_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = DownloadState::default();
        save_state(dir.path(), "fp3", &state).unwrap();
        assert!(progress_path(dir.path(), "fp3").exists());
        delete_state(dir.path(), "fp3").unwrap();
        assert!(!progress_path(dir.path(), "fp3").exists());
    }
}
