//! Persistent state store: JSON files for config, the download registry, and
//! per-download progress (§4.2).
//!
//! Every write goes through a temp-file-then-rename so a reader never
//! observes a partially written file (same atomicity contract as
//! `storage::StorageWriter::finalize`, applied to small JSON documents
//! instead of download payloads).

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

/// Serializes `value` as pretty JSON and writes it to `path` via a temp file
/// in the same directory followed by a rename, so concurrent readers never
/// see a half-written file.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create dir {}", parent.display()))?;

    let tmp = tmp_path(path);
    let json = serde_json::to_string_pretty(value).context("serialize state")?;
    std::fs::write(&tmp, json.as_bytes())
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_owned();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Reads and parses `path` as JSON, returning `T::default()` if the file
/// doesn't exist. If the file exists but fails to parse, the unreadable file
/// is renamed to `<path>.bak` and a fresh default is returned, so the
/// operator can inspect what went wrong without losing the old bytes.
pub fn read_json_or_default<T: Default + DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };

    match serde_json::from_slice::<T>(&bytes) {
        Ok(v) => Ok(v),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt state file, recovering");
            let bak = backup_path(path);
            let _ = std::fs::rename(path, &bak);
            Ok(T::default())
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_owned();
    name.push(".bak");
    path.with_file_name(name)
}

/// Path to a per-download progress file: `{target_dir}/{fingerprint}.progress`.
pub fn progress_path(target_dir: &Path, fingerprint: &str) -> PathBuf {
    target_dir.join(format!("{fingerprint}.progress"))
}

/// Path to the download registry (history) file: `{config_dir}/history.json`.
pub fn registry_path(config_dir: &Path) -> PathBuf {
    config_dir.join("history.json")
}

/// Serializes writes to state files so distinct fingerprints can write
/// concurrently while writes for the same fingerprint are ordered (§4.2
/// "a single process-wide mutex serializes state-store writes for one
/// fingerprint; distinct fingerprints may write concurrently").
#[derive(Default)]
pub struct WriteLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WriteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutex guarding writes for `key` (a fingerprint or a fixed
    /// name like `"config"`/`"history"`), creating it on first use.
    pub fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }
}

static WRITE_LOCKS: OnceLock<WriteLocks> = OnceLock::new();

/// The process-wide `WriteLocks` instance every state-file read-modify-write
/// goes through (`downloader::save_state`, `downloader::checkpoint_one`),
/// so that concurrent segment workers checkpointing the same fingerprint
/// never interleave a read and a write.
pub fn write_locks() -> &'static WriteLocks {
    WRITE_LOCKS.get_or_init(WriteLocks::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        n: u32,
        label: String,
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Doc { n: 42, label: "hi".to_string() };
        atomic_write_json(&path, &doc).unwrap();
        let read: Doc = read_json_or_default(&path).unwrap();
        assert_eq!(read, doc);
    }

    #[test]
    fn missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let read: Doc = read_json_or_default(&path).unwrap();
        assert_eq!(read, Doc::default());
    }

    #[test]
    fn corrupt_file_is_backed_up_and_default_returned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, b"{not json").unwrap();
        let read: Doc = read_json_or_default(&path).unwrap();
        assert_eq!(read, Doc::default());
        assert!(!path.exists());
        assert!(dir.path().join("doc.json.bak").exists());
    }

    #[test]
    fn no_tmp_file_left_behind_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        atomic_write_json(&path, &Doc::default()).unwrap();
        assert!(!dir.path().join("doc.json.tmp").exists());
        assert!(path.exists());
    }

    #[test]
    fn progress_and_registry_paths_match_layout() {
        let target = Path::new("/downloads/movies");
        assert_eq!(
            progress_path(target, "abc123"),
            PathBuf::from("/downloads/movies/abc123.progress")
        );
        let cfg = Path::new("/home/user/.config/dlmgr");
        assert_eq!(
            registry_path(cfg),
            PathBuf::from("/home/user/.config/dlmgr/history.json")
        );
    }

    #[test]
    fn write_locks_same_key_returns_same_mutex() {
        let locks = WriteLocks::new();
        let a = locks.lock_for("fp1");
        let b = locks.lock_for("fp1");
        assert!(Arc::ptr_eq(&a, &b));
        let c = locks.lock_for("fp2");
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
