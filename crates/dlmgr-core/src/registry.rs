//! Download registry (component D, §4.6): the sole in-process owner of the
//! `DownloadItem` set, with debounced persistence and restart recovery.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::fingerprint::item_id;
use crate::state_store::{atomic_write_json, read_json_or_default, registry_path};

/// Closed status enum (§3 "DownloadItem").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Pending,
    Queued,
    Downloading,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl DownloadStatus {
    /// Eligible for dispatch by the queue scheduler (§4.3 "Selection order").
    pub fn is_eligible_for_dispatch(self) -> bool {
        matches!(
            self,
            DownloadStatus::Pending
                | DownloadStatus::Stopped
                | DownloadStatus::Queued
                | DownloadStatus::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Opaque to direct downloads; consumed by the streaming delegate (§3
/// "Format selection").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatSelection {
    pub format_id: String,
    pub container_ext: String,
    pub has_video: bool,
    pub has_audio: bool,
    pub approx_bytes: Option<u64>,
    pub height: Option<u32>,
    pub bitrate: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadItem {
    pub id: String,
    pub url: String,
    pub target_filename: String,
    pub target_directory: PathBuf,
    pub queue_name: String,
    pub queue_position: u64,
    pub status: DownloadStatus,
    pub size_known: bool,
    pub bytes_observed: u64,
    pub total_size: Option<u64>,
    pub created_at: u64,
    pub last_error: Option<String>,
    pub selected_format: Option<FormatSelection>,
    pub auth: Option<BasicAuth>,
    pub proxy: Option<String>,
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[derive(Default)]
struct Inner {
    items: HashMap<String, DownloadItem>,
    next_position: HashMap<String, u64>,
    dirty: bool,
}

/// In-memory registry, guarded by a single mutex (§5 "Scheduler/registry
/// thread(s)... guarded by a single mutex").
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    /// Adds a download, or — if the URL was already added — updates its
    /// mutable fields and returns the existing entry untouched in progress
    /// (§4.6 "ID stability").
    pub fn add(&self, url: &str, target_directory: PathBuf, queue_name: &str) -> DownloadItem {
        let id = item_id(url);
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.items.get_mut(&id) {
            existing.target_directory = target_directory;
            existing.queue_name = queue_name.to_string();
            inner.dirty = true;
            return existing.clone();
        }

        let position = {
            let counter = inner.next_position.entry(queue_name.to_string()).or_insert(0);
            let p = *counter;
            *counter += 1;
            p
        };

        let item = DownloadItem {
            id: id.clone(),
            url: url.to_string(),
            target_filename: String::new(),
            target_directory,
            queue_name: queue_name.to_string(),
            queue_position: position,
            status: DownloadStatus::Pending,
            size_known: false,
            bytes_observed: 0,
            total_size: None,
            created_at: now_unix(),
            last_error: None,
            selected_format: None,
            auth: None,
            proxy: None,
        };
        inner.items.insert(id, item.clone());
        inner.dirty = true;
        item
    }

    pub fn get(&self, id: &str) -> Option<DownloadItem> {
        self.inner.lock().unwrap().items.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<DownloadItem> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.items.remove(id);
        if removed.is_some() {
            inner.dirty = true;
        }
        removed
    }

    pub fn update_status(&self, id: &str, status: DownloadStatus, error: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(id) {
            item.status = status;
            if error.is_some() {
                item.last_error = error;
            }
            inner.dirty = true;
        }
    }

    /// Updates progress fields; called frequently from worker checkpoints,
    /// which is exactly why persistence of this registry is debounced rather
    /// than synchronous per call.
    pub fn update_progress(&self, id: &str, bytes_observed: u64, total_size: Option<u64>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(id) {
            item.bytes_observed = bytes_observed;
            if let Some(size) = total_size {
                item.total_size = Some(size);
                item.size_known = true;
            }
            inner.dirty = true;
        }
    }

    pub fn set_resolved_filename(&self, id: &str, filename: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(id) {
            item.target_filename = filename.to_string();
            inner.dirty = true;
        }
    }

    pub fn set_queue(&self, id: &str, queue_name: &str, queue_position: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(id) {
            item.queue_name = queue_name.to_string();
            item.queue_position = queue_position;
            inner.dirty = true;
        }
    }

    pub fn list(&self) -> Vec<DownloadItem> {
        self.inner.lock().unwrap().items.values().cloned().collect()
    }

    pub fn list_by(&self, predicate: impl Fn(&DownloadItem) -> bool) -> Vec<DownloadItem> {
        self.inner.lock().unwrap().items.values().filter(|i| predicate(i)).cloned().collect()
    }

    /// Within `queue_name`, the eligible items in dispatch order: ascending
    /// `queue_position`, ties by `created_at` (§4.3 "Selection order").
    pub fn eligible_in_queue(&self, queue_name: &str) -> Vec<DownloadItem> {
        let mut items = self.list_by(|i| i.queue_name == queue_name && i.status.is_eligible_for_dispatch());
        items.sort_by_key(|i| (i.queue_position, i.created_at));
        items
    }

    /// Writes the full set to `{config_dir}/history.json` if anything
    /// changed since the last persist. No-op (and cheap) otherwise.
    pub fn persist(&self, config_dir: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.dirty {
            return Ok(());
        }
        let items: Vec<DownloadItem> = inner.items.values().cloned().collect();
        atomic_write_json(&registry_path(config_dir), &items)?;
        inner.dirty = false;
        Ok(())
    }

    /// Loads `history.json`, transitioning any item left `Downloading` at
    /// last shutdown to `Stopped` so it's resumable rather than lost (§4.6
    /// "On restore").
    pub fn restore(&self, config_dir: &Path) -> Result<()> {
        let items: Vec<DownloadItem> = read_json_or_default(&registry_path(config_dir))?;
        let mut inner = self.inner.lock().unwrap();
        let mut max_position: HashMap<String, u64> = HashMap::new();
        for mut item in items {
            if item.status == DownloadStatus::Downloading {
                item.status = DownloadStatus::Stopped;
            }
            let slot = max_position.entry(item.queue_name.clone()).or_insert(0);
            *slot = (*slot).max(item.queue_position + 1);
            inner.items.insert(item.id.clone(), item);
        }
        for (queue, next) in max_position {
            inner.next_position.insert(queue, next);
        }
        Ok(())
    }
}

/// Spawns a background task that flushes the registry to disk every
/// `interval` if dirty (§4.6 "async debounced persist"). Aborts cleanly when
/// `registry` has no other references left... in practice this runs for the
/// process lifetime, so callers keep the returned handle only to abort on
/// shutdown if they want an immediate final flush instead.
pub fn spawn_debounced_persister(
    registry: std::sync::Arc<Registry>,
    config_dir: PathBuf,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = registry.persist(&config_dir) {
                tracing::warn!(error = %e, "registry persist failed");
            }
        }
    })
}
