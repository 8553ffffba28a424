//! Top-level orchestration: admits eligible registry items into active
//! queues, dispatches each as a blocking segmented download, and feeds
//! outcomes back into the registry and queue counters (§4.3).
//!
//! Every dispatched item owns one blocking thread pool run (via
//! `spawn_blocking`, since `downloader::run` is synchronous by design, §5)
//! and one `control::JobControl` abort token; cancelling a queue never
//! interrupts items already in flight, matching `QueueScheduler::stop_queue`.

use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::control::JobControl;
use crate::downloader::{self, DownloadOutcome, DownloadRequest};
use crate::fingerprint;
use crate::queue::QueueScheduler;
use crate::registry::{DownloadItem, DownloadStatus, Registry};
use crate::streaming::{self, DelegateConfig, ProcessState, StreamingDelegate};

/// Shared, cloneable handle to the running scheduler. Every field is
/// independently `Arc`-shared so the ingress server and CLI can hold their
/// own clone without wrapping the whole thing in a mutex.
#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<Registry>,
    queues: Arc<QueueScheduler>,
    control: Arc<JobControl>,
    config_dir: PathBuf,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        queues: Arc<QueueScheduler>,
        control: Arc<JobControl>,
        config_dir: PathBuf,
    ) -> Self {
        Self { registry, queues, control, config_dir }
    }

    /// Builds the whole stack from a loaded config, restoring the registry
    /// from disk first (§4.6 "On restore").
    pub fn bootstrap(config: &AppConfig, config_dir: PathBuf) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        registry.restore(&config_dir)?;
        let queues = Arc::new(QueueScheduler::new(config.queues.clone(), config.max_concurrent_downloads));
        for name in queues.queue_names() {
            queues.start_queue(&name);
        }
        Ok(Self::new(registry, queues, Arc::new(JobControl::new()), config_dir))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn queues(&self) -> &Arc<QueueScheduler> {
        &self.queues
    }

    /// Adds a URL to a queue and immediately tries to dispatch into any free
    /// slot. Returns the (possibly pre-existing, per §4.6 "ID stability")
    /// registry item.
    pub async fn add_download(
        &self,
        url: &str,
        target_directory: PathBuf,
        queue_name: &str,
        worker_count: usize,
        custom_headers: Arc<HashMap<String, String>>,
        proxy_url: Option<String>,
    ) -> DownloadItem {
        let item = self.registry.add(url, target_directory, queue_name);
        self.dispatch_queue(queue_name, worker_count, custom_headers, proxy_url).await;
        item
    }

    /// Requests a graceful stop of a running item. No-op if it isn't
    /// currently running; the caller still sees it settle to `Stopped` via
    /// the worker's own outcome handling.
    pub fn pause(&self, item_id: &str) {
        self.control.request_abort(item_id);
    }

    /// Re-admits a stopped/failed item for another dispatch attempt on its
    /// next `dispatch_queue` pass, without resetting its progress.
    pub fn resume(&self, item_id: &str) {
        self.registry.update_status(item_id, DownloadStatus::Stopped, None);
    }

    pub fn remove(&self, item_id: &str) {
        self.control.request_abort(item_id);
        self.registry.remove(item_id);
    }

    /// Drains as many eligible items from `queue_name` as the queue and
    /// global concurrency caps currently allow, spawning each as an
    /// independent background task (§4.3 "Selection order").
    pub async fn dispatch_queue(
        &self,
        queue_name: &str,
        worker_count: usize,
        custom_headers: Arc<HashMap<String, String>>,
        proxy_url: Option<String>,
    ) {
        loop {
            if self.queues.admit(queue_name) == 0 {
                return;
            }
            let next = self
                .registry
                .eligible_in_queue(queue_name)
                .into_iter()
                .next();
            let Some(item) = next else { return };

            self.queues.mark_started(queue_name, 1);
            self.registry.update_status(&item.id, DownloadStatus::Downloading, None);
            self.spawn_item(item, worker_count, Arc::clone(&custom_headers), proxy_url.clone());
        }
    }

    /// Every active queue, in turn (§4.3 "tick").
    pub async fn dispatch_all(
        &self,
        worker_count: usize,
        custom_headers: Arc<HashMap<String, String>>,
        proxy_url: Option<String>,
    ) {
        for name in self.queues.queue_names() {
            if self.queues.is_active(&name) {
                self.dispatch_queue(&name, worker_count, Arc::clone(&custom_headers), proxy_url.clone()).await;
            }
        }
    }

    /// Routes to the streaming delegate or the segmented downloader based on
    /// `streaming::should_delegate` (§2 "item dispatch routes to
    /// direct-download or external-delegate"), then feeds the outcome back
    /// into the registry and queue counters the same way regardless of
    /// which path ran.
    fn spawn_item(
        &self,
        item: DownloadItem,
        worker_count: usize,
        custom_headers: Arc<HashMap<String, String>>,
        proxy_url: Option<String>,
    ) {
        let abort = self.control.register(&item.id);
        let scheduler = self.clone();
        let queue_name = item.queue_name.clone();
        let delegate = streaming::should_delegate(&item.url);

        tokio::spawn(async move {
            let item_id = item.id.clone();
            let url = item.url.clone();
            let target_dir = item.target_directory.clone();

            let outcome = if delegate {
                Ok(run_streaming_item(&item_id, &url, &target_dir, scheduler.registry()).await)
            } else {
                let fp = fingerprint::fingerprint(&url);
                tokio::task::spawn_blocking(move || {
                    downloader::run(DownloadRequest {
                        url: &url,
                        custom_headers: &custom_headers,
                        proxy_url: proxy_url.as_deref(),
                        target_dir: &target_dir,
                        worker_count,
                        fingerprint: &fp,
                        abort,
                    })
                })
                .await
            };

            scheduler.settle(&item_id, outcome);
            scheduler.control.unregister(&item_id);
            let freed = scheduler.queues.on_item_complete(&queue_name);
            if freed > 0 {
                // Let the caller's next tick pick up the freed slot; recursing
                // here risks unbounded async stack growth under a burst of
                // rapid completions.
                tracing::debug!(queue = %queue_name, freed, "slot freed");
            }
        });
    }

    fn settle(
        &self,
        item_id: &str,
        outcome: Result<Result<DownloadOutcome, downloader::DownloadError>, tokio::task::JoinError>,
    ) {
        match outcome {
            Ok(Ok(DownloadOutcome::Completed { resolved_filename, total_bytes })) => {
                self.registry.set_resolved_filename(item_id, &resolved_filename);
                self.registry.update_progress(item_id, total_bytes, Some(total_bytes));
                self.registry.update_status(item_id, DownloadStatus::Completed, None);
            }
            Ok(Ok(DownloadOutcome::Stopped { resolved_filename, bytes_observed, last_error })) => {
                self.registry.set_resolved_filename(item_id, &resolved_filename);
                self.registry.update_progress(item_id, bytes_observed, None);
                let status = if last_error.is_some() { DownloadStatus::Failed } else { DownloadStatus::Stopped };
                self.registry.update_status(item_id, status, last_error);
            }
            Ok(Err(e)) => {
                tracing::warn!(item_id, error = %e, "download failed before fetching started");
                self.registry.update_status(item_id, DownloadStatus::Failed, Some(e.to_string()));
            }
            Err(join_err) => {
                tracing::error!(item_id, error = %join_err, "download task panicked");
                self.registry.update_status(item_id, DownloadStatus::Failed, Some("internal error".to_string()));
            }
        }
        if let Err(e) = self.registry.persist(&self.config_dir) {
            tracing::warn!(error = %e, "registry persist failed after settling item");
        }
    }

    /// Runs the periodic minute tick: applies any queue start/stop actions
    /// whose schedule matches, then dispatches into whatever queues are now
    /// active (§4.3 "Scheduling semantics").
    pub async fn run_schedule_tick(
        &self,
        hour: u32,
        minute: u32,
        today: crate::queue::Weekday,
        worker_count: usize,
        custom_headers: Arc<HashMap<String, String>>,
        proxy_url: Option<String>,
    ) {
        for action in self.queues.check_schedule(hour, minute, today) {
            match action {
                crate::queue::ScheduleAction::Start(name) => {
                    self.queues.start_queue(&name);
                }
                crate::queue::ScheduleAction::Stop(name) => {
                    self.queues.stop_queue(&name);
                }
            }
        }
        self.dispatch_all(worker_count, custom_headers, proxy_url).await;
    }
}

/// Runs one item through the streaming delegate instead of the segmented
/// downloader, translating its progress/filename callbacks into the same
/// registry updates the direct path makes, and its final `ProcessState` into
/// a `DownloadOutcome` so `settle` can treat both paths identically.
async fn run_streaming_item(
    item_id: &str,
    url: &str,
    target_dir: &Path,
    registry: &Arc<Registry>,
) -> Result<DownloadOutcome, downloader::DownloadError> {
    let delegate = StreamingDelegate::new(DelegateConfig::default());

    let progress_registry = Arc::clone(registry);
    let progress_item_id = item_id.to_string();
    let filename_registry = Arc::clone(registry);
    let filename_item_id = item_id.to_string();

    let state = delegate
        .run(
            url,
            target_dir,
            move |progress| {
                progress_registry.update_progress(
                    &progress_item_id,
                    progress.downloaded_bytes,
                    Some(progress.total_bytes),
                );
            },
            move |filename| {
                filename_registry.set_resolved_filename(&filename_item_id, filename);
            },
        )
        .await
        .map_err(downloader::DownloadError::Fetch)?;

    let item = registry.get(item_id);
    let resolved_filename = item.as_ref().map(|i| i.target_filename.clone()).unwrap_or_default();
    let bytes_observed = item.as_ref().map(|i| i.bytes_observed).unwrap_or(0);

    match state {
        ProcessState::Completed => Ok(DownloadOutcome::Completed { resolved_filename, total_bytes: bytes_observed }),
        _ => Ok(DownloadOutcome::Stopped {
            resolved_filename,
            bytes_observed,
            last_error: Some("streaming delegate did not complete".to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueDescriptor;

    fn test_scheduler() -> Scheduler {
        let mut queues = HashMap::new();
        queues.insert("Main".to_string(), QueueDescriptor::default_main());
        let qs = Arc::new(QueueScheduler::new(queues, 3));
        qs.start_queue("Main");
        Scheduler::new(Arc::new(Registry::new()), qs, Arc::new(JobControl::new()), PathBuf::from("/tmp/dlmgr-test-does-not-exist"))
    }

    #[tokio::test]
    async fn add_download_registers_item_in_pending_or_downloading() {
        let scheduler = test_scheduler();
        let item = scheduler
            .add_download(
                "https://example.invalid/file.bin",
                PathBuf::from("/tmp"),
                "Main",
                4,
                Arc::new(HashMap::new()),
                None,
            )
            .await;
        // Dispatch attempted immediately; either it's already marked
        // Downloading (admitted) or still Pending (shouldn't happen with an
        // empty queue, but tolerate races from the spawned task completing).
        let stored = scheduler.registry().get(&item.id).unwrap();
        assert!(matches!(
            stored.status,
            DownloadStatus::Downloading | DownloadStatus::Pending | DownloadStatus::Failed | DownloadStatus::Stopped
        ));
    }

    #[test]
    fn pause_unknown_item_is_noop() {
        let scheduler = test_scheduler();
        scheduler.pause("nonexistent");
    }

    #[test]
    fn remove_drops_item_from_registry() {
        let scheduler = test_scheduler();
        let item = scheduler.registry().add("https://example.com/x", PathBuf::from("/tmp"), "Main");
        scheduler.remove(&item.id);
        assert!(scheduler.registry().get(&item.id).is_none());
    }
}
