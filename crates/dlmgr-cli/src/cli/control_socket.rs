//! Control socket: a Unix socket the `run` daemon listens on so that other
//! `dlmgr` invocations (add/pause/resume/remove) can reach its in-process
//! `Scheduler` directly, instead of racing it over the registry file.
//!
//! Protocol: one JSON object per line, tagged by `action`. Fire-and-forget —
//! the daemon doesn't write a response, matching how the client only cares
//! whether the message was delivered at all.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use dlmgr_core::scheduler::Scheduler;

pub fn socket_path(config_dir: &Path) -> PathBuf {
    config_dir.join("control.sock")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlMessage {
    Add { url: String, download_dir: PathBuf, queue: String },
    Pause { id: String },
    Resume { id: String },
    Remove { id: String },
}

/// Everything a connection handler needs to act on a `ControlMessage`
/// against the daemon's live scheduler.
#[derive(Clone)]
pub struct DaemonHandle {
    pub scheduler: Scheduler,
    pub worker_count: usize,
    pub custom_headers: Arc<HashMap<String, String>>,
    pub proxy_url: Option<String>,
}

/// Binds `path` and spawns a task that applies every well-formed
/// `ControlMessage` line it receives to `daemon`. Malformed lines are logged
/// and skipped.
pub fn spawn_control_listener(daemon: DaemonHandle, path: PathBuf) -> Result<tokio::task::JoinHandle<()>> {
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).with_context(|| format!("bind control socket {}", path.display()))?;

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(handle_connection(daemon.clone(), stream));
                }
                Err(e) => tracing::debug!(error = %e, "control socket accept failed"),
            }
        }
    }))
}

async fn handle_connection(daemon: DaemonHandle, stream: UnixStream) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let msg: ControlMessage = match serde_json::from_str(line.trim()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(line, error = %e, "malformed control message");
                continue;
            }
        };
        match msg {
            ControlMessage::Add { url, download_dir, queue } => {
                daemon
                    .scheduler
                    .add_download(&url, download_dir, &queue, daemon.worker_count, Arc::clone(&daemon.custom_headers), daemon.proxy_url.clone())
                    .await;
            }
            ControlMessage::Pause { id } => daemon.scheduler.pause(&id),
            ControlMessage::Remove { id } => daemon.scheduler.remove(&id),
            ControlMessage::Resume { id } => {
                daemon.scheduler.resume(&id);
                if let Some(item) = daemon.scheduler.registry().get(&id) {
                    daemon
                        .scheduler
                        .dispatch_queue(&item.queue_name, daemon.worker_count, Arc::clone(&daemon.custom_headers), daemon.proxy_url.clone())
                        .await;
                }
            }
        }
    }
}

/// Sends one message to a running daemon's control socket. Returns `false`
/// (without error) if no socket exists, so callers can fall back to acting
/// on the registry file directly.
pub async fn send(socket_path: &Path, msg: ControlMessage) -> Result<bool> {
    if !socket_path.exists() {
        return Ok(false);
    }
    let mut stream = match UnixStream::connect(socket_path).await {
        Ok(s) => s,
        Err(_) => return Ok(false),
    };
    let mut line = serde_json::to_string(&msg).context("serialize control message")?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await.context("write control message")?;
    Ok(true)
}
