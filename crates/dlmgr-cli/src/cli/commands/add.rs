//! `dlmgr add <url>` — queue a URL for download.

use anyhow::Result;
use std::path::PathBuf;

use crate::cli::control_socket::{self, ControlMessage};

pub async fn run(url: String, download_dir: Option<PathBuf>, queue: String) -> Result<()> {
    let url = dlmgr_core::url_model::sanitize_url(&url)?;
    let config = dlmgr_core::config::load_or_init()?;
    let config_dir = dlmgr_core::config::config_dir()?;
    let target_dir = download_dir.unwrap_or_else(|| config.default_download_dir.clone());
    let id = dlmgr_core::fingerprint::item_id(&url);

    let socket = control_socket::socket_path(&config_dir);
    let delivered = control_socket::send(
        &socket,
        ControlMessage::Add { url: url.clone(), download_dir: target_dir.clone(), queue: queue.clone() },
    )
    .await?;

    if !delivered {
        let scheduler = dlmgr_core::scheduler::Scheduler::bootstrap(&config, config_dir.clone())?;
        scheduler.registry().add(&url, target_dir, &queue);
        scheduler.registry().persist(&config_dir)?;
    }

    println!("queued {id} ({url})");
    Ok(())
}
