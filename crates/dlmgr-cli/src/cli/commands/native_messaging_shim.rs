//! `dlmgr --native-messaging-shim` — the mode the browser launches the
//! installed shim binary in: read length-prefixed JSON messages from stdin,
//! act on them the same way `add`/`register-extension` would, and write a
//! framed JSON reply to stdout for each.
//!
//! Stdio reads are blocking; that's fine here since this command owns the
//! process for its whole lifetime and runs nothing else concurrently on the
//! runtime.

use anyhow::Result;
use serde::Serialize;
use std::io::{stdin, stdout};

use dlmgr_core::ingress::native_messaging::{self, HostMessage};

use crate::cli::control_socket::{self, ControlMessage};

#[derive(Serialize)]
struct ShimResponse {
    ok: bool,
    message: String,
}

pub async fn run() -> Result<()> {
    let stdin = stdin();
    let stdout = stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();

    loop {
        let msg = match native_messaging::read_framed_message(&mut input) {
            Ok(m) => m,
            Err(_) => break,
        };
        let response = handle_message(msg).await;
        native_messaging::write_framed_message(&mut output, &response)?;
    }
    Ok(())
}

async fn handle_message(msg: HostMessage) -> ShimResponse {
    match msg {
        HostMessage::Ping | HostMessage::TestConnection => ShimResponse { ok: true, message: "pong".to_string() },
        HostMessage::AddDownload { url, filename: _ } => match add_download(url).await {
            Ok(id) => ShimResponse { ok: true, message: id },
            Err(e) => ShimResponse { ok: false, message: e.to_string() },
        },
        HostMessage::RegisterExtension { extension_id } => match native_messaging::install(&extension_id) {
            Ok((chromium, firefox)) => ShimResponse {
                ok: true,
                message: format!("{}, {}", chromium.display(), firefox.display()),
            },
            Err(e) => ShimResponse { ok: false, message: e.to_string() },
        },
    }
}

async fn add_download(url: String) -> Result<String> {
    let url = dlmgr_core::url_model::sanitize_url(&url)?;
    let config = dlmgr_core::config::load_or_init()?;
    let config_dir = dlmgr_core::config::config_dir()?;
    let target_dir = config.default_download_dir.clone();
    let id = dlmgr_core::fingerprint::item_id(&url);

    let socket = control_socket::socket_path(&config_dir);
    let delivered = control_socket::send(
        &socket,
        ControlMessage::Add {
            url: url.clone(),
            download_dir: target_dir.clone(),
            queue: dlmgr_core::queue::MAIN_QUEUE.to_string(),
        },
    )
    .await?;

    if !delivered {
        let scheduler = dlmgr_core::scheduler::Scheduler::bootstrap(&config, config_dir.clone())?;
        scheduler.registry().add(&url, target_dir, dlmgr_core::queue::MAIN_QUEUE);
        scheduler.registry().persist(&config_dir)?;
    }
    Ok(id)
}
