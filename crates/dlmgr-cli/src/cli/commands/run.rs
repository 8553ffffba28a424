//! `dlmgr run` — dispatch queued downloads, serve the local ingress HTTP API,
//! listen on the control socket, and apply queue schedules until interrupted.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dlmgr_core::ingress::{self, IngressState};
use dlmgr_core::queue::local_now;
use dlmgr_core::registry::spawn_debounced_persister;
use dlmgr_core::scheduler::Scheduler;

use crate::cli::control_socket::{self, DaemonHandle};

const REGISTRY_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const SCHEDULE_TICK_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(port: u16) -> Result<()> {
    let config = dlmgr_core::config::load_or_init()?;
    let config_dir = dlmgr_core::config::config_dir()?;
    let scheduler = Scheduler::bootstrap(&config, config_dir.clone())?;

    let worker_count = config.normalized_max_connections();
    let custom_headers = Arc::new(HashMap::new());
    let proxy_url = config.proxy.proxy_url();

    scheduler.dispatch_all(worker_count, Arc::clone(&custom_headers), proxy_url.clone()).await;

    let _persister = spawn_debounced_persister(Arc::clone(scheduler.registry()), config_dir.clone(), REGISTRY_FLUSH_INTERVAL);

    let socket_path = control_socket::socket_path(&config_dir);
    let daemon = DaemonHandle {
        scheduler: scheduler.clone(),
        worker_count,
        custom_headers: Arc::clone(&custom_headers),
        proxy_url: proxy_url.clone(),
    };
    let _control = control_socket::spawn_control_listener(daemon, socket_path.clone())?;

    let ingress_state =
        Arc::new(IngressState { scheduler: scheduler.clone(), default_download_dir: config.default_download_dir.clone(), worker_count });
    let mut ingress_task = tokio::spawn(ingress::serve(ingress_state, port));

    let mut ticker = tokio::time::interval(SCHEDULE_TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (hour, minute, weekday) = local_now();
                scheduler.run_schedule_tick(hour, minute, weekday, worker_count, Arc::clone(&custom_headers), proxy_url.clone()).await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            res = &mut ingress_task => {
                match res {
                    Ok(Err(e)) => tracing::error!(error = %e, "ingress server exited"),
                    Err(e) => tracing::error!(error = %e, "ingress task panicked"),
                    Ok(Ok(())) => {}
                }
                break;
            }
        }
    }

    scheduler.registry().persist(&config_dir)?;
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}
