//! `dlmgr remove <id>` — drop an item from the registry.

use anyhow::Result;

use crate::cli::control_socket::{self, ControlMessage};

pub async fn run(id: String) -> Result<()> {
    let config_dir = dlmgr_core::config::config_dir()?;
    let socket = control_socket::socket_path(&config_dir);
    let delivered = control_socket::send(&socket, ControlMessage::Remove { id: id.clone() }).await?;

    if !delivered {
        let config = dlmgr_core::config::load_or_init()?;
        let scheduler = dlmgr_core::scheduler::Scheduler::bootstrap(&config, config_dir.clone())?;
        scheduler.remove(&id);
        scheduler.registry().persist(&config_dir)?;
    }

    println!("removed {id}");
    Ok(())
}
