//! `dlmgr status` — show every item in the registry and its current status.

use anyhow::Result;

pub async fn run() -> Result<()> {
    let config = dlmgr_core::config::load_or_init()?;
    let config_dir = dlmgr_core::config::config_dir()?;
    let scheduler = dlmgr_core::scheduler::Scheduler::bootstrap(&config, config_dir)?;

    let mut items = scheduler.registry().list();
    if items.is_empty() {
        println!("No downloads.");
        return Ok(());
    }
    items.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    println!("{:<18} {:<12} {:<8} {:<12} {}", "ID", "STATUS", "QUEUE", "PROGRESS", "URL");
    for item in items {
        let progress = match item.total_size {
            Some(total) if total > 0 => format!("{:.0}%", item.bytes_observed as f64 / total as f64 * 100.0),
            _ => "-".to_string(),
        };
        println!(
            "{:<18} {:<12} {:<8} {:<12} {}",
            item.id,
            format!("{:?}", item.status).to_lowercase(),
            item.queue_name,
            progress,
            item.url
        );
    }
    Ok(())
}
