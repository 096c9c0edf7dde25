use super::print_bulk;
use devfleet::registry::{ChangeKind, ChannelObserver};
use devfleet::{OperationManager, ProjectConfig};
use std::path::Path;

pub async fn run_up(config: ProjectConfig, work_dir: &Path, verbose: bool) -> anyhow::Result<()> {
    let manager = OperationManager::from_config(config, work_dir)?;

    let (observer, mut changes) = ChannelObserver::new(256);
    manager.registry().subscribe(observer);
    let printer = tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            let entry = &change.entry;
            let lifecycle_changed = change.previous_lifecycle != Some(entry.lifecycle);
            let health_changed = change.previous_health != Some(entry.health);
            if !verbose && change.kind == ChangeKind::Updated && !lifecycle_changed && !health_changed {
                continue;
            }
            match &entry.error {
                Some(error) if !error.is_empty() => println!(
                    "[{}] {} / {}: {}",
                    entry.name, entry.lifecycle, entry.health, error
                ),
                _ => println!("[{}] {} / {}", entry.name, entry.lifecycle, entry.health),
            }
        }
    });

    let started = manager.start_all().await;
    print_bulk("Started", &started);
    if started.success_count == 0 && started.failure_count > 0 {
        manager.stop_all().await;
        manager.cancel_operations();
        printer.abort();
        started.into_result()?;
    }

    let monitor = manager.spawn_monitor();
    println!("\nSupervising {} services. Press Ctrl-C to stop.", manager.services().len());

    tokio::signal::ctrl_c().await?;
    println!("\nStopping services...");

    let stopped = manager.stop_all().await;
    print_bulk("Stopped", &stopped);

    manager.cancel_operations();
    let _ = monitor.await;
    printer.abort();
    Ok(())
}
