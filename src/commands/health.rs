use super::print_bulk;
use devfleet::healthcheck::{HealthCheckResult, EXIT_INTERRUPTED};
use devfleet::{HealthEvent, HealthReport, OperationManager, ProjectConfig};
use std::path::Path;
use std::time::Duration;

/// Start the project, report health and stop it again. Returns the exit code.
pub async fn run_health(
    config: ProjectConfig,
    work_dir: &Path,
    stream: bool,
    interval: u64,
    json: bool,
) -> anyhow::Result<i32> {
    let manager = OperationManager::from_config(config, work_dir)?;
    let started = manager.start_all().await;
    if !json {
        print_bulk("Started", &started);
        println!();
    }

    let code = if stream {
        stream_health(&manager, Duration::from_secs(interval), json).await?
    } else {
        let report = manager.monitor().check_all(&manager.child_token()).await;
        print_report(&report, json)?;
        report.exit_code()
    };

    let stopped = manager.stop_all().await;
    if !json {
        print_bulk("Stopped", &stopped);
    }
    manager.cancel_operations();
    Ok(code)
}

async fn stream_health(manager: &OperationManager, interval: Duration, json: bool) -> anyhow::Result<i32> {
    let session = manager.child_token();
    let mut events = manager.monitor().stream(interval, session.clone());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                session.cancel();
                return Ok(EXIT_INTERRUPTED);
            }
            event = events.next() => match event {
                Some(HealthEvent::Summary(report)) => print_report(&report, json)?,
                Some(HealthEvent::Change { service, from, to }) => {
                    if json {
                        println!(
                            "{}",
                            serde_json::json!({ "service": service, "from": from, "to": to })
                        );
                    } else {
                        println!("{}: {} -> {}", service, from, to);
                    }
                }
                None => return Ok(EXIT_INTERRUPTED),
            },
        }
    }
}

fn print_report(report: &HealthReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
        return Ok(());
    }

    println!(
        "{} overall: {} ({} healthy, {} degraded, {} unhealthy, {} starting, {} unknown)",
        report.timestamp.format("%H:%M:%S"),
        report.summary.overall,
        report.summary.healthy,
        report.summary.degraded,
        report.summary.unhealthy,
        report.summary.starting,
        report.summary.unknown
    );
    for result in &report.services {
        println!("  {}", describe(result));
    }
    Ok(())
}

fn describe(result: &HealthCheckResult) -> String {
    let mut line = format!(
        "{:<20} {:<10} {:<8} {:>5}ms",
        result.service_name,
        result.status.to_string(),
        result.method.to_string(),
        result.latency.as_millis()
    );
    if let Some(endpoint) = &result.endpoint {
        line.push_str(&format!("  {}", endpoint));
    }
    if let Some(error) = &result.error {
        line.push_str(&format!("  ({})", error));
    }
    line
}
