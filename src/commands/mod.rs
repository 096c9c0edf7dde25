mod check_config;
mod health;
mod up;

pub use check_config::run_check_config;
pub use health::run_health;
pub use up::run_up;

use devfleet::{BulkOperationResult, OperationResult};

/// One line per service: `  ✓ api (ready)` or `  ✗ web: <error>`.
pub(crate) fn print_bulk(label: &str, bulk: &BulkOperationResult) {
    println!(
        "{}: {} succeeded, {} failed ({:.1}s)",
        label,
        bulk.success_count,
        bulk.failure_count,
        bulk.total_duration.as_secs_f64()
    );
    for result in &bulk.results {
        print_result(result);
    }
}

pub(crate) fn print_result(result: &OperationResult) {
    let status = result
        .resulting_status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unregistered".to_string());
    match &result.error {
        None => println!("  ✓ {} ({})", result.name, status),
        Some(e) => println!("  ✗ {} ({}): {}", result.name, status, e),
    }
}
