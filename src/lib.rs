//! # devfleet
//!
//! Run, supervise and observe a fleet of local development services.
//!
//! ## Features
//!
//! - **Service Registry**: authoritative per-service state with change notifications
//!   fanned out through one bounded queue per observer
//! - **Lifecycle Operations**: start, stop and restart with per-service locking,
//!   concurrent bulk operations and partial results
//! - **Health Monitoring**: cascading HTTP / TCP / process probes with hysteresis
//! - **Log Broadcasting**: per-service ring buffers and non-blocking fan-out
//! - **Port Allocation**: stable, conflict-aware port assignment
//! - **Cancellation Support**: every long operation observes a `CancellationToken`
//!
//! ## Quick Start
//!
//! ```no_run
//! use devfleet::{OperationManager, Parser};
//!
//! # async fn example() -> Result<(), devfleet::Error> {
//! let parser = Parser::new();
//! let config = parser.load_config("devfleet.yaml")?;
//!
//! let manager = OperationManager::from_config(config, ".")?;
//! let started = manager.start_all().await;
//! println!("{} started, {} failed", started.success_count, started.failure_count);
//!
//! let report = manager.monitor().check_all(&manager.child_token()).await;
//! println!("overall: {}", report.summary.overall);
//!
//! manager.stop_all().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod healthcheck;
pub mod lock_order;
pub mod logs;
pub mod operations;
pub mod port;
pub mod process;
pub mod registry;

// Re-export commonly used types
pub use config::{Parser, ProjectConfig, ServiceMode, ServiceSpec, Settings};
pub use error::{Error, ErrorKind, Result};
pub use healthcheck::{HealthEvent, HealthMonitor, HealthReport};
pub use logs::LogBroadcaster;
pub use operations::{BulkOperationResult, OperationManager, OperationResult};
pub use port::PortAllocator;
pub use registry::{HealthStatus, LifecycleStatus, Registry, ServiceEntry};
