//! Configuration parsing and types.
//!
//! - `types` - top-level `ProjectConfig`
//! - `service` - per-service declaration (`ServiceSpec`, `ServiceMode`)
//! - `health` - health check config (`HealthCheckConfig`)
//! - `settings` - engine tunables and `DEVFLEET_*` overrides
//! - `duration` - human duration parsing
//! - `parser` - YAML loading

mod duration;
mod health;
mod parser;
mod service;
mod settings;
mod types;

pub use duration::*;
pub use health::*;
pub use parser::*;
pub use service::*;
pub use settings::*;
pub use types::*;
