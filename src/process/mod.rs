//! OS process control behind a platform strategy.

#[cfg(unix)]
mod posix;
mod spawn;
mod windows;

#[cfg(unix)]
pub use posix::PosixController;
pub use spawn::{resolve_cwd, shell_command, spawn_service, PORT_ENV, SPAWNED_BY_ENV};
pub use windows::{WindowsController, CREATE_NEW_PROCESS_GROUP};

use crate::error::Result;
use std::sync::Arc;
use tokio::process::Command;

/// Platform-specific process group control.
pub trait ProcessController: Send + Sync {
    /// Prepare a command so the child leads a new process group.
    fn configure(&self, cmd: &mut Command);

    /// Ask the process group to shut down gracefully.
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Kill the process group outright.
    fn force_kill(&self, pid: u32) -> Result<()>;

    /// Whether the process exists and is not a zombie.
    fn is_alive(&self, pid: u32) -> bool;

    fn name(&self) -> &'static str;
}

/// Controller for the platform this binary was built for.
pub fn default_controller() -> Arc<dyn ProcessController> {
    #[cfg(unix)]
    {
        Arc::new(PosixController)
    }
    #[cfg(not(unix))]
    {
        Arc::new(WindowsController)
    }
}
