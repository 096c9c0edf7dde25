use super::ProcessController;
use crate::config::ServiceSpec;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Environment variable carrying the allocated port into the child.
pub const PORT_ENV: &str = "PORT";

/// Marker set in every child so nested tooling can tell it was spawned by us.
pub const SPAWNED_BY_ENV: &str = "DEVFLEET_SERVICE";

/// Build a shell invocation for a command line.
pub fn shell_command(command_line: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    }
}

/// Working directory for a service: `cwd` resolved against the project dir.
pub fn resolve_cwd(project_dir: &Path, cwd: Option<&Path>) -> PathBuf {
    match cwd {
        Some(dir) if dir.is_absolute() => dir.to_path_buf(),
        Some(dir) => project_dir.join(dir),
        None => project_dir.to_path_buf(),
    }
}

/// Spawn a service's command with piped output in a new process group.
pub fn spawn_service(
    controller: &dyn ProcessController,
    spec: &ServiceSpec,
    project_dir: &Path,
    port: Option<u16>,
) -> Result<Child> {
    let work_dir = resolve_cwd(project_dir, spec.cwd.as_deref());
    tracing::debug!(
        service.name = %spec.name,
        work_dir = %work_dir.display(),
        command = %spec.command,
        port = ?port,
        controller = controller.name(),
        "Spawning service process"
    );

    let mut cmd = shell_command(&spec.command);
    cmd.current_dir(&work_dir)
        .envs(&spec.env)
        .env(SPAWNED_BY_ENV, &spec.name)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(port) = port {
        cmd.env(PORT_ENV, port.to_string());
    }
    controller.configure(&mut cmd);

    cmd.spawn()
        .map_err(|e| Error::ServiceStartFailed(spec.name.clone(), e.to_string()))
}
