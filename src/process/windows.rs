use super::ProcessController;
use crate::error::{check_pid_bounds, Error, Result};
use std::process::{Command as StdCommand, Stdio};
use tokio::process::Command;

/// `CREATE_NEW_PROCESS_GROUP` from the Win32 process creation flags.
pub const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Process-tree control through `taskkill` and `tasklist`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsController;

impl WindowsController {
    fn taskkill(&self, pid: u32, force: bool) -> Result<()> {
        check_pid_bounds(pid, "service")?;
        let mut cmd = StdCommand::new("taskkill");
        cmd.arg("/PID").arg(pid.to_string()).arg("/T");
        if force {
            cmd.arg("/F");
        }
        let status = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("taskkill exited with {} for PID {}", status, pid),
            )))
        }
    }
}

impl ProcessController for WindowsController {
    fn configure(&self, cmd: &mut Command) {
        cmd.kill_on_drop(false);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.taskkill(pid, false)
    }

    fn force_kill(&self, pid: u32) -> Result<()> {
        self.taskkill(pid, true)
    }

    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let output = StdCommand::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH", "/FO", "CSV"])
            .output();
        match output {
            Ok(out) if out.status.success() => {
                tasklist_has_pid(&String::from_utf8_lossy(&out.stdout), pid)
            }
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        "windows"
    }
}

/// `tasklist /FO CSV /NH` rows look like `"node.exe","4242","Console","1","30,000 K"`.
fn tasklist_has_pid(output: &str, pid: u32) -> bool {
    let needle = format!("\"{}\"", pid);
    output
        .lines()
        .any(|line| line.split(',').nth(1).map(str::trim) == Some(needle.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasklist_parsing() {
        let out = "\"node.exe\",\"4242\",\"Console\",\"1\",\"30,000 K\"\r\n";
        assert!(tasklist_has_pid(out, 4242));
        assert!(!tasklist_has_pid(out, 424));
        assert!(!tasklist_has_pid("INFO: No tasks are running which match the specified criteria.", 4242));
    }

    #[test]
    fn test_refuses_reserved_pids() {
        assert!(WindowsController.terminate(0).is_err());
        assert!(!WindowsController.is_alive(0));
    }
}
