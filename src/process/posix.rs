use super::ProcessController;
use crate::error::{validate_pid, validate_pid_for_check, Error, Result};
use nix::sys::signal::{self, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use tokio::process::Command;

/// Process-group signalling through `nix`.
///
/// Children are started as leaders of a new process group, so a signal to the
/// group reaches everything a shell wrapper forked.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixController;

impl PosixController {
    fn signal_group(&self, pid: u32, sig: Signal) -> Result<()> {
        let pid = validate_pid(pid, "service")?;
        let pgid = get_process_group(pid).unwrap_or(pid);
        killpg(pgid, sig)
            .or_else(|e| {
                tracing::debug!(
                    pgid = pgid.as_raw(),
                    error = %e,
                    "killpg failed, signalling the PID directly"
                );
                signal::kill(pid, sig)
            })
            .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))
    }
}

impl ProcessController for PosixController {
    fn configure(&self, cmd: &mut Command) {
        cmd.kill_on_drop(false).process_group(0);
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.signal_group(pid, Signal::SIGTERM)
    }

    fn force_kill(&self, pid: u32) -> Result<()> {
        self.signal_group(pid, Signal::SIGKILL)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Some(nix_pid) = validate_pid_for_check(pid) else {
            return false;
        };
        if signal::kill(nix_pid, None).is_err() {
            return false;
        }

        #[cfg(target_os = "linux")]
        {
            if let Some(state) = proc_state(pid) {
                // Zombie, stopped or dead
                return !matches!(state, 'Z' | 'T' | 'X' | 'x');
            }
        }

        true
    }

    fn name(&self) -> &'static str {
        "posix"
    }
}

/// Get the process group ID (PGID) for a given PID.
fn get_process_group(pid: Pid) -> Option<Pid> {
    match getpgid(Some(pid)) {
        Ok(pgid) if pgid.as_raw() > 0 => Some(pgid),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(
                pid = pid.as_raw(),
                error = %e,
                "Failed to get PGID (process may have exited)"
            );
            None
        }
    }
}

/// Single-letter state from `/proc/<pid>/status`.
#[cfg(target_os = "linux")]
fn proc_state(pid: u32) -> Option<char> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    parse_state_line(&status)
}

#[cfg(any(target_os = "linux", test))]
fn parse_state_line(status: &str) -> Option<char> {
    status
        .lines()
        .find(|l| l.starts_with("State:"))
        .and_then(|l| l["State:".len()..].chars().find(|c| c.is_alphabetic()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_line() {
        assert_eq!(
            parse_state_line("Name:\tsleep\nState:\tS (sleeping)\nPid:\t12\n"),
            Some('S')
        );
        assert_eq!(parse_state_line("State:\tZ (zombie)"), Some('Z'));
        assert_eq!(parse_state_line("Name:\tx\n"), None);
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(PosixController.is_alive(std::process::id()));
        assert!(!PosixController.is_alive(0));
    }

    #[test]
    fn test_signals_refuse_init() {
        assert!(matches!(
            PosixController.terminate(1),
            Err(Error::InvalidPid { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminate_child_group() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        PosixController.configure(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(PosixController.is_alive(pid));

        PosixController.terminate(pid).unwrap();
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(!PosixController.is_alive(pid));
    }
}
