use super::conflict::find_listener;
use std::io::{stdin, stdout, Write};

/// Environment variable that forces non-interactive behaviour.
pub const ENV_NON_INTERACTIVE: &str = "DEVFLEET_NON_INTERACTIVE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortConflictAction {
    /// Try the remembered port again (its owner may have exited).
    Retry,
    /// Take the pre-selected alternative port.
    UseAlternative,
    /// Give up on the allocation.
    Abort,
}

/// Decides what to do when a remembered port is taken.
///
/// Called by the allocator without any of its locks held, so an implementation
/// may block for as long as it likes.
pub trait PortConfirmer: Send + Sync {
    fn confirm(&self, key: &str, preferred: u16, alternative: u16) -> PortConflictAction;
}

/// Asks on the terminal. Falls back to the alternative port when there is no
/// interactive TTY.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirmer;

impl PortConfirmer for TerminalConfirmer {
    fn confirm(&self, key: &str, preferred: u16, alternative: u16) -> PortConflictAction {
        if !is_interactive() {
            tracing::info!(
                key = %key,
                preferred,
                alternative,
                "Remembered port in use, using alternative (non-interactive)"
            );
            return PortConflictAction::UseAlternative;
        }
        prompt_user(key, preferred, alternative)
    }
}

/// Check if running in interactive TTY
pub fn is_interactive() -> bool {
    use std::io::IsTerminal;
    if std::env::var_os(ENV_NON_INTERACTIVE).is_some() {
        return false;
    }
    // Cargo test binaries run from target/*/deps/ and are never interactive
    if let Ok(exe) = std::env::current_exe() {
        if let Some(path) = exe.to_str() {
            if path.contains("/deps/") || path.contains("\\deps\\") {
                return false;
            }
        }
    }
    stdin().is_terminal() && stdout().is_terminal()
}

fn prompt_user(key: &str, preferred: u16, alternative: u16) -> PortConflictAction {
    println!();
    println!("Port {} ({}) is in use", preferred, key);
    if let Some((pid, name)) = find_listener(preferred) {
        println!("  held by {} (PID {})", name, pid);
    }
    println!();
    println!("Options:");
    println!("  [r] Retry (process may have exited)");
    println!("  [a] Use port {} instead", alternative);
    println!("  [Esc/q] Abort");
    println!();
    print!("Your choice: ");
    stdout().flush().ok();

    use crossterm::event::{read, Event, KeyCode, KeyEvent};
    loop {
        match read() {
            Ok(Event::Key(KeyEvent { code, .. })) => match code {
                KeyCode::Char('r') | KeyCode::Char('R') => {
                    println!("r");
                    return PortConflictAction::Retry;
                }
                KeyCode::Char('a') | KeyCode::Char('A') | KeyCode::Enter => {
                    println!("a");
                    return PortConflictAction::UseAlternative;
                }
                KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => {
                    println!("q");
                    return PortConflictAction::Abort;
                }
                _ => {}
            },
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read key, using alternative port");
                return PortConflictAction::UseAlternative;
            }
        }
    }
}
