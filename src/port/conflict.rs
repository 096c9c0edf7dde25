use crate::error::{Error, Result};
use std::net::TcpListener;

/// Check whether `port` can be bound on both loopback and the wildcard address.
///
/// On success both probe listeners are dropped again; use the allocator to hold
/// a port.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok() && TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Report a taken port as [`Error::PortConflict`], naming the owner when it can
/// be found.
pub fn check_port(port: u16) -> Result<()> {
    if is_port_available(port) {
        return Ok(());
    }
    let owner = find_listener(port);
    Err(Error::PortConflict {
        port,
        pid: owner.as_ref().map(|(pid, _)| *pid),
        process_name: owner.map(|(_, name)| name),
    })
}

/// Find the process listening on `port` via `lsof` field output.
#[cfg(unix)]
pub fn find_listener(port: u16) -> Option<(u32, String)> {
    let output = std::process::Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{}", port), "-sTCP:LISTEN", "-Fpc"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_lsof_fields(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(not(unix))]
pub fn find_listener(_port: u16) -> Option<(u32, String)> {
    None
}

/// First `p<pid>` / `c<command>` pair from `lsof -F pc` output.
fn parse_lsof_fields(out: &str) -> Option<(u32, String)> {
    let mut pid = None;
    for line in out.lines() {
        if let Some(p) = line.strip_prefix('p') {
            pid = p.trim().parse::<u32>().ok();
        } else if let Some(c) = line.strip_prefix('c') {
            if let Some(pid) = pid {
                return Some((pid, c.trim().to_string()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsof_fields() {
        let out = "p4242\ncnode\nf12\n";
        assert_eq!(parse_lsof_fields(out), Some((4242, "node".to_string())));
        assert_eq!(parse_lsof_fields("cnode\n"), None);
        assert_eq!(parse_lsof_fields(""), None);
    }

    #[test]
    fn test_check_port_reports_conflict() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available(port));
        match check_port(port) {
            Err(Error::PortConflict { port: p, .. }) => assert_eq!(p, port),
            other => panic!("expected conflict, got {:?}", other),
        }
    }
}
