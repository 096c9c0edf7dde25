//! Known failure signatures in service output.
//!
//! When the health monitor marks a service unhealthy it scans the last
//! [`SCAN_WINDOW`] of that service's logs and attaches the first match to the
//! error, critical patterns taking precedence over warnings. Patterns are
//! matched case-insensitively; a pattern containing `.*` is a regex, anything
//! else is a substring.

use super::LogLine;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// How far back the scan looks.
pub const SCAN_WINDOW: Duration = Duration::from_secs(30);

/// Matched lines are cut to this many characters.
pub const MAX_MESSAGE_LEN: usize = 150;

const CRITICAL_PATTERNS: &[&str] = &[
    // crashes
    "panic:",
    "fatal error:",
    "fatal:",
    "segmentation fault",
    "core dumped",
    "stack overflow",
    // binding
    "address already in use",
    "eaddrinuse",
    "port.*already in use",
    "failed to bind",
    "error: listen",
    // startup
    "application failed to start",
    "failed to start",
    "startup failed",
    "initialization failed",
    "failed to initialize",
    // missing modules
    "cannot find module",
    "modulenotfounderror",
    "importerror:",
    "no module named",
    "could not find or load main class",
    // syntax and build
    "syntaxerror",
    "unexpected token",
    "compilation failed",
    "build failed",
    "syntax error",
    // connectivity
    "connection refused",
    "econnrefused",
    "cannot connect to database",
    "failed to connect to database",
    // auth
    "authentication failed",
    "access denied",
    "permission denied",
    // memory
    "out of memory",
    "outofmemoryerror",
    "cannot allocate memory",
];

const WARNING_PATTERNS: &[&str] = &[
    "configuration error",
    "invalid configuration",
    "missing required",
    "environment variable.*not set",
    "deprecated",
    "timeout",
    "slow query",
    "service unavailable",
    "502 bad gateway",
    "504 gateway timeout",
    "rate limit",
    "too many requests",
    "ssl error",
    "tls handshake",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A log line that matched a known failure pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFinding {
    pub severity: Severity,
    pub pattern: &'static str,
    pub message: String,
}

impl fmt::Display for LogFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)
    }
}

enum Matcher {
    Substring(&'static str),
    Regex(&'static str, Regex),
}

impl Matcher {
    fn build(pattern: &'static str) -> Self {
        if pattern.contains(".*") {
            match Regex::new(pattern) {
                Ok(re) => return Matcher::Regex(pattern, re),
                Err(e) => tracing::debug!(pattern, error = %e, "Invalid log pattern, using substring"),
            }
        }
        Matcher::Substring(pattern)
    }

    fn pattern(&self) -> &'static str {
        match self {
            Matcher::Substring(p) | Matcher::Regex(p, _) => p,
        }
    }

    fn is_match(&self, lowered: &str) -> bool {
        match self {
            Matcher::Substring(p) => lowered.contains(p.replace(".*", "").as_str()),
            Matcher::Regex(_, re) => re.is_match(lowered),
        }
    }
}

fn matchers(severity: Severity) -> &'static [Matcher] {
    static CRITICAL: OnceLock<Vec<Matcher>> = OnceLock::new();
    static WARNING: OnceLock<Vec<Matcher>> = OnceLock::new();
    match severity {
        Severity::Critical => {
            CRITICAL.get_or_init(|| CRITICAL_PATTERNS.iter().map(|p| Matcher::build(p)).collect())
        }
        Severity::Warning => {
            WARNING.get_or_init(|| WARNING_PATTERNS.iter().map(|p| Matcher::build(p)).collect())
        }
    }
}

/// First critical match across `lines`, else the first warning match.
pub fn scan(lines: &[LogLine]) -> Option<LogFinding> {
    let lowered: Vec<String> = lines.iter().map(|l| l.text.to_lowercase()).collect();
    for severity in [Severity::Critical, Severity::Warning] {
        for (line, low) in lines.iter().zip(&lowered) {
            if let Some(m) = matchers(severity).iter().find(|m| m.is_match(low)) {
                return Some(LogFinding {
                    severity,
                    pattern: m.pattern(),
                    message: truncate_message(&line.text, MAX_MESSAGE_LEN),
                });
            }
        }
    }
    None
}

/// Trim and cut to `max_len` characters, preferring a word boundary.
pub fn truncate_message(msg: &str, max_len: usize) -> String {
    let msg = msg.trim();
    if msg.chars().count() <= max_len {
        return msg.to_string();
    }
    let cut: String = msg.chars().take(max_len.saturating_sub(3)).collect();
    let cut = match cut.rfind(' ') {
        Some(idx) if idx > cut.len() / 2 => &cut[..idx],
        _ => cut.as_str(),
    };
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogStream;

    fn lines(texts: &[&str]) -> Vec<LogLine> {
        texts
            .iter()
            .map(|t| LogLine::new("api", LogStream::Stderr, *t))
            .collect()
    }

    #[test]
    fn test_critical_beats_earlier_warning() {
        let logs = lines(&[
            "DeprecationWarning: Buffer() is deprecated",
            "Error: listen EADDRINUSE: address already in use :::3000",
        ]);
        let finding = scan(&logs).unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert!(finding.message.contains("EADDRINUSE"));
    }

    #[test]
    fn test_warning_only() {
        let finding = scan(&lines(&["upstream request timeout after 30s"])).unwrap();
        assert_eq!(finding.severity, Severity::Warning);
        assert_eq!(finding.pattern, "timeout");
    }

    #[test]
    fn test_regex_pattern() {
        let finding = scan(&lines(&["Port 8080 is already in use"])).unwrap();
        assert_eq!(finding.pattern, "port.*already in use");
        assert!(scan(&lines(&["environment variable DATABASE_URL not set"])).is_some());
    }

    #[test]
    fn test_clean_logs() {
        assert!(scan(&lines(&["listening on :3000", "GET /health 200"])).is_none());
        assert!(scan(&[]).is_none());
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("  short  ", 150), "short");
        let long = "word ".repeat(60);
        let out = truncate_message(&long, 150);
        assert!(out.chars().count() <= 150);
        assert!(out.ends_with("..."));
    }
}
