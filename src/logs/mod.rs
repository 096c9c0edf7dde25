//! Per-service log buffering and fan-out.
//!
//! - `ring` - bounded history per service
//! - `broadcaster` - pub/sub with per-subscriber backpressure
//! - `capture` - readers that feed a child's stdout/stderr into the broadcaster
//! - `patterns` - failure signatures used to enrich health errors

pub mod broadcaster;
pub mod capture;
pub mod patterns;
pub mod ring;

pub use broadcaster::{LogBroadcaster, LogSubscription, SUBSCRIBER_CHANNEL_CAPACITY};
pub use capture::{spawn_capture, spawn_reader, CaptureHandle};
pub use patterns::{LogFinding, Severity};
pub use ring::LogRing;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of service output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub service: String,
    pub stream: LogStream,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl LogLine {
    pub fn new(service: impl Into<String>, stream: LogStream, text: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            stream,
            timestamp: Utc::now(),
            text: text.into(),
        }
    }
}
