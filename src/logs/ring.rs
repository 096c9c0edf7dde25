use super::LogLine;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Fill ratio at which a one-time warning is logged.
const WARNING_THRESHOLD: f64 = 0.8;

/// Bounded per-service log history. Evicts the oldest line when full.
#[derive(Debug)]
pub struct LogRing {
    service: String,
    lines: VecDeque<LogLine>,
    capacity: usize,
    evicted: u64,
    warned: bool,
}

impl LogRing {
    pub fn new(service: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            service: service.into(),
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
            warned: false,
        }
    }

    pub fn push(&mut self, line: LogLine) {
        self.lines.push_back(line);
        if self.lines.len() > self.capacity {
            self.lines.pop_front();
            self.evicted += 1;
        }

        let threshold = (self.capacity as f64 * WARNING_THRESHOLD) as usize;
        if !self.warned && self.lines.len() >= threshold.max(1) {
            tracing::warn!(
                service.name = %self.service,
                "Log buffer for service '{}' is at {}/{} lines ({}% capacity). Oldest logs will be dropped.",
                self.service,
                self.lines.len(),
                self.capacity,
                (self.lines.len() as f64 / self.capacity as f64 * 100.0) as usize
            );
            self.warned = true;
        }
    }

    /// Last `n` lines, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogLine> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Lines stamped at or after `since`, oldest first.
    pub fn since(&self, since: DateTime<Utc>) -> Vec<LogLine> {
        self.lines
            .iter()
            .filter(|l| l.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.warned = false;
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines evicted because the buffer was full.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogStream;

    fn line(n: usize) -> LogLine {
        LogLine::new("svc", LogStream::Stdout, format!("line {}", n))
    }

    #[test]
    fn test_eviction_counts_dropped_lines() {
        let mut ring = LogRing::new("svc", 3);
        for i in 0..5 {
            ring.push(line(i));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.evicted(), 2);
        let texts: Vec<_> = ring.recent(10).into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_recent_takes_tail() {
        let mut ring = LogRing::new("svc", 10);
        for i in 0..4 {
            ring.push(line(i));
        }
        let texts: Vec<_> = ring.recent(2).into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["line 2", "line 3"]);
        assert!(ring.recent(0).is_empty());
    }

    #[test]
    fn test_since_filters_by_timestamp() {
        let mut ring = LogRing::new("svc", 10);
        let mut old = line(0);
        old.timestamp = Utc::now() - chrono::Duration::seconds(60);
        ring.push(old);
        ring.push(line(1));

        let recent = ring.since(Utc::now() - chrono::Duration::seconds(30));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].text, "line 1");
    }

    #[test]
    fn test_clear() {
        let mut ring = LogRing::new("svc", 2);
        ring.push(line(0));
        ring.clear();
        assert!(ring.is_empty());
    }
}
