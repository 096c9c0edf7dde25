use crate::error::{Error, ErrorKind};
use crate::registry::LifecycleStatus;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Start,
    Stop,
    Restart,
    Remove,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Start => write!(f, "start"),
            OperationKind::Stop => write!(f, "stop"),
            OperationKind::Restart => write!(f, "restart"),
            OperationKind::Remove => write!(f, "remove"),
        }
    }
}

/// Outcome of one lifecycle operation on one service.
#[derive(Debug)]
pub struct OperationResult {
    pub name: String,
    pub operation: OperationKind,
    /// Lifecycle recorded in the registry once the operation finished.
    pub resulting_status: Option<LifecycleStatus>,
    pub error: Option<Error>,
    pub duration: Duration,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(Error::kind)
    }
}

/// Per-service outcomes of a bulk operation, in declaration order.
#[derive(Debug, Default)]
pub struct BulkOperationResult {
    pub results: Vec<OperationResult>,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_duration: Duration,
}

impl BulkOperationResult {
    pub fn new(results: Vec<OperationResult>, total_duration: Duration) -> Self {
        let success_count = results.iter().filter(|r| r.is_success()).count();
        Self {
            failure_count: results.len() - success_count,
            success_count,
            results,
            total_duration,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0
    }

    pub fn get(&self, name: &str) -> Option<&OperationResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// Collapse into a single result. Several failures become [`Error::Multiple`].
    pub fn into_result(self) -> Result<(), Error> {
        let mut errors: Vec<Error> = self.results.into_iter().filter_map(|r| r.error).collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }
}
