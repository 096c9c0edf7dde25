//! Start, stop and restart services, one at a time or in bulk.

mod lock;
mod manager;
mod result;
mod validation;

pub use lock::{LockState, OperationGuard, OperationLock, OperationLocks};
pub use manager::OperationManager;
pub use result::{BulkOperationResult, OperationKind, OperationResult};
pub use validation::{validate_service_name, MAX_SERVICE_NAME_LEN};
