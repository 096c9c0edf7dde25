//! Authoritative per-service state with change notification.

mod dispatch;
mod store;
mod types;

pub use dispatch::{ChannelObserver, RegistryObserver};
pub use store::{Registry, DEFAULT_OBSERVER_TIMEOUT, DEFAULT_OBSERVER_QUEUE};
pub use types::*;
