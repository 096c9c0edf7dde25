pub mod allocator;
pub mod conflict;
pub mod prompt;
pub mod store;

pub use allocator::{port_key, PortAllocator, MAX_RANDOM_ATTEMPTS};
pub use conflict::{check_port, find_listener, is_port_available};
pub use prompt::{is_interactive, PortConfirmer, PortConflictAction, TerminalConfirmer};
pub use store::{MemoryPortStore, NoopPortStore, PortStore};
