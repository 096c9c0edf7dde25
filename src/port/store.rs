use crate::error::Result;
use std::collections::HashMap;

/// Port preference storage.
///
/// The allocator reads remembered ports from here before searching, and writes
/// every successful allocation back so that a service tends to get the same
/// port across runs. Durable backends live outside this crate.
///
/// # Implementations
///
/// - [`MemoryPortStore`] - process-lifetime map
/// - [`NoopPortStore`] - remembers nothing; every allocation is fresh
pub trait PortStore: Send + Sync {
    /// Look up a previously allocated port for a key.
    fn get_port(&self, key: &str) -> Option<u16>;

    /// Save a port allocation.
    fn save_port(&mut self, key: &str, port: u16) -> Result<()>;

    /// Get all stored port allocations.
    fn get_all_ports(&self) -> HashMap<String, u16>;
}

/// Port store held in memory for the lifetime of the allocator.
#[derive(Debug, Default)]
pub struct MemoryPortStore {
    ports: HashMap<String, u16>,
}

impl MemoryPortStore {
    pub fn new(ports: HashMap<String, u16>) -> Self {
        Self { ports }
    }
}

impl PortStore for MemoryPortStore {
    fn get_port(&self, key: &str) -> Option<u16> {
        self.ports.get(key).copied()
    }

    fn save_port(&mut self, key: &str, port: u16) -> Result<()> {
        self.ports.insert(key.to_string(), port);
        Ok(())
    }

    fn get_all_ports(&self) -> HashMap<String, u16> {
        self.ports.clone()
    }
}

/// Always returns `None` for lookups and discards saves.
pub struct NoopPortStore;

impl PortStore for NoopPortStore {
    fn get_port(&self, _key: &str) -> Option<u16> {
        None
    }

    fn save_port(&mut self, _key: &str, _port: u16) -> Result<()> {
        Ok(())
    }

    fn get_all_ports(&self) -> HashMap<String, u16> {
        HashMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_store_always_empty() {
        let mut store = NoopPortStore;
        assert!(store.get_port("any").is_none());
        store.save_port("any", 8080).unwrap();
        assert!(store.get_port("any").is_none());
        assert!(store.get_all_ports().is_empty());
    }

    #[test]
    fn test_memory_store_read_write() {
        let mut ports = HashMap::new();
        ports.insert("/proj::db".to_string(), 5432u16);
        let mut store = MemoryPortStore::new(ports);

        assert_eq!(store.get_port("/proj::db"), Some(5432));
        assert_eq!(store.get_port("/proj::web"), None);

        store.save_port("/proj::web", 3000).unwrap();
        let all = store.get_all_ports();
        assert_eq!(all.len(), 2);
        assert_eq!(all["/proj::web"], 3000);
    }
}
