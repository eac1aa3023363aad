//! Port allocator: hands out unique host ports from a configured range
//! and reclaims them on cluster deletion.
//!
//! Thread-safe via a single `Mutex<BTreeSet<u16>>` of free ports; concurrent
//! `acquire` calls never collide because the set mutation is the critical
//! section.

use std::{collections::BTreeSet, sync::Mutex};

use crate::config::PortRange;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("no ports available in range")]
    NoPortsAvailable,
    #[error("port {0} is outside the configured range")]
    OutOfRange(u16),
    #[error("port {0} is already in use")]
    AlreadyInUse(u16),
}

#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    free: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        let free = (range.lo..range.hi).collect();
        Self {
            range,
            free: Mutex::new(free),
        }
    }

    /// Seeds the allocator from ports already held by non-`DELETED`
    /// clusters on process start. Panics if a held port is outside the
    /// range — that is a configuration error the caller should surface
    /// at startup.
    pub fn seeded(range: PortRange, held: impl IntoIterator<Item = u16>) -> Self {
        let allocator = Self::new(range);
        for port in held {
            allocator
                .reserve(port)
                .expect("persisted cluster port outside configured range");
        }
        allocator
    }

    /// Returns the lowest free port in range.
    pub fn acquire(&self) -> Result<u16, PortError> {
        let mut free = self.free.lock().unwrap();
        let port = *free.iter().next().ok_or(PortError::NoPortsAvailable)?;
        free.remove(&port);
        Ok(port)
    }

    pub fn release(&self, port: u16) {
        if !self.in_range(port) {
            return;
        }
        self.free.lock().unwrap().insert(port);
    }

    /// Marks an externally-chosen port as in-use, e.g. restart-recovery
    /// of persisted cluster records.
    pub fn reserve(&self, port: u16) -> Result<(), PortError> {
        if !self.in_range(port) {
            return Err(PortError::OutOfRange(port));
        }
        let mut free = self.free.lock().unwrap();
        if free.remove(&port) {
            Ok(())
        } else {
            Err(PortError::AlreadyInUse(port))
        }
    }

    pub fn available_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    fn in_range(&self, port: u16) -> bool {
        port >= self.range.lo && port < self.range.hi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(lo: u16, hi: u16) -> PortRange {
        PortRange::new(lo, hi).unwrap()
    }

    #[test]
    fn acquire_returns_lowest_free_port() {
        let allocator = PortAllocator::new(range(100, 103));
        assert_eq!(allocator.acquire().unwrap(), 100);
        assert_eq!(allocator.acquire().unwrap(), 101);
        assert_eq!(allocator.acquire().unwrap(), 102);
        assert!(matches!(allocator.acquire(), Err(PortError::NoPortsAvailable)));
    }

    #[test]
    fn release_returns_port_to_pool() {
        let allocator = PortAllocator::new(range(100, 101));
        let port = allocator.acquire().unwrap();
        assert!(allocator.acquire().is_err());
        allocator.release(port);
        assert_eq!(allocator.acquire().unwrap(), port);
    }

    #[test]
    fn seeded_allocator_reserves_held_ports() {
        let allocator = PortAllocator::seeded(range(100, 103), [101]);
        assert_eq!(allocator.available_count(), 2);
        assert_eq!(allocator.acquire().unwrap(), 100);
        assert_eq!(allocator.acquire().unwrap(), 102);
    }

    #[test]
    fn concurrent_acquire_on_single_port_pool_yields_one_success() {
        use std::sync::Arc;
        let allocator = Arc::new(PortAllocator::new(range(100, 101)));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let allocator = allocator.clone();
            handles.push(std::thread::spawn(move || allocator.acquire()));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok_count = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok_count, 1);
    }

    #[test]
    fn release_of_out_of_range_port_is_ignored() {
        let allocator = PortAllocator::new(range(100, 101));
        allocator.release(9999);
        assert_eq!(allocator.available_count(), 1);
    }
}
