//! Port arbitration for hosted targets.
//!
//! Ports are handed out sequentially from a configured inclusive range. A
//! candidate is taken only if it is not already reserved and both it and its
//! paired health port can be bound on the loopback interface. The reserved
//! set stays locked across the test bind so two concurrent allocations can
//! never land on the same port.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Mutex;

use crate::error::FoundryError;

pub struct PortAllocator {
    start: u16,
    end: u16,
    health_offset: u16,
    reserved: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator over `start..=end`. Each allocated port `p` also
    /// requires `p + health_offset` to be bindable.
    pub fn new(start: u16, end: u16, health_offset: u16) -> Self {
        Self {
            start,
            end,
            health_offset,
            reserved: Mutex::new(BTreeSet::new()),
        }
    }

    /// Reserve and return the first free port in the range.
    ///
    /// Fails with `PortExhaustion` without side effects when none is free.
    pub fn allocate(&self) -> crate::Result<u16> {
        let mut reserved = self.lock();
        for candidate in self.start..=self.end {
            if reserved.contains(&candidate) {
                continue;
            }
            if !self.is_bindable(candidate) {
                tracing::debug!(port = candidate, "port in use by another process, skipping");
                continue;
            }
            reserved.insert(candidate);
            tracing::debug!(port = candidate, "port allocated");
            return Ok(candidate);
        }
        Err(FoundryError::PortExhaustion(self.start, self.end))
    }

    /// Return a port to the pool. Releasing an unreserved port is a no-op.
    pub fn release(&self, port: u16) {
        if self.lock().remove(&port) {
            tracing::debug!(port, "port released");
        }
    }

    /// Mark a specific port as taken without probing it.
    ///
    /// Returns false if the port is outside the range or already reserved.
    pub fn reserve(&self, port: u16) -> bool {
        if port < self.start || port > self.end {
            return false;
        }
        self.lock().insert(port)
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Snapshot of currently reserved ports, ascending.
    pub fn reserved(&self) -> Vec<u16> {
        self.lock().iter().copied().collect()
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    pub fn health_port(&self, port: u16) -> u16 {
        port.saturating_add(self.health_offset)
    }

    fn is_bindable(&self, port: u16) -> bool {
        let Some(health) = port.checked_add(self.health_offset) else {
            return false;
        };
        // Listeners are dropped immediately; the bind only checks availability.
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
            && TcpListener::bind((Ipv4Addr::LOCALHOST, health)).is_ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        // A poisoned set is still a valid set of integers.
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
