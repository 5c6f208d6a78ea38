//! Node resource accounting: the free-port pool and the memory ledger.
//!
//! Both are rebuilt at startup from the instance store and then adjusted
//! incrementally on provision and unprovision.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("no free port")]
    NoFreePort,

    #[error("insufficient memory: requested {requested_mb} MB, {available_mb} MB available")]
    InsufficientMemory { requested_mb: u64, available_mb: u64 },
}

/// Ports not claimed by any instance.
#[derive(Debug, Clone)]
pub struct PortPool {
    range: RangeInclusive<u16>,
    free: BTreeSet<u16>,
}

impl PortPool {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let free = range.clone().collect();
        Self { range, free }
    }

    /// Take the lowest free port.
    pub fn allocate(&mut self) -> Result<u16, ResourceError> {
        self.free.pop_first().ok_or(ResourceError::NoFreePort)
    }

    /// Mark a specific port as in use. Returns `false` if it was not free.
    pub fn claim(&mut self, port: u16) -> bool {
        self.free.remove(&port)
    }

    /// Return a port to the pool. Ports outside the configured range are
    /// ignored.
    pub fn release(&mut self, port: u16) {
        if self.range.contains(&port) {
            self.free.insert(port);
        }
    }

    pub fn is_free(&self, port: u16) -> bool {
        self.free.contains(&port)
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// Memory reserved by live instances against a fixed capacity.
#[derive(Debug, Clone)]
pub struct MemoryLedger {
    capacity_mb: u64,
    reserved_mb: u64,
}

impl MemoryLedger {
    pub fn new(capacity_mb: u64) -> Self {
        Self {
            capacity_mb,
            reserved_mb: 0,
        }
    }

    pub fn capacity_mb(&self) -> u64 {
        self.capacity_mb
    }

    pub fn available_mb(&self) -> u64 {
        self.capacity_mb.saturating_sub(self.reserved_mb)
    }

    /// Reserve memory for a new instance, refusing if it does not fit.
    pub fn reserve(&mut self, mb: u64) -> Result<(), ResourceError> {
        let available_mb = self.available_mb();
        if mb > available_mb {
            return Err(ResourceError::InsufficientMemory {
                requested_mb: mb,
                available_mb,
            });
        }
        self.reserved_mb += mb;
        Ok(())
    }

    /// Account for an instance that already exists, even past capacity.
    pub fn adopt(&mut self, mb: u64) {
        self.reserved_mb = self.reserved_mb.saturating_add(mb);
    }

    /// Credit memory back from a removed instance.
    pub fn credit(&mut self, mb: u64) {
        self.reserved_mb = self.reserved_mb.saturating_sub(mb);
    }
}

/// All resources of one node, guarded together.
#[derive(Debug, Clone)]
pub struct Resources {
    pub ports: PortPool,
    pub memory: MemoryLedger,
}

impl Resources {
    pub fn new(port_range: RangeInclusive<u16>, capacity_mb: u64) -> Self {
        Self {
            ports: PortPool::new(port_range),
            memory: MemoryLedger::new(capacity_mb),
        }
    }

    /// Reserve memory and, if requested, a port. Nothing is held on failure.
    pub fn reserve(&mut self, memory_mb: u64, needs_port: bool) -> Result<Option<u16>, ResourceError> {
        self.memory.reserve(memory_mb)?;
        if !needs_port {
            return Ok(None);
        }
        match self.ports.allocate() {
            Ok(port) => Ok(Some(port)),
            Err(e) => {
                self.memory.credit(memory_mb);
                Err(e)
            }
        }
    }

    /// Give back what [`Resources::reserve`] took.
    pub fn release(&mut self, memory_mb: u64, port: Option<u16>) {
        self.memory.credit(memory_mb);
        if let Some(port) = port {
            self.ports.release(port);
        }
    }
}
