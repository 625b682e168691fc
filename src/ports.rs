//! Public and local port bookkeeping.
//!
//! Pure in-memory reservation set — no I/O, no locking of its own. The
//! allocator is owned by the connection manager and only ever mutated under
//! its single transition lock, so reserve/release are plain `&mut` methods.
//!
//! A port is *reserved* exactly while some mapping holding it is not
//! Stopped. Stopped mappings keep their assigned port number but do not hold
//! a reservation, so the number may be handed to (or explicitly claimed by)
//! another mapping; whichever starts first wins.

use std::collections::HashSet;

use crate::error::Error;

/// Tracks reserved ports and suggests free ones above a configured base.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    reserved: HashSet<u16>,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            reserved: HashSet::new(),
        }
    }

    /// Lowest free port ≥ `max(base, min)`, or `None` if the range above the
    /// base is exhausted.
    pub fn suggest(&self, min: u16) -> Option<u16> {
        let start = self.base.max(min);
        (start..=u16::MAX).find(|p| !self.reserved.contains(p))
    }

    /// Atomically reserve an explicit port.
    pub fn reserve(&mut self, port: u16) -> Result<(), Error> {
        if self.reserved.insert(port) {
            Ok(())
        } else {
            Err(Error::PortConflict(port))
        }
    }

    /// Free a port. Idempotent — releasing an unreserved port is a no-op.
    pub fn release(&mut self, port: u16) {
        self.reserved.remove(&port);
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }
}
