//! Transport registry.
//!
//! A transport is a delivery slot tied to one local identity keypair:
//! relayed messages addressed to that identity surface through it.
//! Slots are created lazily the first time an identity receives.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::registry::{Registry, RegistryError};
use crate::types::REGISTRY_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConn {
    pub id: u64,
    pub keypair_id: u64,
}

#[derive(Debug)]
pub struct TransportRegistry {
    entries: Registry<TransportConn>,
    next_id: AtomicU64,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            entries: Registry::new("transports", REGISTRY_CAPACITY),
            next_id: AtomicU64::new(1),
        }
    }

    /// Return the transport for an identity, creating it on first use.
    pub fn ensure(&self, keypair_id: u64) -> Result<TransportConn, RegistryError> {
        if let Some(existing) = self
            .entries
            .find_where(|conn| conn.keypair_id == keypair_id)
        {
            return Ok(existing);
        }
        let conn = TransportConn {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            keypair_id,
        };
        self.entries
            .push_back_unique(conn, |a, b| a.keypair_id == b.keypair_id)?;
        Ok(conn)
    }

    pub fn get(&self, id: u64) -> Option<TransportConn> {
        self.entries.find_where(|conn| conn.id == id)
    }

    pub fn remove_for_keypair(&self, keypair_id: u64) -> Option<TransportConn> {
        self.entries
            .remove_where(|conn| conn.keypair_id == keypair_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_is_idempotent() {
        let reg = TransportRegistry::new();
        let first = reg.ensure(7).unwrap();
        let second = reg.ensure(7).unwrap();
        assert_eq!(first, second);
        assert_eq!(reg.len(), 1);

        let other = reg.ensure(8).unwrap();
        assert_ne!(first.id, other.id);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn remove_frees_the_slot() {
        let reg = TransportRegistry::new();
        let conn = reg.ensure(7).unwrap();
        assert_eq!(reg.remove_for_keypair(7), Some(conn));
        assert!(reg.get(conn.id).is_none());

        // Recreating allocates a fresh id.
        let fresh = reg.ensure(7).unwrap();
        assert_ne!(fresh.id, conn.id);
    }
}
