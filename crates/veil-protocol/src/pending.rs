//! Pending-message registry: delivery deduplication and expiry.
//!
//! Each locally delivered (or published) message is remembered by the
//! BLAKE3 checksum of its content for the expiry window, so flood
//! echoes are delivered at most once. Forwarding is not gated here.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::crypto::CHECKSUM_LEN;
use crate::registry::{Registry, RegistryError};
use crate::types::{MSG_EXPIRY_SECS, REGISTRY_CAPACITY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMsg {
    pub id: u64,
    pub checksum: [u8; CHECKSUM_LEN],
    pub size: usize,
    pub timestamp: i64,
}

/// A message outside the expiry window is dead: too old, or stamped in
/// the future by a clock-skewed or hostile origin.
pub fn has_expired(timestamp: i64, now: i64) -> bool {
    let age = now - timestamp;
    age < 0 || age > MSG_EXPIRY_SECS
}

#[derive(Debug)]
pub struct PendingRegistry {
    entries: Registry<PendingMsg>,
    next_id: AtomicU64,
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self {
            entries: Registry::new("pending", REGISTRY_CAPACITY),
            next_id: AtomicU64::new(1),
        }
    }

    /// Remember a message checksum. Duplicates mean the flood already
    /// came through and the caller must not deliver or forward again.
    pub fn add(
        &self,
        checksum: [u8; CHECKSUM_LEN],
        size: usize,
        timestamp: i64,
    ) -> Result<u64, RegistryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.push_back_unique(
            PendingMsg {
                id,
                checksum,
                size,
                timestamp,
            },
            |a, b| a.checksum == b.checksum,
        )?;
        Ok(id)
    }

    pub fn has_checksum(&self, checksum: &[u8; CHECKSUM_LEN]) -> bool {
        self.entries.contains(|msg| &msg.checksum == checksum)
    }

    /// Drop every entry whose expiry window has closed, returning the
    /// number removed.
    pub fn sweep_expired(&self, now: i64) -> usize {
        self.entries.remove_all_where(|msg| has_expired(msg.timestamp, now))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
