//! Identity keypair registry.
//!
//! Every keypair here is an address the local node answers to: relayed
//! messages are probed against each one until a signature verifies.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::crypto::{self, KeypairInfo};
use crate::registry::{Registry, RegistryError};
use crate::types::REGISTRY_CAPACITY;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeypairEntry {
    pub id: u64,
    pub info: KeypairInfo,
}

#[derive(Debug)]
pub struct KeypairRegistry {
    entries: Registry<KeypairEntry>,
    next_id: AtomicU64,
}

impl Default for KeypairRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KeypairRegistry {
    pub fn new() -> Self {
        Self {
            entries: Registry::new("keypairs", REGISTRY_CAPACITY),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an identity. Duplicate public keys are rejected so one
    /// address never gets delivered twice.
    pub fn add(&self, info: KeypairInfo) -> Result<u64, RegistryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.push_back_unique(KeypairEntry { id, info }, |a, b| {
            a.info.public == b.info.public
        })?;
        Ok(id)
    }

    /// Generate a complete identity: fresh keypair plus the random nonce
    /// used when sealing material addressed to it.
    pub fn generate(&self) -> Result<u64, RegistryError> {
        let mut info = KeypairInfo::generate();
        info.nonce = crypto::generate_nonce();
        self.add(info)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<KeypairEntry> {
        self.entries.find_where(|entry| entry.id == id)
    }

    pub fn first(&self) -> Option<KeypairEntry> {
        self.entries.snapshot().into_iter().next()
    }

    pub fn snapshot(&self) -> Vec<KeypairEntry> {
        self.entries.snapshot()
    }

    /// Probe a signature-prepended blob against every identity. Returns
    /// the matching entry and the verified inner message, or None when
    /// the material is addressed to someone else.
    pub fn find_signer(&self, signed: &[u8]) -> Option<(KeypairEntry, Vec<u8>)> {
        self.entries.find_map(|entry| {
            crypto::sign_open(signed, &entry.info.public)
                .ok()
                .map(|message| (entry.clone(), message))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_public_key_rejected() {
        let reg = KeypairRegistry::new();
        let info = KeypairInfo::generate();
        reg.add(info.clone()).unwrap();
        assert!(matches!(
            reg.add(info),
            Err(RegistryError::Duplicate { .. })
        ));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn find_signer_probes_all_identities() {
        let reg = KeypairRegistry::new();
        reg.generate().unwrap();
        let id = reg.generate().unwrap();
        let target = reg.get(id).unwrap();

        let signed = crypto::sign(b"for the second identity", &target.info.secret);
        let (found, message) = reg.find_signer(&signed).unwrap();
        assert_eq!(found.id, id);
        assert_eq!(message, b"for the second identity");
    }

    #[test]
    fn find_signer_misses_foreign_material() {
        let reg = KeypairRegistry::new();
        reg.generate().unwrap();

        let stranger = KeypairInfo::generate();
        let signed = crypto::sign(b"not for us", &stranger.secret);
        assert!(reg.find_signer(&signed).is_none());
    }
}
