//! Known-peer registry.
//!
//! A peer is an advertised listen endpoint bound to the connection it
//! was learned on. The registry also owns the peerlist byte format used
//! both on the wire and in the on-disk peer file: `u16` count followed
//! by (`u16`-prefixed address string, `u32` port) per entry.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::packet::PeerAddr;
use crate::registry::{Registry, RegistryError};
use crate::types::{is_local_address, ConnectionId, REGISTRY_CAPACITY};
use crate::wire::{ByteReader, ByteWriter, WireError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: u64,
    pub address: String,
    pub port: u32,
    /// Connection the peer was learned on; `None` for entries loaded
    /// from disk or a peerlist that are not yet dialed.
    pub conn: Option<ConnectionId>,
}

#[derive(Debug)]
pub struct PeerRegistry {
    entries: Registry<Peer>,
    next_id: AtomicU64,
    /// Accept loopback/private addresses, for multi-node tests on one host.
    allow_local: bool,
}

impl PeerRegistry {
    pub fn new(allow_local: bool) -> Self {
        Self {
            entries: Registry::new("peers", REGISTRY_CAPACITY),
            next_id: AtomicU64::new(1),
            allow_local,
        }
    }

    /// Record a peer endpoint. Duplicate (address, port) entries are
    /// rejected, except for loopback/local endpoints when local-peer
    /// policy allows them — that keeps multi-node tests on one host
    /// working.
    pub fn add(
        &self,
        address: &str,
        port: u32,
        conn: Option<ConnectionId>,
    ) -> Result<u64, RegistryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let peer = Peer {
            id,
            address: address.to_string(),
            port,
            conn,
        };
        if self.allow_local && is_local_address(address) {
            self.entries.push_back(peer)?;
        } else {
            self.entries
                .push_back_unique(peer, |a, b| a.address == b.address && a.port == b.port)?;
        }
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_endpoint(&self, address: &str, port: u32) -> bool {
        self.entries
            .contains(|peer| peer.address == address && peer.port == port)
    }

    /// Bind a previously learned endpoint to a live connection.
    pub fn attach_conn(&self, address: &str, port: u32, conn: ConnectionId) -> bool {
        self.entries.update_where(
            |peer| peer.address == address && peer.port == port,
            |peer| peer.conn = Some(conn),
        )
    }

    pub fn remove_by_conn(&self, conn: ConnectionId) -> Option<Peer> {
        self.entries.remove_where(|peer| peer.conn == Some(conn))
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.entries.snapshot()
    }

    pub fn addrs(&self) -> Vec<PeerAddr> {
        self.entries
            .snapshot()
            .into_iter()
            .map(|peer| PeerAddr {
                address: peer.address,
                port: peer.port,
            })
            .collect()
    }

    /// Endpoints not yet bound to a connection, i.e. dial candidates.
    pub fn unconnected(&self) -> Vec<Peer> {
        self.entries
            .snapshot()
            .into_iter()
            .filter(|peer| peer.conn.is_none())
            .collect()
    }
}

/// Serialize a peer list to the shared wire/file byte format.
pub fn encode_peerlist(peers: &[PeerAddr]) -> Result<Vec<u8>, WireError> {
    let count = u16::try_from(peers.len()).map_err(|_| WireError::Oversize { len: peers.len() })?;
    let mut w = ByteWriter::new();
    w.put_u16(count);
    for peer in peers {
        w.put_string(&peer.address)?;
        w.put_u32(peer.port);
    }
    Ok(w.into_vec())
}

/// Parse a peer list from the shared wire/file byte format.
pub fn decode_peerlist(data: &[u8]) -> Result<Vec<PeerAddr>, WireError> {
    let mut r = ByteReader::new(data);
    let count = r.get_u16()? as usize;
    let mut peers = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        peers.push(PeerAddr {
            address: r.get_string()?,
            port: r.get_u32()?,
        });
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_endpoint_rejected() {
        let reg = PeerRegistry::new(false);
        reg.add("10.0.0.1", 5000, None).unwrap();
        assert!(reg.add("10.0.0.1", 5000, Some(ConnectionId(3))).is_err());
        // Same address, different port is a distinct peer.
        reg.add("10.0.0.1", 5001, None).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn local_duplicates_gated_by_policy() {
        let strict = PeerRegistry::new(false);
        strict.add("127.0.0.1", 5000, None).unwrap();
        assert!(strict.add("127.0.0.1", 5000, None).is_err());

        let lax = PeerRegistry::new(true);
        lax.add("127.0.0.1", 5000, None).unwrap();
        lax.add("127.0.0.1", 5000, None).unwrap();
        assert_eq!(lax.len(), 2);
        // Non-local duplicates stay rejected either way.
        lax.add("203.0.113.7", 5000, None).unwrap();
        assert!(lax.add("203.0.113.7", 5000, None).is_err());
    }

    #[test]
    fn remove_by_conn_detaches_peer() {
        let reg = PeerRegistry::new(true);
        reg.add("10.0.0.1", 5000, Some(ConnectionId(1))).unwrap();
        reg.add("10.0.0.2", 5000, Some(ConnectionId(2))).unwrap();

        let removed = reg.remove_by_conn(ConnectionId(1)).unwrap();
        assert_eq!(removed.address, "10.0.0.1");
        assert_eq!(reg.len(), 1);
        assert!(reg.remove_by_conn(ConnectionId(1)).is_none());
    }

    #[test]
    fn attach_conn_marks_dialed_peer() {
        let reg = PeerRegistry::new(true);
        reg.add("10.0.0.1", 5000, None).unwrap();
        assert_eq!(reg.unconnected().len(), 1);
        assert!(reg.attach_conn("10.0.0.1", 5000, ConnectionId(9)));
        assert!(reg.unconnected().is_empty());
    }

    #[test]
    fn peerlist_bytes_roundtrip() {
        let peers = vec![
            PeerAddr {
                address: "10.0.0.1".into(),
                port: 5000,
            },
            PeerAddr {
                address: "relay.example".into(),
                port: 6001,
            },
        ];
        let encoded = encode_peerlist(&peers).unwrap();
        assert_eq!(decode_peerlist(&encoded).unwrap(), peers);
        assert_eq!(decode_peerlist(&encode_peerlist(&[]).unwrap()).unwrap(), vec![]);
    }

    #[test]
    fn truncated_peerlist_rejected() {
        let peers = vec![PeerAddr {
            address: "10.0.0.1".into(),
            port: 5000,
        }];
        let encoded = encode_peerlist(&peers).unwrap();
        assert!(decode_peerlist(&encoded[..encoded.len() - 1]).is_err());
    }
}
