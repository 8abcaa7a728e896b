//! Veil protocol layer.
//!
//! A node in a decentralized encrypted relay network: peers handshake,
//! establish per-link session encryption, gossip peer lists, and flood
//! signed/sealed messages across the mesh so no single relay can tell a
//! message's true origin or destination.
//!
//! Wire format: hand-rolled little-endian framing, stable across
//! versions.
//! Crypto: Ed25519 signatures + XChaCha20-Poly1305 encryption.

pub mod crypto;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod keypairs;
pub mod packet;
pub mod peers;
pub mod pending;
pub mod registry;
pub mod scheduler;
pub mod transports;
pub mod types;
pub mod wire;

pub use crypto::KeypairInfo;
pub use delivery::DeliveryDispatcher;
pub use engine::{Engine, EngineAction, EngineConfig, Registries};
pub use error::VeilProtocolError;
pub use keypairs::{KeypairEntry, KeypairRegistry};
pub use packet::{Packet, PacketType, PeerAddr};
pub use peers::{Peer, PeerRegistry};
pub use pending::{PendingMsg, PendingRegistry};
pub use registry::{Registry, RegistryError};
pub use scheduler::{Scheduler, TaskId, TaskOutcome};
pub use transports::{TransportConn, TransportRegistry};
pub use types::{now_secs, ConnectionId};
