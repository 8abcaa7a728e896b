//! Protocol engine: handshake state machine and relay flood.
//!
//! The engine is pure protocol logic. It owns per-connection state and
//! the shared registries, consumes connection events and raw bytes, and
//! returns [`EngineAction`]s for the I/O layer to carry out. It never
//! touches a socket itself, which keeps the whole state machine testable
//! by wiring two engines together in memory.
//!
//! # Handshake
//!
//! The dialing side (initiator) sends `connect_req`; the accepting side
//! validates version and release, records the peer and answers
//! `connect_resp`. The initiator then generates a session keypair and
//! link nonce and offers them in `keypair_req`; the acceptor answers
//! `keypair_resp` with its own session keypair — in cleartext, since the
//! link only switches to sealed framing after that packet — and both
//! sides mark the connection authenticated and encrypted.
//!
//! # Relay flood
//!
//! A relayed message is signed and sealed against the *recipient's*
//! keypair, so only a node holding that keypair can verify and decrypt
//! it; everyone else just forwards. Forwarding is unconditional for
//! unexpired messages and passes the material on byte-identical, so an
//! observer cannot tell delivery from relay. Dedup — a BLAKE3 checksum
//! of the decrypted content — suppresses repeat *delivery* only; the
//! expiry window is what ultimately stops a flood.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::crypto::{self, KeypairInfo, NONCE_LEN};
use crate::keypairs::KeypairRegistry;
use crate::packet::{Packet, PeerAddr};
use crate::peers::PeerRegistry;
use crate::pending::{self, PendingRegistry};
use crate::registry::RegistryError;
use crate::transports::TransportRegistry;
use crate::types::{now_secs, ConnectionId};
use crate::wire::{ByteReader, ByteWriter};
use crate::VeilProtocolError;

/// Node-level knobs the engine needs to run the handshake.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Software version exchanged and matched in `connect_req`.
    pub version: String,
    /// Release name exchanged and matched in `connect_req`.
    pub release_name: String,
    /// Port our own listener is bound to, advertised to peers.
    pub bind_port: u32,
}

/// Shared registries the engine reads and writes.
#[derive(Debug, Clone)]
pub struct Registries {
    pub keypairs: Arc<KeypairRegistry>,
    pub transports: Arc<TransportRegistry>,
    pub peers: Arc<PeerRegistry>,
    pub pending: Arc<PendingRegistry>,
}

/// Side effect for the I/O layer to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    /// Write a fully framed buffer to a connection.
    Send { conn: ConnectionId, frame: Vec<u8> },
    /// Close a connection.
    Close { conn: ConnectionId },
    /// Dial a newly learned peer endpoint.
    ConnectTo { address: String, port: u32 },
    /// Surface a decrypted relay payload on a transport slot.
    Deliver { transport: u64, payload: Vec<u8> },
}

#[derive(Debug)]
struct Connection {
    id: ConnectionId,
    remote_address: String,
    /// True when we dialed, false when we accepted.
    outbound: bool,
    /// Acceptor side: `connect_req` seen and answered.
    got_connect: bool,
    authenticated: bool,
    /// Frames are sealed from here on.
    encrypted: bool,
    session: Option<KeypairInfo>,
    /// Unconsumed inbound bytes, reassembled across reads.
    rx_buf: Vec<u8>,
}

impl Connection {
    fn new(id: ConnectionId, remote_address: String, outbound: bool) -> Self {
        Self {
            id,
            remote_address,
            outbound,
            got_connect: false,
            authenticated: false,
            encrypted: false,
            session: None,
            rx_buf: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    registries: Registries,
    connections: HashMap<ConnectionId, Connection>,
}

impl Engine {
    pub fn new(config: EngineConfig, registries: Registries) -> Self {
        Self {
            config,
            registries,
            connections: HashMap::new(),
        }
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn authenticated_count(&self) -> usize {
        self.connections.values().filter(|c| c.authenticated).count()
    }

    /// An outbound connection we dialed is up: open with `connect_req`.
    pub fn on_connected(
        &mut self,
        conn: ConnectionId,
        remote_address: &str,
    ) -> Result<Vec<EngineAction>, VeilProtocolError> {
        debug!(%conn, remote_address, "outbound connection established");
        let connection = self
            .connections
            .entry(conn)
            .or_insert_with(|| Connection::new(conn, remote_address.to_string(), true));
        let frame = frame_packet(
            connection,
            &Packet::ConnectReq {
                version: self.config.version.clone(),
                release_name: self.config.release_name.clone(),
                bind_port: self.config.bind_port,
            },
        )?;
        Ok(vec![EngineAction::Send { conn, frame }])
    }

    /// An inbound connection was accepted: wait for its `connect_req`.
    pub fn on_accepted(&mut self, conn: ConnectionId, remote_address: &str) {
        debug!(%conn, remote_address, "inbound connection accepted");
        self.connections
            .insert(conn, Connection::new(conn, remote_address.to_string(), false));
    }

    /// A connection went away: drop its state and any peer bound to it.
    pub fn on_closed(&mut self, conn: ConnectionId) {
        if self.connections.remove(&conn).is_some() {
            debug!(%conn, "connection closed");
        }
        if let Some(peer) = self.registries.peers.remove_by_conn(conn) {
            info!(%conn, address = %peer.address, port = peer.port, "peer disconnected");
        }
    }

    /// Feed raw bytes read from a connection through frame reassembly and
    /// the packet handlers.
    pub fn on_data(
        &mut self,
        conn: ConnectionId,
        data: &[u8],
    ) -> Result<Vec<EngineAction>, VeilProtocolError> {
        self.connections
            .get_mut(&conn)
            .ok_or(VeilProtocolError::UnknownConnection(conn))?
            .rx_buf
            .extend_from_slice(data);

        let mut actions = Vec::new();
        loop {
            // Re-fetch each pass: handle_frame borrows self and may have
            // removed the connection.
            let Some(connection) = self.connections.get_mut(&conn) else {
                break;
            };
            let payload = match take_frame(connection) {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    warn!(%conn, error = %e, "dropping connection: bad frame");
                    actions.push(EngineAction::Close { conn });
                    self.connections.remove(&conn);
                    return Ok(actions);
                }
            };
            let closed = self.handle_frame(conn, &payload, &mut actions)?;
            if closed {
                self.connections.remove(&conn);
                return Ok(actions);
            }
        }
        Ok(actions)
    }

    /// Decode and dispatch every packet in one frame. Returns true when
    /// the connection was closed by a handler.
    fn handle_frame(
        &mut self,
        conn: ConnectionId,
        payload: &[u8],
        actions: &mut Vec<EngineAction>,
    ) -> Result<bool, VeilProtocolError> {
        let mut reader = ByteReader::new(payload);
        while !reader.is_empty() {
            let packet = match Packet::decode(&mut reader) {
                Ok(packet) => packet,
                Err(e) => {
                    // The frame boundary is intact, so drop just this
                    // frame's remainder and keep the connection.
                    warn!(%conn, error = %e, "undecodable packet, discarding rest of frame");
                    return Ok(false);
                }
            };
            trace!(%conn, packet = packet.packet_type().as_str(), "packet received");
            let before = actions.len();
            self.handle_packet(conn, packet, actions)?;
            if actions[before..]
                .iter()
                .any(|action| matches!(action, EngineAction::Close { conn: c } if *c == conn))
            {
                return Ok(true);
            }
            if !self.connections.contains_key(&conn) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn handle_packet(
        &mut self,
        conn: ConnectionId,
        packet: Packet,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), VeilProtocolError> {
        match packet {
            Packet::ConnectReq {
                version,
                release_name,
                bind_port,
            } => self.on_connect_req(conn, &version, &release_name, bind_port, actions),
            Packet::ConnectResp { bind_port } => self.on_connect_resp(conn, bind_port, actions),
            Packet::KeypairReq {
                public_key,
                secret_key,
                nonce,
            } => self.on_keypair_req(conn, public_key, secret_key, nonce, actions),
            Packet::KeypairResp {
                public_key,
                secret_key,
            } => self.on_keypair_resp(conn, public_key, secret_key, actions),
            Packet::PeerlistReq => self.on_peerlist_req(conn, actions),
            Packet::PeerlistResp { peers } => self.on_peerlist_resp(conn, peers, actions),
            Packet::RelayMsg {
                signature,
                ciphertext,
                timestamp,
                ..
            } => self.on_relaymsg(conn, signature, ciphertext, timestamp, actions),
        }
    }

    fn on_connect_req(
        &mut self,
        conn: ConnectionId,
        version: &str,
        release_name: &str,
        bind_port: u32,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), VeilProtocolError> {
        let connection = self
            .connections
            .get_mut(&conn)
            .ok_or(VeilProtocolError::UnknownConnection(conn))?;
        if connection.outbound || connection.got_connect {
            warn!(%conn, "unexpected connect_req, ignoring");
            return Ok(());
        }
        if version != self.config.version || release_name != self.config.release_name {
            info!(
                %conn,
                version,
                release_name,
                "rejecting peer: version mismatch"
            );
            actions.push(EngineAction::Close { conn });
            return Ok(());
        }
        let remote_address = connection.remote_address.clone();
        match self
            .registries
            .peers
            .add(&remote_address, bind_port, Some(conn))
        {
            Ok(_) => {}
            Err(e @ RegistryError::Full { .. }) => return Err(e.into()),
            Err(e) => {
                info!(%conn, address = %remote_address, error = %e, "rejecting peer");
                actions.push(EngineAction::Close { conn });
                return Ok(());
            }
        }
        connection.got_connect = true;
        let frame = frame_packet(
            connection,
            &Packet::ConnectResp {
                bind_port: self.config.bind_port,
            },
        )?;
        info!(%conn, address = %remote_address, port = bind_port, "peer connected");
        actions.push(EngineAction::Send { conn, frame });
        Ok(())
    }

    fn on_connect_resp(
        &mut self,
        conn: ConnectionId,
        bind_port: u32,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), VeilProtocolError> {
        let connection = self
            .connections
            .get_mut(&conn)
            .ok_or(VeilProtocolError::UnknownConnection(conn))?;
        if !connection.outbound || connection.session.is_some() {
            warn!(%conn, "unexpected connect_resp, ignoring");
            return Ok(());
        }
        let remote_address = connection.remote_address.clone();
        if !self
            .registries
            .peers
            .attach_conn(&remote_address, bind_port, conn)
        {
            match self
                .registries
                .peers
                .add(&remote_address, bind_port, Some(conn))
            {
                Ok(_) => {}
                Err(e @ RegistryError::Full { .. }) => return Err(e.into()),
                Err(e) => {
                    info!(%conn, address = %remote_address, error = %e, "rejecting peer");
                    actions.push(EngineAction::Close { conn });
                    return Ok(());
                }
            }
        }

        // Offer a fresh session keypair and link nonce.
        let mut session = KeypairInfo::generate();
        session.nonce = crypto::generate_nonce();
        let frame = frame_packet(
            connection,
            &Packet::KeypairReq {
                public_key: session.public,
                secret_key: session.secret,
                nonce: session.nonce,
            },
        )?;
        connection.session = Some(session);
        info!(%conn, address = %remote_address, port = bind_port, "peer connected");
        actions.push(EngineAction::Send { conn, frame });
        Ok(())
    }

    fn on_keypair_req(
        &mut self,
        conn: ConnectionId,
        public_key: [u8; 32],
        secret_key: [u8; 32],
        nonce: [u8; NONCE_LEN],
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), VeilProtocolError> {
        let connection = self
            .connections
            .get_mut(&conn)
            .ok_or(VeilProtocolError::UnknownConnection(conn))?;
        if connection.outbound || !connection.got_connect || connection.authenticated {
            warn!(%conn, "unexpected keypair_req, ignoring");
            return Ok(());
        }
        let mut session = KeypairInfo::generate();
        session.their_public = public_key;
        session.their_secret = secret_key;
        session.nonce = nonce;

        // The response must leave in cleartext, so build the frame before
        // switching the link to sealed framing.
        let frame = frame_packet(
            connection,
            &Packet::KeypairResp {
                public_key: session.public,
                secret_key: session.secret,
            },
        )?;
        connection.session = Some(session);
        connection.authenticated = true;
        connection.encrypted = true;
        info!(%conn, "session established");
        actions.push(EngineAction::Send { conn, frame });
        Ok(())
    }

    fn on_keypair_resp(
        &mut self,
        conn: ConnectionId,
        public_key: [u8; 32],
        secret_key: [u8; 32],
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), VeilProtocolError> {
        let connection = self
            .connections
            .get_mut(&conn)
            .ok_or(VeilProtocolError::UnknownConnection(conn))?;
        if !connection.outbound || connection.authenticated {
            warn!(%conn, "unexpected keypair_resp, ignoring");
            return Ok(());
        }
        let Some(session) = connection.session.as_mut() else {
            warn!(%conn, "keypair_resp before keypair_req, ignoring");
            return Ok(());
        };
        session.their_public = public_key;
        session.their_secret = secret_key;
        connection.authenticated = true;
        connection.encrypted = true;
        info!(%conn, "session established");

        // First thing over the sealed link: ask for the peer's peer list.
        let frame = frame_packet(connection, &Packet::PeerlistReq)?;
        actions.push(EngineAction::Send { conn, frame });
        Ok(())
    }

    fn on_peerlist_req(
        &mut self,
        conn: ConnectionId,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), VeilProtocolError> {
        let peers = self.registries.peers.addrs();
        let connection = self
            .connections
            .get_mut(&conn)
            .ok_or(VeilProtocolError::UnknownConnection(conn))?;
        if !connection.authenticated {
            warn!(%conn, "peerlist_req before authentication, ignoring");
            return Ok(());
        }
        let frame = frame_packet(connection, &Packet::PeerlistResp { peers })?;
        actions.push(EngineAction::Send { conn, frame });
        Ok(())
    }

    fn on_peerlist_resp(
        &mut self,
        conn: ConnectionId,
        peers: Vec<PeerAddr>,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), VeilProtocolError> {
        let connection = self
            .connections
            .get(&conn)
            .ok_or(VeilProtocolError::UnknownConnection(conn))?;
        if !connection.authenticated {
            warn!(%conn, "peerlist_resp before authentication, ignoring");
            return Ok(());
        }
        for peer in peers {
            if self.registries.peers.has_endpoint(&peer.address, peer.port) {
                continue;
            }
            match self.registries.peers.add(&peer.address, peer.port, None) {
                Ok(_) => {
                    debug!(address = %peer.address, port = peer.port, "learned peer, dialing");
                    actions.push(EngineAction::ConnectTo {
                        address: peer.address,
                        port: peer.port,
                    });
                }
                Err(e @ RegistryError::Full { .. }) => return Err(e.into()),
                Err(e) => {
                    trace!(address = %peer.address, error = %e, "skipping advertised peer");
                }
            }
        }
        Ok(())
    }

    fn on_relaymsg(
        &mut self,
        conn: ConnectionId,
        signature: Vec<u8>,
        ciphertext: Vec<u8>,
        timestamp: i64,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), VeilProtocolError> {
        {
            let connection = self
                .connections
                .get(&conn)
                .ok_or(VeilProtocolError::UnknownConnection(conn))?;
            if !connection.authenticated {
                warn!(%conn, "relaymsg before authentication, ignoring");
                return Ok(());
            }
        }
        if pending::has_expired(timestamp, now_secs()) {
            trace!(%conn, timestamp, "dropping expired relay message");
            return Ok(());
        }

        // Probe the signature against our identities; a hit means the
        // message was addressed to us. Dedup gates delivery only: the
        // checksum is over the decrypted content, so only a holder of the
        // identity can dedup at all, and forwarding below is unaffected.
        if let Some((entry, _message)) = self.registries.keypairs.find_signer(&signature) {
            match crypto::box_open_easy(
                &ciphertext,
                &entry.info.nonce,
                &entry.info.public,
                &entry.info.secret,
            ) {
                Ok(payload) => {
                    let sum = crypto::checksum(&payload);
                    match self.registries.pending.add(sum, payload.len(), timestamp) {
                        Ok(_) => {
                            let transport = self.registries.transports.ensure(entry.id)?;
                            debug!(
                                keypair = entry.id,
                                size = payload.len(),
                                "relay message delivered"
                            );
                            actions.push(EngineAction::Deliver {
                                transport: transport.id,
                                payload,
                            });
                        }
                        Err(RegistryError::Duplicate { .. }) => {
                            trace!(%conn, "duplicate relay message, not re-delivering");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => {
                    warn!(keypair = entry.id, error = %e, "signature matched but unsealing failed");
                }
            }
        }

        // Forward the original material untouched, whether or not it was
        // for us, so relay behavior never betrays local delivery. The
        // expiry window is what eventually stops the flood.
        let packet = Packet::RelayMsg {
            data_size: (ciphertext.len() - crypto::BOX_OVERHEAD) as u16,
            signature,
            ciphertext,
            timestamp,
        };
        self.broadcast(&packet, Some(conn), actions)?;
        Ok(())
    }

    /// Sign and seal `payload` for the holder of `recipient`, then flood
    /// it to every authenticated peer. A stale `timestamp` (outside the
    /// expiry window, either direction) makes this a no-op.
    pub fn relay_send(
        &mut self,
        recipient: &KeypairInfo,
        payload: &[u8],
        timestamp: i64,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), VeilProtocolError> {
        if pending::has_expired(timestamp, now_secs()) {
            debug!(timestamp, "not publishing stale relay message");
            return Ok(());
        }
        let data_size = u16::try_from(payload.len())
            .map_err(|_| crate::wire::WireError::Oversize { len: payload.len() })?;
        let signature = crypto::sign(payload, &recipient.secret);
        let ciphertext = crypto::box_easy(
            payload,
            &recipient.nonce,
            &recipient.public,
            &recipient.secret,
        )?;

        // Remember our own content checksum so the flood echo is not
        // delivered back to us if we hold the recipient identity too.
        let sum = crypto::checksum(payload);
        match self.registries.pending.add(sum, payload.len(), timestamp) {
            Ok(_) | Err(RegistryError::Duplicate { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let packet = Packet::RelayMsg {
            data_size,
            signature,
            ciphertext,
            timestamp,
        };
        self.broadcast(&packet, None, actions)
    }

    /// Ask every authenticated peer for its current peer list.
    pub fn resync_peerlists(
        &mut self,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), VeilProtocolError> {
        self.broadcast(&Packet::PeerlistReq, None, actions)
    }

    fn broadcast(
        &mut self,
        packet: &Packet,
        except: Option<ConnectionId>,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), VeilProtocolError> {
        for connection in self.connections.values_mut() {
            if !connection.authenticated || Some(connection.id) == except {
                continue;
            }
            let frame = frame_packet(connection, packet)?;
            actions.push(EngineAction::Send {
                conn: connection.id,
                frame,
            });
        }
        Ok(())
    }
}

/// Wrap an encoded packet in the connection's outer frame.
///
/// Cleartext links carry `u16 size` + payload. Sealed links carry
/// `u16 sealed_size` + `u16 raw_size` + sealed payload.
fn frame_packet(connection: &Connection, packet: &Packet) -> Result<Vec<u8>, VeilProtocolError> {
    let encoded = packet.encode()?;
    let raw_size = u16::try_from(encoded.len())
        .map_err(|_| crate::wire::WireError::Oversize { len: encoded.len() })?;
    let mut w = ByteWriter::with_capacity(encoded.len() + 4 + crypto::BOX_OVERHEAD);
    if connection.encrypted {
        let session = connection
            .session
            .as_ref()
            .ok_or(VeilProtocolError::MissingSession)?;
        let sealed = crypto::box_easy(
            &encoded,
            &session.nonce,
            &session.public,
            &session.their_secret,
        )?;
        let sealed_size = u16::try_from(sealed.len())
            .map_err(|_| crate::wire::WireError::Oversize { len: sealed.len() })?;
        w.put_u16(sealed_size);
        w.put_u16(raw_size);
        w.put_raw(&sealed);
    } else {
        w.put_u16(raw_size);
        w.put_raw(&encoded);
    }
    Ok(w.into_vec())
}

/// Pull one complete frame out of the connection's receive buffer.
/// Returns `Ok(None)` when more bytes are needed.
fn take_frame(connection: &mut Connection) -> Result<Option<Vec<u8>>, VeilProtocolError> {
    let buf = &connection.rx_buf;
    if buf.len() < 2 {
        return Ok(None);
    }
    let size = u16::from_le_bytes([buf[0], buf[1]]) as usize;

    if connection.encrypted {
        if buf.len() < 4 {
            return Ok(None);
        }
        let raw_size = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + size {
            return Ok(None);
        }
        let session = connection
            .session
            .as_ref()
            .ok_or(VeilProtocolError::MissingSession)?;
        let payload = crypto::box_open_easy(
            &connection.rx_buf[4..4 + size],
            &session.nonce,
            &session.public,
            &session.their_secret,
        )?;
        if payload.len() != raw_size {
            return Err(VeilProtocolError::Crypto(format!(
                "frame size mismatch: header said {raw_size}, unsealed {}",
                payload.len()
            )));
        }
        connection.rx_buf.drain(..4 + size);
        Ok(Some(payload))
    } else {
        if buf.len() < 2 + size {
            return Ok(None);
        }
        let payload = connection.rx_buf[2..2 + size].to_vec();
        connection.rx_buf.drain(..2 + size);
        Ok(Some(payload))
    }
}
