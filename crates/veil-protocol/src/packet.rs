//! Handshake and relay packet definitions.
//!
//! Every packet starts with a one-byte type tag followed by the fields
//! in declaration order. Payload framing (length prefix and optional
//! link encryption) lives in the engine, not here.

use crate::crypto::{BOX_OVERHEAD, KEY_LEN, NONCE_LEN, SIGN_OVERHEAD};
use crate::wire::{ByteReader, ByteWriter, WireError};

/// Wire tag for each packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    ConnectReq = 0,
    ConnectResp = 1,
    KeypairReq = 2,
    KeypairResp = 3,
    PeerlistReq = 4,
    PeerlistResp = 5,
    RelayMsg = 6,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ConnectReq),
            1 => Some(Self::ConnectResp),
            2 => Some(Self::KeypairReq),
            3 => Some(Self::KeypairResp),
            4 => Some(Self::PeerlistReq),
            5 => Some(Self::PeerlistResp),
            6 => Some(Self::RelayMsg),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectReq => "connect_req",
            Self::ConnectResp => "connect_resp",
            Self::KeypairReq => "keypair_req",
            Self::KeypairResp => "keypair_resp",
            Self::PeerlistReq => "peerlist_req",
            Self::PeerlistResp => "peerlist_resp",
            Self::RelayMsg => "relaymsg",
        }
    }
}

/// A peer's advertised listen endpoint, as carried in peerlist packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub address: String,
    pub port: u32,
}

/// Decoded protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Initiator's opening packet: software version, release name and
    /// the port its own listener is bound to.
    ConnectReq {
        version: String,
        release_name: String,
        bind_port: u32,
    },
    /// Acceptor's answer carrying its own listen port.
    ConnectResp { bind_port: u32 },
    /// Initiator's session key offer: both halves plus the link nonce.
    KeypairReq {
        public_key: [u8; KEY_LEN],
        secret_key: [u8; KEY_LEN],
        nonce: [u8; NONCE_LEN],
    },
    /// Acceptor's session key, completing the exchange.
    KeypairResp {
        public_key: [u8; KEY_LEN],
        secret_key: [u8; KEY_LEN],
    },
    PeerlistReq,
    PeerlistResp { peers: Vec<PeerAddr> },
    /// End-to-end relay payload: detached signature material and
    /// sealed ciphertext over the same plaintext, plus the origin
    /// timestamp used for expiry and dedup.
    RelayMsg {
        data_size: u16,
        signature: Vec<u8>,
        ciphertext: Vec<u8>,
        timestamp: i64,
    },
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::ConnectReq { .. } => PacketType::ConnectReq,
            Self::ConnectResp { .. } => PacketType::ConnectResp,
            Self::KeypairReq { .. } => PacketType::KeypairReq,
            Self::KeypairResp { .. } => PacketType::KeypairResp,
            Self::PeerlistReq => PacketType::PeerlistReq,
            Self::PeerlistResp { .. } => PacketType::PeerlistResp,
            Self::RelayMsg { .. } => PacketType::RelayMsg,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = ByteWriter::new();
        w.put_u8(self.packet_type() as u8);
        match self {
            Self::ConnectReq {
                version,
                release_name,
                bind_port,
            } => {
                w.put_string(version)?;
                w.put_string(release_name)?;
                w.put_u32(*bind_port);
            }
            Self::ConnectResp { bind_port } => {
                w.put_u32(*bind_port);
            }
            Self::KeypairReq {
                public_key,
                secret_key,
                nonce,
            } => {
                w.put_bytes(public_key)?;
                w.put_bytes(secret_key)?;
                w.put_bytes(nonce)?;
            }
            Self::KeypairResp {
                public_key,
                secret_key,
            } => {
                w.put_bytes(public_key)?;
                w.put_bytes(secret_key)?;
            }
            Self::PeerlistReq => {}
            Self::PeerlistResp { peers } => {
                let count =
                    u16::try_from(peers.len()).map_err(|_| WireError::Oversize { len: peers.len() })?;
                w.put_u16(count);
                for peer in peers {
                    w.put_string(&peer.address)?;
                    w.put_u32(peer.port);
                }
            }
            Self::RelayMsg {
                data_size,
                signature,
                ciphertext,
                timestamp,
            } => {
                w.put_u16(*data_size);
                w.put_raw(signature);
                w.put_u16(*data_size);
                w.put_raw(ciphertext);
                w.put_i32(*timestamp as i32);
            }
        }
        Ok(w.into_vec())
    }

    /// Decode one packet from the reader, leaving the cursor right after
    /// it so callers can loop over back-to-back packets.
    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let tag = r.get_u8()?;
        let packet_type = PacketType::from_u8(tag).ok_or(WireError::UnknownTag { tag })?;
        match packet_type {
            PacketType::ConnectReq => Ok(Self::ConnectReq {
                version: r.get_string()?,
                release_name: r.get_string()?,
                bind_port: r.get_u32()?,
            }),
            PacketType::ConnectResp => Ok(Self::ConnectResp {
                bind_port: r.get_u32()?,
            }),
            PacketType::KeypairReq => Ok(Self::KeypairReq {
                public_key: r.get_bytes_exact()?,
                secret_key: r.get_bytes_exact()?,
                nonce: r.get_bytes_exact()?,
            }),
            PacketType::KeypairResp => Ok(Self::KeypairResp {
                public_key: r.get_bytes_exact()?,
                secret_key: r.get_bytes_exact()?,
            }),
            PacketType::PeerlistReq => Ok(Self::PeerlistReq),
            PacketType::PeerlistResp => {
                let count = r.get_u16()? as usize;
                let mut peers = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    peers.push(PeerAddr {
                        address: r.get_string()?,
                        port: r.get_u32()?,
                    });
                }
                Ok(Self::PeerlistResp { peers })
            }
            PacketType::RelayMsg => {
                let data_size = r.get_u16()?;
                let signature = r.get_raw(data_size as usize + SIGN_OVERHEAD)?.to_vec();
                let data_size2 = r.get_u16()?;
                if data_size2 != data_size {
                    return Err(WireError::BadLength {
                        expected: data_size as usize,
                        got: data_size2 as usize,
                    });
                }
                let ciphertext = r.get_raw(data_size as usize + BOX_OVERHEAD)?.to_vec();
                let timestamp = i64::from(r.get_i32()?);
                Ok(Self::RelayMsg {
                    data_size,
                    signature,
                    ciphertext,
                    timestamp,
                })
            }
        }
    }

    pub fn decode_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);
        Self::decode(&mut r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let encoded = packet.encode().unwrap();
        let decoded = Packet::decode_bytes(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn connect_req_roundtrip() {
        roundtrip(Packet::ConnectReq {
            version: "0.1.0".into(),
            release_name: "obsidian".into(),
            bind_port: 5000,
        });
    }

    #[test]
    fn connect_req_tag_is_zero() {
        let encoded = Packet::ConnectReq {
            version: "0.1.0".into(),
            release_name: "obsidian".into(),
            bind_port: 5000,
        }
        .encode()
        .unwrap();
        assert_eq!(encoded[0], 0);
    }

    #[test]
    fn keypair_req_roundtrip() {
        roundtrip(Packet::KeypairReq {
            public_key: [1u8; KEY_LEN],
            secret_key: [2u8; KEY_LEN],
            nonce: [3u8; NONCE_LEN],
        });
        roundtrip(Packet::KeypairResp {
            public_key: [4u8; KEY_LEN],
            secret_key: [5u8; KEY_LEN],
        });
    }

    #[test]
    fn peerlist_roundtrip() {
        roundtrip(Packet::PeerlistReq);
        roundtrip(Packet::PeerlistResp { peers: vec![] });
        roundtrip(Packet::PeerlistResp {
            peers: vec![
                PeerAddr {
                    address: "10.0.0.1".into(),
                    port: 5000,
                },
                PeerAddr {
                    address: "example.net".into(),
                    port: 6001,
                },
            ],
        });
    }

    #[test]
    fn relaymsg_roundtrip() {
        let data_size = 11u16;
        roundtrip(Packet::RelayMsg {
            data_size,
            signature: vec![7u8; data_size as usize + SIGN_OVERHEAD],
            ciphertext: vec![8u8; data_size as usize + BOX_OVERHEAD],
            timestamp: 1_700_000_000,
        });
    }

    #[test]
    fn relaymsg_layout_matches_reference() {
        // u16 size, size+64 sig bytes, u16 size again, size+16 ct bytes,
        // i32 timestamp.
        let packet = Packet::RelayMsg {
            data_size: 4,
            signature: vec![0xAA; 4 + SIGN_OVERHEAD],
            ciphertext: vec![0xBB; 4 + BOX_OVERHEAD],
            timestamp: 0x0102_0304,
        };
        let encoded = packet.encode().unwrap();
        assert_eq!(encoded[0], 6);
        assert_eq!(&encoded[1..3], &[4, 0]);
        assert_eq!(&encoded[3..3 + 68], &[0xAA; 68][..]);
        assert_eq!(&encoded[71..73], &[4, 0]);
        assert_eq!(&encoded[73..73 + 20], &[0xBB; 20][..]);
        assert_eq!(&encoded[93..97], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(encoded.len(), 97);
    }

    #[test]
    fn relaymsg_size_mismatch_rejected() {
        let packet = Packet::RelayMsg {
            data_size: 4,
            signature: vec![0xAA; 4 + SIGN_OVERHEAD],
            ciphertext: vec![0xBB; 4 + BOX_OVERHEAD],
            timestamp: 42,
        };
        let mut encoded = packet.encode().unwrap();
        // Corrupt the second size field.
        encoded[71] = 9;
        assert!(Packet::decode_bytes(&encoded).is_err());
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(Packet::decode_bytes(&[200]).is_err());
    }

    #[test]
    fn truncated_packet_rejected() {
        let encoded = Packet::ConnectReq {
            version: "0.1.0".into(),
            release_name: "obsidian".into(),
            bind_port: 5000,
        }
        .encode()
        .unwrap();
        assert!(Packet::decode_bytes(&encoded[..encoded.len() - 2]).is_err());
    }

    #[test]
    fn back_to_back_packets_decode_in_order() {
        let mut buf = Packet::PeerlistReq.encode().unwrap();
        buf.extend(Packet::ConnectResp { bind_port: 7 }.encode().unwrap());

        let mut r = ByteReader::new(&buf);
        assert_eq!(Packet::decode(&mut r).unwrap(), Packet::PeerlistReq);
        assert_eq!(
            Packet::decode(&mut r).unwrap(),
            Packet::ConnectResp { bind_port: 7 }
        );
        assert!(r.is_empty());
    }
}
