//! Peer list persistence.
//!
//! Same byte format as the `peerlist_resp` body: `u16` count, then per
//! peer a `u16`-prefixed address string and a `u32` port. Loaded at
//! startup, saved at shutdown; a missing file is an empty list, a
//! corrupt file is an error the caller decides what to do with.

use std::path::Path;

use anyhow::Context;
use tracing::{debug, info};
use veil_protocol::packet::PeerAddr;
use veil_protocol::peers::{decode_peerlist, encode_peerlist};

pub fn load(path: &Path) -> anyhow::Result<Vec<PeerAddr>> {
    if !path.exists() {
        debug!(path = %path.display(), "no peer file, starting empty");
        return Ok(Vec::new());
    }
    let data = std::fs::read(path)
        .with_context(|| format!("reading peer file {}", path.display()))?;
    let peers = decode_peerlist(&data)
        .with_context(|| format!("parsing peer file {}", path.display()))?;
    info!(path = %path.display(), count = peers.len(), "peer file loaded");
    Ok(peers)
}

pub fn save(path: &Path, peers: &[PeerAddr]) -> anyhow::Result<()> {
    let data = encode_peerlist(peers).context("encoding peer list")?;
    std::fs::write(path, data)
        .with_context(|| format!("writing peer file {}", path.display()))?;
    info!(path = %path.display(), count = peers.len(), "peer file saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("veil-peerfile-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("peers.dat");

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
        save(&path, &peers).unwrap();
        assert_eq!(load(&path).unwrap(), peers);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_empty() {
        let path = Path::new("/nonexistent/veil-peers.dat");
        assert!(load(path).unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!("veil-peerfile-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("peers.dat");
        // Count says one entry, body is missing.
        std::fs::write(&path, [1u8, 0]).unwrap();
        assert!(load(&path).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
