use std::fmt;

/// Protocol version advertised in `CONNECT_REQ` and checked on receipt.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Release name advertised alongside the version. Both must match for a
/// handshake to be accepted.
pub const RELEASE_NAME: &str = "obsidian";

/// Default listen address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Loopback address, treated as "local" by the duplicate-peer exception.
pub const LOCAL_ADDRESS: &str = "127.0.0.1";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 5000;

/// Default TCP accept backlog.
pub const DEFAULT_BACKLOG: u32 = 10_000;

/// A relay message older than this (or from the future) is expired and is
/// neither published, delivered, nor re-flooded.
pub const MSG_EXPIRY_SECS: i64 = 60;

/// Interval between `PEERLIST_REQ` resyncs to authenticated peers.
pub const PEERLIST_RESYNC_SECS: u64 = 15;

/// Capacity bound for every registry. Exceeding it is a loud error, never
/// a silent overwrite.
pub const REGISTRY_CAPACITY: usize = 100_000;

/// Identifier for a live transport stream. Allocated by the transport
/// layer; meaningless once the stream closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Current Unix time in whole seconds.
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Whether `address` is a local bind/loopback address.
pub fn is_local_address(address: &str) -> bool {
    address == DEFAULT_BIND_ADDRESS || address == LOCAL_ADDRESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_addresses() {
        assert!(is_local_address("127.0.0.1"));
        assert!(is_local_address("0.0.0.0"));
        assert!(!is_local_address("10.0.0.1"));
        assert!(!is_local_address("203.0.113.7"));
    }

    #[test]
    fn connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn#7");
    }
}
