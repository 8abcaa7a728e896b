/// Protocol-level errors for Veil.
///
/// Wire and registry errors are defined next to their modules and wrapped
/// here; handlers either recover (log and drop the offending packet) or
/// propagate with `?` when the condition is fatal at the call site.
use crate::registry::RegistryError;
use crate::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum VeilProtocolError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("unknown connection: {0}")]
    UnknownConnection(crate::types::ConnectionId),

    #[error("connection has no session keypair")]
    MissingSession,

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_crypto() {
        let err = VeilProtocolError::Crypto("open failed".into());
        assert_eq!(err.to_string(), "crypto error: open failed");
    }

    #[test]
    fn wire_error_wraps() {
        let err: VeilProtocolError = WireError::Truncated {
            needed: 4,
            remaining: 1,
        }
        .into();
        assert!(err.to_string().contains("wire error"));
    }
}
