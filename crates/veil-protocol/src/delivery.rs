//! Inner message protocol for delivered relay payloads.
//!
//! Payloads that survive the relay layer (signature matched, decryption
//! succeeded) are handed here per transport slot. The payload is itself
//! a sequence of tagged messages; handlers register per tag, and
//! unhandled tags are logged and dropped without disturbing the rest of
//! the payload's framing.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::wire::ByteReader;
use crate::VeilProtocolError;

pub type MessageHandler = Box<dyn FnMut(u64, &[u8]) + Send>;

#[derive(Default)]
pub struct DeliveryDispatcher {
    handlers: HashMap<u8, MessageHandler>,
}

impl DeliveryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one message tag, replacing any previous one.
    pub fn register(&mut self, tag: u8, handler: impl FnMut(u64, &[u8]) + Send + 'static) {
        self.handlers.insert(tag, Box::new(handler));
    }

    /// Walk every tagged message in a delivered payload: `u8` tag,
    /// `u16`-prefixed body, repeated to the end of the payload.
    pub fn handle_incoming(
        &mut self,
        transport: u64,
        payload: &[u8],
    ) -> Result<(), VeilProtocolError> {
        let mut r = ByteReader::new(payload);
        while !r.is_empty() {
            let tag = r.get_u8()?;
            let body = r.get_bytes()?;
            match self.handlers.get_mut(&tag) {
                Some(handler) => {
                    debug!(transport, tag, size = body.len(), "dispatching message");
                    handler(transport, body);
                }
                None => {
                    warn!(transport, tag, "no handler for message tag, dropping");
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeliveryDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryDispatcher")
            .field("tags", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
