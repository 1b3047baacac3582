//! Control link message types

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// One-time correlation token binding a pending inbound connection to the
/// proxy stream that will serve it
pub type Token = Uuid;

/// Codec errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Control message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Failed to encode control message: {0}")]
    Encode(String),

    #[error("Failed to decode control message: {0}")]
    Decode(String),
}

/// Messages carried as binary WebSocket frames on a control link
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// Broker accepted the control link for `domain`
    Registered { domain: String },
    /// Broker refused the control link; the link is closed right after
    Rejected { reason: String },
    /// Pairing request: the agent must dial `/ws/{token}` to serve one inbound connection
    OpenStream { token: Token },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let bytes = bincode::serialize(self).map_err(|e| ProtoError::Encode(e.to_string()))?;
        if bytes.len() > crate::MAX_CONTROL_MESSAGE_SIZE {
            return Err(ProtoError::MessageTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        if data.len() > crate::MAX_CONTROL_MESSAGE_SIZE {
            return Err(ProtoError::MessageTooLarge(data.len()));
        }
        bincode::deserialize(data).map_err(|e| ProtoError::Decode(e.to_string()))
    }
}
