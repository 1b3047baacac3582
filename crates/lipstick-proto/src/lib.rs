//! Lipstick Protocol Definitions
//!
//! Messages exchanged between the broker and tunnel agents over the control
//! link, plus the HTTP paths agents use to reach the broker.

pub mod messages;

pub use messages::*;

/// Maximum encoded control message size (64KB)
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 64 * 1024;

/// Path of the control-link WebSocket upgrade
pub const CONTROL_PATH: &str = "/ws";

/// Path an agent dials to fulfil a pairing request for `token`
pub fn proxy_stream_path(token: &Token) -> String {
    format!("{}/{}", CONTROL_PATH, token)
}
