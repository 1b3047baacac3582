//! Tunnel connection management
//!
//! Owns the live tunnel registry and the table of inbound connections waiting
//! for a proxy stream, and drives every inbound connection through
//! sniff, lookup, pairing and relay.
pub mod config;
pub mod correlation;
pub mod link;
pub mod manager;
pub mod registry;
pub mod relay;
pub mod stream;

pub use config::ManagerConfig;
pub use correlation::{CorrelationError, CorrelationTable, PendingConnection};
pub use link::{ControlLink, LinkError, LinkInfo};
pub use manager::{ManagerError, ManagerHandle, TunnelConnectionManager};
pub use registry::{RegistrationPolicy, RegistryError, TunnelRegistry};
pub use relay::{relay, RelayDirection, RelayError, RelayStats};
pub use stream::{BoxedStream, DuplexIo};
