//! Transport-agnostic duplex byte streams

use tokio::io::{AsyncRead, AsyncWrite};

/// Any owned duplex byte stream the manager can sniff, park and relay
pub trait DuplexIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DuplexIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn DuplexIo>;
