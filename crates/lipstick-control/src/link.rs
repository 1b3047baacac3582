//! Control link handle
//!
//! A `ControlLink` is the broker-side handle of an agent's persistent control
//! connection. The transport task that owns the actual socket keeps the
//! receiving end of the message channel and watches the close signal.

use chrono::{DateTime, Utc};
use lipstick_proto::{ControlMessage, Token};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Control link {0} is closed")]
    Closed(Uuid),
}

/// Snapshot of a live control link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub id: Uuid,
    pub domain: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ControlLink {
    id: Uuid,
    domain: String,
    registered_at: DateTime<Utc>,
    tx: mpsc::Sender<ControlMessage>,
    closed: CancellationToken,
}

impl ControlLink {
    /// Create a link for `domain` and the receiver its transport task drains
    pub fn new(domain: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let link = Self {
            id: Uuid::new_v4(),
            domain: domain.into(),
            registered_at: Utc::now(),
            tx,
            closed: CancellationToken::new(),
        };
        (link, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            id: self.id,
            domain: self.domain.clone(),
            registered_at: self.registered_at,
        }
    }

    /// Queue a message for the agent
    pub async fn send(&self, message: ControlMessage) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed(self.id));
        }
        self.tx
            .send(message)
            .await
            .map_err(|_| LinkError::Closed(self.id))
    }

    /// Ask the agent to open a proxy stream for `token`
    pub async fn request_stream(&self, token: Token) -> Result<(), LinkError> {
        self.send(ControlMessage::OpenStream { token }).await
    }

    /// Signal the transport task to close the connection
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once `close` has been called on any clone of this link
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}
