//! Correlation table: one-time token -> inbound connection awaiting its proxy stream

use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lipstick_proto::Token;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::stream::BoxedStream;

/// How long a retired token is remembered for error reporting
const RETIRED_TTL: Duration = Duration::from_secs(60);

/// Size at which stale retired tokens are pruned
const RETIRED_CAPACITY: usize = 4096;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("Pairing expired for token {0}")]
    PairingExpired(Token),

    #[error("Pairing already claimed for token {0}")]
    PairingAlreadyClaimed(Token),

    #[error("Unknown pairing token {0}")]
    UnknownToken(Token),
}

/// Inbound connection whose domain is known but which has no proxy stream yet
pub struct PendingConnection {
    /// Assigned by [`CorrelationTable::issue_token`]
    pub token: Token,
    pub domain: String,
    /// Control link the pairing request goes to
    pub link_id: Uuid,
    pub stream: BoxedStream,
    /// Bytes consumed while sniffing; replayed to the proxy stream first
    pub prefix: Bytes,
    pub peer_addr: Option<SocketAddr>,
    pub arrived_at: Instant,
}

impl PendingConnection {
    pub fn new(
        domain: impl Into<String>,
        link_id: Uuid,
        stream: BoxedStream,
        prefix: Bytes,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            token: Uuid::nil(),
            domain: domain.into(),
            link_id,
            stream,
            prefix,
            peer_addr,
            arrived_at: Instant::now(),
        }
    }
}

impl fmt::Debug for PendingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConnection")
            .field("token", &self.token)
            .field("domain", &self.domain)
            .field("link_id", &self.link_id)
            .field("prefix_len", &self.prefix.len())
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retirement {
    Claimed,
    Expired,
}

struct Retired {
    reason: Retirement,
    at: Instant,
}

/// Table slot; the stream sits behind a mutex so the table stays `Sync`
/// for stream types that are only `Send`
struct Slot {
    domain: String,
    link_id: Uuid,
    connection: Mutex<PendingConnection>,
}

impl Slot {
    fn into_connection(self) -> PendingConnection {
        self.connection
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Concurrent table of pending connections keyed by one-time token
///
/// Removal is the only way out of the table, so exactly one of `claim` or
/// `expire` can ever obtain a given connection.
pub struct CorrelationTable {
    pending: DashMap<Token, Slot>,
    retired: DashMap<Token, Retired>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            retired: DashMap::new(),
        }
    }

    /// Store `connection` under a fresh token and return the token
    pub fn issue_token(&self, mut connection: PendingConnection) -> Token {
        loop {
            let token = Uuid::new_v4();
            if self.retired.contains_key(&token) {
                continue;
            }
            if let Entry::Vacant(entry) = self.pending.entry(token) {
                connection.token = token;
                debug!(
                    "Issued pairing token {} for {} (link {})",
                    token, connection.domain, connection.link_id
                );
                entry.insert(Slot {
                    domain: connection.domain.clone(),
                    link_id: connection.link_id,
                    connection: Mutex::new(connection),
                });
                return token;
            }
        }
    }

    /// Atomically take the connection waiting on `token`
    pub fn claim(&self, token: Token) -> Result<PendingConnection, CorrelationError> {
        if let Some((_, slot)) = self.pending.remove(&token) {
            self.retire(token, Retirement::Claimed);
            return Ok(slot.into_connection());
        }

        let reason = self.retired.get(&token).map(|retired| retired.reason);
        match reason {
            Some(Retirement::Claimed) => Err(CorrelationError::PairingAlreadyClaimed(token)),
            Some(Retirement::Expired) => Err(CorrelationError::PairingExpired(token)),
            None => Err(CorrelationError::UnknownToken(token)),
        }
    }

    /// Remove and close the connection waiting on `token`
    ///
    /// Returns false if the token was already claimed or expired.
    pub fn expire(&self, token: Token) -> bool {
        match self.pending.remove(&token) {
            Some((_, slot)) => {
                self.retire(token, Retirement::Expired);
                let connection = slot.into_connection();
                debug!(
                    "Expired pairing token {} for {} after {:?}",
                    token,
                    connection.domain,
                    connection.arrived_at.elapsed()
                );
                // Dropping the stream closes the socket
                drop(connection);
                true
            }
            None => false,
        }
    }

    /// Expire every connection of `domain` waiting on the link `link_id`
    pub fn expire_link(&self, domain: &str, link_id: Uuid) -> usize {
        let tokens: Vec<Token> = self
            .pending
            .iter()
            .filter(|entry| entry.domain == domain && entry.link_id == link_id)
            .map(|entry| *entry.key())
            .collect();

        tokens.into_iter().filter(|token| self.expire(*token)).count()
    }

    pub fn expire_all(&self) -> usize {
        let tokens: Vec<Token> = self.pending.iter().map(|entry| *entry.key()).collect();
        tokens.into_iter().filter(|token| self.expire(*token)).count()
    }

    pub fn count(&self) -> usize {
        self.pending.len()
    }

    fn retire(&self, token: Token, reason: Retirement) {
        if self.retired.len() >= RETIRED_CAPACITY {
            self.retired
                .retain(|_, retired| retired.at.elapsed() < RETIRED_TTL);
            if self.retired.len() >= RETIRED_CAPACITY {
                self.retired.clear();
            }
        }
        self.retired.insert(
            token,
            Retired {
                reason,
                at: Instant::now(),
            },
        );
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}
