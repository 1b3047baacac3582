//! Tunnel connection manager
//!
//! Fans in three bounded queues (raw inbound connections, control link
//! registrations and proxy stream arrivals) and drives each inbound
//! connection through `Accepted -> Sniffed -> AwaitingPair -> Paired ->
//! Relaying -> Closed`, or to `Rejected` / `Expired`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lipstick_proto::Token;
use lipstick_router::sniff;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::correlation::{CorrelationTable, PendingConnection};
use crate::link::{ControlLink, LinkInfo};
use crate::registry::{RegistryError, TunnelRegistry};
use crate::relay::relay;
use crate::stream::{BoxedStream, DuplexIo};

/// Upper bound on a graceful shutdown of a rejected stream
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Tunnel connection manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct InboundConnection {
    stream: BoxedStream,
    peer_addr: Option<SocketAddr>,
}

struct Registration {
    link: ControlLink,
    reply: oneshot::Sender<Result<(), RegistryError>>,
}

struct ProxyArrival {
    token: Token,
    stream: BoxedStream,
}

struct Shared {
    config: ManagerConfig,
    registry: TunnelRegistry,
    correlation: CorrelationTable,
    shutdown: CancellationToken,
    active_relays: AtomicUsize,
}

/// Owner of the registry, the correlation table and the ingress queues
pub struct TunnelConnectionManager {
    shared: Arc<Shared>,
    inbound_rx: mpsc::Receiver<InboundConnection>,
    registration_rx: mpsc::Receiver<Registration>,
    proxy_rx: mpsc::Receiver<ProxyArrival>,
    handle: ManagerHandle,
}

impl TunnelConnectionManager {
    pub fn new(config: ManagerConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (registration_tx, registration_rx) = mpsc::channel(capacity);
        let (proxy_tx, proxy_rx) = mpsc::channel(capacity);

        let shared = Arc::new(Shared {
            config,
            registry: TunnelRegistry::new(),
            correlation: CorrelationTable::new(),
            shutdown: CancellationToken::new(),
            active_relays: AtomicUsize::new(0),
        });

        let handle = ManagerHandle {
            shared: shared.clone(),
            inbound_tx,
            registration_tx,
            proxy_tx,
        };

        Self {
            shared,
            inbound_rx,
            registration_rx,
            proxy_rx,
            handle,
        }
    }

    /// Spawn the dispatch loops and return the ingress handle
    pub fn start(self) -> ManagerHandle {
        let Self {
            shared,
            inbound_rx,
            registration_rx,
            proxy_rx,
            handle,
        } = self;

        tokio::spawn(inbound_loop(shared.clone(), inbound_rx));
        tokio::spawn(registration_loop(shared.clone(), registration_rx));
        tokio::spawn(proxy_loop(shared.clone(), proxy_rx));

        info!(
            "Tunnel connection manager started (pairing timeout {:?}, policy {:?})",
            shared.config.pairing_timeout, shared.config.registration_policy
        );
        handle
    }
}

/// Cloneable ingress surface of a running manager
#[derive(Clone)]
pub struct ManagerHandle {
    shared: Arc<Shared>,
    inbound_tx: mpsc::Sender<InboundConnection>,
    registration_tx: mpsc::Sender<Registration>,
    proxy_tx: mpsc::Sender<ProxyArrival>,
}

impl ManagerHandle {
    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Enqueue a raw inbound connection
    ///
    /// Waits while the queue is full, so a listener calling this in its
    /// accept loop stops accepting under load.
    pub async fn submit<S: DuplexIo>(
        &self,
        stream: S,
        peer_addr: Option<SocketAddr>,
    ) -> Result<(), ManagerError> {
        let stream: BoxedStream = Box::new(stream);
        self.enqueue(&self.inbound_tx, InboundConnection { stream, peer_addr })
            .await
    }

    /// Register a control link; resolves once the registry has decided
    pub async fn register_control_link(&self, link: ControlLink) -> Result<(), ManagerError> {
        let (reply, outcome) = oneshot::channel();
        self.enqueue(&self.registration_tx, Registration { link, reply })
            .await?;
        outcome.await.map_err(|_| ManagerError::ShuttingDown)??;
        Ok(())
    }

    /// Hand over a proxy stream opened by an agent for `token`
    ///
    /// A stream whose token cannot be claimed is closed without any payload.
    pub async fn submit_proxy_stream<S: DuplexIo>(
        &self,
        token: Token,
        stream: S,
    ) -> Result<(), ManagerError> {
        let stream: BoxedStream = Box::new(stream);
        self.enqueue(&self.proxy_tx, ProxyArrival { token, stream })
            .await
    }

    /// Called by a control link's transport when the link terminates
    ///
    /// Removes the registry entry only if it still belongs to this link and
    /// expires the connections still waiting on it.
    pub fn unregister_control_link(&self, link: &ControlLink) {
        link.close();
        let removed = self
            .shared
            .registry
            .unregister_link(link.domain(), link.id());
        let expired = self
            .shared
            .correlation
            .expire_link(link.domain(), link.id());

        if removed {
            info!(
                "🔌 Control link {} for {} unregistered ({} pending connections expired)",
                link.id(),
                link.domain(),
                expired
            );
        } else {
            debug!(
                "Control link {} for {} terminated after being replaced ({} pending connections expired)",
                link.id(),
                link.domain(),
                expired
            );
        }
    }

    /// Close the live link of `domain`, if any
    pub fn close_domain(&self, domain: &str) -> bool {
        match self.shared.registry.unregister(domain) {
            Ok(link) => {
                link.close();
                let expired = self.shared.correlation.expire_link(domain, link.id());
                info!(
                    "Closed control link {} for {} ({} pending connections expired)",
                    link.id(),
                    domain,
                    expired
                );
                true
            }
            Err(_) => false,
        }
    }

    pub fn lookup(&self, domain: &str) -> Option<ControlLink> {
        self.shared.registry.lookup(domain)
    }

    pub fn list_links(&self) -> Vec<LinkInfo> {
        self.shared.registry.list()
    }

    pub fn active_tunnels(&self) -> usize {
        self.shared.registry.count()
    }

    pub fn pending_connections(&self) -> usize {
        self.shared.correlation.count()
    }

    pub fn active_relays(&self) -> usize {
        self.shared.active_relays.load(Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Stop the dispatch loops, close every live link and expire every
    /// pending connection. Running relay sessions end on their own.
    pub fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();

        let links = self.shared.registry.drain();
        for link in &links {
            link.close();
        }
        let expired = self.shared.correlation.expire_all();

        info!(
            "🛑 Tunnel connection manager shut down ({} links closed, {} pending connections expired)",
            links.len(),
            expired
        );
    }

    async fn enqueue<T>(&self, queue: &mpsc::Sender<T>, item: T) -> Result<(), ManagerError> {
        if self.is_shutting_down() {
            return Err(ManagerError::ShuttingDown);
        }
        tokio::select! {
            result = queue.send(item) => result.map_err(|_| ManagerError::ShuttingDown),
            _ = self.shared.shutdown.cancelled() => Err(ManagerError::ShuttingDown),
        }
    }
}

async fn inbound_loop(shared: Arc<Shared>, mut queue: mpsc::Receiver<InboundConnection>) {
    loop {
        let connection = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            item = queue.recv() => match item {
                Some(connection) => connection,
                None => break,
            },
        };
        tokio::spawn(handle_inbound(shared.clone(), connection));
    }
    debug!("Inbound dispatch loop stopped");
}

async fn registration_loop(shared: Arc<Shared>, mut queue: mpsc::Receiver<Registration>) {
    loop {
        let Registration { link, reply } = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            item = queue.recv() => match item {
                Some(registration) => registration,
                None => break,
            },
        };

        let result = shared
            .registry
            .register(link.clone(), shared.config.registration_policy);

        match &result {
            Ok(Some(previous)) => {
                let expired = shared
                    .correlation
                    .expire_link(previous.domain(), previous.id());
                info!(
                    "🔁 Control link {} replaced {} for {} ({} pending connections expired)",
                    link.id(),
                    previous.id(),
                    link.domain(),
                    expired
                );
            }
            Ok(None) => {
                info!("✅ Control link {} registered for {}", link.id(), link.domain());
            }
            Err(e) => {
                warn!("Rejected control link {}: {}", link.id(), e);
            }
        }

        if reply.send(result.map(|_| ())).is_err() {
            debug!("Registration reply for link {} dropped", link.id());
        }
    }
    debug!("Registration dispatch loop stopped");
}

async fn proxy_loop(shared: Arc<Shared>, mut queue: mpsc::Receiver<ProxyArrival>) {
    loop {
        let ProxyArrival { token, stream } = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            item = queue.recv() => match item {
                Some(arrival) => arrival,
                None => break,
            },
        };

        match shared.correlation.claim(token) {
            Ok(pending) => {
                tokio::spawn(run_relay(shared.clone(), pending, stream));
            }
            Err(e) => {
                warn!("Refused proxy stream: {}", e);
                tokio::spawn(close_stream(stream));
            }
        }
    }
    debug!("Proxy stream dispatch loop stopped");
}

async fn handle_inbound(shared: Arc<Shared>, connection: InboundConnection) {
    let InboundConnection {
        mut stream,
        peer_addr,
    } = connection;
    let peer = peer_addr
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let sniffed = match sniff(&mut stream, &shared.config.sniff).await {
        Ok(sniffed) => sniffed,
        Err(e) => {
            debug!("Rejected connection from {}: {}", peer, e);
            close_stream(stream).await;
            return;
        }
    };

    let Some(link) = shared.registry.lookup(&sniffed.domain) else {
        debug!(
            "Rejected connection from {}: {}",
            peer,
            RegistryError::DomainNotRegistered(sniffed.domain)
        );
        close_stream(stream).await;
        return;
    };

    let domain = sniffed.domain;
    let pairing_timeout = shared.config.pairing_timeout;
    let deadline = Instant::now() + pairing_timeout;
    let pending = PendingConnection::new(
        domain.clone(),
        link.id(),
        stream,
        sniffed.prefix,
        peer_addr,
    );
    let token = shared.correlation.issue_token(pending);

    match tokio::time::timeout_at(deadline, link.request_stream(token)).await {
        Ok(Ok(())) => {
            debug!(
                "Requested proxy stream {} for {} from {} over link {}",
                token,
                domain,
                peer,
                link.id()
            );
        }
        Ok(Err(e)) => {
            warn!("Failed to request proxy stream for {}: {}", domain, e);
            shared.correlation.expire(token);
            return;
        }
        Err(_) => {
            warn!(
                "Timed out requesting proxy stream for {} over link {}",
                domain,
                link.id()
            );
            shared.correlation.expire(token);
            return;
        }
    }

    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => {
            if shared.correlation.expire(token) {
                info!(
                    "⏱️ Pairing for {} from {} expired after {:?}",
                    domain, peer, pairing_timeout
                );
            }
        }
        _ = shared.shutdown.cancelled() => {}
    }
}

async fn run_relay(shared: Arc<Shared>, pending: PendingConnection, proxy: BoxedStream) {
    let PendingConnection {
        token,
        domain,
        stream,
        prefix,
        arrived_at,
        ..
    } = pending;

    shared.active_relays.fetch_add(1, Ordering::Relaxed);
    info!(
        "🔗 Paired token {} for {} after {:?}",
        token,
        domain,
        arrived_at.elapsed()
    );

    let stats = match relay(stream, proxy, prefix).await {
        Ok(stats) => stats,
        Err(e) => {
            debug!("Relay session {} for {} ended: {}", token, domain, e);
            e.stats()
        }
    };

    shared.active_relays.fetch_sub(1, Ordering::Relaxed);
    info!(
        "📤 Relay session {} for {} closed ({}ms, ↑{}B ↓{}B)",
        token,
        domain,
        stats.duration.as_millis(),
        stats.bytes_a_to_b,
        stats.bytes_b_to_a
    );
}

async fn close_stream(mut stream: BoxedStream) {
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await;
}
