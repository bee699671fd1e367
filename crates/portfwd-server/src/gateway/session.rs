//! Per-connection session: allowlist check, target resolution, outbound
//! connect, relay.
//!
//! Every accepted connection runs [`SessionHandler::handle`] in its own task.
//! Whatever goes wrong inside is logged there and goes no further: the
//! listener and other sessions never see it.

use super::forwarder::{relay, RelayEnd, RelayStats};
use super::resolver::{ClientKey, TargetResolver};
use portfwd_core::{AccessPolicy, FwdError, FwdResult, TargetSpec};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Result of a session that reached the relay stage.
#[derive(Debug)]
pub struct SessionSummary {
    pub target: TargetSpec,
    pub cached: bool,
    pub stats: RelayStats,
}

/// Shared, read-only context for every session.
pub struct SessionHandler {
    access: AccessPolicy,
    resolver: Arc<TargetResolver>,
    chunk_size: usize,
    connect_timeout: Duration,
    active: Arc<AtomicUsize>,
}

impl SessionHandler {
    /// Create a handler shared by all listeners.
    ///
    /// # Arguments
    ///
    /// * `access` - Allowlist checked before anything else
    /// * `resolver` - Picks the upstream for each client
    /// * `chunk_size` - Relay buffer size per direction
    /// * `connect_timeout` - Limit on the outbound connect
    pub fn new(
        access: AccessPolicy,
        resolver: Arc<TargetResolver>,
        chunk_size: usize,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            access,
            resolver,
            chunk_size,
            connect_timeout,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run a session to completion and log how it ended.
    ///
    /// # Arguments
    ///
    /// * `client` - The accepted connection
    /// * `peer` - Remote address of `client`
    /// * `listen_port` - Port the connection arrived on
    pub async fn handle(self: Arc<Self>, client: TcpStream, peer: SocketAddr, listen_port: u16) {
        let guard = self.acquire();
        info!(peer = %peer, listen_port, active = guard.current(), "connection accepted");

        match self.run(client, peer, listen_port).await {
            Ok(summary) => {
                let (ended_by, error) = match &summary.stats.end {
                    RelayEnd::Eof(dir) => (*dir, None),
                    RelayEnd::Error(dir, e) => (*dir, Some(e.to_string())),
                };
                info!(
                    peer = %peer,
                    listen_port,
                    target = %summary.target,
                    cached = summary.cached,
                    sent = summary.stats.client_to_target,
                    received = summary.stats.target_to_client,
                    ended_by = %ended_by,
                    error = error.as_deref().unwrap_or("none"),
                    "connection closed"
                );
            }
            Err(FwdError::Denied(ip)) => {
                warn!(peer = %peer, ip = %ip, listen_port, "connection denied by allowlist");
            }
            Err(e) => {
                warn!(peer = %peer, listen_port, error = %e, "session failed, connection closed");
            }
        }
    }

    /// The session pipeline. The client connection is closed on every
    /// return path, because it is owned here and dropped.
    pub async fn run(
        &self,
        client: TcpStream,
        peer: SocketAddr,
        listen_port: u16,
    ) -> FwdResult<SessionSummary> {
        if !self.access.permit(peer.ip()) {
            return Err(FwdError::Denied(peer.ip()));
        }

        let key = ClientKey {
            client_ip: peer.ip(),
            listen_port,
        };
        let resolution = self.resolver.resolve(&key).await?;
        debug!(
            peer = %peer,
            target = %resolution.target,
            cached = resolution.cached,
            "target resolved"
        );

        let upstream = self.connect(&resolution.target).await?;
        let _ = client.set_nodelay(true);
        let _ = upstream.set_nodelay(true);

        let stats = relay(client, upstream, self.chunk_size).await;
        Ok(SessionSummary {
            target: resolution.target,
            cached: resolution.cached,
            stats,
        })
    }

    async fn connect(&self, target: &TargetSpec) -> FwdResult<TcpStream> {
        let addr = target.to_string();
        let attempt = TcpStream::connect((target.host.as_str(), target.port));
        match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(FwdError::Connection { addr, source }),
            Err(_) => Err(FwdError::Connection {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            }),
        }
    }

    /// Count a session as active until the guard drops.
    fn acquire(&self) -> SessionGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            counter: self.active.clone(),
        }
    }

    /// Approximate number of sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// RAII guard that decrements the session count on drop.
struct SessionGuard {
    counter: Arc<AtomicUsize>,
}

impl SessionGuard {
    fn current(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
