//! Relay server: wires the gateway together and coordinates shutdown.
//!
//! [`RelayServer::run_until`] binds every listener, serves until the given
//! stop future completes, then closes all listeners and waits for their
//! accept loops. Sessions still relaying at that point are not cancelled.

use crate::config::RelayConfig;
use crate::gateway::{ListenerManager, SessionHandler, TargetResolver};
use portfwd_core::FwdResult;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// The relay server instance.
pub struct RelayServer {
    config: RelayConfig,
    resolver: Arc<TargetResolver>,
    handler: Arc<SessionHandler>,
    listeners: ListenerManager,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let resolver = Arc::new(TargetResolver::new(config.target.clone(), config.cache_ttl));
        let handler = Arc::new(SessionHandler::new(
            config.access.clone(),
            resolver.clone(),
            config.buffer_size,
            config.connect_timeout,
        ));
        Self {
            config,
            resolver,
            handler,
            listeners: ListenerManager::new(),
        }
    }

    /// Bind all configured ports and start accepting.
    pub async fn start(&self) -> FwdResult<Vec<SocketAddr>> {
        let addrs = self
            .listeners
            .bind_all(&self.config.listeners, self.handler.clone())
            .await?;
        info!(listeners = addrs.len(), target = ?self.config.target, "relay started");
        Ok(addrs)
    }

    /// Close every listener and wait for the accept loops to finish.
    pub async fn shutdown(&self) {
        let addrs = self.listeners.local_addrs().await;
        debug!(?addrs, "closing listeners");
        let closed = self.listeners.close_all().await;
        info!(
            listeners = closed,
            active_sessions = self.handler.active_sessions(),
            "relay stopped accepting"
        );
    }

    /// Serve until `stop` resolves, then shut down.
    pub async fn run_until<F>(&self, stop: F) -> FwdResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;

        let sweeper = tokio::spawn(sweep_cache(self.resolver.clone()));
        stop.await;
        info!("stop requested");
        sweeper.abort();

        self.shutdown().await;
        Ok(())
    }
}

/// Periodically drop expired cache entries so the map stays bounded by the
/// number of recently seen clients.
async fn sweep_cache(resolver: Arc<TargetResolver>) {
    let mut interval = tokio::time::interval(resolver.max_age());
    interval.tick().await;
    loop {
        interval.tick().await;
        let removed = resolver.purge_expired().await;
        let remaining = resolver.cached_entries().await;
        debug!(removed, remaining, "cache sweep");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetMode;
    use portfwd_core::{AccessPolicy, ListenerSpec, TargetSpec};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    async fn echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    async fn free_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    fn config(ports: &[u16], upstream: SocketAddr) -> RelayConfig {
        RelayConfig {
            listeners: ports
                .iter()
                .map(|&port| ListenerSpec {
                    host: "127.0.0.1".to_string(),
                    port,
                })
                .collect(),
            target: TargetMode::Static(TargetSpec::new("127.0.0.1", upstream.port())),
            cache_ttl: Duration::from_secs(600),
            access: AccessPolicy::AllowAny,
            buffer_size: 4096,
            connect_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn stop_signal_closes_listeners() {
        let upstream = echo_upstream().await;
        let port = free_port().await;
        let server = Arc::new(RelayServer::new(config(&[port], upstream)));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let run = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .run_until(async {
                        let _ = stop_rx.await;
                    })
                    .await
            }
        });

        // Wait until the listener is up.
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let mut client = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(stream) = TcpStream::connect(addr).await {
                    break stream;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        client.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        stop_tx.send(()).unwrap();
        timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(TcpStream::connect(addr).await.is_err());

        // The session that was already relaying survives shutdown.
        client.write_all(b"still").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still");
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn background_tasks_are_send() {
        let resolver = Arc::new(TargetResolver::new(
            TargetMode::Static(TargetSpec::new("127.0.0.1", 9)),
            Duration::from_secs(600),
        ));
        let sweeper = sweep_cache(resolver);
        assert_send(&sweeper);

        let server = RelayServer::new(config(&[9], SocketAddr::from(([127, 0, 0, 1], 9))));
        let run = server.run_until(std::future::pending());
        assert_send(&run);
    }

    #[tokio::test]
    async fn bind_failure_aborts_run() {
        let upstream = echo_upstream().await;
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let server = RelayServer::new(config(&[port], upstream));

        let err = server.run_until(std::future::pending()).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
