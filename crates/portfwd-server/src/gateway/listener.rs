//! Listening sockets, one per port in the configured range.
//!
//! Each listener runs its own accept loop task. An accepted connection is
//! handed to a freshly spawned session task, so the loop never waits on
//! relay work. [`ListenerManager::close_all`] cancels every loop and waits
//! for them to return; sessions already running are left alone.

use super::session::SessionHandler;
use portfwd_core::{FwdError, FwdResult, ListenerSpec};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Manages the relay's listening sockets.
pub struct ListenerManager {
    /// Active listeners keyed by bound port.
    listeners: Mutex<BTreeMap<u16, ListenerEntry>>,
}

/// Bookkeeping for one accept loop.
struct ListenerEntry {
    /// Sending (or dropping) stops the accept loop.
    cancel_tx: mpsc::Sender<()>,
    /// Resolves once the accept loop has returned and the socket is closed.
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl Default for ListenerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerManager {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(BTreeMap::new()),
        }
    }

    /// Bind every spec and start its accept loop.
    ///
    /// All-or-nothing: if any port fails to bind, the listeners bound so far
    /// are closed again and [`FwdError::Bind`] is returned.
    ///
    /// # Arguments
    ///
    /// * `specs` - Host and port for each listening socket
    /// * `handler` - Session handler shared by every accept loop
    pub async fn bind_all(
        &self,
        specs: &[ListenerSpec],
        handler: Arc<SessionHandler>,
    ) -> FwdResult<Vec<SocketAddr>> {
        let mut bound = Vec::with_capacity(specs.len());
        for spec in specs {
            let addr = spec.to_string();
            match TcpListener::bind(&addr).await {
                Ok(listener) => bound.push((spec.port, listener)),
                Err(source) => {
                    warn!(addr = %addr, error = %source, "listen bind failed");
                    return Err(FwdError::Bind { addr, source });
                }
            }
        }

        let mut addrs = Vec::with_capacity(bound.len());
        let mut listeners = self.listeners.lock().await;
        for (port, listener) in bound {
            let local_addr = listener.local_addr()?;
            let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
            let handler = handler.clone();
            let handle = tokio::spawn(async move {
                Self::accept_loop(listener, cancel_rx, port, handler).await;
                debug!(port, "accept loop ended");
            });

            info!(addr = %local_addr, "listener bound");
            addrs.push(local_addr);
            listeners.insert(
                port,
                ListenerEntry {
                    cancel_tx,
                    handle,
                    local_addr,
                },
            );
        }

        Ok(addrs)
    }

    /// Stop accepting on every listener and wait for each accept loop to
    /// return. In-flight sessions keep running.
    ///
    /// Returns the number of listeners closed.
    pub async fn close_all(&self) -> usize {
        let entries: Vec<(u16, ListenerEntry)> = {
            let mut listeners = self.listeners.lock().await;
            std::mem::take(&mut *listeners).into_iter().collect()
        };

        for (port, entry) in &entries {
            debug!(port, "draining listener");
            let _ = entry.cancel_tx.send(()).await;
        }

        let count = entries.len();
        for (port, entry) in entries {
            if let Err(e) = entry.handle.await {
                warn!(port, error = %e, "accept loop task failed");
            }
            info!(addr = %entry.local_addr, "listener closed");
        }
        count
    }

    /// Addresses of the listeners currently accepting.
    pub async fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .lock()
            .await
            .values()
            .map(|entry| entry.local_addr)
            .collect()
    }

    /// Accept loop for one listening port.
    async fn accept_loop(
        listener: TcpListener,
        mut cancel_rx: mpsc::Receiver<()>,
        port: u16,
        handler: Arc<SessionHandler>,
    ) {
        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    debug!(port, "accept loop cancelled");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let handler = handler.clone();
                            tokio::spawn(handler.handle(stream, peer, port));
                        }
                        Err(e) => {
                            warn!(port, error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetMode;
    use crate::gateway::resolver::TargetResolver;
    use portfwd_core::{AccessPolicy, TargetSpec};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    /// Reserve distinct free loopback ports.
    async fn free_ports(n: usize) -> Vec<u16> {
        let mut held = Vec::new();
        for _ in 0..n {
            held.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        held.iter().map(|l| l.local_addr().unwrap().port()).collect()
    }

    fn specs(ports: &[u16]) -> Vec<ListenerSpec> {
        ports
            .iter()
            .map(|&port| ListenerSpec {
                host: "127.0.0.1".to_string(),
                port,
            })
            .collect()
    }

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

    fn static_handler(upstream: SocketAddr) -> Arc<SessionHandler> {
        let resolver = Arc::new(TargetResolver::new(
            TargetMode::Static(TargetSpec::new("127.0.0.1", upstream.port())),
            Duration::from_secs(600),
        ));
        Arc::new(SessionHandler::new(
            AccessPolicy::AllowAny,
            resolver,
            4096,
            Duration::from_secs(2),
        ))
    }

    async fn echo_through(addr: SocketAddr, msg: &[u8]) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(msg).await.unwrap();
        let mut buf = vec![0u8; msg.len()];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, msg);
        stream
    }

    #[tokio::test]
    async fn binds_one_listener_per_port() {
        let upstream = echo_upstream().await;
        let ports = free_ports(3).await;
        let manager = ListenerManager::new();

        let addrs = manager
            .bind_all(&specs(&ports), static_handler(upstream))
            .await
            .unwrap();
        let mut bound: Vec<u16> = addrs.iter().map(|a| a.port()).collect();
        bound.sort_unstable();
        let mut expected = ports.clone();
        expected.sort_unstable();
        assert_eq!(bound, expected);

        for addr in &addrs {
            echo_through(*addr, b"hi").await;
        }
        assert_eq!(manager.close_all().await, 3);
    }

    #[tokio::test]
    async fn bind_conflict_is_fatal_and_rolls_back() {
        let upstream = echo_upstream().await;
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();
        let free = free_ports(1).await;

        let manager = ListenerManager::new();
        let err = manager
            .bind_all(&specs(&[free[0], taken_port]), static_handler(upstream))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(manager.local_addrs().await.is_empty());
    }

    #[tokio::test]
    async fn close_stops_accepting_but_keeps_sessions() {
        let upstream = echo_upstream().await;
        let ports = free_ports(1).await;
        let manager = ListenerManager::new();
        let addrs = manager
            .bind_all(&specs(&ports), static_handler(upstream))
            .await
            .unwrap();

        let mut live = echo_through(addrs[0], b"before").await;

        timeout(Duration::from_secs(5), manager.close_all())
            .await
            .expect("close_all should not wait on sessions");

        // New connections are refused once the listener is closed.
        assert!(TcpStream::connect(addrs[0]).await.is_err());

        // The session accepted before shutdown still relays.
        live.write_all(b"after").await.unwrap();
        let mut buf = [0u8; 5];
        timeout(Duration::from_secs(5), live.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"after");
    }

    #[tokio::test]
    async fn failing_session_does_not_stop_listener() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let resolver = Arc::new(TargetResolver::new(
            TargetMode::File(file.path().to_path_buf()),
            Duration::from_secs(600),
        ));
        let handler = Arc::new(SessionHandler::new(
            AccessPolicy::AllowAny,
            resolver,
            4096,
            Duration::from_secs(2),
        ));
        let ports = free_ports(2).await;
        let manager = ListenerManager::new();
        let addrs = manager.bind_all(&specs(&ports), handler).await.unwrap();

        // No valid targets yet: the session is closed without data.
        let mut first = TcpStream::connect(addrs[0]).await.unwrap();
        let mut buf = [0u8; 4];
        let res = timeout(Duration::from_secs(5), first.read(&mut buf)).await.unwrap();
        assert!(matches!(res, Ok(0) | Err(_)));

        // Once the file lists a target, both listeners forward.
        let upstream = echo_upstream().await;
        std::fs::write(file.path(), format!("127.0.0.1:{}\n", upstream.port())).unwrap();
        echo_through(addrs[0], b"again").await;
        echo_through(addrs[1], b"other").await;

        manager.close_all().await;
    }
}
