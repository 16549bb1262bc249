//! TCP server for beacon clients.
//!
//! Accepts connections, spawns one beacon handler per client, and drains
//! the handlers when the shutdown future resolves.

use crate::beacon::{handle_connection, Beacon};
use crate::config::Config;
use crate::connection::ConnectionRegistry;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Listen backlog for the beacon socket
const BACKLOG: i32 = 128;

/// Server instance
pub struct Server {
    config: Config,
    beacon: Arc<Beacon>,
    registry: Arc<ConnectionRegistry>,
    connection_limit: Arc<Semaphore>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Server {
            beacon: Arc::new(Beacon::from_config(&config)),
            registry: Arc::new(ConnectionRegistry::new(config.max_connections)),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            shutdown_tx,
            config,
        }
    }

    /// Bind the configured listen address.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        bind_listener(&self.config.listen)
    }

    /// Accept connections until `shutdown` resolves, then stop every handler.
    pub async fn run<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr().map_err(ServerError::Io)?;
        info!(address = %local, "Server listening");

        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                _ = &mut shutdown => break,

                Some(res) = sessions.join_next() => reap(res),

                res = listener.accept() => match res {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                        }

                        let session = self.registry.register(addr);
                        info!(peer = %addr, session, "Client connected");

                        let beacon = Arc::clone(&self.beacon);
                        let registry = Arc::clone(&self.registry);
                        let shutdown_rx = self.shutdown_tx.subscribe();

                        sessions.spawn(async move {
                            serve_client(stream, addr, session, beacon, registry, shutdown_rx).await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        drop(listener);
        info!(active = sessions.len(), "Shutting down, stopping sessions");
        // No receivers just means no live sessions
        let _ = self.shutdown_tx.send(());

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(res) = sessions.join_next().await {
                reap(res);
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                remaining = sessions.len(),
                "Grace period elapsed, aborting sessions"
            );
            sessions.shutdown().await;
        }

        let summary = self.registry.summary();
        info!(
            served = summary.served,
            aborted = summary.active,
            payloads_sent = summary.payloads_sent,
            echoed_payloads = summary.echoed_payloads,
            "Server stopped"
        );

        Ok(())
    }

    /// Get a handle to the session registry
    #[cfg(test)]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }
}

/// Run one beacon session and release its registry slot.
async fn serve_client(
    stream: TcpStream,
    addr: SocketAddr,
    session: usize,
    beacon: Arc<Beacon>,
    registry: Arc<ConnectionRegistry>,
    shutdown_rx: broadcast::Receiver<()>,
) {
    match handle_connection(stream, session, beacon, Arc::clone(&registry), shutdown_rx).await {
        Ok(outcome) => {
            info!(
                peer = %addr,
                session,
                half_closed = outcome.half_closed,
                echoed = outcome.echo.complete,
                "Session stopped for shutdown"
            );
        }
        Err(e) => {
            debug!(peer = %addr, session, error = %e, "Connection error");
            info!(peer = %addr, session, "Client disconnected");
        }
    }

    if let Some(info) = registry.remove(session) {
        debug!(
            session,
            peer = %info.peer,
            state = ?info.state,
            sent = info.payloads_sent,
            echoed = info.echoed_payloads,
            age_ms = info.age().as_millis() as u64,
            "Session released"
        );
    }
}

fn reap(res: Result<(), JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            error!(error = ?e, "Session handler panicked");
        }
    }
}

/// Resolve `addr` and bind a listening socket to its first address.
///
/// Only SO_REUSEADDR is set (never SO_REUSEPORT), so a port held by another
/// listener is reported as a bind failure.
pub fn bind_listener(addr: &str) -> Result<TcpListener, ServerError> {
    let resolved = addr
        .to_socket_addrs()
        .map_err(|source| ServerError::Addr {
            addr: addr.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| ServerError::Addr {
            addr: addr.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
        })?;

    create_listener(resolved).map_err(|source| ServerError::Bind {
        addr: resolved,
        source,
    })
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    // SO_REUSEADDR on Windows allows binding a port already in use
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Server startup errors
#[derive(Debug)]
pub enum ServerError {
    Addr { addr: String, source: io::Error },
    Bind { addr: SocketAddr, source: io::Error },
    Io(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Addr { addr, source } => {
                write!(f, "Invalid listen address '{}': {}", addr, source)
            }
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to bind {}: {}", addr, source)
            }
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Addr { source, .. } | ServerError::Bind { source, .. } => Some(source),
            ServerError::Io(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio::time::{timeout, Instant};

    struct Running {
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<Result<(), ServerError>>,
    }

    fn test_config(interval_ms: u64) -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            interval: Duration::from_millis(interval_ms),
            shutdown_grace: Duration::from_millis(500),
            ..Config::default()
        }
    }

    fn start(config: Config) -> Running {
        let server = Server::new(config);
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = server.registry();
        let (stop, stopped) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            server
                .run(listener, async {
                    let _ = stopped.await;
                })
                .await
        });

        Running {
            addr,
            registry,
            stop,
            task,
        }
    }

    async fn read_payload(stream: &mut TcpStream) -> [u8; 5] {
        let mut buf = [0u8; 5];
        timeout(Duration::from_millis(1500), stream.read_exact(&mut buf))
            .await
            .expect("no payload within 1.5s")
            .unwrap();
        buf
    }

    async fn wait_for_sessions(registry: &ConnectionRegistry, expected: usize) {
        // A vanished peer is only noticed by a failed write
        timeout(Duration::from_secs(5), async {
            while registry.len() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session count never settled");
    }

    #[tokio::test]
    async fn test_bind_in_use_fails() {
        let first = bind_listener("127.0.0.1:0").unwrap();
        let addr = first.local_addr().unwrap();

        let err = bind_listener(&addr.to_string()).unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(err.to_string().contains(&addr.to_string()));
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let err = bind_listener("not-an-address").unwrap_err();
        assert!(matches!(err, ServerError::Addr { .. }));
    }

    #[tokio::test]
    async fn test_beacon_scenario() {
        let running = start(test_config(1000));

        let mut client = TcpStream::connect(running.addr).await.unwrap();
        assert_eq!(&read_payload(&mut client).await, b"t321t");
        let first = Instant::now();

        let second = read_payload(&mut client).await;
        let gap = first.elapsed();
        assert_eq!(&second, b"t321t");
        assert!(gap >= Duration::from_millis(900), "gap too short: {gap:?}");
        assert!(gap <= Duration::from_millis(1500), "gap too long: {gap:?}");

        assert_eq!(&read_payload(&mut client).await, b"t321t");
        drop(client);
        wait_for_sessions(&running.registry, 0).await;

        // Still accepting after the first client left
        let mut again = TcpStream::connect(running.addr).await.unwrap();
        assert_eq!(&read_payload(&mut again).await, b"t321t");
        assert!(!running.task.is_finished());

        running.stop.send(()).unwrap();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_does_not_affect_others() {
        let running = start(test_config(50));

        let mut a = TcpStream::connect(running.addr).await.unwrap();
        let mut b = TcpStream::connect(running.addr).await.unwrap();
        read_payload(&mut a).await;
        read_payload(&mut b).await;
        wait_for_sessions(&running.registry, 2).await;

        drop(a);
        wait_for_sessions(&running.registry, 1).await;

        for _ in 0..3 {
            assert_eq!(&read_payload(&mut b).await, b"t321t");
        }

        running.stop.send(()).unwrap();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_half_closed_client_keeps_receiving() {
        let running = start(test_config(100));

        let mut client = TcpStream::connect(running.addr).await.unwrap();
        read_payload(&mut client).await;
        client.shutdown().await.unwrap();

        let mut rest = Vec::new();
        let _ = timeout(Duration::from_millis(800), client.read_to_end(&mut rest)).await;
        assert!(rest.len() >= 10, "only {} bytes after half-close", rest.len());
        assert_eq!(&rest[..5], b"t321t");
        assert_eq!(running.registry.len(), 1);

        running.stop.send(()).unwrap();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let running = start(test_config(50));

        let mut client = TcpStream::connect(running.addr).await.unwrap();
        read_payload(&mut client).await;

        running.stop.send(()).unwrap();
        running.task.await.unwrap().unwrap();

        // Drain whatever was in flight, then expect EOF
        let mut rest = Vec::new();
        timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .expect("socket not closed after shutdown")
            .unwrap();
        assert_eq!(rest.len() % 5, 0);

        assert!(TcpStream::connect(running.addr).await.is_err());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let running = start(Config {
            max_connections: 1,
            ..test_config(50)
        });

        let mut a = TcpStream::connect(running.addr).await.unwrap();
        read_payload(&mut a).await;

        // Sits in the backlog until a slot frees up
        let mut b = TcpStream::connect(running.addr).await.unwrap();
        let mut buf = [0u8; 5];
        assert!(timeout(Duration::from_millis(200), b.read_exact(&mut buf))
            .await
            .is_err());

        drop(a);
        assert_eq!(&read_payload(&mut b).await, b"t321t");

        running.stop.send(()).unwrap();
        running.task.await.unwrap().unwrap();
    }
}
