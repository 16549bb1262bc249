//! Echo client.
//!
//! Plays the device side of a beacon link: connects to the beacon, writes
//! every received byte straight back, and reconnects after a delay whenever
//! the connection closes or cannot be established.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Receive buffer size, one Ethernet MTU
const BUFFER_SIZE: usize = 1500;

/// Counters kept across reconnects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    /// Connections that were established.
    pub connections: u64,
    /// Bytes written back to the beacon.
    pub bytes_echoed: u64,
}

/// Reconnecting echo client
pub struct EchoClient {
    target: String,
    reconnect_delay: Duration,
    connections: AtomicU64,
    bytes_echoed: AtomicU64,
}

impl EchoClient {
    pub fn new(target: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            target: target.into(),
            reconnect_delay,
            connections: AtomicU64::new(0),
            bytes_echoed: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            connections: self.connections.load(Ordering::Relaxed),
            bytes_echoed: self.bytes_echoed.load(Ordering::Relaxed),
        }
    }

    /// Echo until `shutdown` resolves, reconnecting as needed.
    pub async fn run<F>(&self, shutdown: F) -> ClientStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                res = self.session() => match res {
                    Ok(()) => info!(peer = %self.target, "Connection closed"),
                    Err(e) => warn!(peer = %self.target, error = %e, "Connection failed"),
                },
            }

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {
                    debug!(peer = %self.target, "Reconnecting");
                }
            }
        }

        let stats = self.stats();
        info!(
            connections = stats.connections,
            bytes_echoed = stats.bytes_echoed,
            "Echo client stopped"
        );
        stats
    }

    async fn session(&self) -> io::Result<()> {
        let stream = TcpStream::connect(&self.target).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        self.connections.fetch_add(1, Ordering::Relaxed);
        info!(peer = %self.target, "Connected");

        echo_stream(stream, &self.bytes_echoed).await
    }
}

/// Write everything read from `stream` back to it until EOF.
async fn echo_stream<S>(mut stream: S, echoed: &AtomicU64) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; BUFFER_SIZE];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        stream.write_all(&buf[..n]).await?;
        echoed.fetch_add(n as u64, Ordering::Relaxed);
    }
}
