//! Per-connection beacon handler for the Tokio runtime.

use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::verify::{EchoStats, EchoVerifier};
use super::Beacon;
use crate::connection::{ConnState, ConnectionRegistry};

/// Read buffer size for echoed bytes
const READ_BUFFER_SIZE: usize = 1500;

/// Result of a session that was stopped by server shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    /// The client had already closed its sending side.
    pub half_closed: bool,
    pub echo: EchoStats,
}

/// Handle a beacon connection.
///
/// Writes the payload immediately and then once per interval. Missed ticks
/// are delayed rather than bursted, so consecutive writes are never closer
/// than the interval. Anything the client sends is checked against the
/// payload stream.
///
/// Only a failed write ends the session early. A client that closes its
/// sending side keeps receiving payloads; once it is really gone the next
/// write fails. Returns `Ok` only when stopped by `shutdown`.
pub async fn handle_connection<S>(
    stream: S,
    session: usize,
    beacon: Arc<Beacon>,
    registry: Arc<ConnectionRegistry>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<SessionOutcome, Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut verifier = EchoVerifier::new(beacon.payload.clone());
    let mut reading = true;

    let mut ticker = tokio::time::interval(beacon.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            // Closed also means the server is going away
            _ = shutdown.recv() => break Ok(()),

            _ = ticker.tick() => {
                if let Err(e) = send_payload(&mut writer, &beacon.payload).await {
                    break Err(e);
                }
                registry.record_send(session);
                trace!(session, len = beacon.payload.len(), "Sent payload");
            }

            res = reader.read_buf(&mut buffer), if reading => match res {
                Ok(0) => {
                    debug!(session, "Client closed its sending side");
                    reading = false;
                    registry.set_state(session, ConnState::HalfClosed);
                }
                Ok(_) => {
                    trace!(session, len = buffer.len(), "Received echo");
                    let delta = verifier.feed(&buffer);
                    registry.record_echo(session, delta.complete);
                    if delta.mismatched > 0 {
                        warn!(
                            session,
                            mismatched = delta.mismatched,
                            "Echoed bytes do not match payload"
                        );
                    }
                    buffer.clear();
                }
                Err(e) => {
                    // Writes decide whether the session is over
                    debug!(session, error = %e, "Read failed, no longer reading");
                    reading = false;
                    registry.set_state(session, ConnState::HalfClosed);
                }
            },
        }
    };

    let echo = verifier.totals();
    debug!(
        session,
        stopped = result.is_ok(),
        echo_matched = echo.matched,
        echo_mismatched = echo.mismatched,
        echo_payloads = echo.complete,
        "Session finished"
    );

    result.map_err(Into::into).map(|()| SessionOutcome {
        half_closed: !reading,
        echo,
    })
}

async fn send_payload<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(payload).await?;
    writer.flush().await
}
