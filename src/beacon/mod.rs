//! Beacon protocol implementation.
//!
//! The server speaks first and never stops:
//! - On connect, the server writes the payload immediately
//! - Afterwards it writes the payload once per interval until the client
//!   goes away or the server shuts down
//!
//! There is no framing and no length prefix. Whatever the client sends back
//! is read and checked against the payload stream, so a device that echoes
//! its input can be validated end-to-end.
//!
//! ## Protocol Format
//!
//! ```text
//! t=0s   Server: t321t
//! t=1s   Server: t321t
//! t=2s   Server: t321t
//!        Client (optional echo): t321tt321t...
//! ```

pub mod handler;
pub mod verify;

pub use handler::handle_connection;

use crate::config::Config;
use bytes::Bytes;
use std::time::Duration;

/// What a handler sends and how often.
#[derive(Debug, Clone)]
pub struct Beacon {
    pub payload: Bytes,
    pub interval: Duration,
}

impl Beacon {
    pub fn new(payload: impl Into<Bytes>, interval: Duration) -> Self {
        Self {
            payload: payload.into(),
            interval,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.payload.clone(), config.interval)
    }
}
