//! Registry of live beacon sessions.
//!
//! Each accepted connection gets a slab slot holding its metadata. The socket
//! itself stays owned by the handler task; the registry only records who is
//! connected and how many payloads they have been sent.

use slab::Slab;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Sending payloads and reading echoes.
    Connected,
    /// The client closed its sending side; payloads are still sent.
    HalfClosed,
}

/// Metadata for a single client session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Remote address of the client.
    pub peer: SocketAddr,
    /// When the connection was accepted.
    pub connected_at: Instant,
    /// Payloads written to this client so far.
    pub payloads_sent: u64,
    /// Whole payloads the client has echoed back.
    pub echoed_payloads: u64,
    pub state: ConnState,
}

impl SessionInfo {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            connected_at: Instant::now(),
            payloads_sent: 0,
            echoed_payloads: 0,
            state: ConnState::Connected,
        }
    }

    /// Time since the session was accepted.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Totals reported when the server shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySummary {
    pub active: usize,
    pub served: u64,
    pub payloads_sent: u64,
    pub echoed_payloads: u64,
}

/// Registry of active sessions using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    sessions: Mutex<Slab<SessionInfo>>,
    served: AtomicU64,
    payloads_sent: AtomicU64,
    echoed_payloads: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a new registry sized for the expected number of clients.
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(Slab::with_capacity(capacity)),
            served: AtomicU64::new(0),
            payloads_sent: AtomicU64::new(0),
            echoed_payloads: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab<SessionInfo>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a newly accepted connection, returning its session id.
    pub fn register(&self, peer: SocketAddr) -> usize {
        self.served.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(SessionInfo::new(peer))
    }

    /// Count one payload written to the given session.
    pub fn record_send(&self, id: usize) {
        self.payloads_sent.fetch_add(1, Ordering::Relaxed);
        if let Some(session) = self.lock().get_mut(id) {
            session.payloads_sent += 1;
        }
    }

    /// Count whole payloads echoed back by the given session.
    pub fn record_echo(&self, id: usize, payloads: u64) {
        if payloads == 0 {
            return;
        }
        self.echoed_payloads.fetch_add(payloads, Ordering::Relaxed);
        if let Some(session) = self.lock().get_mut(id) {
            session.echoed_payloads += payloads;
        }
    }

    pub fn set_state(&self, id: usize, state: ConnState) {
        if let Some(session) = self.lock().get_mut(id) {
            session.state = state;
        }
    }

    /// Release a session slot.
    pub fn remove(&self, id: usize) -> Option<SessionInfo> {
        let mut sessions = self.lock();
        if sessions.contains(id) {
            Some(sessions.remove(id))
        } else {
            None
        }
    }

    /// Snapshot of a single session.
    #[cfg(test)]
    pub fn get(&self, id: usize) -> Option<SessionInfo> {
        self.lock().get(id).cloned()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if there are no live sessions.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn summary(&self) -> RegistrySummary {
        RegistrySummary {
            active: self.len(),
            served: self.served.load(Ordering::Relaxed),
            payloads_sent: self.payloads_sent.load(Ordering::Relaxed),
            echoed_payloads: self.echoed_payloads.load(Ordering::Relaxed),
        }
    }
}
