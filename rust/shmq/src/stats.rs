//! Counters for the host's metrics collaborator.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct QueueStats {
    messages_handled: AtomicU64,
    malformed_dropped: AtomicU64,
    handshakes_accepted: AtomicU64,
    handshakes_refused: AtomicU64,
    connections_closed: AtomicU64,
}

/// Point-in-time copy of the queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Requests decoded and answered.
    pub messages_handled: u64,
    /// Datagrams dropped because they failed to decode.
    pub malformed_dropped: u64,
    pub handshakes_accepted: u64,
    /// Handshakes dropped for a malformed `Hello` or refused at capacity.
    pub handshakes_refused: u64,
    pub connections_closed: u64,
}

impl QueueStats {
    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            handshakes_accepted: self.handshakes_accepted.load(Ordering::Relaxed),
            handshakes_refused: self.handshakes_refused.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn message_handled(&self) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn malformed_dropped(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handshake_accepted(&self) {
        self.handshakes_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handshake_refused(&self) {
        self.handshakes_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}
