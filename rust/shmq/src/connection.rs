//! Accepted client connections.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use shm_primitives::ChannelKind;

/// Host-assigned id of one accepted connection. Never reused within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One client's private channel as seen by the host.
#[derive(Debug)]
pub(crate) struct Connection {
    id: ConnectionId,
    channel: OwnedFd,
    kind: ChannelKind,
    /// Address the client's `Hello` came from.
    remote: PathBuf,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, channel: OwnedFd, kind: ChannelKind, remote: PathBuf) -> Self {
        Self {
            id,
            channel,
            kind,
            remote,
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub(crate) fn channel(&self) -> BorrowedFd<'_> {
        self.channel.as_fd()
    }

    #[inline]
    pub(crate) fn kind(&self) -> ChannelKind {
        self.kind
    }

    #[inline]
    pub(crate) fn remote(&self) -> &Path {
        &self.remote
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Live connections keyed by id. The lock only guards the map; I/O happens on
/// `Arc` clones taken out of it.
#[derive(Debug, Default)]
pub(crate) struct ConnectionTable {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl ConnectionTable {
    pub(crate) fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert unless the table already holds `limit` connections.
    pub(crate) fn try_insert(
        &self,
        connection: Connection,
        limit: usize,
    ) -> Result<Arc<Connection>, Connection> {
        let mut connections = self.connections.lock();
        if connections.len() >= limit {
            return Err(connection);
        }
        let connection = Arc::new(connection);
        connections.insert(connection.id(), connection.clone());
        Ok(connection)
    }

    pub(crate) fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.lock().remove(&id);
        if let Some(connection) = &removed {
            connection.mark_closed();
        }
        removed
    }

    /// Drain every connection, for shutdown.
    pub(crate) fn take_all(&self) -> Vec<Arc<Connection>> {
        let drained: Vec<_> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in &drained {
            connection.mark_closed();
        }
        drained
    }

    /// Current connections in id order, so polling is fair and repeatable.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<_> = self.connections.lock().values().cloned().collect();
        connections.sort_by_key(|c| c.id());
        connections
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.lock().len()
    }
}
