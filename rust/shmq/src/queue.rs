//! The host-side message dispatcher.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use shm_primitives::fdpass::{self, Received};
use shmq_wire::{MAX_HANDLES, MAX_MESSAGE_LEN, Message, UpdateRegion};

use crate::config::QueueConfig;
use crate::connection::{Connection, ConnectionId, ConnectionTable};
use crate::error::QueueError;
use crate::handshake::{self, HelloRequest, RawHello, Rendezvous};
use crate::hook::{RegionUpdate, RejectAllUpdates, UpdateHook};
use crate::registry::SegmentRegistry;
use crate::stats::{QueueStats, StatsSnapshot};

/// Why a connection is being torn down.
#[derive(Debug)]
enum Teardown {
    PeerClosed,
    Recv(io::Error),
    Send(io::Error),
}

/// Host end of the queue: a rendezvous socket plus every accepted connection.
///
/// Driven by an external run loop calling [`poll_once`](Self::poll_once).
/// Nothing here blocks: all sockets are read and written non-blocking, and a
/// client that stops draining its replies is disconnected rather than waited
/// for.
pub struct MessageQueue {
    config: QueueConfig,
    rendezvous: Rendezvous,
    registry: Arc<SegmentRegistry>,
    hook: Arc<dyn UpdateHook>,
    connections: ConnectionTable,
    stats: QueueStats,
    /// Keeps per-connection request order when several threads poll.
    poll_guard: Mutex<()>,
}

impl MessageQueue {
    /// Bind the rendezvous socket and start accepting handshakes.
    pub fn new(
        config: QueueConfig,
        registry: Arc<SegmentRegistry>,
        hook: Arc<dyn UpdateHook>,
    ) -> Result<Self, QueueError> {
        let rendezvous = Rendezvous::bind(&config.socket_dir, &config.socket_prefix).map_err(
            |source| QueueError::Bind {
                dir: config.socket_dir.clone(),
                source,
            },
        )?;
        tracing::info!(
            address = %rendezvous.address().display(),
            max_connections = config.max_connections,
            "message queue listening"
        );

        Ok(Self {
            config,
            rendezvous,
            registry,
            hook,
            connections: ConnectionTable::default(),
            stats: QueueStats::default(),
            poll_guard: Mutex::new(()),
        })
    }

    /// A queue with its own registry (sized from `config`) and no update
    /// consumer.
    pub fn with_defaults(config: QueueConfig) -> Result<Self, QueueError> {
        let registry = Arc::new(SegmentRegistry::new(config.registry_limits()));
        Self::new(config, registry, Arc::new(RejectAllUpdates))
    }

    /// The address clients pass to [`Client::connect`](crate::Client::connect).
    pub fn get_rendezvous_address(&self) -> &Path {
        self.rendezvous.address()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SegmentRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Ids of the live connections, ascending.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.snapshot().iter().map(|c| c.id()).collect()
    }

    /// Service every pending datagram without blocking.
    ///
    /// Reads up to `max_messages_per_poll` datagrams from the rendezvous
    /// socket and from each connection, answering each request on the
    /// connection it arrived on. Returns `true` if any datagram was consumed,
    /// including ones dropped as malformed. Returns `false` immediately if
    /// another thread is already polling.
    pub fn poll_once(&self) -> bool {
        let Some(_guard) = self.poll_guard.try_lock() else {
            return false;
        };

        let mut processed = self.poll_rendezvous();
        let mut dead = Vec::new();

        for connection in self.connections.snapshot() {
            let (handled, teardown) = self.poll_connection(&connection);
            processed |= handled > 0;
            if let Some(reason) = teardown {
                dead.push((connection.id(), reason));
            } else if connection.is_closed() {
                // Closed by another thread while requests were in flight.
                self.registry.release_owned_by(connection.id());
            }
        }

        for (id, reason) in dead {
            self.teardown(id, reason);
        }

        processed
    }

    /// Drop a connection and release every segment it owns. Returns `false`
    /// if `id` is not live.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        let Some(connection) = self.connections.remove(id) else {
            return false;
        };
        let released = self.registry.release_owned_by(id);
        self.stats.connection_closed();
        tracing::info!(connection = %id, remote = %connection.remote().display(), released, "connection closed by host");
        true
    }

    fn poll_rendezvous(&self) -> bool {
        let mut processed = false;
        for _ in 0..self.config.max_messages_per_poll {
            let raw = match self.rendezvous.try_recv() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "rendezvous receive failed");
                    break;
                }
            };
            processed = true;
            self.handle_hello(raw);
        }
        processed
    }

    fn handle_hello(&self, raw: RawHello) {
        let HelloRequest {
            channel,
            kind,
            reply_to,
        } = match handshake::accept(raw) {
            Ok(hello) => hello,
            Err(e) => {
                self.stats.handshake_refused();
                tracing::warn!(error = %e, "refusing handshake");
                return;
            }
        };

        let id = self.connections.next_id();
        let connection = Connection::new(id, channel, kind, reply_to);
        let connection = match self
            .connections
            .try_insert(connection, self.config.max_connections)
        {
            Ok(connection) => connection,
            Err(refused) => {
                self.stats.handshake_refused();
                tracing::warn!(
                    remote = %refused.remote().display(),
                    max_connections = self.config.max_connections,
                    "refusing handshake: connection limit reached"
                );
                if let Err(e) = self.rendezvous.acknowledge(refused.remote(), false) {
                    tracing::debug!(error = %e, "could not deliver handshake refusal");
                }
                return;
            }
        };

        if let Err(e) = self.rendezvous.acknowledge(connection.remote(), true) {
            self.connections.remove(id);
            self.stats.handshake_refused();
            tracing::warn!(connection = %id, error = %e, "handshake acknowledgment failed");
            return;
        }

        self.stats.handshake_accepted();
        tracing::info!(
            connection = %id,
            remote = %connection.remote().display(),
            channel = ?connection.kind(),
            "connection accepted"
        );
    }

    fn poll_connection(&self, connection: &Connection) -> (usize, Option<Teardown>) {
        let mut handled = 0;

        for _ in 0..self.config.max_messages_per_poll {
            if connection.is_closed() {
                break;
            }

            let mut buf = [0u8; MAX_MESSAGE_LEN + 1];
            let received = match fdpass::recv_with_fds(
                connection.channel(),
                &mut buf,
                MAX_HANDLES + 1,
                true,
            ) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return (handled, Some(Teardown::Recv(e))),
            };

            if received.len == 0 && received.fds.is_empty() && connection.kind().reports_eof() {
                return (handled, Some(Teardown::PeerClosed));
            }

            handled += 1;
            if let Err(e) = self.handle_datagram(connection, &buf, received) {
                return (handled, Some(Teardown::Send(e)));
            }
        }

        (handled, None)
    }

    /// Decode, dispatch and answer one datagram. Only a failed reply is an
    /// error; everything wrong with the datagram itself is logged and dropped.
    fn handle_datagram(
        &self,
        connection: &Connection,
        buf: &[u8],
        received: Received,
    ) -> io::Result<()> {
        let id = connection.id();

        if received.truncated {
            self.stats.malformed_dropped();
            tracing::warn!(connection = %id, "dropping oversized datagram");
            return Ok(());
        }

        let bytes = &buf[..received.len];
        let message = match shmq_wire::decode(bytes, received.fds) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed_dropped();
                tracing::warn!(connection = %id, len = bytes.len(), error = %e, "dropping undecodable datagram");
                return Ok(());
            }
        };

        let kind = message.kind();
        let Some(reply) = self.dispatch(id, message) else {
            self.stats.malformed_dropped();
            tracing::warn!(connection = %id, kind = %kind, "dropping unexpected message on channel");
            return Ok(());
        };

        tracing::debug!(connection = %id, request = %kind, reply = %reply.kind(), "handled request");
        send_reply(connection.channel(), reply)?;
        self.stats.message_handled();
        Ok(())
    }

    /// Run one request. `None` for messages that are not requests a channel
    /// may carry.
    fn dispatch(&self, owner: ConnectionId, message: Message<OwnedFd>) -> Option<Message<OwnedFd>> {
        let kind = message.kind();
        let reply = match message {
            Message::AllocateSharedMemory { size } => match self.registry.allocate(size, owner) {
                Ok((segment_id, handle)) => Message::AllocateSharedMemoryReply {
                    segment_id,
                    size,
                    handle,
                },
                Err(e) => {
                    tracing::warn!(connection = %owner, size, error = %e, "allocation failed");
                    Message::ErrorReply {
                        request: kind,
                        code: e.code(),
                    }
                }
            },
            Message::RegisterSharedMemory { size, handle } => {
                match self.registry.register_external(handle, size, owner) {
                    Ok(segment_id) => Message::RegisterSharedMemoryReply { segment_id },
                    Err(e) => {
                        tracing::warn!(connection = %owner, size, error = %e, "registration failed");
                        Message::ErrorReply {
                            request: kind,
                            code: e.code(),
                        }
                    }
                }
            }
            Message::UnregisterSharedMemory { segment_id } => {
                let ok = self.registry.release_owned(segment_id, owner);
                if !ok {
                    tracing::warn!(connection = %owner, segment = %segment_id, "unregister of unknown segment");
                }
                Message::UnregisterSharedMemoryReply { ok }
            }
            Message::UpdateRegion(update) => Message::UpdateRegionReply {
                ok: self.update_region(owner, update),
            },
            Message::Hello { .. }
            | Message::HelloReply { .. }
            | Message::AllocateSharedMemoryReply { .. }
            | Message::RegisterSharedMemoryReply { .. }
            | Message::UnregisterSharedMemoryReply { .. }
            | Message::UpdateRegionReply { .. }
            | Message::ErrorReply { .. } => return None,
        };
        Some(reply)
    }

    fn update_region(&self, owner: ConnectionId, update: UpdateRegion) -> bool {
        let UpdateRegion {
            target_id,
            level,
            segment_id,
            offset,
            count,
        } = update;

        let Some(entry) = self.registry.lookup_owned(segment_id, owner) else {
            tracing::warn!(connection = %owner, segment = %segment_id, "update of unknown segment");
            return false;
        };
        let Some(bytes) = entry.bytes(offset, count) else {
            tracing::warn!(
                connection = %owner,
                segment = %segment_id,
                offset,
                count,
                size = entry.size(),
                "update out of bounds"
            );
            return false;
        };

        let ok = self.hook.apply_update(RegionUpdate {
            target_id,
            level,
            segment_id,
            offset,
            bytes,
        });
        if !ok {
            tracing::warn!(connection = %owner, target_id, level, segment = %segment_id, "update rejected by consumer");
        }
        ok
    }

    fn teardown(&self, id: ConnectionId, reason: Teardown) {
        let Some(connection) = self.connections.remove(id) else {
            return;
        };
        let released = self.registry.release_owned_by(id);
        self.stats.connection_closed();

        let remote = connection.remote().display();
        match reason {
            Teardown::PeerClosed => {
                tracing::info!(connection = %id, %remote, released, "connection closed by peer");
            }
            Teardown::Recv(e) => {
                tracing::error!(connection = %id, %remote, released, error = %e, "receive failed, closing connection");
            }
            Teardown::Send(e) => {
                tracing::error!(connection = %id, %remote, released, error = %e, "reply failed, closing connection");
            }
        }
    }
}

fn send_reply(channel: BorrowedFd<'_>, reply: Message<OwnedFd>) -> io::Result<()> {
    let (bytes, handles) = shmq_wire::encode(reply);
    let borrowed: Vec<BorrowedFd<'_>> = handles.iter().map(|fd| fd.as_fd()).collect();
    fdpass::send_with_fds(channel, &bytes, &borrowed, None)?;
    // `handles` drops here: the client now holds the only transferred copy.
    Ok(())
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        for connection in self.connections.take_all() {
            self.registry.release_owned_by(connection.id());
        }
        tracing::debug!(address = %self.rendezvous.address().display(), "message queue shut down");
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("address", &self.rendezvous.address())
            .field("connections", &self.connections.len())
            .field("segments", &self.registry.len())
            .finish_non_exhaustive()
    }
}
