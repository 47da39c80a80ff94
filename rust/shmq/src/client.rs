//! Client side of the queue: handshake plus blocking request/reply calls.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::time::Instant;

use shm_primitives::fdpass::{self, ChannelKind};
use shm_primitives::{MmapRegion, ShmObject};
use shmq_wire::{MAX_HANDLES, MAX_MESSAGE_LEN, Message, MessageKind, SegmentId, UpdateRegion};

use crate::config::ClientConfig;
use crate::error::ClientError;

/// A connection to a host's [`MessageQueue`](crate::MessageQueue).
///
/// Calls take `&mut self`: each one sends a request and blocks until the
/// matching reply arrives or `reply_timeout` elapses.
#[derive(Debug)]
pub struct Client {
    channel: OwnedFd,
    kind: ChannelKind,
    config: ClientConfig,
    /// Requests that timed out. Their replies arrive ahead of any later
    /// reply and are discarded.
    stale_replies: usize,
}

impl Client {
    /// Perform the handshake with the host listening at `address`.
    pub fn connect(address: &Path, config: ClientConfig) -> Result<Self, ClientError> {
        // The acknowledgment is addressed to a socket of our own.
        let ack_dir = tempfile::Builder::new().prefix("shmq-client-").tempdir()?;
        let ack = UnixDatagram::bind(ack_dir.path().join("ack.sock"))?;

        let kind = ChannelKind::preferred();
        let (channel, host_end) = fdpass::socketpair(kind)?;

        let (bytes, fds) = shmq_wire::encode(Message::Hello {
            channel: host_end.as_fd(),
        });
        match fdpass::send_with_fds(ack.as_fd(), &bytes, &fds, Some(address)) {
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                tracing::debug!(address = %address.display(), error = %e, "no host at rendezvous address");
                return Err(ClientError::ConnectionRefused);
            }
            Err(e) => return Err(e.into()),
        }
        drop(host_end);

        if !fdpass::wait_readable(ack.as_fd(), Some(config.reply_timeout))? {
            return Err(ClientError::Timeout);
        }
        let mut buf = [0u8; MAX_MESSAGE_LEN + 1];
        let received = fdpass::recv_with_fds(ack.as_fd(), &mut buf, MAX_HANDLES, false)?;
        if received.truncated {
            return Err(oversized_reply());
        }
        match shmq_wire::decode(&buf[..received.len], received.fds)? {
            Message::HelloReply { ok: true } => {}
            Message::HelloReply { ok: false } => return Err(ClientError::ConnectionRefused),
            other => {
                return Err(ClientError::UnexpectedReply {
                    expected: MessageKind::HelloReply,
                    got: other.kind(),
                });
            }
        }

        tracing::debug!(address = %address.display(), channel = ?kind, "connected");
        Ok(Self {
            channel,
            kind,
            config,
            stale_replies: 0,
        })
    }

    /// Ask the host for a fresh segment of `size` bytes and map it.
    pub fn allocate_shared_memory(&mut self, size: u64) -> Result<MappedSegment, ClientError> {
        let reply = self.call(Message::AllocateSharedMemory { size })?;
        let (id, granted, handle) = match reply {
            Message::AllocateSharedMemoryReply {
                segment_id,
                size,
                handle,
            } => (segment_id, size, handle),
            Message::ErrorReply { code, .. } => {
                return Err(ClientError::AllocationFailed(format!("host replied {code}")));
            }
            other => return Err(unexpected(MessageKind::AllocateSharedMemory, &other)),
        };

        if granted < size {
            return Err(ClientError::AllocationFailed(format!(
                "host granted {granted} of {size} bytes"
            )));
        }
        let object = ShmObject::from_fd(handle, granted)
            .map_err(|e| ClientError::AllocationFailed(format!("bad handle from host: {e}")))?;
        let mapping = object
            .map()
            .map_err(|e| ClientError::AllocationFailed(format!("map {granted} bytes: {e}")))?;

        Ok(MappedSegment {
            id,
            mapping,
            object,
        })
    }

    /// Register memory the client already has. The client keeps `handle`; the
    /// host gets its own duplicate.
    pub fn register_shared_memory(
        &mut self,
        handle: &impl AsFd,
        size: u64,
    ) -> Result<SegmentId, ClientError> {
        let reply = self.call(Message::RegisterSharedMemory {
            size,
            handle: handle.as_fd(),
        })?;
        match reply {
            Message::RegisterSharedMemoryReply { segment_id } => Ok(segment_id),
            Message::ErrorReply { code, .. } => Err(ClientError::Rejected(code)),
            other => Err(unexpected(MessageKind::RegisterSharedMemory, &other)),
        }
    }

    /// Returns `false` if the host does not know `id` (already unregistered,
    /// never existed, or owned by another connection).
    pub fn unregister_shared_memory(&mut self, id: SegmentId) -> Result<bool, ClientError> {
        match self.call(Message::UnregisterSharedMemory { segment_id: id })? {
            Message::UnregisterSharedMemoryReply { ok } => Ok(ok),
            Message::ErrorReply { code, .. } => Err(ClientError::Rejected(code)),
            other => Err(unexpected(MessageKind::UnregisterSharedMemory, &other)),
        }
    }

    /// Ask the host to consume `[offset, offset + count)` of segment `id`.
    ///
    /// Returns `false` for unknown segments, out-of-bounds windows, and
    /// updates the host's consumer rejected.
    pub fn request_update(
        &mut self,
        target_id: u32,
        level: u32,
        id: SegmentId,
        offset: u64,
        count: u64,
    ) -> Result<bool, ClientError> {
        let request = Message::UpdateRegion(UpdateRegion {
            target_id,
            level,
            segment_id: id,
            offset,
            count,
        });
        match self.call(request)? {
            Message::UpdateRegionReply { ok } => Ok(ok),
            Message::ErrorReply { code, .. } => Err(ClientError::Rejected(code)),
            other => Err(unexpected(MessageKind::UpdateRegion, &other)),
        }
    }

    /// Which socket type the private channel uses.
    pub fn channel_kind(&self) -> ChannelKind {
        self.kind
    }

    /// Send one request and wait for its reply: the success reply kind, or an
    /// `ErrorReply` naming this request.
    fn call(&mut self, request: Message<BorrowedFd<'_>>) -> Result<Message<OwnedFd>, ClientError> {
        let kind = request.kind();
        let (bytes, fds) = shmq_wire::encode(request);
        fdpass::send_with_fds(self.channel.as_fd(), &bytes, &fds, None)?;

        let deadline = Instant::now() + self.config.reply_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !fdpass::wait_readable(self.channel.as_fd(), Some(remaining))? {
                self.stale_replies += 1;
                return Err(ClientError::Timeout);
            }

            let mut buf = [0u8; MAX_MESSAGE_LEN + 1];
            let received = match fdpass::recv_with_fds(
                self.channel.as_fd(),
                &mut buf,
                MAX_HANDLES + 1,
                true,
            ) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if received.len == 0 && received.fds.is_empty() && self.kind.reports_eof() {
                return Err(ClientError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "host closed the channel",
                )));
            }
            // The host answers in request order, so the oldest outstanding
            // replies belong to timed-out requests whatever their kind.
            if self.stale_replies > 0 {
                self.stale_replies -= 1;
                tracing::debug!(request = %kind, len = received.len, "skipping reply to a timed-out request");
                continue;
            }
            if received.truncated {
                return Err(oversized_reply());
            }

            let reply = shmq_wire::decode(&buf[..received.len], received.fds)?;
            let answers = Some(reply.kind()) == kind.reply_kind()
                || matches!(reply, Message::ErrorReply { request, .. } if request == kind);
            if answers {
                return Ok(reply);
            }
            return Err(unexpected(kind, &reply));
        }
    }
}

fn unexpected(request: MessageKind, got: &Message<OwnedFd>) -> ClientError {
    ClientError::UnexpectedReply {
        expected: request.reply_kind().unwrap_or(MessageKind::ErrorReply),
        got: got.kind(),
    }
}

fn oversized_reply() -> ClientError {
    ClientError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        "reply datagram larger than any message",
    ))
}

/// A host-allocated segment mapped into this process.
#[derive(Debug)]
pub struct MappedSegment {
    id: SegmentId,
    mapping: MmapRegion,
    object: ShmObject,
}

impl MappedSegment {
    #[inline]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.mapping.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mapping.as_mut_slice()
    }
}

impl AsFd for MappedSegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.object.as_fd()
    }
}
