//! Rendezvous socket and the `Hello` handshake.
//!
//! The host binds one unconnected datagram socket at a well-known path. A
//! client creates a socket pair, keeps one end, and sends the other end to the
//! rendezvous address inside a `Hello`. The host adopts that end as the
//! connection's private channel and acknowledges from the rendezvous socket
//! to the client's own bound address. No traffic flows on the private channel
//! before the acknowledgment is sent.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use shm_primitives::fdpass::{self, ChannelKind, Received};
use shmq_wire::{DecodeError, MAX_HANDLES, MAX_MESSAGE_LEN, Message, MessageKind};

static RENDEZVOUS_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Attempts at finding an unused rendezvous path before giving up.
const BIND_ATTEMPTS: usize = 16;

/// The host's well-known datagram endpoint. The socket file is removed on
/// drop.
#[derive(Debug)]
pub struct Rendezvous {
    socket: UnixDatagram,
    path: PathBuf,
}

impl Rendezvous {
    /// Bind a fresh `<dir>/<prefix>-<pid>-<n>.sock`, non-blocking.
    pub fn bind(dir: &Path, prefix: &str) -> io::Result<Self> {
        let pid = std::process::id();
        let mut last_err = None;

        for _ in 0..BIND_ATTEMPTS {
            let n = RENDEZVOUS_COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = dir.join(format!("{prefix}-{pid}-{n}.sock"));
            match UnixDatagram::bind(&path) {
                Ok(socket) => {
                    socket.set_nonblocking(true)?;
                    tracing::debug!(path = %path.display(), "bound rendezvous socket");
                    return Ok(Self { socket, path });
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrInUse)))
    }

    pub fn address(&self) -> &Path {
        &self.path
    }

    /// Take one pending datagram, if any. `None` only when the socket is
    /// empty.
    pub(crate) fn try_recv(&self) -> io::Result<Option<RawHello>> {
        let mut buf = [0u8; MAX_MESSAGE_LEN + 1];
        loop {
            match fdpass::recv_with_fds(self.socket.as_fd(), &mut buf, MAX_HANDLES + 1, true) {
                Ok(received) => {
                    return Ok(Some(RawHello {
                        bytes: buf[..received.len.min(MAX_MESSAGE_LEN)].to_vec(),
                        received,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Send `HelloReply { ok }` to a client's bound address.
    pub(crate) fn acknowledge(&self, to: &Path, ok: bool) -> io::Result<()> {
        let (bytes, _) = shmq_wire::encode::<OwnedFd>(Message::HelloReply { ok });
        fdpass::send_with_fds(self.socket.as_fd(), &bytes, &[], Some(to))?;
        Ok(())
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "failed to remove rendezvous socket");
        }
    }
}

/// A datagram read from the rendezvous socket, not yet validated.
#[derive(Debug)]
pub(crate) struct RawHello {
    bytes: Vec<u8>,
    received: Received,
}

/// A validated `Hello`.
#[derive(Debug)]
pub(crate) struct HelloRequest {
    /// The client's end of its private channel, now non-blocking.
    pub channel: OwnedFd,
    pub kind: ChannelKind,
    /// Where to send the acknowledgment.
    pub reply_to: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HandshakeError {
    #[error("hello datagram truncated")]
    Truncated,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("expected Hello on the rendezvous socket, got {0}")]
    NotHello(MessageKind),

    #[error("hello sender has no filesystem address to acknowledge")]
    Unaddressable,

    #[error("hello handle is not a usable channel: {0}")]
    BadChannel(io::Error),
}

/// Validate a rendezvous datagram.
///
/// On any error every handle that came with the datagram is closed and no
/// acknowledgment must be sent.
pub(crate) fn accept(raw: RawHello) -> Result<HelloRequest, HandshakeError> {
    let RawHello { bytes, received } = raw;
    if received.truncated {
        return Err(HandshakeError::Truncated);
    }

    let reply_to = received.from;
    let message = shmq_wire::decode(&bytes, received.fds)?;
    let Message::Hello { channel } = message else {
        return Err(HandshakeError::NotHello(message.kind()));
    };
    let reply_to = reply_to.ok_or(HandshakeError::Unaddressable)?;

    let kind = fdpass::channel_kind(channel.as_fd()).map_err(HandshakeError::BadChannel)?;
    fdpass::set_nonblocking(channel.as_fd(), true).map_err(HandshakeError::BadChannel)?;

    Ok(HelloRequest {
        channel,
        kind,
        reply_to,
    })
}
