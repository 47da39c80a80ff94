use std::io;

use shmq_wire::{DecodeError, ErrorCode, MessageKind, SegmentId};

/// Failure of a registry operation. Reported to the requesting client, never
/// fatal to the host.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("out of resources: {0}")]
    OutOfResources(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("invalid segment size {0}")]
    InvalidSize(u64),

    #[error("unknown segment id {0}")]
    UnknownSegmentId(SegmentId),
}

impl RegistryError {
    /// Wire code sent back in an `ErrorReply`.
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::OutOfResources(_) => ErrorCode::OutOfResources,
            RegistryError::InvalidHandle(_) => ErrorCode::InvalidHandle,
            RegistryError::InvalidSize(_) => ErrorCode::InvalidSize,
            RegistryError::UnknownSegmentId(_) => ErrorCode::UnknownSegmentId,
        }
    }
}

/// The queue could not be set up. Everything after construction is per-request
/// and handled inside `poll_once`.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to bind a rendezvous socket in {}: {source}", dir.display())]
    Bind {
        /// Directory the rendezvous socket was to be created in.
        dir: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Client-side failure.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("host refused the connection")]
    ConnectionRefused,

    #[error("timed out waiting for the host")]
    Timeout,

    #[error("shared memory allocation failed: {0}")]
    AllocationFailed(String),

    #[error("host rejected the request: {0}")]
    Rejected(ErrorCode),

    #[error("expected {expected} reply, got {got}")]
    UnexpectedReply {
        expected: MessageKind,
        got: MessageKind,
    },

    #[error("undecodable reply: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
