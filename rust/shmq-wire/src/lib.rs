//! Wire format for the shmq shared-memory queue.
//!
//! Every message is one datagram: a little-endian `kind: u32` tag followed by
//! a fixed sequence of little-endian integer fields, plus zero or more OS
//! handles carried out of band. The byte length and the handle count are
//! fully determined by the tag, and [`decode`] rejects anything else.
//!
//! ```text
//! tag   kind                         payload after tag                         bytes handles
//! 0x01  Hello                        -                                             4  1
//! 0x02  AllocateSharedMemory         size u64                                     12  0
//! 0x03  RegisterSharedMemory         size u64                                     12  1
//! 0x04  UnregisterSharedMemory       segment_id u32                                8  0
//! 0x05  UpdateRegion                 target u32, level u32, segment_id u32,
//!                                    offset u64, count u64                        32  0
//! 0x81  HelloReply                   ok bool                                       8  0
//! 0x82  AllocateSharedMemoryReply    segment_id u32, size u64                     16  1
//! 0x83  RegisterSharedMemoryReply    segment_id u32                                8  0
//! 0x84  UnregisterSharedMemoryReply  ok bool                                       8  0
//! 0x85  UpdateRegionReply            ok bool                                       8  0
//! 0xFF  ErrorReply                   request kind u32, code u32                   12  0
//! ```
//!
//! Booleans are `u32` holding exactly 0 or 1. The codec is generic over the
//! handle type so it stays free of I/O: the transport decides what a handle
//! is (an `OwnedFd`, a `BorrowedFd`, or `()` when fuzzing).

use std::fmt;

/// Largest encoded message, in bytes.
pub const MAX_MESSAGE_LEN: usize = 32;

/// Largest number of handles any message carries.
pub const MAX_HANDLES: usize = 1;

const TAG_LEN: usize = 4;

/// Host-assigned identifier of one shared-memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(pub u32);

impl SegmentId {
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Hello = 0x01,
    AllocateSharedMemory = 0x02,
    RegisterSharedMemory = 0x03,
    UnregisterSharedMemory = 0x04,
    UpdateRegion = 0x05,
    HelloReply = 0x81,
    AllocateSharedMemoryReply = 0x82,
    RegisterSharedMemoryReply = 0x83,
    UnregisterSharedMemoryReply = 0x84,
    UpdateRegionReply = 0x85,
    ErrorReply = 0xFF,
}

impl MessageKind {
    pub const ALL: [MessageKind; 11] = [
        MessageKind::Hello,
        MessageKind::AllocateSharedMemory,
        MessageKind::RegisterSharedMemory,
        MessageKind::UnregisterSharedMemory,
        MessageKind::UpdateRegion,
        MessageKind::HelloReply,
        MessageKind::AllocateSharedMemoryReply,
        MessageKind::RegisterSharedMemoryReply,
        MessageKind::UnregisterSharedMemoryReply,
        MessageKind::UpdateRegionReply,
        MessageKind::ErrorReply,
    ];

    #[inline]
    pub const fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Exact encoded length in bytes, tag included.
    pub const fn wire_len(self) -> usize {
        match self {
            MessageKind::Hello => 4,
            MessageKind::AllocateSharedMemory | MessageKind::RegisterSharedMemory => 12,
            MessageKind::UnregisterSharedMemory => 8,
            MessageKind::UpdateRegion => 32,
            MessageKind::HelloReply
            | MessageKind::RegisterSharedMemoryReply
            | MessageKind::UnregisterSharedMemoryReply
            | MessageKind::UpdateRegionReply => 8,
            MessageKind::AllocateSharedMemoryReply => 16,
            MessageKind::ErrorReply => 12,
        }
    }

    /// Exact number of out-of-band handles.
    pub const fn handle_count(self) -> usize {
        match self {
            MessageKind::Hello
            | MessageKind::RegisterSharedMemory
            | MessageKind::AllocateSharedMemoryReply => 1,
            _ => 0,
        }
    }

    /// Requests flow client to host; everything else is a reply.
    pub const fn is_request(self) -> bool {
        (self as u32) < 0x80
    }

    /// The successful reply kind for a request, `None` for replies.
    pub const fn reply_kind(self) -> Option<MessageKind> {
        match self {
            MessageKind::Hello => Some(MessageKind::HelloReply),
            MessageKind::AllocateSharedMemory => Some(MessageKind::AllocateSharedMemoryReply),
            MessageKind::RegisterSharedMemory => Some(MessageKind::RegisterSharedMemoryReply),
            MessageKind::UnregisterSharedMemory => Some(MessageKind::UnregisterSharedMemoryReply),
            MessageKind::UpdateRegion => Some(MessageKind::UpdateRegionReply),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            MessageKind::Hello => "Hello",
            MessageKind::AllocateSharedMemory => "AllocateSharedMemory",
            MessageKind::RegisterSharedMemory => "RegisterSharedMemory",
            MessageKind::UnregisterSharedMemory => "UnregisterSharedMemory",
            MessageKind::UpdateRegion => "UpdateRegion",
            MessageKind::HelloReply => "HelloReply",
            MessageKind::AllocateSharedMemoryReply => "AllocateSharedMemoryReply",
            MessageKind::RegisterSharedMemoryReply => "RegisterSharedMemoryReply",
            MessageKind::UnregisterSharedMemoryReply => "UnregisterSharedMemoryReply",
            MessageKind::UpdateRegionReply => "UpdateRegionReply",
            MessageKind::ErrorReply => "ErrorReply",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed failure carried by [`Message::ErrorReply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// The host could not create or map the segment.
    OutOfResources = 1,
    /// The transferred handle is not a usable shared-memory object.
    InvalidHandle = 2,
    /// No live segment with that id belongs to the caller.
    UnknownSegmentId = 3,
    /// Requested size is zero or above the host's limit.
    InvalidSize = 4,
}

impl ErrorCode {
    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ErrorCode::OutOfResources),
            2 => Some(ErrorCode::InvalidHandle),
            3 => Some(ErrorCode::UnknownSegmentId),
            4 => Some(ErrorCode::InvalidSize),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCode::OutOfResources => "out of resources",
            ErrorCode::InvalidHandle => "invalid handle",
            ErrorCode::UnknownSegmentId => "unknown segment id",
            ErrorCode::InvalidSize => "invalid size",
        })
    }
}

/// Fields of an `UpdateRegion` request.
///
/// ```text
/// [0..4)   kind:       u32 LE = 0x05
/// [4..8)   target_id:  u32 LE
/// [8..12)  level:      u32 LE
/// [12..16) segment_id: u32 LE
/// [16..24) offset:     u64 LE
/// [24..32) count:      u64 LE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRegion {
    /// Opaque id of the object being updated (e.g. a texture).
    pub target_id: u32,
    /// Sub-level index within the target (e.g. a mip level).
    pub level: u32,
    pub segment_id: SegmentId,
    pub offset: u64,
    pub count: u64,
}

/// A decoded message. `H` is the handle type supplied by the transport.
#[derive(Debug, PartialEq, Eq)]
pub enum Message<H> {
    /// Sent to the rendezvous address; `channel` is the client's end of its
    /// private channel.
    Hello { channel: H },
    AllocateSharedMemory { size: u64 },
    RegisterSharedMemory { size: u64, handle: H },
    UnregisterSharedMemory { segment_id: SegmentId },
    UpdateRegion(UpdateRegion),
    HelloReply { ok: bool },
    AllocateSharedMemoryReply { segment_id: SegmentId, size: u64, handle: H },
    RegisterSharedMemoryReply { segment_id: SegmentId },
    UnregisterSharedMemoryReply { ok: bool },
    UpdateRegionReply { ok: bool },
    /// A request of kind `request` failed with `code`.
    ErrorReply { request: MessageKind, code: ErrorCode },
}

impl<H> Message<H> {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello { .. } => MessageKind::Hello,
            Message::AllocateSharedMemory { .. } => MessageKind::AllocateSharedMemory,
            Message::RegisterSharedMemory { .. } => MessageKind::RegisterSharedMemory,
            Message::UnregisterSharedMemory { .. } => MessageKind::UnregisterSharedMemory,
            Message::UpdateRegion(_) => MessageKind::UpdateRegion,
            Message::HelloReply { .. } => MessageKind::HelloReply,
            Message::AllocateSharedMemoryReply { .. } => MessageKind::AllocateSharedMemoryReply,
            Message::RegisterSharedMemoryReply { .. } => MessageKind::RegisterSharedMemoryReply,
            Message::UnregisterSharedMemoryReply { .. } => MessageKind::UnregisterSharedMemoryReply,
            Message::UpdateRegionReply { .. } => MessageKind::UpdateRegionReply,
            Message::ErrorReply { .. } => MessageKind::ErrorReply,
        }
    }

    /// Convert the handle type, e.g. `OwnedFd` to `BorrowedFd` before sending.
    pub fn map_handles<G>(self, mut f: impl FnMut(H) -> G) -> Message<G> {
        match self {
            Message::Hello { channel } => Message::Hello { channel: f(channel) },
            Message::AllocateSharedMemory { size } => Message::AllocateSharedMemory { size },
            Message::RegisterSharedMemory { size, handle } => Message::RegisterSharedMemory {
                size,
                handle: f(handle),
            },
            Message::UnregisterSharedMemory { segment_id } => {
                Message::UnregisterSharedMemory { segment_id }
            }
            Message::UpdateRegion(update) => Message::UpdateRegion(update),
            Message::HelloReply { ok } => Message::HelloReply { ok },
            Message::AllocateSharedMemoryReply {
                segment_id,
                size,
                handle,
            } => Message::AllocateSharedMemoryReply {
                segment_id,
                size,
                handle: f(handle),
            },
            Message::RegisterSharedMemoryReply { segment_id } => {
                Message::RegisterSharedMemoryReply { segment_id }
            }
            Message::UnregisterSharedMemoryReply { ok } => {
                Message::UnregisterSharedMemoryReply { ok }
            }
            Message::UpdateRegionReply { ok } => Message::UpdateRegionReply { ok },
            Message::ErrorReply { request, code } => Message::ErrorReply { request, code },
        }
    }
}

/// Why a datagram was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram of {len} bytes is too short to hold a message kind")]
    Truncated { len: usize },

    #[error("unknown message kind {0:#x}")]
    UnknownMessageKind(u32),

    #[error("malformed {kind} message: {reason}")]
    MalformedMessage {
        kind: MessageKind,
        reason: MalformedReason,
    },
}

impl DecodeError {
    /// True for everything except an unrecognized tag.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, DecodeError::UnknownMessageKind(_))
    }

    /// The tag that was recognized before decoding failed, if any.
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            DecodeError::MalformedMessage { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MalformedReason {
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("expected {expected} handles, got {actual}")]
    HandleCount { expected: usize, actual: usize },

    #[error("boolean field holds {0}")]
    InvalidBool(u32),

    #[error("unknown error code {0}")]
    UnknownErrorCode(u32),

    #[error("{0:#x} is not a request kind")]
    InvalidRequestKind(u32),
}

/// Encode a message into its payload bytes and out-of-band handles.
pub fn encode<H>(message: Message<H>) -> (Vec<u8>, Vec<H>) {
    let kind = message.kind();
    let mut out = Vec::with_capacity(kind.wire_len());
    let mut handles = Vec::with_capacity(kind.handle_count());
    put_u32(&mut out, kind.tag());

    match message {
        Message::Hello { channel } => handles.push(channel),
        Message::AllocateSharedMemory { size } => put_u64(&mut out, size),
        Message::RegisterSharedMemory { size, handle } => {
            put_u64(&mut out, size);
            handles.push(handle);
        }
        Message::UnregisterSharedMemory { segment_id } => put_u32(&mut out, segment_id.0),
        Message::UpdateRegion(update) => {
            put_u32(&mut out, update.target_id);
            put_u32(&mut out, update.level);
            put_u32(&mut out, update.segment_id.0);
            put_u64(&mut out, update.offset);
            put_u64(&mut out, update.count);
        }
        Message::HelloReply { ok }
        | Message::UnregisterSharedMemoryReply { ok }
        | Message::UpdateRegionReply { ok } => put_u32(&mut out, u32::from(ok)),
        Message::AllocateSharedMemoryReply {
            segment_id,
            size,
            handle,
        } => {
            put_u32(&mut out, segment_id.0);
            put_u64(&mut out, size);
            handles.push(handle);
        }
        Message::RegisterSharedMemoryReply { segment_id } => put_u32(&mut out, segment_id.0),
        Message::ErrorReply { request, code } => {
            put_u32(&mut out, request.tag());
            put_u32(&mut out, code.code());
        }
    }

    debug_assert_eq!(out.len(), kind.wire_len());
    debug_assert_eq!(handles.len(), kind.handle_count());
    (out, handles)
}

/// Decode one datagram.
///
/// `handles` are the descriptors that arrived with it. On error they are
/// dropped, which for owned descriptors closes them.
pub fn decode<H>(bytes: &[u8], handles: Vec<H>) -> Result<Message<H>, DecodeError> {
    let Some((tag, body)) = bytes.split_first_chunk::<TAG_LEN>() else {
        return Err(DecodeError::Truncated { len: bytes.len() });
    };
    let tag = u32::from_le_bytes(*tag);
    let kind = MessageKind::from_tag(tag).ok_or(DecodeError::UnknownMessageKind(tag))?;
    let malformed = |reason| DecodeError::MalformedMessage { kind, reason };

    if bytes.len() != kind.wire_len() {
        return Err(malformed(MalformedReason::Length {
            expected: kind.wire_len(),
            actual: bytes.len(),
        }));
    }
    if handles.len() != kind.handle_count() {
        return Err(malformed(MalformedReason::HandleCount {
            expected: kind.handle_count(),
            actual: handles.len(),
        }));
    }

    let mut r = Reader { buf: body, kind };
    let mut handles = handles.into_iter();
    let mut handle = || {
        handles.next().ok_or(malformed(MalformedReason::HandleCount {
            expected: kind.handle_count(),
            actual: 0,
        }))
    };

    let message = match kind {
        MessageKind::Hello => Message::Hello { channel: handle()? },
        MessageKind::AllocateSharedMemory => Message::AllocateSharedMemory { size: r.u64()? },
        MessageKind::RegisterSharedMemory => Message::RegisterSharedMemory {
            size: r.u64()?,
            handle: handle()?,
        },
        MessageKind::UnregisterSharedMemory => Message::UnregisterSharedMemory {
            segment_id: SegmentId(r.u32()?),
        },
        MessageKind::UpdateRegion => Message::UpdateRegion(UpdateRegion {
            target_id: r.u32()?,
            level: r.u32()?,
            segment_id: SegmentId(r.u32()?),
            offset: r.u64()?,
            count: r.u64()?,
        }),
        MessageKind::HelloReply => Message::HelloReply { ok: r.bool()? },
        MessageKind::AllocateSharedMemoryReply => Message::AllocateSharedMemoryReply {
            segment_id: SegmentId(r.u32()?),
            size: r.u64()?,
            handle: handle()?,
        },
        MessageKind::RegisterSharedMemoryReply => Message::RegisterSharedMemoryReply {
            segment_id: SegmentId(r.u32()?),
        },
        MessageKind::UnregisterSharedMemoryReply => {
            Message::UnregisterSharedMemoryReply { ok: r.bool()? }
        }
        MessageKind::UpdateRegionReply => Message::UpdateRegionReply { ok: r.bool()? },
        MessageKind::ErrorReply => {
            let raw_request = r.u32()?;
            let request = MessageKind::from_tag(raw_request)
                .filter(|k| k.is_request())
                .ok_or(malformed(MalformedReason::InvalidRequestKind(raw_request)))?;
            let raw_code = r.u32()?;
            let code = ErrorCode::from_code(raw_code)
                .ok_or(malformed(MalformedReason::UnknownErrorCode(raw_code)))?;
            Message::ErrorReply { request, code }
        }
    };

    Ok(message)
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Cursor over a length-checked body. Running short is still reported rather
/// than panicking.
struct Reader<'a> {
    buf: &'a [u8],
    kind: MessageKind,
}

impl Reader<'_> {
    fn chunk<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let Some((head, rest)) = self.buf.split_first_chunk::<N>() else {
            return Err(DecodeError::MalformedMessage {
                kind: self.kind,
                reason: MalformedReason::Length {
                    expected: self.kind.wire_len(),
                    actual: TAG_LEN + self.buf.len(),
                },
            });
        };
        self.buf = rest;
        Ok(*head)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.chunk::<4>().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.chunk::<8>().map(u64::from_le_bytes)
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::MalformedMessage {
                kind: self.kind,
                reason: MalformedReason::InvalidBool(other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(message: Message<u8>) {
        let kind = message.kind();
        let expected = format!("{message:?}");
        let (bytes, handles) = encode(message);
        assert_eq!(bytes.len(), kind.wire_len(), "{kind}");
        assert_eq!(handles.len(), kind.handle_count(), "{kind}");
        let decoded = decode(&bytes, handles).unwrap();
        assert_eq!(format!("{decoded:?}"), expected);
    }

    #[test]
    fn every_kind_fits_in_max_message_len() {
        for kind in MessageKind::ALL {
            assert!(kind.wire_len() <= MAX_MESSAGE_LEN, "{kind}");
            assert!(kind.handle_count() <= MAX_HANDLES, "{kind}");
            assert_eq!(MessageKind::from_tag(kind.tag()), Some(kind));
        }
    }

    #[test]
    fn reply_tags_set_the_high_bit() {
        for kind in MessageKind::ALL.into_iter().filter(|k| k.is_request()) {
            let reply = kind.reply_kind().unwrap();
            assert_eq!(reply.tag(), kind.tag() | 0x80);
            assert!(!reply.is_request());
            assert_eq!(reply.reply_kind(), None);
        }
    }

    #[test]
    fn update_region_golden_bytes() {
        let (bytes, handles) = encode::<()>(Message::UpdateRegion(UpdateRegion {
            target_id: 7,
            level: 0,
            segment_id: SegmentId(0),
            offset: 0,
            count: 65536,
        }));
        assert!(handles.is_empty());
        assert_eq!(
            bytes,
            [
                0x05, 0, 0, 0, // kind
                7, 0, 0, 0, // target
                0, 0, 0, 0, // level
                0, 0, 0, 0, // segment
                0, 0, 0, 0, 0, 0, 0, 0, // offset
                0, 0, 1, 0, 0, 0, 0, 0, // count
            ]
        );
    }

    #[test]
    fn allocate_reply_golden_bytes() {
        let (bytes, handles) = encode(Message::AllocateSharedMemoryReply {
            segment_id: SegmentId(3),
            size: 4096,
            handle: 'h',
        });
        assert_eq!(handles, vec!['h']);
        assert_eq!(
            bytes,
            [0x82, 0, 0, 0, 3, 0, 0, 0, 0, 0x10, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn error_reply_golden_bytes() {
        let (bytes, _) = encode::<()>(Message::ErrorReply {
            request: MessageKind::RegisterSharedMemory,
            code: ErrorCode::InvalidHandle,
        });
        assert_eq!(bytes, [0xFF, 0, 0, 0, 0x03, 0, 0, 0, 0x02, 0, 0, 0]);
    }

    #[test]
    fn every_kind_roundtrips() {
        roundtrip(Message::Hello { channel: 1 });
        roundtrip(Message::AllocateSharedMemory { size: 65536 });
        roundtrip(Message::RegisterSharedMemory { size: 1, handle: 2 });
        roundtrip(Message::UnregisterSharedMemory {
            segment_id: SegmentId(999),
        });
        roundtrip(Message::UpdateRegion(UpdateRegion {
            target_id: u32::MAX,
            level: 3,
            segment_id: SegmentId(1),
            offset: u64::MAX,
            count: 1,
        }));
        roundtrip(Message::HelloReply { ok: true });
        roundtrip(Message::AllocateSharedMemoryReply {
            segment_id: SegmentId(0),
            size: 0,
            handle: 3,
        });
        roundtrip(Message::RegisterSharedMemoryReply {
            segment_id: SegmentId(u32::MAX),
        });
        roundtrip(Message::UnregisterSharedMemoryReply { ok: false });
        roundtrip(Message::UpdateRegionReply { ok: true });
        roundtrip(Message::ErrorReply {
            request: MessageKind::AllocateSharedMemory,
            code: ErrorCode::OutOfResources,
        });
    }

    #[test]
    fn short_datagram_is_truncated() {
        assert_eq!(
            decode::<()>(&[], vec![]),
            Err(DecodeError::Truncated { len: 0 })
        );
        assert_eq!(
            decode::<()>(&[1, 0, 0], vec![]),
            Err(DecodeError::Truncated { len: 3 })
        );
    }

    #[test]
    fn unknown_tag_rejected() {
        let err = decode::<()>(&[0x42, 0, 0, 0], vec![]).unwrap_err();
        assert_eq!(err, DecodeError::UnknownMessageKind(0x42));
        assert!(!err.is_malformed());
    }

    #[test]
    fn wrong_length_rejected() {
        let (mut bytes, _) = encode::<()>(Message::AllocateSharedMemory { size: 16 });
        bytes.push(0);
        let err = decode::<()>(&bytes, vec![]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::MalformedMessage {
                kind: MessageKind::AllocateSharedMemory,
                reason: MalformedReason::Length {
                    expected: 12,
                    actual: 13
                },
            }
        );
        assert!(err.is_malformed());

        let err = decode::<()>(&bytes[..8], vec![]).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedMessage {
                reason: MalformedReason::Length { actual: 8, .. },
                ..
            }
        ));
    }

    #[test]
    fn wrong_handle_count_rejected() {
        let hello = 1u32.to_le_bytes();
        assert_eq!(
            decode::<u8>(&hello, vec![]),
            Err(DecodeError::MalformedMessage {
                kind: MessageKind::Hello,
                reason: MalformedReason::HandleCount {
                    expected: 1,
                    actual: 0
                },
            })
        );
        assert_eq!(
            decode::<u8>(&hello, vec![1, 2]).unwrap_err().kind(),
            Some(MessageKind::Hello)
        );

        let (bytes, _) = encode::<u8>(Message::AllocateSharedMemory { size: 8 });
        assert!(matches!(
            decode(&bytes, vec![9u8]),
            Err(DecodeError::MalformedMessage {
                reason: MalformedReason::HandleCount {
                    expected: 0,
                    actual: 1
                },
                ..
            })
        ));
    }

    #[test]
    fn non_canonical_bool_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x85u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        assert_eq!(
            decode::<()>(&bytes, vec![]),
            Err(DecodeError::MalformedMessage {
                kind: MessageKind::UpdateRegionReply,
                reason: MalformedReason::InvalidBool(2),
            })
        );
    }

    #[test]
    fn error_reply_fields_validated() {
        let raw = |request: u32, code: u32| {
            let mut bytes = Vec::new();
            bytes.extend_from_slice(&0xFFu32.to_le_bytes());
            bytes.extend_from_slice(&request.to_le_bytes());
            bytes.extend_from_slice(&code.to_le_bytes());
            bytes
        };

        assert!(matches!(
            decode::<()>(&raw(0x81, 1), vec![]),
            Err(DecodeError::MalformedMessage {
                reason: MalformedReason::InvalidRequestKind(0x81),
                ..
            })
        ));
        assert!(matches!(
            decode::<()>(&raw(0x02, 0), vec![]),
            Err(DecodeError::MalformedMessage {
                reason: MalformedReason::UnknownErrorCode(0),
                ..
            })
        ));
        assert!(decode::<()>(&raw(0x02, 4), vec![]).is_ok());
    }

    fn boundary_u64() -> impl Strategy<Value = u64> {
        prop_oneof![Just(0), Just(1), Just(u64::MAX), any::<u64>()]
    }

    fn boundary_u32() -> impl Strategy<Value = u32> {
        prop_oneof![Just(0), Just(1), Just(u32::MAX), any::<u32>()]
    }

    proptest! {
        #[test]
        fn update_region_roundtrips(
            target_id in boundary_u32(),
            level in boundary_u32(),
            segment in boundary_u32(),
            offset in boundary_u64(),
            count in boundary_u64(),
        ) {
            let update = UpdateRegion {
                target_id,
                level,
                segment_id: SegmentId(segment),
                offset,
                count,
            };
            let (bytes, handles) = encode::<()>(Message::UpdateRegion(update));
            prop_assert_eq!(decode(&bytes, handles), Ok(Message::UpdateRegion(update)));
        }

        #[test]
        fn sized_requests_roundtrip(size in boundary_u64(), segment in boundary_u32()) {
            let (bytes, handles) = encode::<()>(Message::AllocateSharedMemory { size });
            prop_assert_eq!(decode(&bytes, handles), Ok(Message::AllocateSharedMemory { size }));

            let message = Message::RegisterSharedMemory { size, handle: () };
            let (bytes, handles) = encode(message);
            prop_assert_eq!(decode(&bytes, handles), Ok(Message::RegisterSharedMemory { size, handle: () }));

            let message = Message::AllocateSharedMemoryReply { segment_id: SegmentId(segment), size, handle: () };
            let (bytes, handles) = encode(message);
            prop_assert_eq!(
                decode(&bytes, handles),
                Ok(Message::AllocateSharedMemoryReply { segment_id: SegmentId(segment), size, handle: () })
            );
        }

        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..40), handles in 0usize..3) {
            let _ = decode(&bytes, vec![(); handles]);
        }
    }
}
