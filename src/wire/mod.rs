//! Wire-level message definitions.
//!
//! Every RPC travels as an active message: one id byte picked from
//! [`MsgId`], a sender-address envelope, and a little-endian payload frame.
//! Bulk data does not: it rides the transport's dedicated `rma_request`
//! primitive, which carries the same request frame but no id byte and never
//! touches the AM handler table. [`MsgId::RmaReq`] only names that message
//! kind in the protocol vocabulary. The structs here are the exact
//! on-the-wire layouts; they are unaligned so a frame can be decoded in
//! place from any byte offset.

use std::error;
use std::fmt;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use zerocopy::little_endian::{I32, I64, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub(crate) mod argument;
pub(crate) mod reply;
pub(crate) mod request;

/// Error that may occur while decoding an incoming frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough data left in the buffer (short read).
    ShortRead {
        /// Bytes remaining.
        have: usize,
        /// Bytes the decoder needed.
        need: usize,
    },
    /// The id byte does not name a known message.
    UnknownMessage(u8),
    /// A path field was not valid UTF-8.
    BadPath,
    /// The lock type field holds an unknown value.
    BadLockType(i32),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::ShortRead { have, need } => {
                write!(f, "short read of request frame ({have} < {need})")
            }
            FrameError::UnknownMessage(id) => write!(f, "unknown message id ({id})"),
            FrameError::BadPath => write!(f, "path is not valid UTF-8"),
            FrameError::BadLockType(t) => write!(f, "unknown lock type ({t})"),
        }
    }
}

impl error::Error for FrameError {}

/// Active-message ids.
///
/// Requests and their responses come in pairs; `MPI_SIZE` and `STOP_REQ` are
/// fire-and-forget control messages with no response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MsgId {
    /// Record extents at the metadata service.
    PostReq = 1,
    /// Ack for `PostReq`.
    PostResp = 2,
    /// Ask who last wrote a byte range.
    QueryReq = 3,
    /// Serialized owner address, or empty on a miss.
    QueryResp = 4,
    /// Ask for file size/mtime as known to the metadata service.
    StatReq = 5,
    /// Serialized [`WireStat`], or empty when unknown.
    StatResp = 6,
    /// Acquire a byte-range lock token.
    AcquireLockReq = 7,
    /// Serialized [`WireToken`] on grant, empty on conflict.
    AcquireLockResp = 8,
    /// Release tokens covering a range.
    ReleaseLockReq = 9,
    /// Ack for `ReleaseLockReq`.
    ReleaseLockResp = 10,
    /// Release every token the sender holds in one file.
    ReleaseLockFileReq = 11,
    /// Ack for `ReleaseLockFileReq`.
    ReleaseLockFileResp = 12,
    /// Release every token the sender holds across all files.
    ReleaseLockClientReq = 13,
    /// Ack for `ReleaseLockClientReq`.
    ReleaseLockClientResp = 14,
    /// Bulk-fetch a byte range from a peer's scratch file. Named for
    /// completeness; the transfer itself goes through the transport's bulk
    /// path, not an active message.
    RmaReq = 15,
    /// Announce the number of participating clients.
    MpiSize = 16,
    /// Terminate the server progress loop.
    StopReq = 17,
}

impl MsgId {
    /// The response id paired with a request id, if the message has one.
    pub fn response(self) -> Option<MsgId> {
        match self {
            MsgId::PostReq => Some(MsgId::PostResp),
            MsgId::QueryReq => Some(MsgId::QueryResp),
            MsgId::StatReq => Some(MsgId::StatResp),
            MsgId::AcquireLockReq => Some(MsgId::AcquireLockResp),
            MsgId::ReleaseLockReq => Some(MsgId::ReleaseLockResp),
            MsgId::ReleaseLockFileReq => Some(MsgId::ReleaseLockFileResp),
            MsgId::ReleaseLockClientReq => Some(MsgId::ReleaseLockClientResp),
            _ => None,
        }
    }

    /// True for the request ids the metadata/lock server dispatches to its
    /// worker pool.
    pub(crate) fn is_server_request(self) -> bool {
        self.response().is_some()
    }
}

/// One `(offset, count, type)` interval inside a request frame.
///
/// `typ` carries the lock type for lock requests and is zero elsewhere.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct WireInterval {
    pub offset: U64,
    pub count: U64,
    pub typ: I32,
}

impl WireInterval {
    pub(crate) fn new(offset: u64, count: u64, typ: i32) -> Self {
        WireInterval {
            offset: U64::new(offset),
            count: U64::new(count),
            typ: I32::new(typ),
        }
    }
}

/// Granted lock token as it travels in an `AcquireLockResp`.
///
/// Bounds are inclusive; `end == u64::MAX` means file-unbounded.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WireToken {
    pub start: U64,
    pub end: U64,
    pub typ: I32,
}

/// `StatResp` payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WireStat {
    /// Highest posted logical end + 1, or the PFS size.
    pub size: U64,
    /// Seconds since the epoch of the last post (or PFS mtime).
    pub mtime: I64,
}

/// Length prefix of a path field.
pub(crate) type PathLen = U16;
/// Length prefix of an interval list.
pub(crate) type IntervalCount = U32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_byte_round_trip() {
        for id in [MsgId::PostReq, MsgId::RmaReq, MsgId::StopReq] {
            let raw: u8 = id.into();
            assert_eq!(MsgId::try_from(raw), Ok(id));
        }
        assert!(MsgId::try_from(0u8).is_err());
        assert!(MsgId::try_from(200u8).is_err());
    }

    #[test]
    fn request_response_pairing() {
        assert_eq!(MsgId::PostReq.response(), Some(MsgId::PostResp));
        assert_eq!(MsgId::AcquireLockReq.response(), Some(MsgId::AcquireLockResp));
        assert_eq!(MsgId::MpiSize.response(), None);
        assert_eq!(MsgId::StopReq.response(), None);
        assert_eq!(MsgId::RmaReq.response(), None);
        assert!(!MsgId::PostResp.is_server_request());
    }
}
