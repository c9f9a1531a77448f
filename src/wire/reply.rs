//! Response frame builders.
//!
//! Small responses dominate (an ack, a token, an address), so response
//! buffers carry inline capacity and spill to the heap only for oversized
//! addresses.

use smallvec::SmallVec;
use zerocopy::IntoBytes;
use zerocopy::little_endian::{I32, I64, U64};

use super::{WireStat, WireToken};
use crate::addr::ClientAddr;

const INLINE_DATA_THRESHOLD: usize = size_of::<u64>() * 4;
pub(crate) type ResponseBuf = SmallVec<[u8; INLINE_DATA_THRESHOLD]>;

/// A response payload. `Empty` doubles as the ack for releases/posts, the
/// miss marker for queries and the denial marker for lock acquires.
#[derive(Debug)]
pub(crate) enum Response {
    Empty,
    Data(ResponseBuf),
}

impl Response {
    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            Response::Empty => &[],
            Response::Data(buf) => buf,
        }
    }

    pub(crate) fn new_ack() -> Self {
        Response::Empty
    }

    /// Query hit: the serialized owner address.
    pub(crate) fn new_owner(owner: &ClientAddr) -> Self {
        let mut buf = ResponseBuf::new();
        buf.extend_from_slice(U64::new(owner.dev().len() as u64).as_bytes());
        buf.extend_from_slice(owner.dev());
        buf.extend_from_slice(U64::new(owner.iface().len() as u64).as_bytes());
        buf.extend_from_slice(owner.iface());
        Response::Data(buf)
    }

    /// Granted lock token.
    pub(crate) fn new_token(start: u64, end: u64, typ: i32) -> Self {
        let token = WireToken {
            start: U64::new(start),
            end: U64::new(end),
            typ: I32::new(typ),
        };
        Response::Data(ResponseBuf::from_slice(token.as_bytes()))
    }

    /// File stat as known to the metadata service.
    pub(crate) fn new_stat(size: u64, mtime: i64) -> Self {
        let stat = WireStat {
            size: U64::new(size),
            mtime: I64::new(mtime),
        };
        Response::Data(ResponseBuf::from_slice(stat.as_bytes()))
    }
}
