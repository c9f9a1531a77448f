//! The request frame shared by every RPC and RMA message.
//!
//! Layout: `path_len:u16 | path | num_intervals:u32 | interval*` with every
//! integer little-endian. Lock releases for a whole client use an empty path
//! and zero intervals; STAT uses a path and zero intervals.

use std::str;

use zerocopy::IntoBytes;
use zerocopy::little_endian::{U16, U32};

use super::argument::ArgumentIterator;
use super::{FrameError, IntervalCount, PathLen, WireInterval};

/// A parsed request frame, borrowing from the receive buffer.
#[derive(Debug)]
pub(crate) struct RpcRequest<'a> {
    pub path: &'a str,
    pub intervals: &'a [WireInterval],
}

impl<'a> RpcRequest<'a> {
    /// Decode a frame.
    pub(crate) fn parse(data: &'a [u8]) -> Result<RpcRequest<'a>, FrameError> {
        let mut it = ArgumentIterator::new(data);
        let path_len: &PathLen = it.fetch()?;
        let path_bytes = it.fetch_bytes(path_len.get() as usize)?;
        let path = str::from_utf8(path_bytes).map_err(|_| FrameError::BadPath)?;
        let count: &IntervalCount = it.fetch()?;
        let intervals = it.fetch_slice(count.get() as usize)?;
        Ok(RpcRequest { path, intervals })
    }

    /// Encode a frame.
    pub(crate) fn encode(path: &str, intervals: &[WireInterval]) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            size_of::<PathLen>()
                + path.len()
                + size_of::<IntervalCount>()
                + intervals.len() * size_of::<WireInterval>(),
        );
        out.extend_from_slice(U16::new(path.len() as u16).as_bytes());
        out.extend_from_slice(path.as_bytes());
        out.extend_from_slice(U32::new(intervals.len() as u32).as_bytes());
        out.extend_from_slice(intervals.as_bytes());
        out
    }

    /// Encode a single-interval frame, the common case.
    pub(crate) fn encode_one(path: &str, offset: u64, count: u64, typ: i32) -> Vec<u8> {
        Self::encode(path, &[WireInterval::new(offset, count, typ)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let buf = RpcRequest::encode(
            "/pd/data.bin",
            &[
                WireInterval::new(0, 4096, 0),
                WireInterval::new(1 << 32, 17, 1),
            ],
        );
        let req = RpcRequest::parse(&buf).unwrap();
        assert_eq!(req.path, "/pd/data.bin");
        assert_eq!(req.intervals.len(), 2);
        assert_eq!(req.intervals[0].offset.get(), 0);
        assert_eq!(req.intervals[0].count.get(), 4096);
        assert_eq!(req.intervals[1].offset.get(), 1 << 32);
        assert_eq!(req.intervals[1].typ.get(), 1);
    }

    #[test]
    fn empty_path_and_intervals() {
        let buf = RpcRequest::encode("", &[]);
        let req = RpcRequest::parse(&buf).unwrap();
        assert_eq!(req.path, "");
        assert!(req.intervals.is_empty());
    }

    #[test]
    fn truncated_interval_list() {
        let mut buf = RpcRequest::encode_one("/pd/f", 0, 8, 0);
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            RpcRequest::parse(&buf),
            Err(FrameError::ShortRead { .. })
        ));
    }
}
