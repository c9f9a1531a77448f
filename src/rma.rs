//! RMA data plane: zero-copy bulk transfer of a byte range between clients.
//!
//! The fetch side encodes the same request frame as every RPC, with exactly
//! one interval; the transport carries it to the owner, whose registered
//! serve callback (installed at session init) runs the local-read path and
//! hands the bytes back for the bulk transfer.

use std::sync::Arc;

use log::debug;

use crate::addr::ClientAddr;
use crate::error::TfsError;
use crate::transport::Transport;
use crate::wire::request::RpcRequest;

/// Fetch side of the data plane.
pub struct RmaClient {
    transport: Arc<dyn Transport>,
}

impl RmaClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        RmaClient { transport }
    }

    /// Read `count` bytes of `path` at `offset` out of `owner`'s scratch
    /// into `dst`. Blocks until the bulk completion. An owner without the
    /// bytes reports an error; the caller's recovery is the PFS fallback.
    pub fn fetch(
        &self,
        owner: &ClientAddr,
        path: &str,
        offset: u64,
        count: u64,
        dst: &mut [u8],
    ) -> Result<usize, TfsError> {
        let payload = RpcRequest::encode_one(path, offset, count, 0);
        let wanted = (count as usize).min(dst.len());
        let n = self
            .transport
            .rma_request(owner, &payload, &mut dst[..wanted])?;
        debug!("rma fetch {path} [{offset}, +{count}) from {owner}: {n} bytes");
        Ok(n)
    }
}
