//! Delegator tier of the lock manager.
//!
//! A cache of the tokens granted to this node's clients. Repeated requests
//! that the cached tokens already cover never reach the server; an RD -> WR
//! upgrade drops the cached copy and forwards, because only the server may
//! decide an upgrade. A server-initiated revoke simply deletes the cached
//! token.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use zerocopy::FromBytes;

use super::{ByteRange, LockToken, LockType, TokenList};
use crate::error::TfsError;
use crate::rpc::RpcClient;
use crate::wire::request::RpcRequest;
use crate::wire::{FrameError, MsgId, WireToken};

/// Client-side lock cache backed by the central lock server.
pub struct LockDelegator {
    rpc: Arc<RpcClient>,
    tables: Mutex<HashMap<String, TokenList>>,
}

impl LockDelegator {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        LockDelegator {
            rpc,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a token over `[offset, offset + count)`, short-circuiting on a
    /// sufficient cached token. Fails fast with
    /// [`TfsError::LockConflict`] when the server refuses.
    pub fn acquire(
        &self,
        path: &str,
        offset: u64,
        count: u64,
        typ: LockType,
    ) -> Result<LockToken, TfsError> {
        let me = self.rpc.client_addr().clone();
        let range = ByteRange::from_offset_count(offset, count);

        {
            let mut tables = self.tables.lock();
            if let Some(list) = tables.get_mut(path) {
                if let Some(idx) = list.position_cover_owned(range, &me) {
                    let held = list.get(idx);
                    if !(held.typ == LockType::Read && typ == LockType::Write) {
                        return Ok(held.clone());
                    }
                    // upgrade: forget the local copy and ask the server
                    list.remove_at(idx);
                }
            }
        }

        let payload = RpcRequest::encode_one(path, offset, count, typ.to_wire());
        let resp = self.rpc.sendrecv_server(MsgId::AcquireLockReq, &payload)?;
        if resp.is_empty() {
            return Err(TfsError::LockConflict {
                path: path.to_owned(),
                offset,
                count,
            });
        }
        let wire = WireToken::read_from_bytes(&resp).map_err(|_| FrameError::ShortRead {
            have: resp.len(),
            need: size_of::<WireToken>(),
        })?;
        let token = LockToken {
            range: ByteRange {
                start: wire.start.get(),
                end: wire.end.get(),
            },
            typ: LockType::from_wire(wire.typ.get())?,
            owner: me,
        };
        debug!(
            "cached token {path} [{}, {}] {:?}",
            token.range.start, token.range.end, token.typ
        );
        self.tables
            .lock()
            .entry(path.to_owned())
            .or_default()
            .push(token.clone());
        Ok(token)
    }

    /// Release the tokens covering `[offset, offset + count)`.
    pub fn release(&self, path: &str, offset: u64, count: u64) -> Result<(), TfsError> {
        let me = self.rpc.client_addr().clone();
        if let Some(list) = self.tables.lock().get_mut(path) {
            list.remove_covering_owned(ByteRange::from_offset_count(offset, count), &me);
        }
        let payload = RpcRequest::encode_one(path, offset, count, 0);
        self.rpc
            .sendrecv_server(MsgId::ReleaseLockReq, &payload)
            .map(drop)
    }

    /// Release every token this client holds in `path`.
    pub fn release_file(&self, path: &str) -> Result<(), TfsError> {
        self.tables.lock().remove(path);
        let payload = RpcRequest::encode(path, &[]);
        self.rpc
            .sendrecv_server(MsgId::ReleaseLockFileReq, &payload)
            .map(drop)
    }

    /// Release every token this client holds, across all files.
    pub fn release_client(&self) -> Result<(), TfsError> {
        self.tables.lock().clear();
        let payload = RpcRequest::encode("", &[]);
        self.rpc
            .sendrecv_server(MsgId::ReleaseLockClientReq, &payload)
            .map(drop)
    }

    /// Server-initiated revoke: the client on this node no longer holds the
    /// matching token.
    pub fn revoke(&self, path: &str, offset: u64, count: u64) {
        let me = self.rpc.client_addr().clone();
        if let Some(list) = self.tables.lock().get_mut(path) {
            list.remove_covering_owned(ByteRange::from_offset_count(offset, count), &me);
        }
    }

    #[cfg(test)]
    pub(crate) fn cached(&self, path: &str) -> Vec<LockToken> {
        self.tables
            .lock()
            .get(path)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }
}
