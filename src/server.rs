//! The metadata/lock service.
//!
//! Binds a [`MetadataStore`] and a [`LockServer`] to the RPC plane's worker
//! pool. One instance serves either the whole job (global server) or the
//! clients of one node (per-node server); the request handling is identical.

use std::sync::Arc;

use log::warn;

use crate::addr::ClientAddr;
use crate::error::TfsError;
use crate::lock::{LockServer, LockType};
use crate::metadata::MetadataStore;
use crate::rpc::RpcServer;
use crate::rpc::server::ServiceHandler;
use crate::transport::Transport;
use crate::wire::reply::Response;
use crate::wire::request::RpcRequest;
use crate::wire::{MsgId, WireInterval};

/// The server-side state: location records plus the lock table.
pub struct TangramServer {
    metadata: Arc<MetadataStore>,
    locks: Arc<LockServer>,
}

impl TangramServer {
    pub fn new() -> Self {
        TangramServer {
            metadata: Arc::new(MetadataStore::new()),
            locks: Arc::new(LockServer::new()),
        }
    }

    /// The location records (exposed for inspection).
    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    /// The authoritative lock table (exposed for inspection).
    pub fn locks(&self) -> &Arc<LockServer> {
        &self.locks
    }

    /// Register the service on `transport` and start the worker pool. Drive
    /// the returned server with [`RpcServer::run`] or [`RpcServer::spawn`].
    ///
    /// Fails when the OS refuses to create a worker thread.
    pub fn start(
        &self,
        transport: Arc<dyn Transport>,
        workers: usize,
    ) -> Result<RpcServer, TfsError> {
        let metadata = self.metadata.clone();
        let locks = self.locks.clone();
        let handler: ServiceHandler = Arc::new(move |id, client, payload| {
            dispatch(&metadata, &locks, id, client, payload)
        });
        RpcServer::start(transport, handler, workers)
    }
}

impl Default for TangramServer {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch(
    metadata: &MetadataStore,
    locks: &LockServer,
    id: MsgId,
    client: &ClientAddr,
    payload: &[u8],
) -> Option<(MsgId, Response)> {
    let respond_id = id.response()?;
    let req = match RpcRequest::parse(payload) {
        Ok(req) => req,
        Err(err) => {
            warn!("rejecting malformed {id:?} from {client}: {err}");
            return Some((respond_id, Response::Empty));
        }
    };

    let response = match id {
        MsgId::PostReq => {
            let intervals: Vec<(u64, u64)> = req
                .intervals
                .iter()
                .map(|iv| (iv.offset.get(), iv.count.get()))
                .collect();
            metadata.post(req.path, client, &intervals);
            Response::new_ack()
        }
        MsgId::QueryReq => match single_interval(id, client, &req) {
            Some(iv) => match metadata.query(req.path, iv.offset.get(), iv.count.get()) {
                Some(owner) => Response::new_owner(&owner),
                None => Response::Empty,
            },
            None => Response::Empty,
        },
        MsgId::StatReq => match metadata.stat(req.path) {
            Some((size, mtime)) => Response::new_stat(size, mtime),
            None => Response::Empty,
        },
        MsgId::AcquireLockReq => match single_interval(id, client, &req) {
            Some(iv) => match acquire(locks, client, req.path, iv) {
                Ok(token) => {
                    Response::new_token(token.range.start, token.range.end, token.typ.to_wire())
                }
                // an empty respond tells the requester "denied"
                Err(TfsError::LockConflict { .. }) => Response::Empty,
                Err(err) => {
                    warn!("refusing {id:?} from {client}: {err}");
                    Response::Empty
                }
            },
            None => Response::Empty,
        },
        MsgId::ReleaseLockReq => {
            if let Some(iv) = single_interval(id, client, &req) {
                locks.release(client, req.path, iv.offset.get(), iv.count.get());
            }
            Response::new_ack()
        }
        MsgId::ReleaseLockFileReq => {
            locks.release_file(client, req.path);
            Response::new_ack()
        }
        MsgId::ReleaseLockClientReq => {
            locks.release_client(client);
            Response::new_ack()
        }
        _ => return None,
    };
    Some((respond_id, response))
}

fn acquire(
    locks: &LockServer,
    client: &ClientAddr,
    path: &str,
    iv: &WireInterval,
) -> Result<crate::lock::LockToken, TfsError> {
    let typ = LockType::from_wire(iv.typ.get())?;
    locks.acquire(client, path, iv.offset.get(), iv.count.get(), typ)
}

fn single_interval<'a>(
    id: MsgId,
    client: &ClientAddr,
    req: &'a RpcRequest<'a>,
) -> Option<&'a WireInterval> {
    if req.intervals.len() != 1 {
        warn!(
            "{id:?} from {client} carries {} intervals, expected 1",
            req.intervals.len()
        );
        return None;
    }
    Some(&req.intervals[0])
}
