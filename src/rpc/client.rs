//! Client half of the RPC plane.
//!
//! `sendrecv_server` is synchronous from the caller's view: post the request
//! AM, then spin on transport progress until the matching response fires.
//! One request is in flight at a time per client, so the rendezvous is a
//! single slot filled by the response handlers registered at construction.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::Mutex;

use crate::addr::ClientAddr;
use crate::error::TfsError;
use crate::transport::{Transport, unpack_envelope};
use crate::wire::MsgId;

/// Give up on a response after this long; the transport itself never times
/// out, so a dead server would otherwise hang the caller forever.
const RPC_DEADLINE: Duration = Duration::from_secs(30);

const RESPONSE_IDS: [MsgId; 7] = [
    MsgId::PostResp,
    MsgId::QueryResp,
    MsgId::StatResp,
    MsgId::AcquireLockResp,
    MsgId::ReleaseLockResp,
    MsgId::ReleaseLockFileResp,
    MsgId::ReleaseLockClientResp,
];

#[derive(Default)]
struct Rendezvous {
    slot: Mutex<Option<(MsgId, Vec<u8>)>>,
}

/// Issues requests to the metadata/lock server.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    server: ClientAddr,
    rendezvous: Arc<Rendezvous>,
    // serializes sendrecv callers so the slot holds one response at most
    call_lock: Mutex<()>,
}

impl RpcClient {
    /// Wire up the response handlers and return a client bound to `server`.
    pub fn new(transport: Arc<dyn Transport>, server: ClientAddr) -> Arc<RpcClient> {
        let rendezvous = Arc::new(Rendezvous::default());
        for id in RESPONSE_IDS {
            let slot = rendezvous.clone();
            transport.set_am_handler(
                id,
                Box::new(move |envelope| match unpack_envelope(envelope) {
                    Ok((_sender, payload)) => {
                        *slot.slot.lock() = Some((id, payload.to_vec()));
                    }
                    Err(err) => warn!("dropping malformed {id:?}: {err}"),
                }),
            );
        }
        Arc::new(RpcClient {
            transport,
            server,
            rendezvous,
            call_lock: Mutex::new(()),
        })
    }

    /// Address of the server this client talks to.
    pub fn server_addr(&self) -> &ClientAddr {
        &self.server
    }

    /// Address of this client, as peers will see it.
    pub fn client_addr(&self) -> &ClientAddr {
        self.transport.self_addr()
    }

    /// Post `payload` under the request `id` and block until the matching
    /// response arrives. The returned buffer is the response payload.
    pub fn sendrecv_server(&self, id: MsgId, payload: &[u8]) -> Result<Vec<u8>, TfsError> {
        let Some(expected) = id.response() else {
            return Err(TfsError::Transport(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{id:?} has no response message"),
            )));
        };

        let _in_flight = self.call_lock.lock();
        self.rendezvous.slot.lock().take();
        self.transport.send_am(&self.server, id, payload)?;

        let started = Instant::now();
        loop {
            {
                let mut slot = self.rendezvous.slot.lock();
                match slot.take() {
                    Some((rid, buf)) if rid == expected => return Ok(buf),
                    Some((rid, _)) => warn!("discarding stale response {rid:?}"),
                    None => {}
                }
            }
            if started.elapsed() > RPC_DEADLINE {
                return Err(TfsError::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "no {expected:?} from {} within {RPC_DEADLINE:?}",
                        self.server
                    ),
                )));
            }
            if !self.transport.progress() {
                thread::yield_now();
            }
        }
    }

    /// Fire-and-forget message to the server (`MPI_SIZE`, `STOP_REQ`).
    pub fn send_server(&self, id: MsgId, payload: &[u8]) -> Result<(), TfsError> {
        self.transport.send_am(&self.server, id, payload)
    }
}
