//! In-process transport.
//!
//! A hub connects any number of endpoints living in one process: each
//! endpoint owns a FIFO inbox drained by its `progress` calls, and bulk
//! requests run the peer's registered RMA callback directly. This is the
//! transport for single-node runs and for the end-to-end tests; a fabric
//! transport (UCX, Mercury) plugs in behind the same trait.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::addr::ClientAddr;
use crate::error::TfsError;
use crate::transport::{AmHandler, RmaHandler, Transport, pack_envelope};
use crate::wire::MsgId;

#[derive(Default)]
struct Endpoint {
    inbox: Mutex<VecDeque<(MsgId, Vec<u8>)>>,
    available: Condvar,
    am_handlers: RwLock<HashMap<MsgId, AmHandler>>,
    rma_handler: RwLock<Option<RmaHandler>>,
}

#[derive(Default)]
struct HubShared {
    peers: Mutex<HashMap<ClientAddr, Arc<Endpoint>>>,
}

impl HubShared {
    fn lookup(&self, addr: &ClientAddr) -> Result<Arc<Endpoint>, TfsError> {
        self.peers.lock().get(addr).cloned().ok_or_else(|| {
            TfsError::Transport(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no endpoint registered for {addr}"),
            ))
        })
    }
}

/// Registry of in-process endpoints.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    shared: Arc<HubShared>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint under `addr` and hand out its transport.
    pub fn endpoint(&self, addr: ClientAddr) -> LoopbackTransport {
        let endpoint = Arc::new(Endpoint::default());
        self.shared
            .peers
            .lock()
            .insert(addr.clone(), endpoint.clone());
        LoopbackTransport {
            addr,
            local: endpoint,
            shared: self.shared.clone(),
        }
    }
}

/// One endpoint of a [`LoopbackHub`].
pub struct LoopbackTransport {
    addr: ClientAddr,
    local: Arc<Endpoint>,
    shared: Arc<HubShared>,
}

impl LoopbackTransport {
    fn dispatch(&self, id: MsgId, envelope: Vec<u8>) -> bool {
        let handlers = self.local.am_handlers.read();
        match handlers.get(&id) {
            Some(handler) => handler(&envelope),
            None => warn!("dropping message {id:?}: no handler registered"),
        }
        true
    }
}

impl Transport for LoopbackTransport {
    fn self_addr(&self) -> &ClientAddr {
        &self.addr
    }

    fn send_am(&self, peer: &ClientAddr, id: MsgId, payload: &[u8]) -> Result<(), TfsError> {
        let endpoint = self.shared.lookup(peer)?;
        let envelope = pack_envelope(&self.addr, payload);
        endpoint.inbox.lock().push_back((id, envelope));
        endpoint.available.notify_one();
        Ok(())
    }

    fn set_am_handler(&self, id: MsgId, handler: AmHandler) {
        self.local.am_handlers.write().insert(id, handler);
    }

    fn set_rma_handler(&self, handler: RmaHandler) {
        *self.local.rma_handler.write() = Some(handler);
    }

    fn rma_request(
        &self,
        peer: &ClientAddr,
        payload: &[u8],
        recv: &mut [u8],
    ) -> Result<usize, TfsError> {
        let endpoint = self.shared.lookup(peer)?;
        let guard = endpoint.rma_handler.read();
        let handler = guard.as_ref().ok_or_else(|| {
            TfsError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("peer {peer} serves no bulk requests"),
            ))
        })?;
        let bytes = handler(payload)?;
        let n = bytes.len().min(recv.len());
        recv[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn progress(&self) -> bool {
        let message = self.local.inbox.lock().pop_front();
        match message {
            Some((id, envelope)) => self.dispatch(id, envelope),
            None => false,
        }
    }

    fn progress_wait(&self, timeout: Duration) -> bool {
        let mut inbox = self.local.inbox.lock();
        if inbox.is_empty() {
            self.local.available.wait_for(&mut inbox, timeout);
        }
        let message = inbox.pop_front();
        drop(inbox);
        match message {
            Some((id, envelope)) => self.dispatch(id, envelope),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::transport::unpack_envelope;

    use super::*;

    fn addr(tag: &str) -> ClientAddr {
        ClientAddr::new(tag.as_bytes().to_vec(), Vec::new())
    }

    #[test]
    fn am_delivery_in_fifo_order() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint(addr("a"));
        let b = hub.endpoint(addr("b"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        b.set_am_handler(
            MsgId::PostReq,
            Box::new(move |envelope| {
                let (sender, payload) = unpack_envelope(envelope).unwrap();
                sink.lock().push((sender, payload.to_vec()));
            }),
        );

        a.send_am(b.self_addr(), MsgId::PostReq, b"one").unwrap();
        a.send_am(b.self_addr(), MsgId::PostReq, b"two").unwrap();

        assert!(b.progress());
        assert!(b.progress());
        assert!(!b.progress());

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (addr("a"), b"one".to_vec()));
        assert_eq!(seen[1], (addr("a"), b"two".to_vec()));
    }

    #[test]
    fn unknown_peer_is_a_transport_error() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint(addr("a"));
        assert!(matches!(
            a.send_am(&addr("ghost"), MsgId::PostReq, b""),
            Err(TfsError::Transport(_))
        ));
    }

    #[test]
    fn rma_runs_peer_callback() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint(addr("a"));
        let b = hub.endpoint(addr("b"));

        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();
        b.set_rma_handler(Box::new(move |payload| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(payload.iter().rev().copied().collect())
        }));

        let mut recv = [0u8; 3];
        let n = a.rma_request(b.self_addr(), b"abc", &mut recv).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&recv, b"cba");
        assert_eq!(served.load(Ordering::SeqCst), 1);
    }
}
