//! The transport interface the I/O plane consumes.
//!
//! The core never talks to a fabric directly; it posts active messages and
//! bulk (RMA) requests through this trait and lets the transport drive
//! completions from `progress` calls. Endpoint setup and teardown is the
//! transport's business, performed per send the way the reference wire
//! implementation created an endpoint around every reply.
//!
//! Every delivered active message is an envelope: the sender's serialized
//! address followed by the payload, so receive callbacks can answer without
//! any connection state.

use std::time::Duration;

use crate::addr::ClientAddr;
use crate::error::TfsError;
use crate::wire::{FrameError, MsgId};

/// Receive callback for one active-message id. The argument is the full
/// envelope; decompose it with [`unpack_envelope`].
pub type AmHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Serve-side bulk callback: maps a request payload to the bytes the
/// transport should transfer to the requester.
pub type RmaHandler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, TfsError> + Send + Sync>;

/// A generic active-message + RMA endpoint.
pub trait Transport: Send + Sync + 'static {
    /// Address other endpoints reach this one under.
    fn self_addr(&self) -> &ClientAddr;

    /// Fire-and-forget active message to `peer`.
    fn send_am(&self, peer: &ClientAddr, id: MsgId, payload: &[u8]) -> Result<(), TfsError>;

    /// Register the receive callback for one message id.
    fn set_am_handler(&self, id: MsgId, handler: AmHandler);

    /// Register the callback that serves incoming bulk requests.
    fn set_rma_handler(&self, handler: RmaHandler);

    /// Blocking bulk fetch: deliver `payload` to `peer`'s RMA callback and
    /// receive the resulting bytes into `recv`. Returns the byte count.
    fn rma_request(
        &self,
        peer: &ClientAddr,
        payload: &[u8],
        recv: &mut [u8],
    ) -> Result<usize, TfsError>;

    /// Non-blocking poll: deliver at most one pending message to its
    /// callback. True when a message was delivered.
    fn progress(&self) -> bool;

    /// Like [`progress`](Transport::progress), but parks the caller up to
    /// `timeout` waiting for a message first.
    fn progress_wait(&self, timeout: Duration) -> bool {
        let _ = timeout;
        self.progress()
    }
}

/// Prefix `payload` with the sender's serialized address.
pub fn pack_envelope(sender: &ClientAddr, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(sender.encoded_len() + payload.len());
    sender.encode_into(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// Split an envelope back into the sender address and the payload.
pub fn unpack_envelope(buf: &[u8]) -> Result<(ClientAddr, &[u8]), FrameError> {
    ClientAddr::split_from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let sender = ClientAddr::new(b"dev".to_vec(), b"iface".to_vec());
        let buf = pack_envelope(&sender, b"payload");
        let (decoded, payload) = unpack_envelope(&buf).unwrap();
        assert_eq!(decoded, sender);
        assert_eq!(payload, b"payload");
    }
}
