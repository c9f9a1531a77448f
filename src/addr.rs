//! Opaque client addresses.
//!
//! A client is identified by a pair of transport-defined byte strings: the
//! device address and the interface address. The pair serializes to a flat
//! buffer with u64 length prefixes; the same layout is used inside AM
//! envelopes and in the on-disk server address files.

use std::fmt;

use zerocopy::IntoBytes;
use zerocopy::little_endian::U64;

use crate::wire::FrameError;
use crate::wire::argument::ArgumentIterator;

/// Address of one client endpoint. Equality is bytewise on both parts.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ClientAddr {
    dev: Vec<u8>,
    iface: Vec<u8>,
}

impl ClientAddr {
    /// Build an address from its two raw parts.
    pub fn new(dev: impl Into<Vec<u8>>, iface: impl Into<Vec<u8>>) -> Self {
        ClientAddr {
            dev: dev.into(),
            iface: iface.into(),
        }
    }

    /// Device address bytes.
    pub fn dev(&self) -> &[u8] {
        &self.dev
    }

    /// Interface address bytes.
    pub fn iface(&self) -> &[u8] {
        &self.iface
    }

    /// Serialized size in bytes.
    pub fn encoded_len(&self) -> usize {
        2 * size_of::<u64>() + self.dev.len() + self.iface.len()
    }

    /// Append the flat-buffer form (`dev_len | dev | iface_len | iface`).
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(U64::new(self.dev.len() as u64).as_bytes());
        out.extend_from_slice(&self.dev);
        out.extend_from_slice(U64::new(self.iface.len() as u64).as_bytes());
        out.extend_from_slice(&self.iface);
    }

    /// Serialize to a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Decode one address from the front of `data`, returning the rest.
    pub fn split_from(data: &[u8]) -> Result<(ClientAddr, &[u8]), FrameError> {
        let mut it = ArgumentIterator::new(data);
        let dev_len: &U64 = it.fetch()?;
        let dev = it.fetch_bytes(dev_len.get() as usize)?;
        let iface_len: &U64 = it.fetch()?;
        let iface = it.fetch_bytes(iface_len.get() as usize)?;
        Ok((ClientAddr::new(dev, iface), it.fetch_all()))
    }

    /// Decode an address that occupies the whole buffer.
    pub fn from_bytes(data: &[u8]) -> Result<ClientAddr, FrameError> {
        let (addr, _rest) = Self::split_from(data)?;
        Ok(addr)
    }
}

impl fmt::Debug for ClientAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClientAddr({}/{})",
            String::from_utf8_lossy(&self.dev),
            String::from_utf8_lossy(&self.iface)
        )
    }
}

impl fmt::Display for ClientAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            String::from_utf8_lossy(&self.dev),
            String::from_utf8_lossy(&self.iface)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let addr = ClientAddr::new(b"mlx5_0".to_vec(), b"rc_mlx5:3".to_vec());
        let bytes = addr.to_bytes();
        assert_eq!(bytes.len(), addr.encoded_len());
        assert_eq!(ClientAddr::from_bytes(&bytes).unwrap(), addr);
    }

    #[test]
    fn split_leaves_rest() {
        let addr = ClientAddr::new(b"dev".to_vec(), Vec::new());
        let mut bytes = addr.to_bytes();
        bytes.extend_from_slice(b"tail");
        let (decoded, rest) = ClientAddr::split_from(&bytes).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(rest, b"tail");
    }

    #[test]
    fn truncated_buffer() {
        let addr = ClientAddr::new(b"device".to_vec(), b"iface".to_vec());
        let bytes = addr.to_bytes();
        assert!(ClientAddr::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
