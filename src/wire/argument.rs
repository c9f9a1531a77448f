//! Argument decomposition for incoming active messages.
//!
//! Helper to decompose a slice of binary data (an AM payload) into typed wire
//! structs and length-prefixed byte fields. All wire types are unaligned, so
//! decoding never copies and never fails on alignment.

use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use super::FrameError;

/// An iterator that fetches typed arguments from a byte slice.
pub(crate) struct ArgumentIterator<'a> {
    data: &'a [u8],
}

impl<'a> ArgumentIterator<'a> {
    /// Create a new argument iterator for the given byte slice.
    pub(crate) fn new(data: &'a [u8]) -> ArgumentIterator<'a> {
        ArgumentIterator { data }
    }

    /// Size of the remaining data.
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Fetch a slice of all remaining bytes.
    pub(crate) fn fetch_all(&mut self) -> &'a [u8] {
        let bytes = self.data;
        self.data = &[];
        bytes
    }

    /// Fetch a typed argument. Fails if there is not enough data left.
    pub(crate) fn fetch<T>(&mut self) -> Result<&'a T, FrameError>
    where
        T: FromBytes + KnownLayout + Immutable + Unaligned,
    {
        match zerocopy::Ref::<_, T>::from_prefix(self.data) {
            Ok((x, rest)) => {
                self.data = rest;
                Ok(zerocopy::Ref::into_ref(x))
            }
            Err(_) => Err(FrameError::ShortRead {
                have: self.data.len(),
                need: size_of::<T>(),
            }),
        }
    }

    /// Fetch a slice of `count` typed arguments.
    pub(crate) fn fetch_slice<T>(&mut self, count: usize) -> Result<&'a [T], FrameError>
    where
        T: FromBytes + KnownLayout + Immutable + Unaligned,
    {
        match zerocopy::Ref::<_, [T]>::from_prefix_with_elems(self.data, count) {
            Ok((x, rest)) => {
                self.data = rest;
                Ok(zerocopy::Ref::into_ref(x))
            }
            Err(_) => Err(FrameError::ShortRead {
                have: self.data.len(),
                need: count * size_of::<T>(),
            }),
        }
    }

    /// Fetch a run of `len` raw bytes.
    pub(crate) fn fetch_bytes(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        if self.data.len() < len {
            return Err(FrameError::ShortRead {
                have: self.data.len(),
                need: len,
            });
        }
        let (out, rest) = self.data.split_at(len);
        self.data = rest;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::little_endian::{U16, U32};

    use super::*;

    #[test]
    fn typed_then_bytes() {
        let data: [u8; 8] = [0x03, 0x00, b'f', b'o', b'o', 0x02, 0x00, 0x00];
        let mut it = ArgumentIterator::new(&data);
        let len: &U16 = it.fetch().unwrap();
        assert_eq!(len.get(), 3);
        assert_eq!(it.fetch_bytes(3).unwrap(), b"foo");
        assert_eq!(it.len(), 3);
    }

    #[test]
    fn out_of_data() {
        let data: [u8; 2] = [0x01, 0x02];
        let mut it = ArgumentIterator::new(&data);
        let err = it.fetch::<U32>().unwrap_err();
        assert_eq!(err, FrameError::ShortRead { have: 2, need: 4 });
        // a failed fetch consumes nothing
        assert_eq!(it.len(), 2);
        assert_eq!(it.fetch_all(), &[0x01, 0x02]);
    }

    #[test]
    fn slice_fetch() {
        let data: [u8; 4] = [0x01, 0x00, 0x02, 0x00];
        let mut it = ArgumentIterator::new(&data);
        let vals: &[U16] = it.fetch_slice(2).unwrap();
        assert_eq!(vals[0].get(), 1);
        assert_eq!(vals[1].get(), 2);
        assert_eq!(it.len(), 0);
    }
}
