/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
use arrayvec::ArrayVec;

use crate::error::Error;

/// A bounded, append-only byte buffer.
///
/// Backs every transcript ledger. `append` never grows the
/// buffer's capacity; once `CAP` bytes have been appended further appends
/// fail with [`Error::BufferOverflow`] rather than silently truncating.
/// `reset` only zeros the logical length, it never changes `CAP`. There is
/// no way to mutate previously appended bytes short of a full `reset`.
#[derive(Clone)]
pub struct ManagedBuffer<const CAP: usize> {
    data: ArrayVec<u8, CAP>,
}

impl<const CAP: usize> ManagedBuffer<CAP> {
    /// Create an empty buffer with capacity `CAP`.
    pub const fn new() -> Self {
        Self { data: ArrayVec::new_const() }
    }

    /// Append `bytes` to the buffer, failing if that would exceed `CAP`.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.data.len() + bytes.len() > CAP {
            return Err(Error::BufferOverflow);
        }
        // ArrayVec::try_extend_from_slice cannot fail after the check above.
        self.data
            .try_extend_from_slice(bytes)
            .map_err(|_| Error::BufferOverflow)
    }

    /// Drop the trailing `n` bytes. `n` must not exceed the current length.
    pub fn shrink(&mut self, n: usize) -> Result<(), Error> {
        if n > self.data.len() {
            return Err(Error::InvalidParameter);
        }
        let new_len = self.data.len() - n;
        self.data.truncate(new_len);
        Ok(())
    }

    /// Zero the logical length. Capacity is unaffected.
    pub fn reset(&mut self) {
        self.data.clear();
    }

    /// Current number of bytes held.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Capacity this buffer was created with.
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Borrow the bytes currently held.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl<const CAP: usize> Default for ManagedBuffer<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_reset_roundtrip() {
        let mut buf: ManagedBuffer<8> = ManagedBuffer::new();
        buf.append(&[1, 2, 3]).unwrap();
        buf.append(&[4, 5]).unwrap();
        assert_eq!(buf.data(), &[1, 2, 3, 4, 5]);
        buf.reset();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    fn append_overflow_rejected() {
        let mut buf: ManagedBuffer<4> = ManagedBuffer::new();
        buf.append(&[1, 2, 3]).unwrap();
        assert_eq!(buf.append(&[4, 5]), Err(Error::BufferOverflow));
        // Failed append must not have partially written.
        assert_eq!(buf.data(), &[1, 2, 3]);
    }

    #[test]
    fn shrink_truncates_tail() {
        let mut buf: ManagedBuffer<8> = ManagedBuffer::new();
        buf.append(&[1, 2, 3, 4]).unwrap();
        buf.shrink(2).unwrap();
        assert_eq!(buf.data(), &[1, 2]);
        assert_eq!(buf.shrink(10), Err(Error::InvalidParameter));
    }
}
