//! Growable byte buffer with a cursor.
//!
//! The buffer is used in two modes:
//!
//! - **write mode**: created with [`Buffer::allocate`], `len` is the size of
//!   the packet being encoded and `position` is how much has been written.
//! - **read mode**: created with [`Buffer::with_capacity`] or
//!   [`Buffer::from_vec`], `len` is the number of valid bytes received and
//!   `position` is the decoder's read cursor.
//!
//! `position <= len <= capacity` holds at all times.

use crate::error::{Error, Result};

/// Byte region with a logical extent and a cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    len: usize,
    position: usize,
}

impl Buffer {
    /// Allocates a zero-filled buffer of `len` bytes in write mode.
    pub fn allocate(len: usize) -> Result<Self> {
        let mut buf = Self::default();
        buf.grow_storage(len)?;
        buf.len = len;
        Ok(buf)
    }

    /// Allocates an empty buffer in read mode with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut buf = Self::default();
        buf.grow_storage(capacity)?;
        Ok(buf)
    }

    /// Wraps received bytes in read mode.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            data,
            len,
            position: 0,
        }
    }

    /// Copies `data` into a new buffer in read mode.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Logical extent.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Cursor position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the cursor, clamped to `len`.
    pub fn set_position(&mut self, position: usize) {
        self.position = position.min(self.len);
    }

    /// Bytes between the cursor and `len`.
    pub fn free_space(&self) -> usize {
        self.len - self.position
    }

    /// True when the cursor reached `len`.
    pub fn is_eof(&self) -> bool {
        self.position >= self.len
    }

    /// Rewinds the cursor to the start.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Resizes the logical extent, growing storage if needed.
    ///
    /// New bytes are zeroed. The cursor is clamped to the new extent.
    pub fn reallocate(&mut self, len: usize) -> Result<()> {
        if len > self.data.len() {
            self.grow_storage(len)?;
        }
        self.len = len;
        self.position = self.position.min(len);
        Ok(())
    }

    /// Grows storage to at least `capacity` bytes without touching `len`.
    pub fn reserve(&mut self, capacity: usize) -> Result<()> {
        if capacity > self.data.len() {
            self.grow_storage(capacity)?;
        }
        Ok(())
    }

    /// Copies as much of `src` as fits before `len` at the cursor.
    ///
    /// Returns the number of bytes copied.
    pub fn copy_in(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.free_space());
        self.data[self.position..self.position + n].copy_from_slice(&src[..n]);
        self.position += n;
        n
    }

    /// Copies as many bytes as available from the cursor into `dest`.
    ///
    /// Returns the number of bytes copied.
    pub fn copy_out(&mut self, dest: &mut [u8]) -> usize {
        let n = dest.len().min(self.free_space());
        dest[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        n
    }

    /// Writes `src` at the cursor, growing the buffer when it does not fit.
    ///
    /// Returns a short count if growing fails. Callers must treat a short
    /// append as fatal for the packet being written.
    pub fn append(&mut self, src: &[u8]) -> usize {
        let written = self.copy_in(src);
        if written == src.len() {
            return written;
        }
        let missing = src.len() - written;
        if self.reallocate(self.len + missing).is_err() {
            return written;
        }
        written + self.copy_in(&src[written..])
    }

    /// Valid bytes `[0, len)`.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Unread bytes `[position, len)`.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.position..self.len]
    }

    /// Skips up to `n` unread bytes.
    pub fn advance(&mut self, n: usize) {
        self.position = (self.position + n).min(self.len);
    }

    /// Storage past `len`, for a transport read to fill.
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Marks `n` bytes after `len` as valid.
    pub fn fill(&mut self, n: usize) {
        self.len = (self.len + n).min(self.data.len());
    }

    /// Drops consumed bytes and moves unread bytes to the front.
    pub fn compact(&mut self) {
        if self.position == 0 {
            return;
        }
        self.data.copy_within(self.position..self.len, 0);
        self.len -= self.position;
        self.position = 0;
    }

    /// Consumes the buffer, returning the valid bytes.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.len);
        self.data
    }

    fn grow_storage(&mut self, capacity: usize) -> Result<()> {
        let additional = capacity.saturating_sub(self.data.len());
        self.data
            .try_reserve_exact(additional)
            .map_err(|_| Error::OutOfMemory)?;
        self.data.resize(capacity, 0);
        Ok(())
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_write_mode() {
        let mut buf = Buffer::allocate(4).unwrap();
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.free_space(), 4);
        assert!(!buf.is_eof());

        assert_eq!(buf.copy_in(&[1, 2, 3]), 3);
        assert_eq!(buf.free_space(), 1);
        assert_eq!(buf.copy_in(&[4, 5]), 1);
        assert!(buf.is_eof());
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_append_grows() {
        let mut buf = Buffer::allocate(2).unwrap();
        assert_eq!(buf.append(b"hello"), 5);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.position(), 5);
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn test_copy_out_short() {
        let mut buf = Buffer::from_slice(&[9, 8, 7]);
        let mut out = [0u8; 2];
        assert_eq!(buf.copy_out(&mut out), 2);
        assert_eq!(out, [9, 8]);
        assert_eq!(buf.copy_out(&mut out), 1);
        assert_eq!(out[0], 7);
        assert!(buf.is_eof());
        assert_eq!(buf.copy_out(&mut out), 0);

        buf.reset();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.remaining(), &[9, 8, 7]);
    }

    #[test]
    fn test_read_mode_fill_and_compact() {
        let mut buf = Buffer::with_capacity(8).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.unfilled_mut().len(), 8);

        buf.unfilled_mut()[..5].copy_from_slice(&[1, 2, 3, 4, 5]);
        buf.fill(5);
        assert_eq!(buf.len(), 5);

        buf.advance(3);
        assert_eq!(buf.remaining(), &[4, 5]);

        buf.compact();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.as_slice(), &[4, 5]);
        assert_eq!(buf.unfilled_mut().len(), 6);
    }

    #[test]
    fn test_reallocate_clamps_position() {
        let mut buf = Buffer::from_slice(&[1, 2, 3, 4]);
        buf.advance(4);
        buf.reallocate(2).unwrap();
        assert_eq!(buf.position(), 2);
        assert!(buf.is_eof());

        buf.reallocate(6).unwrap();
        assert_eq!(buf.as_slice(), &[1, 2, 0, 0, 0, 0]);
    }

    #[test]
    fn test_reserve_keeps_len() {
        let mut buf = Buffer::from_slice(&[1]);
        buf.reserve(16).unwrap();
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.into_vec(), vec![1]);
    }
}
