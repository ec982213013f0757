//! Streaming IO buffer between USB packets and storage blocks.
//!
//! A linear buffer with independent read and write cursors. Cursors never
//! wrap: the buffer is reset at the start of every command and whenever a
//! full buffer of write data has been committed to storage, so no shifting
//! or wrap arithmetic is needed. `read` hands out borrows into the buffer;
//! a reset invalidates them by construction.

use core::borrow::BorrowMut;
use core::cmp::min;

/// Write would exceed the remaining free space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct BufferFull;

pub(crate) struct Buffer<T: BorrowMut<[u8]>> {
    inner: T,
    rpos: usize, // next byte to read from
    rend: usize, // readable limit; trails wpos only after `limit`
    wpos: usize, // next byte to write into
}

impl<T: BorrowMut<[u8]>> Buffer<T> {
    pub fn new(inner: T) -> Buffer<T> {
        Buffer {
            inner,
            rpos: 0,
            rend: 0,
            wpos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().len()
    }

    /// Total valid bytes accumulated since the last reset.
    pub fn total(&self) -> usize {
        self.wpos
    }

    pub fn is_full(&self) -> bool {
        self.wpos == self.capacity()
    }

    pub fn available_read(&self) -> usize {
        self.rend - self.rpos
    }

    pub fn available_write(&self) -> usize {
        self.capacity() - self.wpos
    }

    pub fn reset(&mut self) {
        self.rpos = 0;
        self.rend = 0;
        self.wpos = 0;
    }

    /// Appends `data`, failing without side effects if it does not fit.
    pub fn write(&mut self, data: &[u8]) -> Result<(), BufferFull> {
        if data.len() > self.available_write() {
            return Err(BufferFull);
        }
        let wpos = self.wpos;
        self.inner.borrow_mut()[wpos..wpos + data.len()].copy_from_slice(data);
        self.wpos += data.len();
        self.rend += data.len();
        Ok(())
    }

    /// Lets `f` produce the next `count` bytes in place (a storage block
    /// read lands directly in the buffer). The bytes become readable only if
    /// `f` succeeds. The caller checks `available_write` beforehand.
    pub fn write_with<E>(
        &mut self,
        count: usize,
        f: impl FnOnce(&mut [u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        debug_assert!(count <= self.available_write());
        let wpos = self.wpos;
        f(&mut self.inner.borrow_mut()[wpos..wpos + count])?;
        self.wpos += count;
        self.rend += count;
        Ok(())
    }

    /// Hands out the next `min(max, available_read())` bytes and advances
    /// the read cursor past them. The borrow stays valid until the next
    /// write or reset.
    pub fn read(&mut self, max: usize) -> &[u8] {
        let count = min(max, self.available_read());
        let rpos = self.rpos;
        self.rpos += count;
        &self.inner.borrow()[rpos..rpos + count]
    }

    /// Rewinds the read cursor by `count` bytes (a partial block taken by
    /// the storage writer goes back until the rest arrives).
    pub fn unread(&mut self, count: usize) {
        debug_assert!(count <= self.rpos);
        self.rpos -= count;
    }

    /// Caps the readable byte count at `cap` (SCSI allocation length) and
    /// returns what remains readable.
    pub fn limit(&mut self, cap: usize) -> usize {
        if cap < self.available_read() {
            self.rend = self.rpos + cap;
        }
        self.available_read()
    }
}
