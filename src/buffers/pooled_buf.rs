//! Fixed-capacity buffers handed out by a [BufferPool]. Their salient points are:
//!
//! * backed by a pre-allocated buffer of the pool's size class, with a separate logical length
//! * implement `BufMut` to fit into the `bytes` ecosystem
//! * return themselves to their pool when dropped, so a buffer is released exactly once and
//!    can not be touched after it was released
//!

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use bytes::buf::UninitSlice;
use crate::buffers::buffer_pool::BufferPool;

pub struct PooledBuf {
    id: u64,
    buf: Vec<u8>,
    len: usize,
    pool: Arc<BufferPool>,
}
impl PooledBuf {
    pub(crate) fn new(id: u64, buf: Vec<u8>, len: usize, pool: Arc<BufferPool>) -> PooledBuf {
        assert!(len <= buf.len());
        PooledBuf { id, buf, len, pool }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// the size class this buffer belongs to
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Set the logical length, e.g. after filling the buffer through `as_mut()` with fewer bytes
    ///  than were requested initially. Data between the old and the new length is whatever
    ///  the buffer contained before.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "length {} exceeds the buffer's capacity of {}", len, self.capacity());
        self.len = len;
    }

    /// make the entire underlying buffer available through as_ref() etc.
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.give_back(self.id, buf);
    }
}

impl PartialEq for PooledBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}
impl Eq for PooledBuf {}

impl PartialEq<[u8]> for PooledBuf {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_ref().eq(other)
    }
}

impl Debug for PooledBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for PooledBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
impl AsMut<[u8]> for PooledBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for PooledBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}
