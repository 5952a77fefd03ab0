//! Page Buffer Pool
//!
//! Fixed-size page buffers recycled through a lock-free queue so the
//! cache and the checkpoint path do not allocate 8 KB on every load.

use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

use crossbeam::queue::SegQueue;

use super::PAGE_SIZE;

/// Spare buffers kept around after their owner drops them.
const MAX_POOLED: usize = 1024;

fn pool() -> &'static SegQueue<Box<[u8]>> {
    static POOL: OnceLock<SegQueue<Box<[u8]>>> = OnceLock::new();
    POOL.get_or_init(SegQueue::new)
}

/// One page worth of bytes. Returned to the pool on drop.
pub struct PageBuffer {
    data: Box<[u8]>,
}

impl PageBuffer {
    /// A buffer whose contents are all zero
    pub fn zeroed() -> Self {
        let mut buffer = Self::recycled();
        buffer.data.fill(0);
        buffer
    }

    /// A buffer with unspecified contents, for callers that overwrite it whole
    pub fn recycled() -> Self {
        let data = pool()
            .pop()
            .unwrap_or_else(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
        Self { data }
    }

    /// Number of spare buffers currently pooled
    pub fn pooled() -> usize {
        pool().len()
    }
}

impl Clone for PageBuffer {
    fn clone(&self) -> Self {
        let mut copy = Self::recycled();
        copy.data.copy_from_slice(&self.data);
        copy
    }
}

impl Deref for PageBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PageBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer").field("len", &self.data.len()).finish()
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        if data.len() == PAGE_SIZE && pool().len() < MAX_POOLED {
            pool().push(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_buffer_is_clean_after_reuse() {
        {
            let mut dirty = PageBuffer::recycled();
            dirty.fill(0xAB);
        }
        let clean = PageBuffer::zeroed();
        assert_eq!(clean.len(), PAGE_SIZE);
        assert!(clean.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_clone_copies_contents() {
        let mut original = PageBuffer::zeroed();
        original[0] = 7;
        original[PAGE_SIZE - 1] = 9;
        let copy = original.clone();
        assert_eq!(copy[0], 7);
        assert_eq!(copy[PAGE_SIZE - 1], 9);
    }
}
