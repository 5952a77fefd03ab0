//! Page Module
//!
//! The cached unit of storage: a page index, a dirty flag, and a body
//! decoded into one of four kinds.
//!
//! ## Page Trailer
//! ```text
//! ┌─────────────────────────────────────────────┬───────────────────────┐
//! │ body (PAGE_SIZE - 8)                        │ make_addr(index, kind)│
//! └─────────────────────────────────────────────┴───────────────────────┘
//! ```
//! The trailer lets a raw page be redispatched to the right decoder and
//! lets the log carry pages away from their home position.

mod magic;

pub(crate) use magic::MagicPage;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};

use crate::btree::{IndexPage, LeafPage};
use crate::error::{AtlasError, Result};
use crate::storage::{addr_index, addr_pos, get_u64, make_addr, put_u64, PageBuffer, PAGE_SIZE};

/// Offset of the page trailer
pub(crate) const TRAILER: usize = PAGE_SIZE - 8;

/// Identifies a table inside the shared cache
pub(crate) type TableId = u32;

/// Exclusive latch over one leaf page, owned by a cursor
pub(crate) type LeafLatch = ArcMutexGuard<RawMutex, ()>;

/// Page kind tag stored in the trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageKind {
    Free = 0,
    Data = 1,
    Index = 2,
    Leaf = 3,
}

impl PageKind {
    fn from_tag(tag: usize) -> Option<Self> {
        match tag {
            0 => Some(PageKind::Free),
            1 => Some(PageKind::Data),
            2 => Some(PageKind::Index),
            3 => Some(PageKind::Leaf),
            _ => None,
        }
    }
}

/// Decoded page contents
pub(crate) enum PageBody {
    /// Member of the table free list; holds the next free index
    Free { next: u64 },
    /// Record segments, kept as raw bytes
    Data(PageBuffer),
    Index(Box<IndexPage>),
    Leaf(Box<LeafPage>),
}

impl PageBody {
    pub(crate) fn kind(&self) -> PageKind {
        match self {
            PageBody::Free { .. } => PageKind::Free,
            PageBody::Data(_) => PageKind::Data,
            PageBody::Index(_) => PageKind::Index,
            PageBody::Leaf(_) => PageKind::Leaf,
        }
    }

    /// Decode a raw page read from page `index`
    pub(crate) fn decode(index: u64, buf: PageBuffer) -> Result<Self> {
        let trailer = get_u64(&buf, TRAILER);
        if addr_index(trailer) != index {
            return Err(AtlasError::corruption(
                index,
                format!("trailer names page {}", addr_index(trailer)),
            ));
        }
        let kind = PageKind::from_tag(addr_pos(trailer))
            .ok_or_else(|| AtlasError::corruption(index, format!("unknown page kind {}", addr_pos(trailer))))?;
        Ok(match kind {
            PageKind::Free => PageBody::Free {
                next: get_u64(&buf, 0),
            },
            PageKind::Data => PageBody::Data(buf),
            PageKind::Index => PageBody::Index(Box::new(IndexPage::decode(index, &buf)?)),
            PageKind::Leaf => PageBody::Leaf(Box::new(LeafPage::decode(index, &buf)?)),
        })
    }

    /// Encode into a fresh buffer, trailer included
    pub(crate) fn encode(&self, index: u64) -> PageBuffer {
        let mut buf = match self {
            PageBody::Data(data) => data.clone(),
            _ => PageBuffer::zeroed(),
        };
        match self {
            PageBody::Free { next } => put_u64(&mut buf, 0, *next),
            PageBody::Data(_) => {}
            PageBody::Index(page) => page.encode(&mut buf),
            PageBody::Leaf(page) => page.encode(&mut buf),
        }
        put_u64(&mut buf, TRAILER, make_addr(index, self.kind() as usize));
        buf
    }
}

/// A cached page
pub(crate) struct Page {
    table: TableId,
    index: u64,
    dirty: AtomicBool,
    body: RwLock<PageBody>,
    latch: Arc<Mutex<()>>,
}

impl Page {
    pub(crate) fn new(table: TableId, index: u64, body: PageBody) -> Arc<Self> {
        Arc::new(Self {
            table,
            index,
            dirty: AtomicBool::new(false),
            body: RwLock::new(body),
            latch: Arc::new(Mutex::new(())),
        })
    }

    pub(crate) fn table(&self) -> TableId {
        self.table
    }

    pub(crate) fn index(&self) -> u64 {
        self.index
    }

    pub(crate) fn kind(&self) -> PageKind {
        self.body.read().kind()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Block until the leaf latch is ours
    pub(crate) fn latch(&self) -> LeafLatch {
        self.latch.lock_arc()
    }

    /// Take the leaf latch only if nobody holds it
    pub(crate) fn try_latch(&self) -> Option<LeafLatch> {
        self.latch.try_lock_arc()
    }

    /// Swap in a new body (allocation, free, index rewrite) and mark dirty
    pub(crate) fn replace_body(&self, body: PageBody) {
        *self.body.write() = body;
        self.mark_dirty();
    }

    pub(crate) fn with_leaf<R>(&self, f: impl FnOnce(&LeafPage) -> R) -> Result<R> {
        match &*self.body.read() {
            PageBody::Leaf(leaf) => Ok(f(leaf)),
            other => Err(self.mismatch(PageKind::Leaf, other.kind())),
        }
    }

    pub(crate) fn with_leaf_mut<R>(&self, f: impl FnOnce(&mut LeafPage) -> R) -> Result<R> {
        let result = match &mut *self.body.write() {
            PageBody::Leaf(leaf) => f(leaf),
            other => return Err(self.mismatch(PageKind::Leaf, other.kind())),
        };
        self.mark_dirty();
        Ok(result)
    }

    pub(crate) fn with_index<R>(&self, f: impl FnOnce(&IndexPage) -> R) -> Result<R> {
        match &*self.body.read() {
            PageBody::Index(index) => Ok(f(index)),
            other => Err(self.mismatch(PageKind::Index, other.kind())),
        }
    }

    pub(crate) fn with_index_mut<R>(&self, f: impl FnOnce(&mut IndexPage) -> R) -> Result<R> {
        let result = match &mut *self.body.write() {
            PageBody::Index(index) => f(index),
            other => return Err(self.mismatch(PageKind::Index, other.kind())),
        };
        self.mark_dirty();
        Ok(result)
    }

    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        match &*self.body.read() {
            PageBody::Data(buf) => Ok(f(buf)),
            other => Err(self.mismatch(PageKind::Data, other.kind())),
        }
    }

    pub(crate) fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let result = match &mut *self.body.write() {
            PageBody::Data(buf) => f(buf),
            other => return Err(self.mismatch(PageKind::Data, other.kind())),
        };
        self.mark_dirty();
        Ok(result)
    }

    /// Next index stored in a free page
    pub(crate) fn free_next(&self) -> Result<u64> {
        match &*self.body.read() {
            PageBody::Free { next } => Ok(*next),
            other => Err(self.mismatch(PageKind::Free, other.kind())),
        }
    }

    fn mismatch(&self, want: PageKind, found: PageKind) -> AtlasError {
        AtlasError::corruption(self.index, format!("expected {:?} page, found {:?}", want, found))
    }

    /// Byte-exact copy of a dirty page; clears the dirty flag
    pub(crate) fn snapshot(&self) -> Option<PageBuffer> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return None;
        }
        Some(self.body.read().encode(self.index))
    }
}
