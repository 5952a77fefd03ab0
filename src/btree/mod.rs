//! B-tree Module
//!
//! Sorted key routing for one table: index pages on top, a doubly linked
//! chain of leaf pages underneath.
//!
//! ## Responsibilities
//! - Prefix-compressed keys (`KeyPrefix`) with lazy full-key tie breaks
//! - Leaf page rows, chain links and overflow/merge handling
//! - Index pages: search, insert with split, remove with borrow/merge
//! - Cursors that latch one leaf page at a time
//!
//! ## Shape
//! ```text
//!                    ┌──────────── index root ───────────┐
//!                    │  sep(b) → L1   sep(k) → L3        │
//!                    └───────┬─────────────┬─────────────┘
//!                            │ children    │  (0 on the bottom level)
//!                  ┌─────────▼──┐     ┌────▼───────┐
//!                  │ sep(f)→L2  │     │ sep(t)→L4  │
//!                  └────────────┘     └────────────┘
//!
//!   L1 ⇄ L2 ⇄ L3 ⇄ L4      every non-empty leaf page is named by exactly
//!                          one separator: the key of its first row
//! ```

pub(crate) mod cursor;
pub(crate) mod index;
pub(crate) mod leaf;

pub(crate) use cursor::{Bound, Cursor, Locate};
pub(crate) use index::{Find, IndexPage};
pub(crate) use leaf::{Latched, LeafPage, Row};

use std::cmp::Ordering;

use crate::cache::TableOp;
use crate::error::Result;

/// Bytes of key kept inline in leaf and index rows
pub(crate) const PREFIX_LEN: usize = 15;

/// Most rows a leaf page can hold on disk
pub const MAX_LEAF_CAPACITY: usize = 340;

/// Most separators an index page can hold on disk
pub const MAX_INDEX_CAPACITY: usize = 255;

// =============================================================================
// Key Prefix
// =============================================================================

/// The first bytes of a key as stored in a row.
///
/// Keys shorter than `PREFIX_LEN` are stored whole. For longer keys the
/// prefix alone cannot always decide an ordering; `compare` then returns
/// `None` and the caller fetches the full key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct KeyPrefix {
    len: u8,
    bytes: [u8; PREFIX_LEN],
}

impl KeyPrefix {
    pub(crate) fn new(key: &[u8]) -> Self {
        let len = key.len().min(PREFIX_LEN);
        let mut bytes = [0u8; PREFIX_LEN];
        bytes[..len].copy_from_slice(&key[..len]);
        Self { len: len as u8, bytes }
    }

    pub(crate) fn from_raw(len: u8, raw: &[u8]) -> Self {
        let mut bytes = [0u8; PREFIX_LEN];
        bytes.copy_from_slice(&raw[..PREFIX_LEN]);
        Self {
            len: len.min(PREFIX_LEN as u8),
            bytes,
        }
    }

    pub(crate) fn len(&self) -> u8 {
        self.len
    }

    pub(crate) fn bytes(&self) -> &[u8; PREFIX_LEN] {
        &self.bytes
    }

    /// Whether the stored bytes are the entire key
    pub(crate) fn is_whole(&self) -> bool {
        (self.len as usize) < PREFIX_LEN
    }

    /// Order of the stored key relative to `key`, or `None` when only the
    /// full stored key can tell.
    pub(crate) fn compare(&self, key: &[u8]) -> Option<Ordering> {
        if self.is_whole() {
            return Some(self.bytes[..self.len as usize].cmp(key));
        }
        let n = key.len().min(PREFIX_LEN);
        match self.bytes[..n].cmp(&key[..n]) {
            Ordering::Equal if key.len() < PREFIX_LEN => Some(Ordering::Greater),
            Ordering::Equal => None,
            other => Some(other),
        }
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// How index searches resolve ambiguous separators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Concurrent reader: separator leaves are try-latched, busy means retry
    Reader,
    /// The table's writer: leaves are read without latching
    Writer,
}

/// Binary search over `len` rows ordered by key.
///
/// `probe(i)` yields the order of row `i` relative to the searched key.
pub(crate) fn search<F>(len: usize, mut probe: F) -> Result<std::result::Result<usize, usize>>
where
    F: FnMut(usize) -> Result<Ordering>,
{
    let (mut low, mut high) = (0, len);
    while low < high {
        let mid = low + (high - low) / 2;
        match probe(mid)? {
            Ordering::Less => low = mid + 1,
            Ordering::Greater => high = mid,
            Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(low))
}

/// Compare a stored row against `key`, fetching the row's full key only
/// when its prefix is ambiguous.
pub(crate) fn compare_row<F>(prefix: &KeyPrefix, key: &[u8], fetch: F) -> Result<Ordering>
where
    F: FnOnce() -> Result<Vec<u8>>,
{
    match prefix.compare(key) {
        Some(order) => Ok(order),
        None => Ok(fetch()?.as_slice().cmp(key)),
    }
}

/// Physical slot choice when a row is added at logical position `at`.
///
/// Returns the new `lo`. Rows grow to the right unless the left half is
/// the cheaper side to shift and there is room there.
pub(crate) fn grow_side(lo: usize, len: usize, at: usize, capacity: usize) -> usize {
    let hi = lo + len;
    let mid = (lo + hi) / 2;
    if lo == 0 || (mid < lo + at && hi < capacity) {
        lo
    } else {
        lo - 1
    }
}

/// New `lo` after the row at logical position `at` is removed
pub(crate) fn shrink_side(lo: usize, len: usize, at: usize) -> usize {
    let mid = (2 * lo + len) / 2;
    if mid < lo + at {
        lo
    } else {
        lo + 1
    }
}

/// Keep `lo + len` inside the page
pub(crate) fn fit_lo(lo: usize, len: usize, capacity: usize) -> usize {
    if lo + len > capacity {
        capacity.saturating_sub(len)
    } else {
        lo
    }
}

/// Full key of the first row of leaf page `leaf`, used to break ties on
/// index separators.
pub(crate) fn leaf_first_key(op: &TableOp<'_>, leaf: u64, mode: Mode) -> Result<Option<Vec<u8>>> {
    let page = op.page(leaf)?;
    let _latch = match mode {
        Mode::Reader => match page.try_latch() {
            Some(latch) => Some(latch),
            None => return Ok(None),
        },
        Mode::Writer => None,
    };
    let addr = page.with_leaf(|leaf| leaf.rows().first().map(|row| row.addr))?;
    match addr {
        Some(addr) => Ok(Some(crate::record::read_key(op, addr)?)),
        None => Err(crate::error::AtlasError::invariant(format!(
            "separator names empty leaf page {}",
            page.index()
        ))),
    }
}
