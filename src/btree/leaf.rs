//! Leaf Pages
//!
//! The bottom level of the tree: sorted rows of `(key prefix, record
//! address)`, linked into one chain that spans the whole table.
//!
//! ## Layout
//! ```text
//! ┌────────────┬────────────┬─────┬─────────────┬──────┬──────┬────┬────┬─────────┐
//! │ row lo     │ row lo+1   │ ... │ (free rows) │ prev │ next │ lo │ hi │ trailer │
//! └────────────┴────────────┴─────┴─────────────┴──────┴──────┴────┴────┴─────────┘
//!   24 bytes: record addr u64, prefix len u8, prefix [u8; 15]
//! ```
//! Rows occupy the physical slots `lo..hi`; inserts grow whichever end
//! needs the smaller shift.
//!
//! ## Writer protocol
//! Every page touched by a writer stays latched until the operation ends.
//! Index separators are updated while the affected leaf still shows its
//! old first row, so separator tie breaks always read a consistent key.

use std::sync::Arc;

use crate::cache::TableOp;
use crate::error::{AtlasError, Result};
use crate::page::{LeafLatch, Page, PageBody};
use crate::record;
use crate::storage::{get_u16, get_u64, put_u16, put_u64, PAGE_SIZE};

use super::{compare_row, fit_lo, grow_side, index, search, shrink_side, KeyPrefix, MAX_LEAF_CAPACITY, PREFIX_LEN};

const ROW_LEN: usize = 24;
const TAIL: usize = PAGE_SIZE - 32;

/// One leaf row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Row {
    pub addr: u64,
    pub prefix: KeyPrefix,
}

impl Row {
    pub(crate) fn new(key: &[u8], addr: u64) -> Self {
        Self {
            addr,
            prefix: KeyPrefix::new(key),
        }
    }
}

/// Decoded leaf page
#[derive(Debug, Clone, Default)]
pub(crate) struct LeafPage {
    pub prev: u64,
    pub next: u64,
    lo: usize,
    rows: Vec<Row>,
}

impl LeafPage {
    pub(crate) fn new(prev: u64, next: u64) -> Self {
        Self {
            prev,
            next,
            lo: 0,
            rows: Vec::new(),
        }
    }

    pub(crate) fn decode(index: u64, buf: &[u8]) -> Result<Self> {
        let lo = get_u16(buf, TAIL + 16) as usize;
        let hi = get_u16(buf, TAIL + 18) as usize;
        if lo > hi || hi > MAX_LEAF_CAPACITY {
            return Err(AtlasError::corruption(index, format!("leaf rows {}..{}", lo, hi)));
        }
        let rows = (lo..hi)
            .map(|slot| {
                let pos = slot * ROW_LEN;
                Row {
                    addr: get_u64(buf, pos),
                    prefix: KeyPrefix::from_raw(buf[pos + 8], &buf[pos + 9..pos + 9 + PREFIX_LEN]),
                }
            })
            .collect();
        Ok(Self {
            prev: get_u64(buf, TAIL),
            next: get_u64(buf, TAIL + 8),
            lo,
            rows,
        })
    }

    pub(crate) fn encode(&self, buf: &mut [u8]) {
        for (i, row) in self.rows.iter().enumerate() {
            let pos = (self.lo + i) * ROW_LEN;
            put_u64(buf, pos, row.addr);
            buf[pos + 8] = row.prefix.len();
            buf[pos + 9..pos + 9 + PREFIX_LEN].copy_from_slice(row.prefix.bytes());
        }
        put_u64(buf, TAIL, self.prev);
        put_u64(buf, TAIL + 8, self.next);
        put_u16(buf, TAIL + 16, self.lo as u16);
        put_u16(buf, TAIL + 18, (self.lo + self.rows.len()) as u16);
    }

    pub(crate) fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(crate) fn insert(&mut self, at: usize, row: Row, capacity: usize) {
        self.lo = fit_lo(grow_side(self.lo, self.rows.len(), at, capacity), self.rows.len() + 1, capacity);
        self.rows.insert(at, row);
    }

    pub(crate) fn remove(&mut self, at: usize) -> Row {
        self.lo = shrink_side(self.lo, self.rows.len(), at);
        let row = self.rows.remove(at);
        if self.rows.is_empty() {
            self.lo = 0;
        }
        row
    }

    pub(crate) fn set_addr(&mut self, at: usize, addr: u64) {
        self.rows[at].addr = addr;
    }

    fn pop(&mut self) -> Option<Row> {
        self.rows.pop()
    }

    fn take_rows(&mut self) -> Vec<Row> {
        self.lo = 0;
        std::mem::take(&mut self.rows)
    }

    fn append(&mut self, rows: Vec<Row>, capacity: usize) {
        self.rows.extend(rows);
        self.lo = fit_lo(self.lo, self.rows.len(), capacity);
    }
}

// =============================================================================
// Writer-side chain maintenance
// =============================================================================

/// Leaf latches held by one write operation, released together on drop
#[derive(Default)]
pub(crate) struct Latched {
    held: Vec<(u64, LeafLatch)>,
}

impl Latched {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Latch `page` unless this operation already holds it
    pub(crate) fn hold(&mut self, page: &Page) {
        if !self.held.iter().any(|(index, _)| *index == page.index()) {
            self.held.push((page.index(), page.latch()));
        }
    }
}

/// Row `at` of a leaf page
pub(crate) fn row_at(page: &Page, at: usize) -> Result<Row> {
    let row = page.with_leaf(|leaf| leaf.rows().get(at).copied())?;
    row.ok_or_else(|| AtlasError::corruption(page.index(), format!("leaf has no row {}", at)))
}

/// Full key of row `at` of a leaf page
pub(crate) fn key_at(op: &TableOp<'_>, page: &Page, at: usize) -> Result<Vec<u8>> {
    record::read_key(op, row_at(page, at)?.addr)
}

/// Position of `key` among the rows of a leaf page
pub(crate) fn search_leaf(op: &TableOp<'_>, page: &Page, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
    page.with_leaf(|leaf| {
        search(leaf.len(), |i| {
            let row = leaf.rows()[i];
            compare_row(&row.prefix, key, || record::read_key(op, row.addr))
        })
    })?
}

// Separator edits take the index write lock; leaf latches are already held.

fn register(op: &TableOp<'_>, key: &[u8], leaf: u64) -> Result<()> {
    let _index = op.table.index_write();
    index::insert(op, key, leaf)
}

fn rekey(op: &TableOp<'_>, old: &[u8], new: &[u8]) -> Result<()> {
    let _index = op.table.index_write();
    index::update(op, old, new)
}

fn unregister(op: &TableOp<'_>, key: &[u8]) -> Result<()> {
    let _index = op.table.index_write();
    index::remove(op, key)
}

/// Allocate an empty leaf page, latched by `latched`
pub(crate) fn alloc_leaf(op: &TableOp<'_>, latched: &mut Latched, prev: u64, next: u64) -> Result<Arc<Page>> {
    let page = op.alloc_page(PageBody::Leaf(Box::new(LeafPage::new(prev, next))))?;
    latched.hold(&page);
    Ok(page)
}

/// Insert `row` (whose key is `key`) at position `at` of a latched leaf.
///
/// A full page hands one row to its successor, or to a fresh page spliced
/// in after it when the successor is missing or also full.
pub(crate) fn insert_row(
    op: &TableOp<'_>,
    latched: &mut Latched,
    page: &Arc<Page>,
    at: usize,
    key: &[u8],
    row: Row,
) -> Result<()> {
    let capacity = op.leaf_capacity();
    let (len, next) = page.with_leaf(|leaf| (leaf.len(), leaf.next))?;

    if len < capacity {
        if at == 0 {
            if len == 0 {
                register(op, key, page.index())?;
            } else {
                let old = key_at(op, page, 0)?;
                rekey(op, &old, key)?;
            }
        }
        page.with_leaf_mut(|leaf| leaf.insert(at, row, capacity))?;
        return Ok(());
    }

    // Pick the page that receives the overflow row.
    let (target, fresh) = if next == 0 {
        let target = alloc_leaf(op, latched, page.index(), 0)?;
        (target, true)
    } else {
        let successor = op.page(next)?;
        latched.hold(&successor);
        if successor.with_leaf(|leaf| leaf.len())? < capacity {
            (successor, false)
        } else {
            let target = alloc_leaf(op, latched, page.index(), next)?;
            let split = target.index();
            successor.with_leaf_mut(|leaf| leaf.prev = split)?;
            (target, true)
        }
    };
    let target_index = target.index();
    if fresh {
        page.with_leaf_mut(|leaf| leaf.next = target_index)?;
    }

    let (moved, moved_key) = if at == len {
        (row, key.to_vec())
    } else {
        let last = page.with_leaf(|leaf| leaf.rows()[len - 1])?;
        (last, record::read_key(op, last.addr)?)
    };

    if fresh {
        target.with_leaf_mut(|leaf| leaf.insert(0, moved, capacity))?;
        register(op, &moved_key, target_index)?;
    } else if target.with_leaf(|leaf| leaf.is_empty())? {
        register(op, &moved_key, target_index)?;
        target.with_leaf_mut(|leaf| leaf.insert(0, moved, capacity))?;
    } else {
        let old = key_at(op, &target, 0)?;
        rekey(op, &old, &moved_key)?;
        target.with_leaf_mut(|leaf| leaf.insert(0, moved, capacity))?;
    }

    if at < len {
        page.with_leaf_mut(|leaf| leaf.pop())?;
        if at == 0 {
            let old = key_at(op, page, 0)?;
            rekey(op, &old, key)?;
        }
        page.with_leaf_mut(|leaf| leaf.insert(at, row, capacity))?;
    }
    Ok(())
}

/// Remove row `at` (whose key is `key`) from a latched leaf, then merge
/// the page with a neighbour when their rows fit in one page.
pub(crate) fn remove_row(op: &TableOp<'_>, latched: &mut Latched, page: &Arc<Page>, at: usize, key: &[u8]) -> Result<Row> {
    let len = page.with_leaf(|leaf| leaf.len())?;
    if at == 0 {
        if len == 1 {
            unregister(op, key)?;
        } else {
            let second = key_at(op, page, 1)?;
            rekey(op, key, &second)?;
        }
    }
    let row = page.with_leaf_mut(|leaf| leaf.remove(at))?;
    maintain(op, latched, page)?;
    Ok(row)
}

fn maintain(op: &TableOp<'_>, latched: &mut Latched, page: &Arc<Page>) -> Result<()> {
    let capacity = op.leaf_capacity();
    let (len, prev, next) = page.with_leaf(|leaf| (leaf.len(), leaf.prev, leaf.next))?;

    if len == 0 {
        unlink(op, latched, prev, next)?;
        op.free_page(page)?;
        return Ok(());
    }

    if prev != 0 {
        let before = op.page(prev)?;
        latched.hold(&before);
        if before.with_leaf(|leaf| leaf.len())? + len <= capacity {
            let first = key_at(op, page, 0)?;
            unregister(op, &first)?;
            let rows = page.with_leaf_mut(|leaf| leaf.take_rows())?;
            before.with_leaf_mut(|leaf| leaf.append(rows, capacity))?;
            unlink(op, latched, prev, next)?;
            op.free_page(page)?;
            return Ok(());
        }
    }

    if next != 0 {
        let after = op.page(next)?;
        latched.hold(&after);
        let (after_len, after_next) = after.with_leaf(|leaf| (leaf.len(), leaf.next))?;
        if len + after_len <= capacity {
            if after_len > 0 {
                let first = key_at(op, &after, 0)?;
                unregister(op, &first)?;
            }
            let rows = after.with_leaf_mut(|leaf| leaf.take_rows())?;
            page.with_leaf_mut(|leaf| leaf.append(rows, capacity))?;
            unlink(op, latched, page.index(), after_next)?;
            op.free_page(&after)?;
        }
    }
    Ok(())
}

/// Point `prev` and `next` at each other, dropping whatever sat between
fn unlink(op: &TableOp<'_>, latched: &mut Latched, prev: u64, next: u64) -> Result<()> {
    if prev != 0 {
        let before = op.page(prev)?;
        latched.hold(&before);
        before.with_leaf_mut(|leaf| leaf.next = next)?;
    }
    if next != 0 {
        let after = op.page(next)?;
        latched.hold(&after);
        after.with_leaf_mut(|leaf| leaf.prev = prev)?;
    }
    Ok(())
}
