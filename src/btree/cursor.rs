//! Reader Cursors
//!
//! A cursor is one latched leaf page plus a row position. Readers hold at
//! most one leaf latch at a time and never block on a latch while holding
//! anything else: every contended latch is reported back as
//! `Locate::Wait`, the caller waits for that page with nothing held and
//! restarts from the index.

use std::sync::Arc;

use crate::cache::TableOp;
use crate::error::{AtlasError, Result};
use crate::page::{LeafLatch, Page};
use crate::record;

use super::index::{self, Find};
use super::leaf::{row_at, search_leaf};
use super::Mode;

/// Result of positioning or stepping a cursor
pub(crate) enum Locate {
    At(Cursor),
    /// Ran off either end of the table
    End,
    /// A latch was busy; wait for this page and retry
    Wait(u64),
}

/// Which row a seek settles on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Bound {
    /// First row with key >= probe
    AtOrAfter,
    /// First row with key > probe
    After,
    /// Last row with key <= probe
    AtOrBefore,
    /// Last row with key < probe
    Before,
}

/// A latched leaf page and a row on it
pub(crate) struct Cursor {
    page: Arc<Page>,
    _latch: LeafLatch,
    pos: usize,
}

impl Cursor {
    fn addr(&self) -> Result<u64> {
        Ok(row_at(&self.page, self.pos)?.addr)
    }

    pub(crate) fn key(&self, op: &TableOp<'_>) -> Result<Vec<u8>> {
        record::read_key(op, self.addr()?)
    }

    pub(crate) fn value(&self, op: &TableOp<'_>) -> Result<Vec<u8>> {
        record::read_value(op, self.addr()?)
    }

    /// Key and value of every row from the cursor to the end of its page
    /// (`forward`) or back to the start of it.
    pub(crate) fn drain_page(&self, op: &TableOp<'_>, forward: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let addrs: Option<Vec<u64>> = self.page.with_leaf(|leaf| {
            let rows = leaf.rows();
            if forward {
                rows.get(self.pos..).map(|rows| rows.iter().map(|row| row.addr).collect())
            } else {
                rows.get(..=self.pos).map(|rows| rows.iter().rev().map(|row| row.addr).collect())
            }
        })?;
        let addrs = addrs.ok_or_else(|| {
            AtlasError::corruption(self.page.index(), format!("cursor past the last row at {}", self.pos))
        })?;
        addrs.into_iter().map(|addr| record::read_record(op, addr)).collect()
    }

    /// First row of the next non-empty page. The latch on the new page is
    /// taken before the old one is released.
    pub(crate) fn next_page(self, op: &TableOp<'_>) -> Result<Locate> {
        let mut current = self;
        loop {
            let next = current.page.with_leaf(|leaf| leaf.next)?;
            if next == 0 {
                return Ok(Locate::End);
            }
            let page = op.page(next)?;
            let latch = match page.try_latch() {
                Some(latch) => latch,
                None => return Ok(Locate::Wait(next)),
            };
            let len = page.with_leaf(|leaf| leaf.len())?;
            current = Cursor {
                page,
                _latch: latch,
                pos: 0,
            };
            if len > 0 {
                return Ok(Locate::At(current));
            }
        }
    }

    /// Last row of the previous non-empty page
    pub(crate) fn prev_page(self, op: &TableOp<'_>) -> Result<Locate> {
        let mut current = self;
        loop {
            let prev = current.page.with_leaf(|leaf| leaf.prev)?;
            if prev == 0 {
                return Ok(Locate::End);
            }
            let page = op.page(prev)?;
            let latch = match page.try_latch() {
                Some(latch) => latch,
                None => return Ok(Locate::Wait(prev)),
            };
            let len = page.with_leaf(|leaf| leaf.len())?;
            current = Cursor {
                page,
                _latch: latch,
                pos: len.saturating_sub(1),
            };
            if len > 0 {
                return Ok(Locate::At(current));
            }
        }
    }
}

/// Latch `leaf` while still holding the index read guard; on success the
/// guard is released and the cursor is positioned on row 0.
fn enter(op: &TableOp<'_>, leaf: u64) -> Result<Option<Cursor>> {
    let page = op.page(leaf)?;
    Ok(page.try_latch().map(|latch| Cursor {
        page,
        _latch: latch,
        pos: 0,
    }))
}

/// Position on the row selected by `bound` relative to `key`
pub(crate) fn seek(op: &TableOp<'_>, key: &[u8], bound: Bound) -> Result<Locate> {
    let mut cursor = {
        let _index = op.table.index_read();
        let leaf = match index::find(op, key, Mode::Reader)? {
            Find::Empty => return Ok(Locate::End),
            Find::Busy(leaf) => return Ok(Locate::Wait(leaf)),
            Find::Leaf(leaf) => leaf,
        };
        match enter(op, leaf)? {
            Some(cursor) => cursor,
            None => return Ok(Locate::Wait(leaf)),
        }
    };

    let len = cursor.page.with_leaf(|leaf| leaf.len())?;
    let at = search_leaf(op, &cursor.page, key)?;
    match bound {
        Bound::AtOrAfter | Bound::After => {
            let pos = match at {
                Ok(i) if bound == Bound::After => i + 1,
                Ok(i) | Err(i) => i,
            };
            if pos < len {
                cursor.pos = pos;
                Ok(Locate::At(cursor))
            } else {
                cursor.next_page(op)
            }
        }
        Bound::AtOrBefore | Bound::Before => {
            let pos = match at {
                Ok(i) if bound == Bound::AtOrBefore => Some(i),
                Ok(i) | Err(i) => i.checked_sub(1),
            };
            match pos {
                Some(pos) if pos < len => {
                    cursor.pos = pos;
                    Ok(Locate::At(cursor))
                }
                _ => cursor.prev_page(op),
            }
        }
    }
}

/// Row holding exactly `key`; `End` when the key is absent
pub(crate) fn exact(op: &TableOp<'_>, key: &[u8]) -> Result<Locate> {
    match seek(op, key, Bound::AtOrAfter)? {
        Locate::At(cursor) => {
            let order = row_at(&cursor.page, cursor.pos)?.prefix.compare(key);
            let equal = match order {
                Some(order) => order.is_eq(),
                None => cursor.key(op)? == key,
            };
            Ok(if equal { Locate::At(cursor) } else { Locate::End })
        }
        other => Ok(other),
    }
}

/// First row of the table
pub(crate) fn first(op: &TableOp<'_>) -> Result<Locate> {
    edge(op, false)
}

/// Last row of the table
pub(crate) fn last(op: &TableOp<'_>) -> Result<Locate> {
    edge(op, true)
}

fn edge(op: &TableOp<'_>, last: bool) -> Result<Locate> {
    let mut cursor = {
        let _index = op.table.index_read();
        let leaf = match if last { index::last_leaf(op)? } else { index::first_leaf(op)? } {
            Some(leaf) => leaf,
            None => return Ok(Locate::End),
        };
        match enter(op, leaf)? {
            Some(cursor) => cursor,
            None => return Ok(Locate::Wait(leaf)),
        }
    };
    let len = cursor.page.with_leaf(|leaf| leaf.len())?;
    if len == 0 {
        return if last { cursor.prev_page(op) } else { cursor.next_page(op) };
    }
    if last {
        cursor.pos = len - 1;
    }
    Ok(Locate::At(cursor))
}
