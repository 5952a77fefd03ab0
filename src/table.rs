//! Table Handles
//!
//! The key/value surface of one table.
//!
//! ## Concurrency Model
//!
//! - **Writes** (put/remove): one writer per table
//!   - Acquire: write barrier → writer lock → leaf latches (blocking)
//!   - Separator edits briefly take the index write lock
//!
//! - **Reads** (get/seek/walk): any number, concurrent with the writer
//!   - Route under the index read lock, then try-latch one leaf page
//!   - A busy latch means: drop everything, wait for it, start over
//!
//! Every operation pins the pages it reaches with an epoch stamp; walks
//! use a sliding window instead so long scans do not pin the whole table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::btree::cursor::{self, Bound, Locate};
use crate::btree::index::{self, Find};
use crate::btree::leaf::{alloc_leaf, insert_row, remove_row, row_at, search_leaf};
use crate::btree::{Latched, Mode, Row};
use crate::cache::{TableCache, TableOp};
use crate::error::{AtlasError, Result};
use crate::record;

// =============================================================================
// Open table bookkeeping
// =============================================================================

/// A registered table and the number of handles open on it
pub(crate) struct OpenTable {
    cache: Arc<TableCache>,
    halted: Arc<AtomicBool>,
    handles: Mutex<usize>,
    closed: Condvar,
}

impl OpenTable {
    pub(crate) fn new(cache: Arc<TableCache>, halted: Arc<AtomicBool>) -> Self {
        Self {
            cache,
            halted,
            handles: Mutex::new(0),
            closed: Condvar::new(),
        }
    }

    pub(crate) fn cache(&self) -> &Arc<TableCache> {
        &self.cache
    }

    /// Block until every handle on this table has been dropped
    pub(crate) fn wait_closed(&self) {
        let mut handles = self.handles.lock();
        while *handles > 0 {
            self.closed.wait(&mut handles);
        }
    }
}

/// Handle to an open table. Dropping the last handle closes the table.
pub struct TableHandle {
    table: Arc<OpenTable>,
}

impl TableHandle {
    pub(crate) fn open(table: Arc<OpenTable>) -> Self {
        *table.handles.lock() += 1;
        Self { table }
    }

    fn cache(&self) -> &TableCache {
        &self.table.cache
    }

    fn check_running(&self) -> Result<()> {
        if self.table.halted.load(Ordering::Acquire) {
            return Err(AtlasError::Halted);
        }
        Ok(())
    }

    /// Name of the table
    pub fn name(&self) -> &str {
        self.cache().name()
    }

    // =========================================================================
    // Point reads
    // =========================================================================

    /// Value stored under `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let op = self.cache().op();
        loop {
            match cursor::exact(&op, key)? {
                Locate::At(cursor) => return Ok(Some(cursor.value(&op)?)),
                Locate::End => return Ok(None),
                Locate::Wait(page) => op.wait_for(page)?,
            }
        }
    }

    /// Whether `key` is present
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        let op = self.cache().op();
        loop {
            match cursor::exact(&op, key)? {
                Locate::At(_) => return Ok(true),
                Locate::End => return Ok(false),
                Locate::Wait(page) => op.wait_for(page)?,
            }
        }
    }

    pub fn record_count(&self) -> u64 {
        self.cache().magic().record_count
    }

    /// Smallest key in the table
    pub fn first_key(&self) -> Result<Option<Vec<u8>>> {
        self.key_at(|op| cursor::first(op))
    }

    /// Largest key in the table
    pub fn last_key(&self) -> Result<Option<Vec<u8>>> {
        self.key_at(|op| cursor::last(op))
    }

    /// Smallest key strictly greater than `key`
    pub fn next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.key_at(|op| cursor::seek(op, key, Bound::After))
    }

    /// Largest key strictly less than `key`
    pub fn prev_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.key_at(|op| cursor::seek(op, key, Bound::Before))
    }

    fn key_at<F>(&self, locate: F) -> Result<Option<Vec<u8>>>
    where
        F: Fn(&TableOp<'_>) -> Result<Locate>,
    {
        let op = self.cache().op();
        loop {
            match locate(&op)? {
                Locate::At(cursor) => return Ok(Some(cursor.key(&op)?)),
                Locate::End => return Ok(None),
                Locate::Wait(page) => op.wait_for(page)?,
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store `value` under `key`.
    ///
    /// Returns `false` without writing when the key exists and `overwrite`
    /// is not set.
    pub fn put(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<bool> {
        self.check_running()?;
        let table = self.cache();
        let _permit = table.barrier().enter();
        let _writer = table.writer();
        let op = table.op();
        let mut latched = Latched::new();

        let page = match route(&op, key)? {
            Some(leaf) => {
                let page = op.page(leaf)?;
                latched.hold(&page);
                page
            }
            None => alloc_leaf(&op, &mut latched, 0, 0)?,
        };

        match search_leaf(&op, &page, key)? {
            Ok(at) => {
                if !overwrite {
                    return Ok(false);
                }
                let old = row_at(&page, at)?.addr;
                let addr = record::replace_record(&op, old, key, value)?;
                if addr != old {
                    page.with_leaf_mut(|leaf| leaf.set_addr(at, addr))?;
                }
            }
            Err(at) => {
                let addr = record::write_record(&op, key, value)?;
                insert_row(&op, &mut latched, &page, at, key, Row::new(key, addr))?;
                op.magic().record_count += 1;
            }
        }
        Ok(true)
    }

    /// Store `value` under `key` unless the key exists
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.put(key, value, false)
    }

    /// Store `value` under `key`, replacing any previous value
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put(key, value, true).map(|_| ())
    }

    /// Delete `key`, returning its value
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_running()?;
        let table = self.cache();
        let _permit = table.barrier().enter();
        let _writer = table.writer();
        let op = table.op();
        let mut latched = Latched::new();

        let Some(leaf) = route(&op, key)? else {
            return Ok(None);
        };
        let page = op.page(leaf)?;
        latched.hold(&page);
        let at = match search_leaf(&op, &page, key)? {
            Ok(at) => at,
            Err(_) => return Ok(None),
        };

        let addr = row_at(&page, at)?.addr;
        let value = record::read_value(&op, addr)?;
        remove_row(&op, &mut latched, &page, at, key)?;
        record::free_record(&op, addr)?;
        let mut magic = op.magic();
        magic.record_count = magic.record_count.saturating_sub(1);
        Ok(Some(value))
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Visit every row in ascending key order until `visit` returns `false`
    pub fn walk<F>(&self, visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.scan(None, true, visit)
    }

    /// Visit rows with key >= `start` in ascending order
    pub fn walk_from<F>(&self, start: &[u8], visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.scan(Some(start), true, visit)
    }

    /// Visit every row in descending key order until `visit` returns `false`
    pub fn rwalk<F>(&self, visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.scan(None, false, visit)
    }

    /// Visit rows with key <= `start` in descending order
    pub fn rwalk_from<F>(&self, start: &[u8], visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.scan(Some(start), false, visit)
    }

    /// Page-at-a-time scan. Rows of one page are copied out under its
    /// latch; `visit` runs with nothing held and the window slides past
    /// the page before the next one is entered.
    fn scan<F>(&self, start: Option<&[u8]>, forward: bool, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let op = self.cache().scan_op();
        let (inclusive, exclusive) = if forward {
            (Bound::AtOrAfter, Bound::After)
        } else {
            (Bound::AtOrBefore, Bound::Before)
        };
        let mut resume: Option<(Vec<u8>, Bound)> = start.map(|key| (key.to_vec(), inclusive));

        loop {
            let located = match &resume {
                Some((key, bound)) => cursor::seek(&op, key, *bound)?,
                None if forward => cursor::first(&op)?,
                None => cursor::last(&op)?,
            };
            let cursor = match located {
                Locate::At(cursor) => cursor,
                Locate::End => return Ok(()),
                Locate::Wait(page) => {
                    op.wait_for(page)?;
                    continue;
                }
            };
            let rows = cursor.drain_page(&op, forward)?;
            drop(cursor);

            for (key, value) in &rows {
                if !visit(key, value) {
                    return Ok(());
                }
            }
            match rows.into_iter().last() {
                Some((key, _)) => resume = Some((key, exclusive)),
                None => return Ok(()),
            }
            op.slide();
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Row count of every leaf page, in chain order
    pub fn leaf_chain(&self) -> Result<Vec<usize>> {
        let table = self.cache();
        let _writer = table.writer();
        let op = table.op();
        let mut next = {
            let _index = table.index_read();
            index::first_leaf(&op)?
        };
        let mut counts = Vec::new();
        while let Some(leaf) = next.filter(|&leaf| leaf != 0) {
            let page = op.page(leaf)?;
            let (len, after) = page.with_leaf(|leaf| (leaf.len(), leaf.next))?;
            counts.push(len);
            next = Some(after);
        }
        Ok(counts)
    }
}

/// Writer-side routing: the leaf page whose range covers `key`
fn route(op: &TableOp<'_>, key: &[u8]) -> Result<Option<u64>> {
    let _index = op.table.index_read();
    match index::find(op, key, Mode::Writer)? {
        Find::Empty => Ok(None),
        Find::Leaf(leaf) => Ok(Some(leaf)),
        Find::Busy(leaf) => Err(AtlasError::invariant(format!(
            "writer saw busy leaf page {} while routing",
            leaf
        ))),
    }
}

impl Clone for TableHandle {
    fn clone(&self) -> Self {
        Self::open(Arc::clone(&self.table))
    }
}

impl Drop for TableHandle {
    fn drop(&mut self) {
        let mut handles = self.table.handles.lock();
        *handles -= 1;
        if *handles == 0 {
            self.table.closed.notify_all();
        }
    }
}

impl std::fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableHandle").field("name", &self.name()).finish()
    }
}
