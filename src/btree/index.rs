//! Index Pages
//!
//! B-tree nodes whose entries route keys to leaf pages. Every entry, on
//! every level, names one leaf page; child pointers are zero on the
//! bottom level and all non-zero above it.
//!
//! ## Layout
//! ```text
//! ┌───────────────────────────────┬─────┬───────────────┬────────┬────┬────┬─────────┐
//! │ row p: child[p] prefix leaf   │ ... │ child[hi]     │ parent │ lo │ hi │ trailer │
//! └───────────────────────────────┴─────┴───────────────┴────────┴────┴────┴─────────┘
//!   32 bytes: child u64, prefix len u8, prefix [u8; 15], leaf u64
//! ```
//! `parent` is `make_addr(parent_page, slot * 32)`, the physical slot of
//! this page among its parent's children. Rebalancing climbs through it
//! instead of re-descending from the root.
//!
//! Structural edits work on owned copies: load, edit, store, then fix the
//! back-pointer of every child whose physical slot changed.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::cache::TableOp;
use crate::error::{AtlasError, Result};
use crate::page::PageBody;
use crate::storage::{addr_index, addr_pos, get_u16, get_u64, make_addr, put_u16, put_u64, PAGE_SIZE};

use super::{fit_lo, grow_side, leaf_first_key, search, shrink_side, KeyPrefix, Mode, MAX_INDEX_CAPACITY, PREFIX_LEN};

const ROW_LEN: usize = 32;
const TAIL: usize = PAGE_SIZE - 32;

/// One index entry: the first key of `leaf`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Separator {
    pub prefix: KeyPrefix,
    pub leaf: u64,
}

impl Separator {
    pub(crate) fn new(key: &[u8], leaf: u64) -> Self {
        Self {
            prefix: KeyPrefix::new(key),
            leaf,
        }
    }
}

/// Decoded index page
#[derive(Debug, Clone)]
pub(crate) struct IndexPage {
    lo: usize,
    seps: Vec<Separator>,
    /// `seps.len() + 1` child page indices, all zero on the bottom level
    children: Vec<u64>,
    parent: u64,
}

impl Default for IndexPage {
    fn default() -> Self {
        Self {
            lo: 0,
            seps: Vec::new(),
            children: vec![0],
            parent: 0,
        }
    }
}

impl IndexPage {
    pub(crate) fn decode(index: u64, buf: &[u8]) -> Result<Self> {
        let lo = get_u16(buf, TAIL + 16) as usize;
        let hi = get_u16(buf, TAIL + 18) as usize;
        if lo > hi || hi > MAX_INDEX_CAPACITY {
            return Err(AtlasError::corruption(index, format!("index rows {}..{}", lo, hi)));
        }
        let seps = (lo..hi)
            .map(|slot| {
                let pos = slot * ROW_LEN;
                Separator {
                    prefix: KeyPrefix::from_raw(buf[pos + 8], &buf[pos + 9..pos + 9 + PREFIX_LEN]),
                    leaf: get_u64(buf, pos + 24),
                }
            })
            .collect();
        let children = (lo..=hi).map(|slot| get_u64(buf, slot * ROW_LEN)).collect();
        Ok(Self {
            lo,
            seps,
            children,
            parent: get_u64(buf, TAIL + 8),
        })
    }

    pub(crate) fn encode(&self, buf: &mut [u8]) {
        for (i, sep) in self.seps.iter().enumerate() {
            let pos = (self.lo + i) * ROW_LEN;
            buf[pos + 8] = sep.prefix.len();
            buf[pos + 9..pos + 9 + PREFIX_LEN].copy_from_slice(sep.prefix.bytes());
            put_u64(buf, pos + 24, sep.leaf);
        }
        for (i, child) in self.children.iter().enumerate() {
            put_u64(buf, (self.lo + i) * ROW_LEN, *child);
        }
        put_u64(buf, TAIL + 8, self.parent);
        put_u16(buf, TAIL + 16, self.lo as u16);
        put_u16(buf, TAIL + 18, (self.lo + self.seps.len()) as u16);
    }

    pub(crate) fn len(&self) -> usize {
        self.seps.len()
    }

    pub(crate) fn is_bottom(&self) -> bool {
        self.children[0] == 0
    }

    pub(crate) fn parent(&self) -> u64 {
        self.parent
    }

    pub(crate) fn separators(&self) -> &[Separator] {
        &self.seps
    }

    pub(crate) fn children(&self) -> &[u64] {
        &self.children
    }

    /// Logical position of a child given its stored back-pointer slot
    fn child_at(&self, slot: usize) -> Option<usize> {
        slot.checked_sub(self.lo).filter(|at| *at < self.children.len())
    }

    fn slots(&self) -> HashMap<u64, usize> {
        self.children
            .iter()
            .enumerate()
            .filter(|(_, child)| **child != 0)
            .map(|(i, child)| (*child, self.lo + i))
            .collect()
    }

    /// Insert `sep` at `at` with `right` as the child that follows it
    fn insert_entry(&mut self, at: usize, sep: Separator, right: u64, capacity: usize) {
        self.lo = fit_lo(grow_side(self.lo, self.seps.len(), at, capacity), self.seps.len() + 1, capacity);
        self.seps.insert(at, sep);
        self.children.insert(at + 1, right);
    }

    /// Insert `sep` in front with `left` as the new first child
    fn push_front(&mut self, sep: Separator, left: u64, capacity: usize) {
        self.lo = fit_lo(grow_side(self.lo, self.seps.len(), 0, capacity), self.seps.len() + 1, capacity);
        self.seps.insert(0, sep);
        self.children.insert(0, left);
    }

    /// Remove entry `at` and the child that follows it
    fn remove_entry(&mut self, at: usize) -> (Separator, u64) {
        self.lo = shrink_side(self.lo, self.seps.len(), at);
        let sep = self.seps.remove(at);
        let child = self.children.remove(at + 1);
        if self.seps.is_empty() {
            self.lo = 0;
        }
        (sep, child)
    }
}

// =============================================================================
// Page access
// =============================================================================

fn load(op: &TableOp<'_>, index: u64) -> Result<IndexPage> {
    op.page(index)?.with_index(|node| node.clone())
}

fn store(op: &TableOp<'_>, index: u64, node: IndexPage) -> Result<()> {
    op.page(index)?.replace_body(PageBody::Index(Box::new(node)));
    Ok(())
}

fn set_parent(op: &TableOp<'_>, child: u64, parent: u64) -> Result<()> {
    op.page(child)?.with_index_mut(|node| node.parent = parent)
}

/// Point every child whose physical slot differs from `before` back at `index`
fn relink(op: &TableOp<'_>, index: u64, node: &IndexPage, before: &HashMap<u64, usize>) -> Result<()> {
    for (i, child) in node.children.iter().enumerate() {
        let slot = node.lo + i;
        if *child != 0 && before.get(child) != Some(&slot) {
            set_parent(op, *child, make_addr(index, slot * ROW_LEN))?;
        }
    }
    Ok(())
}

fn root(op: &TableOp<'_>) -> u64 {
    op.magic().root_index
}

fn ensure_root(op: &TableOp<'_>) -> Result<u64> {
    let current = root(op);
    if current != 0 {
        return Ok(current);
    }
    let page = op.alloc_page(PageBody::Index(Box::default()))?;
    op.magic().root_index = page.index();
    Ok(page.index())
}

/// Search one node; `Err(leaf)` reports a separator leaf a reader could not latch
fn search_node(
    op: &TableOp<'_>,
    node: &IndexPage,
    key: &[u8],
    mode: Mode,
) -> Result<std::result::Result<std::result::Result<usize, usize>, u64>> {
    let mut busy = None;
    let found = search(node.seps.len(), |i| {
        let sep = node.seps[i];
        if let Some(order) = sep.prefix.compare(key) {
            return Ok(order);
        }
        match leaf_first_key(op, sep.leaf, mode)? {
            Some(full) => Ok(full.as_slice().cmp(key)),
            None => {
                busy = Some(sep.leaf);
                Ok(Ordering::Equal)
            }
        }
    })?;
    Ok(match busy {
        Some(leaf) => Err(leaf),
        None => Ok(found),
    })
}

// =============================================================================
// Lookup
// =============================================================================

/// Where a key lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Find {
    /// The table has no rows
    Empty,
    /// Leaf page whose range covers the key
    Leaf(u64),
    /// A reader hit a latched leaf during a tie break; wait on it and retry
    Busy(u64),
}

/// Leaf page holding the greatest separator not above `key`.
///
/// Keys below every separator route to the first leaf page.
pub(crate) fn find(op: &TableOp<'_>, key: &[u8], mode: Mode) -> Result<Find> {
    let mut index = root(op);
    if index == 0 {
        return Ok(Find::Empty);
    }
    loop {
        let node = load(op, index)?;
        let pos = match search_node(op, &node, key, mode)? {
            Ok(Ok(pos)) => return Ok(Find::Leaf(node.seps[pos].leaf)),
            Ok(Err(pos)) => pos,
            Err(leaf) => return Ok(Find::Busy(leaf)),
        };
        let child = node.children[pos];
        if child != 0 {
            index = child;
            continue;
        }
        if pos > 0 {
            return Ok(Find::Leaf(node.seps[pos - 1].leaf));
        }
        if node.seps.is_empty() {
            return Ok(Find::Empty);
        }
        // Leftmost slot of a bottom node: the predecessor sits in an ancestor.
        let mut parent = node.parent;
        while parent != 0 {
            let up = load(op, addr_index(parent))?;
            let at = up
                .child_at(addr_pos(parent) / ROW_LEN)
                .ok_or_else(|| AtlasError::corruption(addr_index(parent), "stale child back-pointer"))?;
            if at > 0 {
                return Ok(Find::Leaf(up.seps[at - 1].leaf));
            }
            parent = up.parent;
        }
        return Ok(Find::Leaf(node.seps[0].leaf));
    }
}

/// Leaf page of the smallest separator
pub(crate) fn first_leaf(op: &TableOp<'_>) -> Result<Option<u64>> {
    edge_leaf(op, false)
}

/// Leaf page of the greatest separator
pub(crate) fn last_leaf(op: &TableOp<'_>) -> Result<Option<u64>> {
    edge_leaf(op, true)
}

fn edge_leaf(op: &TableOp<'_>, last: bool) -> Result<Option<u64>> {
    let mut index = root(op);
    if index == 0 {
        return Ok(None);
    }
    loop {
        let node = load(op, index)?;
        let child = if last {
            node.children[node.children.len() - 1]
        } else {
            node.children[0]
        };
        if child == 0 {
            let sep = if last { node.seps.last() } else { node.seps.first() };
            return Ok(sep.map(|sep| sep.leaf));
        }
        index = child;
    }
}

// =============================================================================
// Mutation (table writer, index write lock held)
// =============================================================================

/// Register leaf page `leaf` under its first key
pub(crate) fn insert(op: &TableOp<'_>, key: &[u8], leaf: u64) -> Result<()> {
    let mut index = ensure_root(op)?;
    loop {
        let mut node = load(op, index)?;
        let pos = match search_node(op, &node, key, Mode::Writer)? {
            Ok(Ok(_)) => {
                return Err(AtlasError::invariant(format!(
                    "separator for leaf {} already indexed",
                    leaf
                )))
            }
            Ok(Err(pos)) => pos,
            Err(busy) => return Err(AtlasError::invariant(format!("writer saw busy leaf {}", busy))),
        };
        let child = node.children[pos];
        if child != 0 {
            index = child;
            continue;
        }
        let before = node.slots();
        node.insert_entry(pos, Separator::new(key, leaf), 0, op.index_capacity());
        return settle(op, index, node, before);
    }
}

/// Replace the separator `old` with `new`, keeping the leaf it names.
///
/// Only valid when no other separator sorts between the two keys.
pub(crate) fn update(op: &TableOp<'_>, old: &[u8], new: &[u8]) -> Result<()> {
    let (index, mut node, pos) = locate_exact(op, old)?;
    node.seps[pos].prefix = KeyPrefix::new(new);
    store(op, index, node)
}

/// Drop the separator `key`, rebalancing upward as needed
pub(crate) fn remove(op: &TableOp<'_>, key: &[u8]) -> Result<()> {
    let (index, mut node, pos) = locate_exact(op, key)?;
    if node.is_bottom() {
        let before = node.slots();
        node.remove_entry(pos);
        return rebalance(op, index, node, before);
    }

    // Internal entry: pull up the leftmost entry of the right subtree.
    let mut bottom = node.children[pos + 1];
    let mut lowest = load(op, bottom)?;
    while !lowest.is_bottom() {
        bottom = lowest.children[0];
        lowest = load(op, bottom)?;
    }
    node.seps[pos] = lowest.seps[0];
    store(op, index, node)?;

    let mut lowest = load(op, bottom)?;
    let before = lowest.slots();
    lowest.remove_entry(0);
    rebalance(op, bottom, lowest, before)
}

fn locate_exact(op: &TableOp<'_>, key: &[u8]) -> Result<(u64, IndexPage, usize)> {
    let mut index = root(op);
    while index != 0 {
        let node = load(op, index)?;
        match search_node(op, &node, key, Mode::Writer)? {
            Ok(Ok(pos)) => return Ok((index, node, pos)),
            Ok(Err(pos)) => index = node.children[pos],
            Err(busy) => return Err(AtlasError::invariant(format!("writer saw busy leaf {}", busy))),
        }
    }
    Err(AtlasError::invariant("separator missing from index"))
}

/// Store `node`, splitting upward while it holds more than capacity
fn settle(op: &TableOp<'_>, mut index: u64, mut node: IndexPage, mut before: HashMap<u64, usize>) -> Result<()> {
    let capacity = op.index_capacity();
    loop {
        if node.len() <= capacity {
            let fitted = fit_lo(node.lo, node.len(), capacity);
            node.lo = fitted;
            store(op, index, node.clone())?;
            return relink(op, index, &node, &before);
        }

        let mid = node.len() / 2;
        let right_seps = node.seps.split_off(mid + 1);
        let right_children = node.children.split_off(mid + 1);
        let promoted = node.seps.pop().ok_or_else(|| AtlasError::invariant("split of empty index page"))?;
        node.lo = fit_lo(node.lo, node.len(), capacity);
        let parent = node.parent;

        let right = IndexPage {
            lo: 0,
            seps: right_seps,
            children: right_children,
            parent,
        };
        let right_index = op.alloc_page(PageBody::Index(Box::new(right.clone())))?.index();
        store(op, index, node.clone())?;
        relink(op, index, &node, &before)?;
        relink(op, right_index, &right, &HashMap::new())?;

        if parent == 0 {
            let top = IndexPage {
                lo: 0,
                seps: vec![promoted],
                children: vec![index, right_index],
                parent: 0,
            };
            let top_index = op.alloc_page(PageBody::Index(Box::new(top.clone())))?.index();
            relink(op, top_index, &top, &HashMap::new())?;
            op.magic().root_index = top_index;
            tracing::trace!(root = top_index, "index root split");
            return Ok(());
        }

        let parent_index = addr_index(parent);
        let mut up = load(op, parent_index)?;
        let at = up
            .child_at(addr_pos(parent) / ROW_LEN)
            .filter(|at| up.children[*at] == index)
            .ok_or_else(|| AtlasError::corruption(parent_index, "stale child back-pointer"))?;
        before = up.slots();
        up.insert_entry(at, promoted, right_index, capacity);
        index = parent_index;
        node = up;
    }
}

/// Store `node` after a removal, borrowing from or merging with a sibling
/// while it is below half capacity.
fn rebalance(op: &TableOp<'_>, mut index: u64, mut node: IndexPage, mut before: HashMap<u64, usize>) -> Result<()> {
    let capacity = op.index_capacity();
    let half = (capacity - 1) / 2;
    loop {
        if node.parent == 0 && node.seps.is_empty() && !node.is_bottom() {
            // The root lost its last entry: its only child becomes the root.
            let child = node.children[0];
            set_parent(op, child, 0)?;
            op.magic().root_index = child;
            let page = op.page(index)?;
            op.free_page(&page)?;
            tracing::trace!(root = child, "index root collapsed");
            return Ok(());
        }
        if node.len() >= half || node.parent == 0 {
            store(op, index, node.clone())?;
            return relink(op, index, &node, &before);
        }

        let parent_index = addr_index(node.parent);
        let mut up = load(op, parent_index)?;
        let up_before = up.slots();
        let at = up
            .child_at(addr_pos(node.parent) / ROW_LEN)
            .filter(|at| up.children[*at] == index)
            .ok_or_else(|| AtlasError::corruption(parent_index, "stale child back-pointer"))?;

        if at == up.len() {
            let left_index = up.children[at - 1];
            let mut left = load(op, left_index)?;
            let left_before = left.slots();
            if left.len() > half {
                let sep = left.seps.pop().ok_or_else(|| AtlasError::invariant("borrow from empty sibling"))?;
                let child = left.children.pop().unwrap_or(0);
                let down = std::mem::replace(&mut up.seps[at - 1], sep);
                node.push_front(down, child, capacity);
                store(op, left_index, left.clone())?;
                relink(op, left_index, &left, &left_before)?;
                store(op, index, node.clone())?;
                relink(op, index, &node, &before)?;
                return store(op, parent_index, up);
            }
            merge(op, &mut up, at - 1, (left_index, left, left_before), (index, node))?;
        } else {
            let right_index = up.children[at + 1];
            let mut right = load(op, right_index)?;
            let right_before = right.slots();
            if right.len() > half {
                let sep = right.seps.remove(0);
                let child = right.children.remove(0);
                right.lo = if right.seps.is_empty() { 0 } else { right.lo + 1 };
                let down = std::mem::replace(&mut up.seps[at], sep);
                node.seps.push(down);
                node.children.push(child);
                node.lo = fit_lo(node.lo, node.len(), capacity);
                store(op, right_index, right.clone())?;
                relink(op, right_index, &right, &right_before)?;
                store(op, index, node.clone())?;
                relink(op, index, &node, &before)?;
                return store(op, parent_index, up);
            }
            merge(op, &mut up, at, (index, node, before), (right_index, right))?;
        }

        index = parent_index;
        node = up;
        before = up_before;
    }
}

/// Fold `right` and the separator between them into `left`, freeing `right`
fn merge(
    op: &TableOp<'_>,
    up: &mut IndexPage,
    at: usize,
    (left_index, mut left, left_before): (u64, IndexPage, HashMap<u64, usize>),
    (right_index, right): (u64, IndexPage),
) -> Result<()> {
    let (sep, _) = up.remove_entry(at);
    left.seps.push(sep);
    left.seps.extend(right.seps);
    left.children.extend(right.children);
    left.lo = fit_lo(left.lo, left.len(), op.index_capacity());
    store(op, left_index, left.clone())?;
    relink(op, left_index, &left, &left_before)?;
    let page = op.page(right_index)?;
    op.free_page(&page)
}

/// Walk the whole index, checking ordering of leaves and back-pointers.
/// Returns the leaf pages in separator order.
#[cfg(test)]
pub(crate) fn verify(op: &TableOp<'_>) -> Result<Vec<u64>> {
    fn walk(op: &TableOp<'_>, index: u64, parent: u64, out: &mut Vec<u64>) -> Result<()> {
        let node = load(op, index)?;
        if node.parent != parent {
            return Err(AtlasError::invariant(format!(
                "index page {} points at parent {:#x}, expected {:#x}",
                index, node.parent, parent
            )));
        }
        if node.children.len() != node.seps.len() + 1 {
            return Err(AtlasError::invariant("child count mismatch"));
        }
        for (i, child) in node.children.iter().enumerate() {
            if *child != 0 {
                walk(op, *child, make_addr(index, (node.lo + i) * ROW_LEN), out)?;
            } else if !node.is_bottom() {
                return Err(AtlasError::invariant("mixed bottom and internal children"));
            }
            if let Some(sep) = node.seps.get(i) {
                out.push(sep.leaf);
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    let top = root(op);
    if top != 0 {
        walk(op, top, 0, &mut out)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PageBuffer;

    #[test]
    fn test_encode_decode_preserves_entries_and_children() {
        let mut node = IndexPage::default();
        node.insert_entry(0, Separator::new(b"m", 7), 11, 8);
        node.insert_entry(0, Separator::new(b"c", 5), 12, 8);
        node.children[0] = 10;
        node.parent = make_addr(3, 64);

        let mut buf = PageBuffer::zeroed();
        node.encode(&mut buf);
        let back = IndexPage::decode(2, &buf).unwrap();

        assert_eq!(back.separators(), node.separators());
        assert_eq!(back.children(), &[10, 12, 11]);
        assert_eq!(back.parent(), make_addr(3, 64));
    }

    #[test]
    fn test_full_page_stores_last_child_in_tail_slot() {
        let mut node = IndexPage::default();
        for i in 0..MAX_INDEX_CAPACITY {
            node.insert_entry(i, Separator::new(&[i as u8], i as u64 + 1), i as u64 + 100, MAX_INDEX_CAPACITY);
        }
        assert_eq!(node.lo + node.len(), MAX_INDEX_CAPACITY);

        let mut buf = PageBuffer::zeroed();
        node.encode(&mut buf);
        assert_eq!(get_u64(&buf, TAIL), MAX_INDEX_CAPACITY as u64 - 1 + 100);
        let back = IndexPage::decode(1, &buf).unwrap();
        assert_eq!(back.children().last(), node.children().last());
    }

    #[test]
    fn test_remove_entry_keeps_children_aligned() {
        let mut node = IndexPage::default();
        node.children[0] = 1;
        node.insert_entry(0, Separator::new(b"a", 9), 2, 8);
        node.insert_entry(1, Separator::new(b"b", 8), 3, 8);
        let (sep, child) = node.remove_entry(0);
        assert_eq!(sep.leaf, 9);
        assert_eq!(child, 2);
        assert_eq!(node.children(), &[1, 3]);
        assert_eq!(node.child_at(node.lo + 1), Some(1));
    }
}
