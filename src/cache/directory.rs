//! Cache Directory
//!
//! Maps `(table, page index)` to cached pages and threads every cached
//! page through one recency list held in an index-based arena.
//!
//! ## Recency List
//! ```text
//!   HEAD ─ recent ─ STAMP ─ evictable ─ DIRTY ─ parked dirty ─ TAIL ─ windows ─┐
//!    ▲                                                                        │
//!    └────────────────────────────────────────────────────────────────────────┘
//! ```
//! - Pages touched by an operation move right behind `HEAD`, tagged with
//!   the operation's epoch stamp.
//! - Closing a stamp walks `STAMP` back toward `HEAD` over pages whose
//!   stamp is older than every open stamp. A page touched by an open
//!   operation therefore never reaches the evictable region.
//! - `wash` scans the evictable region from `DIRTY` backwards: clean pages
//!   are dropped, dirty ones are parked behind `DIRTY` until a checkpoint
//!   snapshots them.
//! - A scan window is a pair of markers after `TAIL`; pages inside it are
//!   invisible to `wash` until the window slides or closes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::{Mutex, MutexGuard};

use crate::error::{AtlasError, Result};
use crate::page::{Page, TableId};
use crate::storage::PageBuffer;

const HEAD: usize = 0;
const STAMP: usize = 1;
const DIRTY: usize = 2;
const TAIL: usize = 3;
const MARKERS: usize = 4;

/// Striped locks serializing loads of the same page
const LOAD_STRIPES: usize = 64;

/// How an operation keeps the pages it touches out of reach of `wash`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pin {
    /// Epoch stamp of a short operation
    Stamp(u64),
    /// Scan window id
    Window(u64),
}

struct Slot {
    prev: usize,
    next: usize,
    page: Option<Arc<Page>>,
    stamp: u64,
    window: Option<u64>,
}

impl Slot {
    fn marker(at: usize) -> Self {
        Self {
            prev: at,
            next: at,
            page: None,
            stamp: 0,
            window: None,
        }
    }
}

struct State {
    slots: Vec<Slot>,
    spare: Vec<usize>,
    map: HashMap<(TableId, u64), usize>,
    open: BTreeSet<u64>,
    last_stamp: u64,
    /// window id -> (start marker, end marker)
    windows: HashMap<u64, (usize, usize)>,
    next_window: u64,
    capacity: usize,
    pages: usize,
    permit_wash: bool,
}

impl State {
    fn new(capacity: usize) -> Self {
        let mut state = Self {
            slots: (0..MARKERS).map(Slot::marker).collect(),
            spare: Vec::new(),
            map: HashMap::new(),
            open: BTreeSet::new(),
            last_stamp: 0,
            windows: HashMap::new(),
            next_window: 0,
            capacity,
            pages: 0,
            permit_wash: true,
        };
        for at in 1..MARKERS {
            state.link_after(at - 1, at);
        }
        state
    }

    // -------------------------------------------------------------------------
    // Arena list plumbing
    // -------------------------------------------------------------------------

    fn unlink(&mut self, at: usize) {
        let (prev, next) = (self.slots[at].prev, self.slots[at].next);
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
        self.slots[at].prev = at;
        self.slots[at].next = at;
    }

    fn link_after(&mut self, after: usize, at: usize) {
        let next = self.slots[after].next;
        self.slots[at].prev = after;
        self.slots[at].next = next;
        self.slots[after].next = at;
        self.slots[next].prev = at;
    }

    fn move_after(&mut self, after: usize, at: usize) {
        if after != at && self.slots[after].next != at {
            self.unlink(at);
            self.link_after(after, at);
        }
    }

    fn alloc(&mut self, slot: Slot) -> usize {
        match self.spare.pop() {
            Some(at) => {
                self.slots[at] = slot;
                at
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, at: usize) -> Option<Arc<Page>> {
        self.unlink(at);
        self.spare.push(at);
        self.slots[at].window = None;
        self.slots[at].page.take()
    }

    fn evict(&mut self, at: usize) {
        if let Some(page) = self.release(at) {
            self.map.remove(&(page.table(), page.index()));
            self.pages -= 1;
        }
    }

    // -------------------------------------------------------------------------
    // Epochs and windows
    // -------------------------------------------------------------------------

    /// Oldest stamp an open operation may still be using
    fn floor(&self) -> u64 {
        self.open.iter().next().copied().unwrap_or(self.last_stamp + 1)
    }

    /// Hand every page no open stamp can see to the evictable region
    fn advance_stamp(&mut self) {
        let floor = self.floor();
        let mut at = self.slots[STAMP].prev;
        while at != HEAD && self.slots[at].stamp < floor {
            at = self.slots[at].prev;
        }
        self.move_after(at, STAMP);
    }

    /// Place `at` according to `pin`
    fn touch(&mut self, at: usize, pin: Pin) {
        match pin {
            Pin::Stamp(stamp) => {
                if self.slots[at].window.is_some() {
                    return;
                }
                self.slots[at].stamp = self.slots[at].stamp.max(stamp);
                self.move_after(HEAD, at);
            }
            Pin::Window(id) => {
                if self.slots[at].window.is_some() {
                    return;
                }
                if let Some(&(_, end)) = self.windows.get(&id) {
                    let before = self.slots[end].prev;
                    self.move_after(before, at);
                    self.slots[at].window = Some(id);
                }
            }
        }
    }

    /// Return the pages of a window to the recent region
    fn drain_window(&mut self, start: usize, end: usize) {
        let stamp = self.last_stamp;
        let mut at = self.slots[start].next;
        while at != end {
            let next = self.slots[at].next;
            self.slots[at].window = None;
            self.slots[at].stamp = self.slots[at].stamp.max(stamp);
            self.move_after(HEAD, at);
            at = next;
        }
    }
}

/// Shared page cache directory for every table of an engine
pub(crate) struct Directory {
    state: Mutex<State>,
    loads: Vec<Mutex<()>>,
    checkpoint: Mutex<Option<Sender<()>>>,
}

impl Directory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::new(capacity)),
            loads: (0..LOAD_STRIPES).map(|_| Mutex::new(())).collect(),
            checkpoint: Mutex::new(None),
        }
    }

    /// Where `wash` sends a request when dirty pages crowd the cache
    pub(crate) fn set_checkpoint_sender(&self, sender: Option<Sender<()>>) {
        *self.checkpoint.lock() = sender;
    }

    pub(crate) fn set_capacity(&self, capacity: usize) {
        self.state.lock().capacity = capacity;
    }

    /// Number of cached pages
    pub(crate) fn len(&self) -> usize {
        self.state.lock().pages
    }

    /// Serialize loads of one page so it is read from disk once
    pub(crate) fn load_lock(&self, table: TableId, index: u64) -> MutexGuard<'_, ()> {
        let stripe = (index as usize ^ (table as usize).rotate_left(7)) % LOAD_STRIPES;
        self.loads[stripe].lock()
    }

    // -------------------------------------------------------------------------
    // Stamps and windows
    // -------------------------------------------------------------------------

    pub(crate) fn open_stamp(&self) -> u64 {
        let mut state = self.state.lock();
        state.last_stamp += 1;
        let stamp = state.last_stamp;
        state.open.insert(stamp);
        stamp
    }

    pub(crate) fn close_stamp(&self, stamp: u64) {
        let mut state = self.state.lock();
        state.open.remove(&stamp);
        state.advance_stamp();
    }

    pub(crate) fn open_window(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_window += 1;
        let id = state.next_window;
        let start = state.alloc(Slot::marker(0));
        let end = state.alloc(Slot::marker(0));
        state.link_after(TAIL, start);
        state.link_after(start, end);
        state.windows.insert(id, (start, end));
        id
    }

    /// Unpin every page the window holds; the window stays open
    pub(crate) fn slide_window(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(&(start, end)) = state.windows.get(&id) {
            state.drain_window(start, end);
            state.advance_stamp();
        }
    }

    pub(crate) fn close_window(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some((start, end)) = state.windows.remove(&id) {
            state.drain_window(start, end);
            state.release(start);
            state.release(end);
            state.advance_stamp();
        }
    }

    // -------------------------------------------------------------------------
    // Lookup and insertion
    // -------------------------------------------------------------------------

    pub(crate) fn lookup(&self, table: TableId, index: u64, pin: Pin) -> Option<Arc<Page>> {
        let mut state = self.state.lock();
        let at = *state.map.get(&(table, index))?;
        state.touch(at, pin);
        state.slots[at].page.clone()
    }

    /// Add a page that is not cached yet
    pub(crate) fn insert(&self, page: Arc<Page>, pin: Pin) -> Result<()> {
        let mut state = self.state.lock();
        let key = (page.table(), page.index());
        if state.map.contains_key(&key) {
            return Err(AtlasError::invariant(format!(
                "page {} of table {} cached twice",
                key.1, key.0
            )));
        }
        let at = state.alloc(Slot {
            prev: 0,
            next: 0,
            page: Some(page),
            stamp: 0,
            window: None,
        });
        state.link_after(HEAD, at);
        state.map.insert(key, at);
        state.pages += 1;
        if let Pin::Stamp(stamp) = pin {
            state.slots[at].stamp = stamp;
        } else {
            state.touch(at, pin);
        }
        Ok(())
    }

    /// Forget every page of a table
    pub(crate) fn purge_table(&self, table: TableId) {
        let mut state = self.state.lock();
        let doomed: Vec<usize> = state
            .map
            .iter()
            .filter(|((owner, _), _)| *owner == table)
            .map(|(_, &at)| at)
            .collect();
        for at in doomed {
            state.evict(at);
        }
    }

    // -------------------------------------------------------------------------
    // Eviction
    // -------------------------------------------------------------------------

    /// Shed clean, unpinned pages while the cache is over capacity
    pub(crate) fn wash(&self) {
        let mut state = self.state.lock();
        if !state.permit_wash || state.pages <= state.capacity {
            return;
        }
        let mut evicted = 0;
        let mut parked = 0;
        let mut at = state.slots[DIRTY].prev;
        while at != STAMP && state.pages > state.capacity {
            let prev = state.slots[at].prev;
            let (dirty, shared) = match &state.slots[at].page {
                Some(page) => (page.is_dirty(), Arc::strong_count(page) > 1),
                None => (false, true),
            };
            if dirty {
                state.move_after(DIRTY, at);
                parked += 1;
            } else if !shared {
                state.evict(at);
                evicted += 1;
            }
            at = prev;
        }
        let over = state.pages > state.capacity;
        let pages = state.pages;
        drop(state);

        if evicted > 0 || parked > 0 {
            tracing::trace!(evicted, parked, pages, "cache washed");
        }
        if over {
            tracing::debug!(pages, parked, "cache full of pinned or dirty pages");
            if let Some(sender) = self.checkpoint.lock().as_ref() {
                let _ = sender.try_send(());
            }
        }
    }

    // -------------------------------------------------------------------------
    // Checkpoint support
    // -------------------------------------------------------------------------

    /// Snapshot every dirty page, grouped by table, and stop eviction until
    /// `permit_wash`. Callers hold every table's write barrier frozen.
    pub(crate) fn capture_snapshots(&self) -> HashMap<TableId, Vec<PageBuffer>> {
        let pages: Vec<Arc<Page>> = {
            let mut state = self.state.lock();
            state.permit_wash = false;
            state
                .map
                .values()
                .filter_map(|&at| state.slots[at].page.clone())
                .filter(|page| page.is_dirty())
                .collect()
        };

        let mut captured: HashMap<TableId, Vec<PageBuffer>> = HashMap::new();
        for page in pages {
            if let Some(snapshot) = page.snapshot() {
                captured.entry(page.table()).or_default().push(snapshot);
            }
        }

        // The parked generation is captured; it may be reclaimed once permitted.
        let mut state = self.state.lock();
        let last = state.slots[TAIL].prev;
        state.move_after(last, DIRTY);
        captured
    }

    pub(crate) fn permit_wash(&self) {
        self.state.lock().permit_wash = true;
        self.wash();
    }

    /// Whether a page is cached, without touching it
    #[cfg(test)]
    fn contains(&self, table: TableId, index: u64) -> bool {
        self.state.lock().map.contains_key(&(table, index))
    }

    /// Pages in `HEAD..STAMP`, for tests of the epoch invariant
    #[cfg(test)]
    fn recent(&self) -> Vec<u64> {
        let state = self.state.lock();
        let mut out = Vec::new();
        let mut at = state.slots[HEAD].next;
        while at != STAMP {
            if let Some(page) = &state.slots[at].page {
                out.push(page.index());
            }
            at = state.slots[at].next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageBody;

    fn setup_directory(capacity: usize) -> Directory {
        Directory::new(capacity)
    }

    fn cache_page(dir: &Directory, index: u64, pin: Pin) {
        dir.insert(Page::new(1, index, PageBody::Free { next: 0 }), pin).unwrap();
    }

    #[test]
    fn test_open_stamp_protects_touched_pages() {
        let dir = setup_directory(2);
        let stamp = dir.open_stamp();
        for index in 1..=5 {
            cache_page(&dir, index, Pin::Stamp(stamp));
        }
        dir.wash();
        assert_eq!(dir.len(), 5);

        dir.close_stamp(stamp);
        dir.wash();
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn test_closing_newer_stamp_keeps_older_pages() {
        let dir = setup_directory(1);
        let old = dir.open_stamp();
        cache_page(&dir, 1, Pin::Stamp(old));

        let new = dir.open_stamp();
        cache_page(&dir, 2, Pin::Stamp(new));
        dir.close_stamp(new);
        dir.wash();

        // Page 1 sits behind page 2 and `old` still protects it.
        assert!(dir.lookup(1, 1, Pin::Stamp(old)).is_some());
        assert_eq!(dir.len(), 2);

        dir.close_stamp(old);
        dir.wash();
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_retouch_keeps_newest_stamp() {
        let dir = setup_directory(0);
        let a = dir.open_stamp();
        let b = dir.open_stamp();
        cache_page(&dir, 7, Pin::Stamp(b));
        assert!(dir.lookup(1, 7, Pin::Stamp(a)).is_some());

        dir.close_stamp(b);
        dir.wash();
        assert_eq!(dir.recent(), vec![7]);
        assert_eq!(dir.len(), 1);

        dir.close_stamp(a);
        dir.wash();
        assert_eq!(dir.len(), 0);
    }

    #[test]
    fn test_dirty_pages_park_and_request_checkpoint() {
        let dir = setup_directory(1);
        let (tx, rx) = crossbeam::channel::bounded(1);
        dir.set_checkpoint_sender(Some(tx));

        let stamp = dir.open_stamp();
        for index in 1..=3 {
            let page = Page::new(1, index, PageBody::Free { next: 0 });
            page.mark_dirty();
            dir.insert(page, Pin::Stamp(stamp)).unwrap();
        }
        dir.close_stamp(stamp);
        dir.wash();

        assert_eq!(dir.len(), 3);
        assert!(rx.try_recv().is_ok());

        let captured = dir.capture_snapshots();
        assert_eq!(captured[&1].len(), 3);
        // Eviction waits for the checkpoint to finish.
        dir.wash();
        assert_eq!(dir.len(), 3);
        dir.permit_wash();
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_window_pins_until_slide() {
        let dir = setup_directory(0);
        let window = dir.open_window();
        cache_page(&dir, 1, Pin::Window(window));
        cache_page(&dir, 2, Pin::Window(window));
        dir.wash();
        assert_eq!(dir.len(), 2);

        dir.slide_window(window);
        dir.wash();
        assert_eq!(dir.len(), 0);

        cache_page(&dir, 3, Pin::Window(window));
        dir.close_window(window);
        dir.wash();
        assert_eq!(dir.len(), 0);
    }

    #[test]
    fn test_referenced_page_is_not_evicted() {
        let dir = setup_directory(0);
        let page = Page::new(1, 4, PageBody::Free { next: 0 });
        let stamp = dir.open_stamp();
        dir.insert(page.clone(), Pin::Stamp(stamp)).unwrap();
        dir.close_stamp(stamp);
        dir.wash();
        assert_eq!(dir.len(), 1);
        drop(page);
        dir.wash();
        assert_eq!(dir.len(), 0);
    }

    #[test]
    fn test_purge_table_drops_only_its_pages() {
        let dir = setup_directory(100);
        cache_page(&dir, 1, Pin::Stamp(0));
        dir.insert(Page::new(2, 1, PageBody::Free { next: 0 }), Pin::Stamp(0))
            .unwrap();
        dir.purge_table(1);
        assert_eq!(dir.len(), 1);
        assert!(dir.lookup(2, 1, Pin::Stamp(0)).is_some());
    }

    /// Tracks what the directory must keep: the newest stamp each page was
    /// touched with and the window pinning it, if any.
    #[derive(Default)]
    struct Model {
        pages: HashMap<u64, (u64, Option<u64>)>,
        stamps: Vec<u64>,
        windows: Vec<u64>,
        last_stamp: u64,
    }

    impl Model {
        fn protected(&self) -> Vec<u64> {
            let floor = self.stamps.iter().min().copied();
            self.pages
                .iter()
                .filter(|(_, (stamp, window))| window.is_some() || floor.is_some_and(|floor| *stamp >= floor))
                .map(|(&index, _)| index)
                .collect()
        }

        fn drain(&mut self, id: u64) {
            let last = self.last_stamp;
            for (stamp, window) in self.pages.values_mut() {
                if *window == Some(id) {
                    *window = None;
                    *stamp = (*stamp).max(last);
                }
            }
        }
    }

    #[test]
    fn test_wash_never_evicts_protected_pages() {
        for seed in [0x9e37_79b9_7f4a_7c15u64, 17, 4242, 0xdead_beef, 1] {
            let dir = setup_directory(4);
            let mut model = Model::default();
            let mut state = seed;
            let mut next = move || {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state
            };

            for _ in 0..3000 {
                match next() % 8 {
                    0 if model.stamps.len() < 3 => {
                        let stamp = dir.open_stamp();
                        model.last_stamp = stamp;
                        model.stamps.push(stamp);
                    }
                    1 if !model.stamps.is_empty() => {
                        let at = next() as usize % model.stamps.len();
                        dir.close_stamp(model.stamps.swap_remove(at));
                    }
                    2 | 3 => {
                        let pins = model.stamps.len() + model.windows.len();
                        if pins == 0 {
                            continue;
                        }
                        let choice = next() as usize % pins;
                        let pin = match model.stamps.get(choice) {
                            Some(&stamp) => Pin::Stamp(stamp),
                            None => Pin::Window(model.windows[choice - model.stamps.len()]),
                        };
                        let index = next() % 24;
                        if dir.contains(1, index) {
                            assert!(dir.lookup(1, index, pin).is_some());
                            let entry = model.pages.get_mut(&index).unwrap();
                            if entry.1.is_none() {
                                match pin {
                                    Pin::Stamp(stamp) => entry.0 = entry.0.max(stamp),
                                    Pin::Window(id) => entry.1 = Some(id),
                                }
                            }
                        } else {
                            cache_page(&dir, index, pin);
                            let entry = match pin {
                                Pin::Stamp(stamp) => (stamp, None),
                                Pin::Window(id) => (0, Some(id)),
                            };
                            model.pages.insert(index, entry);
                        }
                    }
                    4 => {
                        let protected = model.protected();
                        dir.wash();
                        for index in protected {
                            assert!(dir.contains(1, index), "seed {} evicted protected page {}", seed, index);
                        }
                        model.pages.retain(|&index, _| dir.contains(1, index));
                        assert_eq!(dir.len(), model.pages.len());
                    }
                    5 if model.windows.len() < 2 => model.windows.push(dir.open_window()),
                    6 if !model.windows.is_empty() => {
                        let id = model.windows[next() as usize % model.windows.len()];
                        dir.slide_window(id);
                        model.drain(id);
                    }
                    7 if !model.windows.is_empty() => {
                        let at = next() as usize % model.windows.len();
                        let id = model.windows.swap_remove(at);
                        dir.close_window(id);
                        model.drain(id);
                    }
                    _ => {}
                }
            }

            // Once nothing is pinned the cache shrinks back to capacity.
            for id in model.windows.drain(..) {
                dir.close_window(id);
            }
            for stamp in model.stamps.drain(..) {
                dir.close_stamp(stamp);
            }
            dir.wash();
            assert!(dir.len() <= 4);
        }
    }
}
