//! Per-table Cache State
//!
//! `TableCache` owns what one table needs while the engine is open: its
//! backing file, the in-memory magic page, the structural locks and the
//! write barrier. Pages themselves live in the shared `Directory`.
//!
//! `TableOp` is one logical operation on a table. It holds an epoch stamp
//! (or a scan window) for its whole lifetime, so every page it reaches is
//! safe from eviction until it is dropped.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{AtlasError, Result};
use crate::page::{MagicPage, Page, PageBody, TableId};
use crate::storage::{PageBuffer, PageFile};

use super::barrier::WriteBarrier;
use super::directory::{Directory, Pin};

pub(crate) struct TableCache {
    id: TableId,
    name: String,
    file: PageFile,
    magic: Mutex<MagicPage>,
    index: RwLock<()>,
    writer: Mutex<()>,
    barrier: WriteBarrier,
    directory: Arc<Directory>,
    leaf_capacity: usize,
    index_capacity: usize,
}

impl TableCache {
    pub(crate) fn new(
        id: TableId,
        name: String,
        file: PageFile,
        directory: Arc<Directory>,
        leaf_capacity: usize,
        index_capacity: usize,
    ) -> Result<Self> {
        let magic = MagicPage::load(&file, 0)?;
        Ok(Self {
            id,
            name,
            file,
            magic: Mutex::new(magic),
            index: RwLock::new(()),
            writer: Mutex::new(()),
            barrier: WriteBarrier::new(),
            directory,
            leaf_capacity,
            index_capacity,
        })
    }

    pub(crate) fn id(&self) -> TableId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn file(&self) -> &PageFile {
        &self.file
    }

    pub(crate) fn directory(&self) -> &Directory {
        &self.directory
    }

    pub(crate) fn barrier(&self) -> &WriteBarrier {
        &self.barrier
    }

    pub(crate) fn magic(&self) -> MutexGuard<'_, MagicPage> {
        self.magic.lock()
    }

    /// Shared access to the index level
    pub(crate) fn index_read(&self) -> RwLockReadGuard<'_, ()> {
        self.index.read()
    }

    /// Exclusive access to the index level
    pub(crate) fn index_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.index.write()
    }

    /// Serializes writers of this table
    pub(crate) fn writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock()
    }

    /// Start an operation pinned by a fresh epoch stamp
    pub(crate) fn op(&self) -> TableOp<'_> {
        TableOp {
            table: self,
            pin: Pin::Stamp(self.directory.open_stamp()),
        }
    }

    /// Start a scan pinned by its own window
    pub(crate) fn scan_op(&self) -> TableOp<'_> {
        TableOp {
            table: self,
            pin: Pin::Window(self.directory.open_window()),
        }
    }
}

/// One logical operation on a table
pub(crate) struct TableOp<'a> {
    pub table: &'a TableCache,
    pin: Pin,
}

impl<'a> TableOp<'a> {
    /// Page `index`, loaded from the table file when not cached
    pub(crate) fn page(&self, index: u64) -> Result<Arc<Page>> {
        if index == 0 {
            return Err(AtlasError::invariant(format!(
                "table {} dereferenced the null page",
                self.table.name
            )));
        }
        let directory = &self.table.directory;
        if let Some(page) = directory.lookup(self.table.id, index, self.pin) {
            return Ok(page);
        }

        let _load = directory.load_lock(self.table.id, index);
        if let Some(page) = directory.lookup(self.table.id, index, self.pin) {
            return Ok(page);
        }
        let mut buf = PageBuffer::recycled();
        self.table.file.read_page(index, &mut buf)?;
        let page = Page::new(self.table.id, index, PageBody::decode(index, buf)?);
        directory.insert(Arc::clone(&page), self.pin)?;
        Ok(page)
    }

    /// Block until nobody holds the latch of page `index`
    pub(crate) fn wait_for(&self, index: u64) -> Result<()> {
        drop(self.page(index)?.latch());
        Ok(())
    }

    /// A page holding `body`, taken from the free list or appended to the file
    pub(crate) fn alloc_page(&self, body: PageBody) -> Result<Arc<Page>> {
        let head = self.table.magic().free_list;
        if head != 0 {
            let page = self.page(head)?;
            let next = page.free_next()?;
            self.table.magic().free_list = next;
            page.replace_body(body);
            return Ok(page);
        }

        let index = self.table.magic().extend();
        let page = Page::new(self.table.id, index, body);
        page.mark_dirty();
        self.table.directory.insert(Arc::clone(&page), self.pin)?;
        Ok(page)
    }

    /// Push `page` onto the table free list
    pub(crate) fn free_page(&self, page: &Page) -> Result<()> {
        let mut magic = self.table.magic();
        page.replace_body(PageBody::Free {
            next: magic.free_list,
        });
        magic.free_list = page.index();
        Ok(())
    }

    pub(crate) fn magic(&self) -> MutexGuard<'a, MagicPage> {
        self.table.magic()
    }

    pub(crate) fn leaf_capacity(&self) -> usize {
        self.table.leaf_capacity
    }

    pub(crate) fn index_capacity(&self) -> usize {
        self.table.index_capacity
    }

    /// Unpin the pages a scan has moved past
    pub(crate) fn slide(&self) {
        if let Pin::Window(id) = self.pin {
            self.table.directory.slide_window(id);
            self.table.directory.wash();
        }
    }
}

impl Drop for TableOp<'_> {
    fn drop(&mut self) {
        let directory = &self.table.directory;
        match self.pin {
            Pin::Stamp(stamp) => directory.close_stamp(stamp),
            Pin::Window(id) => directory.close_window(id),
        }
        directory.wash();
    }
}
