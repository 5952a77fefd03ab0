//! Table Header (Magic Page)
//!
//! Page 0 of every table file.
//!
//! ## Layout
//! ```text
//! offset 0     ┌────────────────────┐
//!              │ free list head     │ u64
//!              │ root index page    │ u64
//!              │ max page index     │ u64
//!              │ logger id          │ u64
//!              │ logger last check  │ u64  (watermark, u64::MAX = none)
//!              │ record count       │ u64
//! PAGE_SIZE/2  ├────────────────────┤
//!              │ fragment slot 0    │ u64  (segment address)
//!              │ ...                │
//!              │ fragment slot 510  │
//!              └────────────────────┘
//! ```

use crate::error::Result;
use crate::record::MAX_FRAGMENT_SLOT;
use crate::storage::{get_u64, put_u64, PageBuffer, PageFile, PAGE_SIZE};

const FRAGMENT_SLOT_POS: usize = PAGE_SIZE / 2;

/// Per-table root pointers, free lists and checkpoint watermark
#[derive(Clone)]
pub(crate) struct MagicPage {
    pub free_list: u64,
    pub root_index: u64,
    pub max_page: u64,
    pub logger_id: u64,
    pub logger_last_check: u64,
    pub record_count: u64,
    pub fragments: Box<[u64; MAX_FRAGMENT_SLOT]>,
}

impl MagicPage {
    /// Header of a table that has never been checkpointed
    pub(crate) fn new() -> Self {
        Self {
            free_list: 0,
            root_index: 0,
            max_page: 0,
            logger_id: 0,
            logger_last_check: u64::MAX,
            record_count: 0,
            fragments: Box::new([0; MAX_FRAGMENT_SLOT]),
        }
    }

    pub(crate) fn decode(buf: &[u8]) -> Self {
        let mut fragments = Box::new([0u64; MAX_FRAGMENT_SLOT]);
        for (i, slot) in fragments.iter_mut().enumerate() {
            *slot = get_u64(buf, FRAGMENT_SLOT_POS + i * 8);
        }
        Self {
            free_list: get_u64(buf, 0),
            root_index: get_u64(buf, 8),
            max_page: get_u64(buf, 16),
            logger_id: get_u64(buf, 24),
            logger_last_check: get_u64(buf, 32),
            record_count: get_u64(buf, 40),
            fragments,
        }
    }

    pub(crate) fn encode(&self) -> PageBuffer {
        let mut buf = PageBuffer::zeroed();
        put_u64(&mut buf, 0, self.free_list);
        put_u64(&mut buf, 8, self.root_index);
        put_u64(&mut buf, 16, self.max_page);
        put_u64(&mut buf, 24, self.logger_id);
        put_u64(&mut buf, 32, self.logger_last_check);
        put_u64(&mut buf, 40, self.record_count);
        for (i, slot) in self.fragments.iter().enumerate() {
            put_u64(&mut buf, FRAGMENT_SLOT_POS + i * 8, *slot);
        }
        buf
    }

    /// Read the header stored at page `index` of `file`
    pub(crate) fn load(file: &PageFile, index: u64) -> Result<Self> {
        let mut buf = PageBuffer::recycled();
        file.read_page(index, &mut buf)?;
        Ok(Self::decode(&buf))
    }

    /// Write the header as page `index` of `file`
    pub(crate) fn save(&self, file: &PageFile, index: u64) -> Result<()> {
        file.write_page(index, &self.encode())
    }

    /// Claim the next never-used page index
    pub(crate) fn extend(&mut self) -> u64 {
        self.max_page += 1;
        self.max_page
    }

    /// Whether the table has a checkpoint watermark
    pub(crate) fn has_watermark(&self) -> bool {
        self.logger_last_check != u64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_header_has_no_watermark() {
        let magic = MagicPage::new();
        assert!(!magic.has_watermark());
        assert_eq!(magic.max_page, 0);
    }

    #[test]
    fn test_encode_decode_preserves_fields() {
        let mut magic = MagicPage::new();
        magic.free_list = 3;
        magic.root_index = 1;
        magic.max_page = 12;
        magic.logger_id = 0x1000;
        magic.logger_last_check = 0x1005;
        magic.record_count = 99;
        magic.fragments[0] = 77;
        magic.fragments[MAX_FRAGMENT_SLOT - 1] = 88;

        let back = MagicPage::decode(&magic.encode());
        assert_eq!(back.free_list, 3);
        assert_eq!(back.root_index, 1);
        assert_eq!(back.max_page, 12);
        assert_eq!(back.logger_id, 0x1000);
        assert_eq!(back.logger_last_check, 0x1005);
        assert_eq!(back.record_count, 99);
        assert_eq!(back.fragments[0], 77);
        assert_eq!(back.fragments[MAX_FRAGMENT_SLOT - 1], 88);
    }

    #[test]
    fn test_extend_hands_out_increasing_indices() {
        let mut magic = MagicPage::new();
        assert_eq!(magic.extend(), 1);
        assert_eq!(magic.extend(), 2);
    }
}
