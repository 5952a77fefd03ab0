//! Log Key Pages
//!
//! The first pages of every log file describe what the rest of it holds.
//!
//! ## File Key Page (page 0)
//! ```text
//! 0   record_start u32   bit 31: current count slot, low bits: pages before data
//! 4   page_header  u32   next free page
//! 8   count[0]     u32   committed generations (slot 0)
//! 12  chain        u64   id of the next log file, bit 63 once final
//! 20  count[1]     u32   committed generations (slot 1)
//! 40  stamp[n]     u64   commit timestamp of generation n, 0 = never prepared
//! ```
//!
//! ## Table Key Page (pages 1..)
//! ```text
//! 0   name_len u8, name (at most 39 bytes)
//! 40  start[n] u32, end[n] u32   pages of the table's snapshot for generation n
//! ```
//! The last page of every range is the table's magic page.

use crate::error::{AtlasError, Result};
use crate::storage::{get_u32, get_u64, put_u32, put_u64, PageBuffer, PageFile, PAGE_SIZE};

/// Generations one log file can hold
pub(crate) const MAX_GENERATIONS: usize = (PAGE_SIZE - PREFIX) / 8 - 1;

/// Longest table name a key page can carry
pub const MAX_TABLE_NAME: usize = PREFIX - 1;

const PREFIX: usize = 40;
const SLOT_BIT: u32 = 1 << 31;
const FINAL_BIT: u64 = 1 << 63;
const COUNT_POS: [usize; 2] = [8, 20];

fn slot_pos(generation: usize) -> usize {
    PREFIX + 8 * generation
}

/// Decoded file key page
#[derive(Debug, Clone)]
pub(crate) struct FileKey {
    slot: usize,
    /// Pages in front of the first logged page
    pub heads: u32,
    pub page_header: u32,
    counts: [u32; 2],
    chain: u64,
    pub stamps: Vec<u64>,
}

impl FileKey {
    /// Key page of a fresh log file with `tables` table key pages
    pub(crate) fn new(tables: usize) -> Self {
        let heads = 1 + tables as u32;
        Self {
            slot: 0,
            heads,
            page_header: heads,
            counts: [0; 2],
            chain: 0,
            stamps: vec![0; MAX_GENERATIONS],
        }
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        let start = get_u32(buf, 0);
        let key = Self {
            slot: (start >> 31) as usize,
            heads: start & !SLOT_BIT,
            page_header: get_u32(buf, 4),
            counts: [get_u32(buf, COUNT_POS[0]), get_u32(buf, COUNT_POS[1])],
            chain: get_u64(buf, 12),
            stamps: (0..MAX_GENERATIONS).map(|n| get_u64(buf, slot_pos(n))).collect(),
        };
        if key.heads == 0 || key.page_header < key.heads || key.committed() > MAX_GENERATIONS {
            return Err(AtlasError::LogCorruption(format!(
                "key page: heads {} page_header {} committed {}",
                key.heads,
                key.page_header,
                key.committed()
            )));
        }
        Ok(key)
    }

    pub(crate) fn encode(&self) -> PageBuffer {
        let mut buf = PageBuffer::zeroed();
        let flag = if self.slot == 1 { SLOT_BIT } else { 0 };
        put_u32(&mut buf, 0, self.heads | flag);
        put_u32(&mut buf, 4, self.page_header);
        put_u32(&mut buf, COUNT_POS[0], self.counts[0]);
        put_u64(&mut buf, 12, self.chain);
        put_u32(&mut buf, COUNT_POS[1], self.counts[1]);
        for (n, stamp) in self.stamps.iter().enumerate() {
            put_u64(&mut buf, slot_pos(n), *stamp);
        }
        buf
    }

    /// Number of committed generations
    pub(crate) fn committed(&self) -> usize {
        self.counts[self.slot] as usize
    }

    /// Stage `committed() + 1` in the spare count slot
    pub(crate) fn stage_commit(&mut self) {
        self.counts[self.slot ^ 1] = self.counts[self.slot] + 1;
    }

    /// Make the staged count current
    pub(crate) fn flip(&mut self) {
        self.slot ^= 1;
    }

    /// Id of the next log file once the link is final
    pub(crate) fn next(&self) -> Option<u64> {
        (self.chain & FINAL_BIT != 0).then_some(self.chain & !FINAL_BIT)
    }

    /// Link to log file `id`; `last` marks the link final
    pub(crate) fn set_chain(&mut self, id: u64, last: bool) {
        self.chain = if last { id | FINAL_BIT } else { id };
    }

    pub(crate) fn load(file: &PageFile) -> Result<Self> {
        let mut buf = PageBuffer::recycled();
        file.read_page(0, &mut buf)?;
        Self::decode(&buf)
    }

    pub(crate) fn save(&self, file: &PageFile) -> Result<()> {
        file.write_page(0, &self.encode())
    }
}

/// Decoded table key page
#[derive(Debug, Clone)]
pub(crate) struct TableKey {
    pub name: String,
    pub ranges: Vec<(u32, u32)>,
}

impl TableKey {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ranges: vec![(0, 0); MAX_GENERATIONS],
        }
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        let len = buf[0] as usize;
        if len == 0 || len > MAX_TABLE_NAME {
            return Err(AtlasError::LogCorruption(format!("table key name length {}", len)));
        }
        let name = std::str::from_utf8(&buf[1..1 + len])
            .map_err(|_| AtlasError::LogCorruption("table key name is not UTF-8".into()))?
            .to_string();
        let ranges = (0..MAX_GENERATIONS)
            .map(|n| (get_u32(buf, slot_pos(n)), get_u32(buf, slot_pos(n) + 4)))
            .collect();
        Ok(Self { name, ranges })
    }

    pub(crate) fn encode(&self) -> PageBuffer {
        let mut buf = PageBuffer::zeroed();
        let name = self.name.as_bytes();
        buf[0] = name.len() as u8;
        buf[1..1 + name.len()].copy_from_slice(name);
        for (n, (start, end)) in self.ranges.iter().enumerate() {
            put_u32(&mut buf, slot_pos(n), *start);
            put_u32(&mut buf, slot_pos(n) + 4, *end);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_limit_fills_key_page() {
        assert_eq!(MAX_GENERATIONS, 1018);
        assert!(slot_pos(MAX_GENERATIONS) <= PAGE_SIZE - 8);
    }

    #[test]
    fn test_count_flip_is_double_buffered() {
        let mut key = FileKey::new(2);
        assert_eq!(key.heads, 3);
        assert_eq!(key.page_header, 3);

        key.stamps[0] = 77;
        key.stage_commit();
        // Staged but not flipped: still zero committed after a reload.
        let reloaded = FileKey::decode(&key.encode()).unwrap();
        assert_eq!(reloaded.committed(), 0);

        key.flip();
        let reloaded = FileKey::decode(&key.encode()).unwrap();
        assert_eq!(reloaded.committed(), 1);
        assert_eq!(reloaded.stamps[0], 77);
    }

    #[test]
    fn test_chain_only_followed_once_final() {
        let mut key = FileKey::new(1);
        assert_eq!(key.next(), None);
        key.set_chain(0x1234, false);
        assert_eq!(FileKey::decode(&key.encode()).unwrap().next(), None);
        key.set_chain(0x1234, true);
        assert_eq!(FileKey::decode(&key.encode()).unwrap().next(), Some(0x1234));
    }

    #[test]
    fn test_table_key_roundtrip() {
        let mut key = TableKey::new("accounts");
        key.ranges[3] = (10, 14);
        let back = TableKey::decode(&key.encode()).unwrap();
        assert_eq!(back.name, "accounts");
        assert_eq!(back.ranges[3], (10, 14));
        assert_eq!(back.ranges[0], (0, 0));
    }

    #[test]
    fn test_zeroed_key_page_is_corrupt() {
        let buf = PageBuffer::zeroed();
        assert!(matches!(FileKey::decode(&buf), Err(AtlasError::LogCorruption(_))));
    }
}
