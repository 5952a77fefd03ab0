//! Storage Module
//!
//! Fixed-size page plumbing shared by every other layer.
//!
//! ## Responsibilities
//! - Whole-page positional file I/O (`PageFile`)
//! - Reusable page buffers (`PageBuffer`)
//! - Page addresses and little-endian field access
//!
//! ## Page Address
//! ```text
//! ┌──────────────────────────────────────┬──────────────────┐
//! │ page index (48 bits)                 │ offset (16 bits) │
//! └──────────────────────────────────────┴──────────────────┘
//! ```
//! Page index 0 is the table's magic page and doubles as the null address.

mod buffer;
mod file;

pub use buffer::PageBuffer;
pub use file::PageFile;

use bytes::{Buf, BufMut};

/// Size of every page in table and log files
pub const PAGE_SIZE: usize = 8192;

const INDEX_MASK: u64 = 0xffff_ffff_ffff;
const POS_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Compose a page address from a page index and an in-page offset
#[inline]
pub fn make_addr(index: u64, pos: usize) -> u64 {
    (index << 16) | (pos as u64 & POS_MASK)
}

/// Page index part of an address
#[inline]
pub fn addr_index(addr: u64) -> u64 {
    (addr >> 16) & INDEX_MASK
}

/// In-page offset part of an address
#[inline]
pub fn addr_pos(addr: u64) -> usize {
    (addr & POS_MASK) as usize
}

// =============================================================================
// Little-endian field access
// =============================================================================

#[inline]
pub(crate) fn get_u64(buf: &[u8], pos: usize) -> u64 {
    (&buf[pos..pos + 8]).get_u64_le()
}

#[inline]
pub(crate) fn put_u64(buf: &mut [u8], pos: usize, value: u64) {
    (&mut buf[pos..pos + 8]).put_u64_le(value)
}

#[inline]
pub(crate) fn get_u32(buf: &[u8], pos: usize) -> u32 {
    (&buf[pos..pos + 4]).get_u32_le()
}

#[inline]
pub(crate) fn put_u32(buf: &mut [u8], pos: usize, value: u32) {
    (&mut buf[pos..pos + 4]).put_u32_le(value)
}

#[inline]
pub(crate) fn get_u16(buf: &[u8], pos: usize) -> u16 {
    (&buf[pos..pos + 2]).get_u16_le()
}

#[inline]
pub(crate) fn put_u16(buf: &mut [u8], pos: usize, value: u16) {
    (&mut buf[pos..pos + 2]).put_u16_le(value)
}
