//! Data Page Segments
//!
//! A data page body is tiled by segments; each one starts with a 12 byte
//! header and owns the bytes up to the next segment's offset.
//!
//! ```text
//! pos ┌───────────┬──────────┬──────────┬───────────────────────────────┐
//!     │ next_addr │ next|F   │ size     │ payload ...                   │
//!     │ u64       │ u16      │ u16      │                               │
//!     └───────────┴──────────┴──────────┴───────────────────────────────┘
//!   next_addr  address of the record's next segment (0 = last), or the
//!              next fragment in a size class list
//!   next       offset of the physically following segment; bit 0 (F)
//!              marks the first segment of a record
//!   size       payload bytes in use, 0 marks a fragment
//! ```
//! A fragment keeps the address of its predecessor in the size class list
//! at `pos + 24`, so no fragment is smaller than 32 bytes. Fragments are
//! merged with free physical neighbours on release; a fragment covering
//! the whole body hands the page back to the table free list.

use crate::cache::TableOp;
use crate::error::{AtlasError, Result};
use crate::page::PageBody;
use crate::storage::{addr_index, addr_pos, get_u16, get_u64, make_addr, put_u16, put_u64, PageBuffer, PAGE_SIZE};

use super::MAX_FRAGMENT_SLOT;

/// Bytes of a data page usable by segments
pub(crate) const PAGE_USED: usize = PAGE_SIZE - 16;

pub(crate) const HEADER_LEN: usize = 12;

/// Largest payload one segment can carry
pub(crate) const MAX_PAYLOAD: usize = PAGE_USED - HEADER_LEN;

const GRANULE: usize = 16;
const MIN_EXTENT: usize = 32;
const PREV_LINK: usize = 24;
const FIRST_FLAG: u16 = 1;

/// Fragment size class of a segment spanning `extent` bytes
pub(crate) fn slot(extent: usize) -> usize {
    if extent > MIN_EXTENT {
        (extent + GRANULE - 1) / GRANULE - 2
    } else {
        0
    }
}

/// Bytes a segment needs to carry `payload` bytes
pub(crate) fn extent_for(payload: usize) -> usize {
    ((payload + HEADER_LEN + GRANULE - 1) / GRANULE * GRANULE).max(MIN_EXTENT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub next_addr: u64,
    /// Offset of the physically following segment
    pub end: usize,
    pub first: bool,
    pub size: usize,
}

impl Header {
    pub(crate) fn read(buf: &[u8], pos: usize) -> Self {
        let next = get_u16(buf, pos + 8);
        Self {
            next_addr: get_u64(buf, pos),
            end: (next & !FIRST_FLAG) as usize,
            first: next & FIRST_FLAG != 0,
            size: get_u16(buf, pos + 10) as usize,
        }
    }

    pub(crate) fn write(&self, buf: &mut [u8], pos: usize) {
        put_u64(buf, pos, self.next_addr);
        let flag = if self.first { FIRST_FLAG } else { 0 };
        put_u16(buf, pos + 8, self.end as u16 | flag);
        put_u16(buf, pos + 10, self.size as u16);
    }

    pub(crate) fn capacity(&self, pos: usize) -> usize {
        self.end - pos - HEADER_LEN
    }

    /// Reject headers that would index outside the page body
    pub(crate) fn check(&self, page: u64, pos: usize) -> Result<()> {
        if self.end > PAGE_USED || self.end < pos + MIN_EXTENT || self.size > self.end - pos - HEADER_LEN {
            return Err(AtlasError::corruption(
                page,
                format!("bad segment at {}: end {} size {}", pos, self.end, self.size),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Field access through the cache
// =============================================================================

pub(crate) fn header(op: &TableOp<'_>, addr: u64) -> Result<Header> {
    let (index, pos) = (addr_index(addr), addr_pos(addr));
    let header = op.page(index)?.with_data(|buf| Header::read(buf, pos))?;
    header.check(index, pos)?;
    Ok(header)
}

pub(crate) fn set_header(op: &TableOp<'_>, addr: u64, header: Header) -> Result<()> {
    op.page(addr_index(addr))?
        .with_data_mut(|buf| header.write(buf, addr_pos(addr)))
}

fn set_next_addr(op: &TableOp<'_>, addr: u64, next: u64) -> Result<()> {
    op.page(addr_index(addr))?
        .with_data_mut(|buf| put_u64(buf, addr_pos(addr), next))
}

fn prev_link(op: &TableOp<'_>, addr: u64) -> Result<u64> {
    op.page(addr_index(addr))?
        .with_data(|buf| get_u64(buf, addr_pos(addr) + PREV_LINK))
}

fn set_prev_link(op: &TableOp<'_>, addr: u64, prev: u64) -> Result<()> {
    op.page(addr_index(addr))?
        .with_data_mut(|buf| put_u64(buf, addr_pos(addr) + PREV_LINK, prev))
}

// =============================================================================
// Fragment lists
// =============================================================================

/// Push the fragment at `addr` onto the head of its size class
fn link(op: &TableOp<'_>, addr: u64, extent: usize) -> Result<()> {
    let class = slot(extent);
    let head = op.magic().fragments[class];
    set_header(
        op,
        addr,
        Header {
            next_addr: head,
            end: addr_pos(addr) + extent,
            first: false,
            size: 0,
        },
    )?;
    set_prev_link(op, addr, 0)?;
    if head != 0 {
        set_prev_link(op, head, addr)?;
    }
    op.magic().fragments[class] = addr;
    Ok(())
}

/// Take the fragment at `addr` out of its size class list
fn unlink(op: &TableOp<'_>, addr: u64, extent: usize) -> Result<()> {
    let next = header(op, addr)?.next_addr;
    let prev = prev_link(op, addr)?;
    if prev == 0 {
        op.magic().fragments[slot(extent)] = next;
    } else {
        set_next_addr(op, prev, next)?;
    }
    if next != 0 {
        set_prev_link(op, next, prev)?;
    }
    Ok(())
}

/// Reserve a segment able to hold `payload` bytes (at most `MAX_PAYLOAD`).
///
/// Returns the segment address and its payload capacity, which may exceed
/// the request.
pub(crate) fn take(op: &TableOp<'_>, payload: usize) -> Result<(u64, usize)> {
    let want = extent_for(payload.min(MAX_PAYLOAD));
    let found = {
        let magic = op.magic();
        (slot(want)..MAX_FRAGMENT_SLOT).find_map(|class| {
            let head = magic.fragments[class];
            (head != 0).then_some(head)
        })
    };

    let addr = match found {
        Some(addr) => {
            let extent = header(op, addr)?.end - addr_pos(addr);
            unlink(op, addr, extent)?;
            addr
        }
        None => {
            let mut buf = PageBuffer::zeroed();
            Header {
                next_addr: 0,
                end: PAGE_USED,
                first: false,
                size: 0,
            }
            .write(&mut buf, 0);
            let page = op.alloc_page(PageBody::Data(buf))?;
            make_addr(page.index(), 0)
        }
    };

    let pos = addr_pos(addr);
    let mut segment = header(op, addr)?;
    if segment.end - pos >= want + MIN_EXTENT {
        let rest = addr + want as u64;
        let rest_extent = segment.end - pos - want;
        segment.end = pos + want;
        set_header(op, addr, segment)?;
        link(op, rest, rest_extent)?;
    }
    Ok((addr, segment.capacity(pos)))
}

/// Give a segment back, merging it with free physical neighbours
pub(crate) fn release(op: &TableOp<'_>, addr: u64) -> Result<()> {
    let index = addr_index(addr);
    let page = op.page(index)?;
    let mut start = addr_pos(addr);
    let mut end = header(op, addr)?.end;

    if end < PAGE_USED {
        let after = make_addr(index, end);
        let next = header(op, after)?;
        if next.size == 0 {
            unlink(op, after, next.end - end)?;
            end = next.end;
        }
    }

    // Segments only link forward; find the one ending at `start`.
    let before = page.with_data(|buf| {
        let mut pos = 0;
        let mut found = None;
        while pos < start {
            let segment = Header::read(buf, pos);
            if segment.end <= pos {
                break;
            }
            if segment.end == start {
                found = Some((pos, segment));
            }
            pos = segment.end;
        }
        found
    })?;
    if let Some((pos, segment)) = before {
        if segment.size == 0 {
            unlink(op, make_addr(index, pos), start - pos)?;
            start = pos;
        }
    }

    if start == 0 && end == PAGE_USED {
        return op.free_page(&page);
    }
    link(op, make_addr(index, start), end - start)
}

/// Trim a segment down to the space its payload needs
pub(crate) fn shrink(op: &TableOp<'_>, addr: u64) -> Result<()> {
    let pos = addr_pos(addr);
    let mut segment = header(op, addr)?;
    let need = extent_for(segment.size);
    if segment.end - pos < need + MIN_EXTENT {
        return Ok(());
    }
    let tail = addr + need as u64;
    set_header(
        op,
        tail,
        Header {
            next_addr: 0,
            end: segment.end,
            first: false,
            size: 0,
        },
    )?;
    segment.end = pos + need;
    set_header(op, addr, segment)?;
    release(op, tail)
}
