//! Record Allocator
//!
//! Stores each key/value pair as a chain of data page segments.
//!
//! ## Responsibilities
//! - Stream `key_len | value_len | key | value` across as many segments
//!   as the record needs, allocating each one lazily
//! - Reuse the old chain in place on replace when the sizes allow it
//! - Release segments into size-classed fragment lists kept in the
//!   table's magic page
//!
//! ## Record Layout
//! ```text
//! first segment                        next segment
//! ┌────────┬─────────┬─────────┬─────┐  ┌────────┬──────────────────┐
//! │ header │ key_len │ val_len │ key │→ │ header │ ...key | value   │→ 0
//! └────────┴─────────┴─────────┴─────┘  └────────┴──────────────────┘
//! ```

mod segment;

pub(crate) use segment::{MAX_PAYLOAD, PAGE_USED};

use crate::cache::TableOp;
use crate::error::{AtlasError, Result};
use crate::storage::{addr_index, addr_pos, get_u32};

/// Number of fragment size classes
pub(crate) const MAX_FRAGMENT_SLOT: usize = 511;

const LENGTHS: usize = 8;

/// Bytes of the record payload, fed to segments in order
struct Payload<'a> {
    parts: [&'a [u8]; 3],
    part: usize,
    offset: usize,
    remaining: usize,
}

impl<'a> Payload<'a> {
    fn new(lengths: &'a [u8; LENGTHS], key: &'a [u8], value: &'a [u8]) -> Self {
        Self {
            parts: [lengths, key, value],
            part: 0,
            offset: 0,
            remaining: LENGTHS + key.len() + value.len(),
        }
    }

    fn copy_into(&mut self, dst: &mut [u8]) {
        let mut done = 0;
        while done < dst.len() {
            let part = self.parts[self.part];
            if self.offset == part.len() {
                self.part += 1;
                self.offset = 0;
                continue;
            }
            let n = (part.len() - self.offset).min(dst.len() - done);
            dst[done..done + n].copy_from_slice(&part[self.offset..self.offset + n]);
            done += n;
            self.offset += n;
        }
        self.remaining -= dst.len();
    }
}

fn lengths(key: &[u8], value: &[u8]) -> Result<[u8; LENGTHS]> {
    let key_len = u32::try_from(key.len()).map_err(|_| AtlasError::invariant("key longer than 4 GiB"))?;
    let value_len = u32::try_from(value.len()).map_err(|_| AtlasError::invariant("value longer than 4 GiB"))?;
    let mut out = [0u8; LENGTHS];
    out[..4].copy_from_slice(&key_len.to_le_bytes());
    out[4..].copy_from_slice(&value_len.to_le_bytes());
    Ok(out)
}

/// Segments of the record at `addr` with their payload capacities
fn chain(op: &TableOp<'_>, addr: u64) -> Result<Vec<(u64, usize)>> {
    let mut out = Vec::new();
    let mut at = addr;
    while at != 0 {
        let header = segment::header(op, at)?;
        if out.is_empty() != header.first {
            return Err(AtlasError::corruption(
                addr_index(at),
                format!("segment {:#x} out of place in record chain", at),
            ));
        }
        out.push((at, header.capacity(addr_pos(at))));
        at = header.next_addr;
    }
    Ok(out)
}

/// Write `payload` over `reuse` (in order), allocating further segments
/// once those run out. Unused old segments are released.
fn write_segments(op: &TableOp<'_>, payload: &mut Payload<'_>, reuse: Vec<(u64, usize)>) -> Result<u64> {
    let mut reuse = reuse.into_iter();
    let mut first = 0;
    let mut last = 0;
    while payload.remaining > 0 {
        let (addr, capacity) = match reuse.next() {
            Some(segment) => segment,
            None => segment::take(op, payload.remaining)?,
        };
        let n = capacity.min(payload.remaining);
        let pos = addr_pos(addr);
        let is_first = first == 0;
        op.page(addr_index(addr))?.with_data_mut(|buf| {
            let mut header = segment::Header::read(buf, pos);
            header.next_addr = 0;
            header.first = is_first;
            header.size = n;
            header.write(buf, pos);
            let start = pos + segment::HEADER_LEN;
            payload.copy_into(&mut buf[start..start + n]);
        })?;
        if last != 0 {
            let mut header = segment::header(op, last)?;
            header.next_addr = addr;
            segment::set_header(op, last, header)?;
        } else {
            first = addr;
        }
        last = addr;
    }
    for (addr, _) in reuse {
        segment::release(op, addr)?;
    }
    segment::shrink(op, last)?;
    Ok(first)
}

// =============================================================================
// Public record operations
// =============================================================================

/// Store a new record; returns the address of its first segment
pub(crate) fn write_record(op: &TableOp<'_>, key: &[u8], value: &[u8]) -> Result<u64> {
    let lengths = lengths(key, value)?;
    let mut payload = Payload::new(&lengths, key, value);
    write_segments(op, &mut payload, Vec::new())
}

/// Overwrite the record at `addr`; returns its (possibly new) address.
///
/// The old chain is reused when its first segment already has the shape
/// the new payload needs: big enough for a single-segment record, or a
/// full-size segment for a multi-segment one.
pub(crate) fn replace_record(op: &TableOp<'_>, addr: u64, key: &[u8], value: &[u8]) -> Result<u64> {
    let lengths = lengths(key, value)?;
    let mut payload = Payload::new(&lengths, key, value);
    let old = chain(op, addr)?;
    let first_capacity = old[0].1;
    let total = payload.remaining;
    let reuse = if total <= MAX_PAYLOAD {
        first_capacity >= total
    } else {
        first_capacity == MAX_PAYLOAD
    };
    if reuse {
        return write_segments(op, &mut payload, old);
    }
    for (segment, _) in old {
        segment::release(op, segment)?;
    }
    write_segments(op, &mut payload, Vec::new())
}

/// Release every segment of the record at `addr`
pub(crate) fn free_record(op: &TableOp<'_>, addr: u64) -> Result<()> {
    for (segment, _) in chain(op, addr)? {
        segment::release(op, segment)?;
    }
    Ok(())
}

/// The first `limit` payload bytes of a record
fn read_payload(op: &TableOp<'_>, addr: u64, limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(limit.min(MAX_PAYLOAD * 4));
    let mut at = addr;
    while at != 0 && out.len() < limit {
        let (index, pos) = (addr_index(at), addr_pos(at));
        let header = segment::header(op, at)?;
        let n = header.size.min(limit - out.len());
        op.page(index)?.with_data(|buf| {
            let start = pos + segment::HEADER_LEN;
            out.extend_from_slice(&buf[start..start + n]);
        })?;
        at = header.next_addr;
    }
    if out.len() < limit {
        return Err(AtlasError::corruption(
            addr_index(addr),
            format!("record {:#x} ends after {} of {} bytes", addr, out.len(), limit),
        ));
    }
    Ok(out)
}

/// Key and value lengths from the record's first segment
fn record_lengths(op: &TableOp<'_>, addr: u64) -> Result<(usize, usize)> {
    let header = segment::header(op, addr)?;
    if !header.first || header.size < LENGTHS {
        return Err(AtlasError::corruption(
            addr_index(addr),
            format!("no record starts at {:#x}", addr),
        ));
    }
    let start = addr_pos(addr) + segment::HEADER_LEN;
    op.page(addr_index(addr))?.with_data(|buf| {
        (
            get_u32(buf, start) as usize,
            get_u32(buf, start + 4) as usize,
        )
    })
}

pub(crate) fn read_key(op: &TableOp<'_>, addr: u64) -> Result<Vec<u8>> {
    let (key_len, _) = record_lengths(op, addr)?;
    let mut payload = read_payload(op, addr, LENGTHS + key_len)?;
    payload.drain(..LENGTHS);
    Ok(payload)
}

pub(crate) fn read_value(op: &TableOp<'_>, addr: u64) -> Result<Vec<u8>> {
    let (_, value) = read_record(op, addr)?;
    Ok(value)
}

pub(crate) fn read_record(op: &TableOp<'_>, addr: u64) -> Result<(Vec<u8>, Vec<u8>)> {
    let (key_len, value_len) = record_lengths(op, addr)?;
    let mut payload = read_payload(op, addr, LENGTHS + key_len + value_len)?;
    let value = payload.split_off(LENGTHS + key_len);
    payload.drain(..LENGTHS);
    Ok((payload, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::setup_temp_table;
    use crate::storage::PAGE_SIZE;
    use tempfile::TempDir;

    fn value_of(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_payload_spans_parts_and_empty_key() {
        let lengths = lengths(b"", b"abcdef").unwrap();
        let mut payload = Payload::new(&lengths, b"", b"abcdef");
        assert_eq!(payload.remaining, 14);

        let mut first = [0u8; 10];
        payload.copy_into(&mut first);
        assert_eq!(&first[..4], &0u32.to_le_bytes());
        assert_eq!(&first[4..8], &6u32.to_le_bytes());
        assert_eq!(&first[8..], b"ab");

        let mut rest = [0u8; 4];
        payload.copy_into(&mut rest);
        assert_eq!(&rest, b"cdef");
        assert_eq!(payload.remaining, 0);
    }

    #[test]
    fn test_records_of_several_page_sizes() {
        let temp = TempDir::new().unwrap();
        let table = setup_temp_table(&temp, 256);
        let op = table.op();

        for (i, len) in [PAGE_SIZE, 3 * PAGE_SIZE, 10 * PAGE_SIZE, 0, 17].into_iter().enumerate() {
            let key = format!("key-{}", i).into_bytes();
            let value = value_of(len);
            let addr = write_record(&op, &key, &value).unwrap();
            assert_eq!(read_key(&op, addr).unwrap(), key);
            assert_eq!(read_record(&op, addr).unwrap(), (key.clone(), value.clone()));
        }
    }

    #[test]
    fn test_payload_on_segment_boundary_has_no_empty_tail() {
        let temp = TempDir::new().unwrap();
        let table = setup_temp_table(&temp, 64);
        let op = table.op();

        let value = value_of(2 * MAX_PAYLOAD - LENGTHS);
        let addr = write_record(&op, b"", &value).unwrap();
        let segments = chain(&op, addr).unwrap();
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|(_, capacity)| *capacity == MAX_PAYLOAD));
        assert_eq!(read_value(&op, addr).unwrap(), value);
    }

    #[test]
    fn test_replace_reuses_or_reallocates() {
        let temp = TempDir::new().unwrap();
        let table = setup_temp_table(&temp, 64);
        let op = table.op();

        let addr = write_record(&op, b"k", b"small").unwrap();
        let grown = replace_record(&op, addr, b"k", &value_of(5000)).unwrap();
        assert_eq!(read_value(&op, grown).unwrap(), value_of(5000));

        let shrunk = replace_record(&op, grown, b"k", b"tiny").unwrap();
        assert_eq!(shrunk, grown);
        assert_eq!(read_record(&op, shrunk).unwrap(), (b"k".to_vec(), b"tiny".to_vec()));
    }

    #[test]
    fn test_free_returns_whole_pages() {
        let temp = TempDir::new().unwrap();
        let table = setup_temp_table(&temp, 64);
        let op = table.op();

        let addr = write_record(&op, b"big", &value_of(3 * PAGE_SIZE)).unwrap();
        let used = op.magic().max_page;
        assert_eq!(used, 4);

        free_record(&op, addr).unwrap();
        assert_ne!(op.magic().free_list, 0);
        assert!(op.magic().fragments.iter().all(|&head| head == 0));

        let again = write_record(&op, b"big", &value_of(3 * PAGE_SIZE)).unwrap();
        assert_eq!(op.magic().max_page, used);
        assert_eq!(read_value(&op, again).unwrap(), value_of(3 * PAGE_SIZE));
    }

    #[test]
    fn test_small_records_share_a_page() {
        let temp = TempDir::new().unwrap();
        let table = setup_temp_table(&temp, 64);
        let op = table.op();

        let addrs: Vec<u64> = (0..20u8)
            .map(|i| write_record(&op, &[i], &value_of(100)).unwrap())
            .collect();
        assert_eq!(op.magic().max_page, 1);
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(read_key(&op, *addr).unwrap(), vec![i as u8]);
        }

        for addr in &addrs {
            free_record(&op, *addr).unwrap();
        }
        assert_eq!(op.magic().free_list, 1);
    }
}
