//! Purpose: Page file layout, header codec, and record length-prefix helpers.
//! Exports: `PageHeader`, `RecordSlot`, layout constants, space arithmetic.
//! Role: Single source of truth for byte offsets shared by writer, readers, and tools.
//! Invariants: Header is 16 bytes: `page_index` (u64 LE) then `write_limit` (u64 LE).
//! Invariants: Records are `[i32 LE length][payload]`; `EOF_MARKER` is never a real length.
//! Invariants: A writer always leaves `LEN_PREFIX` bytes free for a trailing EOF marker.
use crate::core::error::{Error, ErrorKind};

pub const HEADER_LEN: usize = 16;
pub const INDEX_POS: usize = 0;
pub const WRITE_LIMIT_POS: usize = 8;
pub const LEN_PREFIX: usize = 4;
pub const EOF_MARKER: i32 = i32::MIN;
pub const MIN_CHUNK_LEN: usize = 1;
pub const MIN_PAGE_SIZE: usize = HEADER_LEN + LEN_PREFIX + MIN_CHUNK_LEN + LEN_PREFIX;
pub const DEFAULT_PAGE_SIZE: usize = 500 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageHeader {
    pub page_index: u64,
    pub write_limit: u64,
}

impl PageHeader {
    pub fn new(page_index: u64) -> Self {
        Self {
            page_index,
            write_limit: HEADER_LEN as u64,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        write_u64(&mut buf, INDEX_POS, self.page_index);
        write_u64(&mut buf, WRITE_LIMIT_POS, self.write_limit);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("page header too small"));
        }
        Ok(Self {
            page_index: read_u64(buf, INDEX_POS),
            write_limit: read_u64(buf, WRITE_LIMIT_POS),
        })
    }

    pub fn validate(&self, capacity: usize) -> Result<(), Error> {
        if self.page_index == 0 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("page index is zero"));
        }
        if self.write_limit < HEADER_LEN as u64 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("write limit inside header")
                .with_offset(self.write_limit));
        }
        if self.write_limit > capacity as u64 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("write limit exceeds capacity")
                .with_offset(self.write_limit));
        }
        Ok(())
    }
}

/// What sits in the length field at some offset of a page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordSlot {
    /// Nothing committed here yet.
    Empty,
    /// The page is sealed at this offset.
    Eof,
    Chunk(usize),
    /// A length that is neither zero, the sentinel, nor positive.
    Invalid(i32),
}

pub fn peek_slot(buf: &[u8], offset: usize) -> RecordSlot {
    if offset + LEN_PREFIX > buf.len() {
        return RecordSlot::Eof;
    }
    match read_i32(buf, offset) {
        0 => RecordSlot::Empty,
        EOF_MARKER => RecordSlot::Eof,
        len if len > 0 => RecordSlot::Chunk(len as usize),
        len => RecordSlot::Invalid(len),
    }
}

pub fn write_len(buf: &mut [u8], offset: usize, len: i32) {
    buf[offset..offset + LEN_PREFIX].copy_from_slice(&len.to_le_bytes());
}

pub fn write_limit(buf: &[u8]) -> u64 {
    read_u64(buf, WRITE_LIMIT_POS)
}

pub fn set_write_limit(buf: &mut [u8], limit: u64) {
    write_u64(buf, WRITE_LIMIT_POS, limit);
}

/// True when a chunk of `chunk_len` bytes plus its prefix fits at `position`
/// and still leaves room for the EOF marker.
pub fn fits(position: usize, capacity: usize, chunk_len: usize) -> bool {
    position
        .checked_add(LEN_PREFIX + LEN_PREFIX)
        .and_then(|end| end.checked_add(chunk_len))
        .is_some_and(|end| end <= capacity)
}

pub fn remaining_for_write(position: usize, capacity: usize) -> usize {
    capacity.saturating_sub(position + LEN_PREFIX + LEN_PREFIX)
}

/// Largest chunk an empty page of `page_size` bytes can take.
pub fn max_chunk_len(page_size: usize) -> usize {
    remaining_for_write(HEADER_LEN, page_size).min(i32::MAX as usize)
}

pub fn validate_page_size(page_size: usize) -> Result<(), Error> {
    if page_size < MIN_PAGE_SIZE {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!(
                "page size {page_size} is too small, header and one record need at least {MIN_PAGE_SIZE}"
            ))
            .with_hint("Use a page size of at least a few kilobytes."));
    }
    if page_size as u64 > i32::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("page size {page_size} exceeds {}", i32::MAX)));
    }
    Ok(())
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(read_4(buf, offset))
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_8(buf, offset))
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
