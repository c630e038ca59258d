// Per-reader cursor over one page with its own read-only mapping.
use std::fs::File;
use std::sync::Arc;

use bytes::Bytes;
use memmap2::Mmap;

use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::format::{self, HEADER_LEN, LEN_PREFIX, PageHeader, RecordSlot};
use crate::core::page::Page;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    Chunk(Bytes),
    /// Nothing committed past the cursor yet.
    Empty,
    /// The page is sealed at the cursor; nothing more will ever appear here.
    EndOfPage,
}

impl ReadOutcome {
    pub fn into_chunk(self) -> Option<Bytes> {
        match self {
            ReadOutcome::Chunk(chunk) => Some(chunk),
            ReadOutcome::Empty | ReadOutcome::EndOfPage => None,
        }
    }
}

/// A reader's private position inside one page.
///
/// Every reader maps the file on its own, so closing one reader never
/// invalidates another reader or the writer.
pub struct PageReader {
    page: Arc<Page>,
    mmap: Option<Mmap>,
    offset: usize,
}

impl PageReader {
    pub(crate) fn open(page: Arc<Page>) -> Result<Self, Error> {
        let mmap = {
            let _shared = page.read_state()?;
            let file = File::open(page.path()).map_err(|err| {
                io_error(page.path(), err).with_message("failed to open page for reading")
            })?;
            let mmap = unsafe {
                Mmap::map(&file).map_err(|err| {
                    io_error(page.path(), err).with_message("failed to map page for reading")
                })?
            };
            let header = PageHeader::decode(&mmap).map_err(|err| err.with_path(page.path()))?;
            header
                .validate(mmap.len())
                .map_err(|err| err.with_path(page.path()))?;
            mmap
        };
        tracing::debug!(path = %page.path().display(), "page opened for read");
        Ok(Self {
            page,
            mmap: Some(mmap),
            offset: HEADER_LEN,
        })
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn timestamp(&self) -> u64 {
        self.page.timestamp()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn read(&mut self) -> Result<ReadOutcome, Error> {
        let _shared = self.page.read_state()?;
        let mmap = self.mmap.as_ref().ok_or_else(|| not_open_for_read(&self.page))?;
        let (outcome, next) =
            read_record_at(mmap, self.offset).map_err(|err| err.with_path(self.page.path()))?;
        self.offset = next;
        Ok(outcome)
    }

    /// True once the cursor sits on the page's EOF marker.
    pub fn is_read_complete(&self) -> Result<bool, Error> {
        let _shared = self.page.read_state()?;
        let mmap = self.mmap.as_ref().ok_or_else(|| not_open_for_read(&self.page))?;
        let limit = format::write_limit(mmap) as usize;
        Ok(self.offset >= limit && format::peek_slot(mmap, self.offset) == RecordSlot::Eof)
    }

    /// Releases this reader's mapping. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.mmap.take().is_some() {
            tracing::debug!(path = %self.page.path().display(), offset = self.offset, "page closed for read");
        }
    }
}

impl std::fmt::Debug for PageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageReader")
            .field("page", &self.page)
            .field("offset", &self.offset)
            .field("open", &self.mmap.is_some())
            .finish()
    }
}

fn not_open_for_read(page: &Page) -> Error {
    Error::new(ErrorKind::State)
        .with_message("page reader is closed")
        .with_path(page.path())
}

/// Decodes the record at `offset`, returning the outcome and the next cursor offset.
///
/// Only bytes below the header's write limit count as committed. Past it the
/// cursor stays put and the length field only tells a seal from "not yet".
fn read_record_at(buf: &[u8], offset: usize) -> Result<(ReadOutcome, usize), Error> {
    let limit = format::write_limit(buf) as usize;
    if limit < HEADER_LEN || limit > buf.len() {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("write limit outside page")
            .with_offset(limit as u64));
    }

    if offset >= limit {
        let outcome = match format::peek_slot(buf, offset) {
            RecordSlot::Eof => ReadOutcome::EndOfPage,
            _ => ReadOutcome::Empty,
        };
        return Ok((outcome, offset));
    }

    match format::peek_slot(buf, offset) {
        RecordSlot::Chunk(len) => {
            let start = offset + LEN_PREFIX;
            let end = start + len;
            if end > limit {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!(
                        "record of {len} bytes runs past committed data ({limit} of {})",
                        buf.len()
                    ))
                    .with_offset(offset as u64));
            }
            Ok((ReadOutcome::Chunk(Bytes::copy_from_slice(&buf[start..end])), end))
        }
        slot => Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!("unexpected record length {slot:?} in committed data"))
            .with_offset(offset as u64)),
    }
}
