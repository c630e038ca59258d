//! Purpose: One fixed-capacity memory-mapped page file with a single writer mapping.
//! Exports: `Page`.
//! Role: Appends length-prefixed chunks and hands out independent read cursors.
//! Invariants: `write_limit` in the header moves only after length and payload are in place.
//! Invariants: Write-path calls take the exclusive side of the page lock, read-path calls the shared side.
//! Invariants: A rejected write leaves an EOF marker at the writer position and consumes nothing.
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Buf;
use memmap2::MmapMut;

use crate::core::cursor::PageReader;
use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::format::{self, EOF_MARKER, HEADER_LEN, LEN_PREFIX, PageHeader, RecordSlot};

pub(crate) struct WriteMapping {
    mmap: MmapMut,
    position: usize,
    sealed: bool,
}

impl WriteMapping {
    fn seal(&mut self) {
        if !self.sealed {
            format::write_len(&mut self.mmap, self.position, EOF_MARKER);
            self.sealed = true;
        }
    }
}

pub struct Page {
    path: PathBuf,
    timestamp: u64,
    capacity: usize,
    state: RwLock<Option<WriteMapping>>,
}

impl Page {
    /// Creates the backing file at exactly `capacity` bytes and leaves it mapped for writing.
    pub fn create(
        path: impl AsRef<Path>,
        timestamp: u64,
        capacity: usize,
        page_index: u64,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        format::validate_page_size(capacity).map_err(|err| err.with_path(&path))?;

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(&path, err).with_message("failed to create page file"))?;

        let mmap = match allocate(&file, &path, capacity) {
            Ok(mmap) => mmap,
            Err(err) => {
                let _ = fs::remove_file(&path);
                return Err(err);
            }
        };
        let mut mapping = WriteMapping {
            mmap,
            position: HEADER_LEN,
            sealed: false,
        };
        mapping.mmap[..HEADER_LEN].copy_from_slice(&PageHeader::new(page_index).encode());

        tracing::debug!(path = %path.display(), page_index, capacity, "page created");
        Ok(Self {
            path,
            timestamp,
            capacity,
            state: RwLock::new(Some(mapping)),
        })
    }

    /// Handle to an existing page file; nothing is mapped until a reader or writer opens it.
    pub fn open(path: impl AsRef<Path>, timestamp: u64, capacity: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            timestamp,
            capacity,
            state: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current header, from the write mapping when open, else from the file.
    pub fn header(&self) -> Result<PageHeader, Error> {
        let state = self.read_state()?;
        if let Some(mapping) = state.as_ref() {
            return PageHeader::decode(&mapping.mmap);
        }
        drop(state);
        read_header(&self.path)
    }

    pub fn has_write_mapping(&self) -> Result<bool, Error> {
        Ok(self.read_state()?.is_some())
    }

    pub fn open_for_write(&self) -> Result<(), Error> {
        let mut state = self.write_state()?;
        if state.is_some() {
            return Err(Error::new(ErrorKind::State)
                .with_message("page is already open for writing")
                .with_path(&self.path));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|err| io_error(&self.path, err).with_message("failed to open page file"))?;
        let actual = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| io_error(&self.path, err))?;
        if actual != self.capacity as u64 {
            return Err(Error::new(ErrorKind::SizeMismatch)
                .with_message(format!(
                    "capacity changed since creation: declared {}, on disk {actual}",
                    self.capacity
                ))
                .with_path(&self.path));
        }

        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|err| {
                io_error(&self.path, err).with_message("failed to map page for writing")
            })?
        };
        let header = PageHeader::decode(&mmap).map_err(|err| err.with_path(&self.path))?;
        header
            .validate(self.capacity)
            .map_err(|err| err.with_path(&self.path))?;

        let position = header.write_limit as usize;
        let sealed = format::peek_slot(&mmap, position) == RecordSlot::Eof;
        tracing::debug!(path = %self.path.display(), position, sealed, "page opened for write");
        *state = Some(WriteMapping {
            mmap,
            position,
            sealed,
        });
        Ok(())
    }

    /// Appends `chunk` as one record and returns the bytes consumed.
    ///
    /// Zero means the page is full: `chunk` is untouched and the page is now
    /// sealed, so the caller must move on to a new page.
    pub fn write<B: Buf>(&self, chunk: &mut B) -> Result<usize, Error> {
        let mut state = self.write_state()?;
        let mapping = state.as_mut().ok_or_else(|| self.not_open_for_write())?;

        let len = chunk.remaining();
        if len == 0 {
            return Ok(0);
        }
        if mapping.sealed
            || len > i32::MAX as usize
            || !format::fits(mapping.position, self.capacity, len)
        {
            if !mapping.sealed {
                tracing::debug!(
                    path = %self.path.display(),
                    position = mapping.position,
                    chunk_len = len,
                    "page full, sealing"
                );
            }
            mapping.seal();
            return Ok(0);
        }

        let start = mapping.position;
        let body = start + LEN_PREFIX;
        let end = body + len;
        format::write_len(&mut mapping.mmap, start, len as i32);
        chunk.copy_to_slice(&mut mapping.mmap[body..end]);
        mapping.position = end;
        format::set_write_limit(&mut mapping.mmap, end as u64);
        Ok(len)
    }

    /// Payload bytes the next record may carry; zero once the page is sealed.
    pub fn remaining_for_write(&self) -> Result<usize, Error> {
        let state = self.write_state()?;
        let mapping = state.as_ref().ok_or_else(|| self.not_open_for_write())?;
        if mapping.sealed {
            return Ok(0);
        }
        Ok(format::remaining_for_write(mapping.position, self.capacity))
    }

    /// Writes the EOF marker at the writer position without committing it.
    pub fn seal(&self) -> Result<(), Error> {
        let mut state = self.write_state()?;
        let mapping = state.as_mut().ok_or_else(|| self.not_open_for_write())?;
        mapping.seal();
        Ok(())
    }

    pub fn is_sealed(&self) -> Result<bool, Error> {
        let state = self.read_state()?;
        let mapping = state.as_ref().ok_or_else(|| self.not_open_for_write())?;
        Ok(mapping.sealed)
    }

    /// Flushes and releases the write mapping. Calling it again is a no-op.
    pub fn close_for_write(&self) -> Result<(), Error> {
        let mut state = self.write_state()?;
        let Some(mapping) = state.take() else {
            return Ok(());
        };
        mapping
            .mmap
            .flush()
            .map_err(|err| io_error(&self.path, err).with_message("failed to flush page"))?;
        tracing::debug!(path = %self.path.display(), position = mapping.position, "page closed for write");
        Ok(())
    }

    /// Opens an independent cursor positioned at the first record.
    pub fn open_for_read(self: &Arc<Self>) -> Result<PageReader, Error> {
        PageReader::open(Arc::clone(self))
    }

    pub(crate) fn read_state(&self) -> Result<RwLockReadGuard<'_, Option<WriteMapping>>, Error> {
        self.state.read().map_err(|_| self.poisoned())
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, Option<WriteMapping>>, Error> {
        self.state.write().map_err(|_| self.poisoned())
    }

    fn poisoned(&self) -> Error {
        Error::new(ErrorKind::Internal)
            .with_message("page lock poisoned")
            .with_path(&self.path)
    }

    fn not_open_for_write(&self) -> Error {
        Error::new(ErrorKind::State)
            .with_message("page is not open for writing")
            .with_path(&self.path)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("path", &self.path)
            .field("timestamp", &self.timestamp)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let Some(mapping) = state.take() {
                let _ = mapping.mmap.flush();
            }
        }
    }
}

fn allocate(file: &File, path: &Path, capacity: usize) -> Result<MmapMut, Error> {
    file.set_len(capacity as u64)
        .map_err(|err| io_error(path, err).with_message("failed to allocate page file"))?;
    unsafe {
        MmapMut::map_mut(file)
            .map_err(|err| io_error(path, err).with_message("failed to map page for writing"))
    }
}

fn read_header(path: &Path) -> Result<PageHeader, Error> {
    let mut buf = [0u8; HEADER_LEN];
    let mut file = File::open(path).map_err(|err| io_error(path, err))?;
    file.read_exact(&mut buf)
        .map_err(|err| Error::new(ErrorKind::Corrupt).with_path(path).with_source(err))?;
    PageHeader::decode(&buf).map_err(|err| err.with_path(path))
}
