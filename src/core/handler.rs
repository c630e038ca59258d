//! Purpose: Own every page of one stream, keyed by creation timestamp.
//! Exports: `PageHandler`, `PageInfo`, `WRITER_LOCK_FILE`.
//! Role: Decides rotation, enforces append order, and resolves pages for readers.
//! Invariants: Page keys are unique and ascending in creation order.
//! Invariants: Every page except the newest ends in an EOF marker.
//! Invariants: Write timestamps never go below the highest one already accepted,
//! or below a page a reader asked to start from.
//! Invariants: Only the holder of the advisory lock on `writer.lock` creates or seals pages.
//! Invariants: Lookups that miss in memory rescan the directory before giving up.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use fs2::FileExt;
use libc::{EACCES, EPERM};

use crate::config::BufferConfig;
use crate::core::cursor::PageReader;
use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::format::PageHeader;
use crate::core::naming;
use crate::core::page::Page;

pub const WRITER_LOCK_FILE: &str = "writer.lock";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageInfo {
    pub timestamp: u64,
    pub path: PathBuf,
    pub capacity: usize,
    pub page_index: u64,
    pub write_limit: u64,
}

struct Directory {
    pages: BTreeMap<u64, Arc<Page>>,
    next_index: u64,
    frontier: Option<u64>,
    lock_file: File,
    writer_locked: bool,
}

impl Directory {
    fn first_page(&self, range: impl RangeBounds<u64>) -> Option<Arc<Page>> {
        self.pages.range(range).next().map(|(_, page)| Arc::clone(page))
    }
}

pub struct PageHandler {
    dir: PathBuf,
    page_size: usize,
    state: Mutex<Directory>,
}

impl PageHandler {
    /// Opens the stream in `config.cache_dir`, creating the directory if needed
    /// and rebuilding the page map from the files already there.
    pub fn open(config: &BufferConfig) -> Result<Self, Error> {
        config.validate()?;
        let dir = config.cache_dir.clone();
        fs::create_dir_all(&dir)
            .map_err(|err| io_error(&dir, err).with_message("failed to create cache directory"))?;

        let lock_path = dir.join(WRITER_LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|err| {
                io_error(&lock_path, err)
                    .with_message("cache directory is not writable")
                    .with_hint("Point --dir at a directory this process can write.")
            })?;

        let mut pages = BTreeMap::new();
        let mut max_index = 0;
        for (key, path) in naming::scan_pages(&dir)? {
            let page = Page::open(path, key, config.page_size);
            max_index = max_index.max(page.header()?.page_index);
            pages.insert(key, Arc::new(page));
        }
        let frontier = pages.keys().next_back().copied();
        tracing::info!(
            dir = %dir.display(),
            pages = pages.len(),
            next_index = max_index + 1,
            "page directory loaded"
        );

        Ok(Self {
            dir,
            page_size: config.page_size,
            state: Mutex::new(Directory {
                pages,
                next_index: max_index + 1,
                frontier,
                lock_file,
                writer_locked: false,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Page that should take the next write for `timestamp`, open for writing.
    pub fn get_write_page(&self, timestamp: u64) -> Result<Arc<Page>, Error> {
        let mut dir = self.directory()?;
        self.acquire_writer_lock(&mut dir)?;
        if let Some(frontier) = dir.frontier {
            if timestamp < frontier {
                return Err(Error::new(ErrorKind::OutOfOrder)
                    .with_message(format!(
                        "write at {timestamp} precedes the write frontier {frontier}"
                    ))
                    .with_timestamp(timestamp)
                    .with_hint("Enqueue chunks in non-decreasing timestamp order."));
            }
        }

        let last = dir.pages.last_key_value().map(|(_, page)| Arc::clone(page));
        let page = match last {
            None => self.create_page(&mut dir, timestamp)?,
            Some(page) => {
                if !page.has_write_mapping()? {
                    page.open_for_write()?;
                }
                if page.remaining_for_write()? == 0 {
                    let key = timestamp.max(page.timestamp() + 1);
                    tracing::info!(from = page.timestamp(), to = key, "rotating write page");
                    page.close_for_write()?;
                    self.create_page(&mut dir, key)?
                } else {
                    page
                }
            }
        };
        advance_frontier(&mut dir, timestamp);
        Ok(page)
    }

    pub fn close_write_page(&self, page: &Page) -> Result<(), Error> {
        page.close_for_write()
    }

    /// Reader on the earliest page keyed at or after `from`.
    ///
    /// When no such page exists yet and this handle may write the stream, one
    /// is created at `from` so the reader can wait there for data that has not
    /// arrived. `None` means another process owns the stream and has no page
    /// there yet; poll again later.
    pub fn get_read_page(&self, from: u64) -> Result<Option<PageReader>, Error> {
        let page = {
            let mut dir = self.directory()?;
            let mut found = dir.first_page(from..);
            if found.is_none() && self.refresh(&mut dir)? > 0 {
                found = dir.first_page(from..);
            }
            match found {
                Some(page) => page,
                None => match self.create_read_page(&mut dir, from)? {
                    Some(page) => page,
                    None => return Ok(None),
                },
            }
        };
        page.open_for_read().map(Some)
    }

    pub fn get_first_page(&self, from: u64) -> Result<Option<PageReader>, Error> {
        self.get_read_page(from)
    }

    /// Reader on the page after `current`, or `None` while the stream has no later page.
    pub fn get_next_read_page(&self, current: &PageReader) -> Result<Option<PageReader>, Error> {
        if !current.is_read_complete()? {
            return Err(Error::new(ErrorKind::State)
                .with_message("current page is not fully read")
                .with_path(current.page().path())
                .with_offset(current.offset() as u64));
        }
        let after = (Bound::Excluded(current.timestamp()), Bound::Unbounded);
        let next = {
            let mut dir = self.directory()?;
            let mut next = dir.first_page(after);
            if next.is_none() && self.refresh(&mut dir)? > 0 {
                next = dir.first_page(after);
            }
            next
        };
        next.map(|page| page.open_for_read()).transpose()
    }

    pub fn close_read_page(&self, mut reader: PageReader) {
        reader.close();
    }

    pub fn pages(&self) -> Result<Vec<PageInfo>, Error> {
        let pages = {
            let dir = self.directory()?;
            dir.pages.values().cloned().collect::<Vec<_>>()
        };
        pages
            .iter()
            .map(|page| {
                let PageHeader {
                    page_index,
                    write_limit,
                } = page.header()?;
                let capacity = fs::metadata(page.path())
                    .map(|meta| meta.len() as usize)
                    .map_err(|err| io_error(page.path(), err))?;
                Ok(PageInfo {
                    timestamp: page.timestamp(),
                    path: page.path().to_path_buf(),
                    capacity,
                    page_index,
                    write_limit,
                })
            })
            .collect()
    }

    /// Flushes and releases every write mapping and gives up the writer lock.
    pub fn close(&self) -> Result<(), Error> {
        let mut dir = self.directory()?;
        for page in dir.pages.values() {
            page.close_for_write()?;
        }
        self.release_writer_lock(&mut dir)
    }

    fn directory(&self) -> Result<MutexGuard<'_, Directory>, Error> {
        self.state.lock().map_err(|_| {
            Error::new(ErrorKind::Internal)
                .with_message("page directory lock poisoned")
                .with_path(&self.dir)
        })
    }

    fn acquire_writer_lock(&self, dir: &mut Directory) -> Result<(), Error> {
        if self.try_writer_lock(dir)? {
            return Ok(());
        }
        Err(Error::new(ErrorKind::Busy)
            .with_message("another process is writing to this stream")
            .with_path(self.dir.join(WRITER_LOCK_FILE)))
    }

    /// Takes the writer lock without blocking; `false` when another handle holds it.
    fn try_writer_lock(&self, dir: &mut Directory) -> Result<bool, Error> {
        if dir.writer_locked {
            return Ok(true);
        }
        if let Err(err) = dir.lock_file.try_lock_exclusive() {
            let kind = lock_error_kind(&err);
            if kind == ErrorKind::Busy {
                return Ok(false);
            }
            return Err(Error::new(kind)
                .with_message("failed to lock stream for writing")
                .with_path(self.dir.join(WRITER_LOCK_FILE))
                .with_source(err));
        }
        dir.writer_locked = true;
        // the previous lock holder may have added pages
        self.refresh(dir)?;
        Ok(true)
    }

    fn release_writer_lock(&self, dir: &mut Directory) -> Result<(), Error> {
        if dir.writer_locked {
            FileExt::unlock(&dir.lock_file)
                .map_err(|err| io_error(&self.dir.join(WRITER_LOCK_FILE), err))?;
            dir.writer_locked = false;
        }
        Ok(())
    }

    /// Adds page files other handles created since the last scan; returns how many.
    fn refresh(&self, dir: &mut Directory) -> Result<usize, Error> {
        let mut added = 0;
        for (key, path) in naming::scan_pages(&self.dir)? {
            if dir.pages.contains_key(&key) {
                continue;
            }
            let page = Page::open(path, key, self.page_size);
            let header = match page.header() {
                Ok(header) if header.page_index != 0 => header,
                // still being created elsewhere; a later scan picks it up
                Ok(_) => continue,
                Err(err) if matches!(err.kind(), ErrorKind::Corrupt | ErrorKind::NotFound) => {
                    continue;
                }
                Err(err) => return Err(err),
            };
            dir.next_index = dir.next_index.max(header.page_index + 1);
            advance_frontier(dir, key);
            dir.pages.insert(key, Arc::new(page));
            added += 1;
        }
        if added > 0 {
            tracing::debug!(dir = %self.dir.display(), added, "picked up pages from disk");
        }
        Ok(added)
    }

    /// Creates a page at `from` for readers to wait on, if this handle may write the stream.
    fn create_read_page(&self, dir: &mut Directory, from: u64) -> Result<Option<Arc<Page>>, Error> {
        let held = dir.writer_locked;
        if !self.try_writer_lock(dir)? {
            tracing::debug!(from, "stream has another writer, no read page created");
            return Ok(None);
        }
        // taking the lock rescans, so the previous writer's pages are visible now
        let page = match dir.first_page(from..) {
            Some(page) => page,
            None => {
                let page = self.create_page(dir, from)?;
                advance_frontier(dir, from);
                page
            }
        };
        if !held {
            page.close_for_write()?;
            self.release_writer_lock(dir)?;
        }
        Ok(Some(page))
    }

    /// Creates the page keyed at `key` after sealing the current newest page.
    fn create_page(&self, dir: &mut Directory, key: u64) -> Result<Arc<Page>, Error> {
        if let Some((_, last)) = dir.pages.last_key_value() {
            seal_newest(last)?;
        }
        let path = self.dir.join(naming::page_file_name(key)?);
        let page = Arc::new(Page::create(&path, key, self.page_size, dir.next_index)?);
        dir.next_index += 1;
        dir.pages.insert(key, Arc::clone(&page));
        Ok(page)
    }
}

impl Drop for PageHandler {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(dir = %self.dir.display(), error = %err, "failed to close page directory");
        }
    }
}

fn advance_frontier(dir: &mut Directory, timestamp: u64) {
    dir.frontier = Some(dir.frontier.map_or(timestamp, |frontier| frontier.max(timestamp)));
}

/// Seals `page` so readers move past it. An open write mapping stays open:
/// its holder sees the next write rejected and rotates on its own.
fn seal_newest(page: &Page) -> Result<(), Error> {
    if page.has_write_mapping()? {
        return page.seal();
    }
    page.open_for_write()?;
    page.seal()?;
    page.close_for_write()
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}
