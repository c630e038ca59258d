//! Purpose: FIFO facade over a page directory: enqueue timestamped chunks, dequeue them in order.
//! Exports: `Buffer`, `DequeueOptions`.
//! Role: Composes `PageHandler` and `Page`; owns no storage logic of its own.
//! Invariants: `enqueue` either stores the whole chunk or returns an error.
//! Invariants: `dequeue` never skips a page before it reports read-complete.
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};

use crate::config::BufferConfig;
use crate::core::cursor::{PageReader, ReadOutcome};
use crate::core::error::{Error, ErrorKind};
use crate::core::format;
use crate::core::handler::PageHandler;
use crate::core::page::Page;

const MAX_WRITE_ATTEMPTS: usize = 8;

#[derive(Clone, Debug)]
pub struct DequeueOptions {
    pub poll_interval: Duration,
    pub timeout: Option<Duration>,
}

impl DequeueOptions {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for DequeueOptions {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Buffer {
    handler: Arc<PageHandler>,
    write_page: Option<Arc<Page>>,
    read_page: Option<PageReader>,
    read_start: u64,
}

impl Buffer {
    pub fn open(config: &BufferConfig) -> Result<Self, Error> {
        Ok(Self::with_handler(Arc::new(PageHandler::open(config)?)))
    }

    /// Buffer sharing `handler` with other buffers; each keeps its own read position.
    pub fn with_handler(handler: Arc<PageHandler>) -> Self {
        Self {
            handler,
            write_page: None,
            read_page: None,
            read_start: 0,
        }
    }

    pub fn handler(&self) -> &Arc<PageHandler> {
        &self.handler
    }

    /// Stores `chunk` as one record at `timestamp`, rotating pages when full.
    pub fn enqueue<B: Buf>(&mut self, mut chunk: B, timestamp: u64) -> Result<(), Error> {
        let len = chunk.remaining();
        if len == 0 {
            return Ok(());
        }
        let max = format::max_chunk_len(self.handler.page_size());
        if len > max {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("chunk of {len} bytes exceeds page capacity of {max}"))
                .with_timestamp(timestamp)
                .with_hint("Split the chunk or raise the page size."));
        }

        let mut attempts = 0;
        loop {
            let page = self.handler.get_write_page(timestamp)?;
            self.write_page = Some(Arc::clone(&page));
            if page.write(&mut chunk)? > 0 {
                return Ok(());
            }
            // sealed under us, by a full page or by a reader starting past it
            self.handler.close_write_page(&page)?;
            attempts += 1;
            if attempts == MAX_WRITE_ATTEMPTS {
                return Err(Error::new(ErrorKind::Internal)
                    .with_message(format!(
                        "chunk rejected by {attempts} consecutive pages within page capacity"
                    ))
                    .with_path(page.path())
                    .with_timestamp(timestamp));
            }
            tracing::trace!(timestamp, attempts, "write page rejected chunk, retrying");
        }
    }

    /// Where the next `dequeue` starts when no page is being read.
    pub fn set_read_start(&mut self, timestamp: u64) {
        self.read_start = timestamp;
        if let Some(reader) = self.read_page.take() {
            self.handler.close_read_page(reader);
        }
    }

    /// Next chunk in stream order, or `None` when nothing is available yet.
    pub fn dequeue(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            let reader = match self.read_page.as_mut() {
                Some(reader) => reader,
                None => {
                    let Some(reader) = self.handler.get_read_page(self.read_start)? else {
                        return Ok(None);
                    };
                    self.read_page.insert(reader)
                }
            };
            match reader.read()? {
                ReadOutcome::Chunk(chunk) => return Ok(Some(chunk)),
                ReadOutcome::Empty => return Ok(None),
                ReadOutcome::EndOfPage => {
                    let Some(next) = self.handler.get_next_read_page(reader)? else {
                        return Ok(None);
                    };
                    tracing::debug!(
                        from = reader.timestamp(),
                        to = next.timestamp(),
                        "advancing read page"
                    );
                    if let Some(done) = self.read_page.replace(next) {
                        self.handler.close_read_page(done);
                    }
                }
            }
        }
    }

    /// Polls `dequeue` until a chunk arrives or `options.timeout` passes.
    pub fn dequeue_wait(&mut self, options: &DequeueOptions) -> Result<Option<Bytes>, Error> {
        let started = Instant::now();
        loop {
            if let Some(chunk) = self.dequeue()? {
                return Ok(Some(chunk));
            }
            if let Some(timeout) = options.timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    return Ok(None);
                }
                thread::sleep(options.poll_interval.min(timeout - elapsed));
            } else {
                thread::sleep(options.poll_interval);
            }
        }
    }

    pub fn close(&mut self) -> Result<(), Error> {
        if let Some(reader) = self.read_page.take() {
            self.handler.close_read_page(reader);
        }
        if let Some(page) = self.write_page.take() {
            self.handler.close_write_page(&page)?;
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(dir = %self.handler.dir().display(), error = %err, "failed to close buffer");
        }
    }
}
