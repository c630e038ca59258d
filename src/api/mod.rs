//! Purpose: Define the public Rust API boundary for filebuffer.
//! Exports: Page storage, readers, the page directory, the queue facade, and errors.
//! Role: Additive-only surface; hides internal module layout.
//! Invariants: This module is the only public path to storage primitives.
//! Invariants: Internal modules remain private and are not directly exposed.

pub use crate::config::{BufferConfig, default_cache_dir};
pub use crate::core::buffer::{Buffer, DequeueOptions};
pub use crate::core::cursor::{PageReader, ReadOutcome};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::format::{
    DEFAULT_PAGE_SIZE, EOF_MARKER, HEADER_LEN, MIN_PAGE_SIZE, PageHeader, max_chunk_len,
};
pub use crate::core::handler::{PageHandler, PageInfo, WRITER_LOCK_FILE};
pub use crate::core::naming::{
    PAGE_SUFFIX, format_millis, now_millis, page_file_name, parse_page_file_name,
};
pub use crate::core::page::Page;
