// Storage engine: page layout, pages, readers, the page directory, and the queue facade.
pub mod buffer;
pub mod cursor;
pub mod error;
pub mod format;
pub mod handler;
pub mod naming;
pub mod page;
