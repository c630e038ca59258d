//! Purpose: Durable, rotating, memory-mapped page log used by the `filebuffer` CLI and tests.
//! Exports: `api` (pages, readers, page directory, queue facade, errors), `config`.
//! Role: Library crate; the binary is a thin diagnostic shell over it.
//! Invariants: `api` is the only public path to storage primitives.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod config;
mod core;
