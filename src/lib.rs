//! agent-memory: persistent similarity-search memory for a stateful agent.
//!
//! A [`MemoryStore`](memory::MemoryStore) keeps an append-only log of text
//! memories, each embedded into a vector. The JSON log on disk is the source
//! of truth; the vector index is rebuilt from it whenever its snapshot is
//! missing or stale.

pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod tools;

pub use error::{Error, Result};
