//! Memory storage and retrieval system.

pub mod embedding;
pub mod index;
pub mod persist;
pub mod store;
pub mod types;

pub use embedding::{Embedder, HashingEmbedder, OllamaEmbedder, build_embedder};
pub use persist::StorePaths;
pub use store::MemoryStore;
pub use types::{EmbeddingModelInfo, MemoryRecord, MemorySearchResult, Metadata};
