//! Memory tools for the agent loop.
//!
//! The agent saves every finished interaction with [`save_conversation_turn`]
//! and pulls context for the next prompt with [`memory_recall`] and
//! [`format_memories`].

pub mod memory_recall;
pub mod memory_save;

pub use memory_recall::{RecalledMemory, format_memories, memory_recall, user_questions};
pub use memory_save::{MemoryKind, SaveInput, memory_save, save_conversation_turn};
