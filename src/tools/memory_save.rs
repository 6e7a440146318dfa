//! Memory save tool.

use crate::error::Result;
use crate::memory::types::{KIND_KEY, Metadata};
use crate::memory::{MemoryRecord, MemoryStore};

/// What a saved memory represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// A user message and the agent's answer.
    Conversation,
    /// An answer to a question about earlier conversations.
    HistoryQuery,
    /// Free-form text saved on request.
    Note,
}

impl MemoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryKind::Conversation => "conversation",
            MemoryKind::HistoryQuery => "history_query",
            MemoryKind::Note => "note",
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Input for memory creation.
#[derive(Debug, Clone)]
pub struct SaveInput {
    pub text: String,
    pub kind: MemoryKind,
    pub metadata: Metadata,
}

impl SaveInput {
    pub fn new(text: impl Into<String>, kind: MemoryKind) -> Self {
        Self {
            text: text.into(),
            kind,
            metadata: Metadata::new(),
        }
    }

    /// Attach an extra metadata attribute.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Save a memory to the store, tagging it with its kind.
pub async fn memory_save(memory_store: &MemoryStore, input: SaveInput) -> Result<MemoryRecord> {
    let mut metadata = input.metadata;
    metadata.insert(KIND_KEY.into(), input.kind.as_str().into());

    let record = memory_store.insert(&input.text, Some(metadata)).await?;
    tracing::info!(memory_id = record.id, kind = %input.kind, "memory saved");
    Ok(record)
}

/// Save one finished interaction as `User: ...\nAssistant: ...`.
pub async fn save_conversation_turn(
    memory_store: &MemoryStore,
    user: &str,
    assistant: &str,
    kind: MemoryKind,
) -> Result<MemoryRecord> {
    let text = format!("User: {user}\nAssistant: {assistant}");
    memory_save(memory_store, SaveInput::new(text, kind)).await
}
