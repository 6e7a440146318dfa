//! Memory record types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Auxiliary key/value attributes attached to a record.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Metadata key stamped with the insertion time.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Metadata key carrying the record kind (conversation, note, ...).
pub const KIND_KEY: &str = "type";

/// A single immutable memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub id: u64,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

impl MemoryRecord {
    /// Insertion time, if the record carries a parseable timestamp.
    pub fn timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.metadata
            .get(TIMESTAMP_KEY)
            .and_then(|value| value.as_str())
            .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&chrono::Utc))
    }

    /// The record kind stored under the `type` metadata key.
    pub fn kind(&self) -> Option<&str> {
        self.metadata.get(KIND_KEY).and_then(|value| value.as_str())
    }
}

/// Identity of the embedding model a store was built with.
///
/// Distances are only comparable between vectors from the same model, so
/// every store records this once and refuses to load under another model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbeddingModelInfo {
    pub name: String,
    pub dimension: usize,
}

impl EmbeddingModelInfo {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
        }
    }
}

impl std::fmt::Display for EmbeddingModelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} dims)", self.name, self.dimension)
    }
}

/// Search result combining a record with its distance to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySearchResult {
    pub record: MemoryRecord,
    /// Cosine distance; lower is more similar.
    pub distance: f32,
}

impl From<MemorySearchResult> for (MemoryRecord, f32) {
    fn from(result: MemorySearchResult) -> Self {
        (result.record, result.distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_parsed_from_metadata() {
        let mut metadata = Metadata::new();
        metadata.insert(
            TIMESTAMP_KEY.into(),
            serde_json::json!("2025-03-01T12:00:00+00:00"),
        );
        let record = MemoryRecord {
            id: 1,
            text: "hello".into(),
            metadata,
            embedding: vec![1.0],
        };

        let timestamp = record.timestamp().expect("timestamp should parse");
        assert_eq!(timestamp.to_rfc3339(), "2025-03-01T12:00:00+00:00");
    }

    #[test]
    fn record_without_metadata_deserializes() {
        let record: MemoryRecord =
            serde_json::from_str(r#"{"id": 4, "text": "x", "embedding": [0.5]}"#)
                .expect("record should deserialize");
        assert!(record.metadata.is_empty());
        assert_eq!(record.kind(), None);
    }
}
