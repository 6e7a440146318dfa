//! Memory recall tool.

use crate::error::Result;
use crate::memory::{MemoryRecord, MemoryStore};
use crate::tools::memory_save::MemoryKind;

/// A memory pulled back for the prompt, with its distance to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct RecalledMemory {
    pub record: MemoryRecord,
    pub distance: f32,
}

/// Recall the `max_results` memories nearest to `query`.
pub async fn memory_recall(
    memory_store: &MemoryStore,
    query: &str,
    max_results: usize,
) -> Result<Vec<RecalledMemory>> {
    let results = memory_store.retrieve(query, max_results).await?;

    Ok(results
        .into_iter()
        .map(|result| RecalledMemory {
            record: result.record,
            distance: result.distance,
        })
        .collect())
}

/// Format memories as context for an LLM prompt.
pub fn format_memories(memories: &[RecalledMemory]) -> String {
    if memories.is_empty() {
        return "No relevant memories found.".to_string();
    }

    let mut output = String::from("## Relevant Memories\n\n");

    for (i, memory) in memories.iter().enumerate() {
        let kind = memory.record.kind().unwrap_or("memory");
        let when = memory
            .record
            .timestamp()
            .map(|timestamp| timestamp.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown time".into());

        output.push_str(&format!(
            "{}. [{}, {}] (distance: {:.3})\n",
            i + 1,
            kind,
            when,
            memory.distance
        ));
        for line in memory.record.text.lines() {
            output.push_str("   ");
            output.push_str(line);
            output.push('\n');
        }
        output.push('\n');
    }

    output
}

/// The user side of recalled conversation memories.
///
/// Used to answer "what did I ask before?" style questions.
pub fn user_questions(memories: &[RecalledMemory]) -> Vec<String> {
    memories
        .iter()
        .filter(|memory| memory.record.kind() == Some(MemoryKind::Conversation.as_str()))
        .map(|memory| {
            let text = &memory.record.text;
            let question = text.split("Assistant:").next().unwrap_or(text);
            question.trim().to_string()
        })
        .collect()
}
