//! Long-term memory tools: save_memory and recall_memories

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ToolContext, ToolHandler, ToolResult, json_schema, required_str};

const MAX_MEMORY_CONTENT: usize = 10_000;

/// Entries kept per store before the oldest are evicted
pub const DEFAULT_MAX_MEMORIES: usize = 5_000;

/// What kind of thing was remembered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    #[default]
    Fact,
    Summary,
    Rule,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fact => write!(f, "fact"),
            Self::Summary => write!(f, "summary"),
            Self::Rule => write!(f, "rule"),
        }
    }
}

impl MemoryKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "fact" => Some(Self::Fact),
            "summary" => Some(Self::Summary),
            "rule" => Some(Self::Rule),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub id: String,
    pub user_id: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MemoryKind,
    pub created_at: DateTime<Utc>,
}

/// Process-local memory store scoped by user
#[derive(Debug)]
pub struct MemoryStore {
    entries: RwLock<VecDeque<MemoryEntry>>,
    capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_MEMORIES)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding at most `capacity` entries (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn save(&self, user_id: Option<&str>, content: &str, kind: MemoryKind) -> MemoryEntry {
        let entry = MemoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.map(str::to_string),
            content: content.to_string(),
            kind,
            created_at: Utc::now(),
        };
        let mut entries = self.entries.write().await;
        entries.push_back(entry.clone());
        while entries.len() > self.capacity {
            if let Some(evicted) = entries.pop_front() {
                debug!("Evicted memory {}", evicted.id);
            }
        }
        debug!("Saved {} memory {}", entry.kind, entry.id);
        entry
    }

    /// Newest-first memories for `user_id` sharing a term with `query`
    pub async fn recall(&self, user_id: Option<&str>, query: &str, limit: usize) -> Vec<MemoryEntry> {
        let terms: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= 3)
            .map(str::to_lowercase)
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let entries = self.entries.read().await;
        entries
            .iter()
            .rev()
            .filter(|e| e.user_id.as_deref() == user_id)
            .filter(|e| {
                let content = e.content.to_lowercase();
                terms.iter().any(|t| content.contains(t.as_str()))
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Tool for saving facts, summaries and rules
pub struct SaveMemoryTool {
    store: Arc<MemoryStore>,
}

impl SaveMemoryTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolHandler for SaveMemoryTool {
    fn name(&self) -> &str {
        "save_memory"
    }

    fn description(&self) -> &str {
        "Save a fact, rule, or preference to long-term memory."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "content": {
                    "type": "string",
                    "description": "The content to remember."
                },
                "type": {
                    "type": "string",
                    "enum": ["fact", "summary", "rule"],
                    "description": "Type of memory."
                }
            }),
            vec!["content"],
        )
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let content = required_str(&args, "content")?;
        let length = content.chars().count();
        if length > MAX_MEMORY_CONTENT {
            return Ok(ToolResult::failure(format!(
                "Memory content too long ({} chars, max {})",
                length,
                MAX_MEMORY_CONTENT
            )));
        }
        let kind = args
            .get("type")
            .and_then(|v| v.as_str())
            .and_then(MemoryKind::parse)
            .unwrap_or_default();

        let entry = self
            .store
            .save(ctx.context.user_id.as_deref(), content, kind)
            .await;
        Ok(ToolResult::success(format!("Saved {} to memory.", kind))
            .with_data(serde_json::json!({ "id": entry.id })))
    }
}

/// Tool for searching long-term memory
pub struct RecallMemoriesTool {
    store: Arc<MemoryStore>,
}

impl RecallMemoriesTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolHandler for RecallMemoriesTool {
    fn name(&self) -> &str {
        "recall_memories"
    }

    fn description(&self) -> &str {
        "Search long-term memory for relevant information."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "query": {
                    "type": "string",
                    "description": "Search query."
                }
            }),
            vec!["query"],
        )
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let query = required_str(&args, "query")?;
        let memories = self
            .store
            .recall(ctx.context.user_id.as_deref(), query, 10)
            .await;

        if memories.is_empty() {
            return Ok(ToolResult::success(format!("No memories found for '{}'.", query))
                .with_data(serde_json::json!({ "memories": [] })));
        }

        let message = memories
            .iter()
            .map(|m| format!("- [{}] {}", m.kind, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolResult::success(message).with_data(serde_json::json!({ "memories": memories })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionContext;

    fn ctx_for(user: &str) -> ToolContext {
        ToolContext::new(ExecutionContext {
            user_id: Some(user.to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_save_and_recall() {
        let store = Arc::new(MemoryStore::new());
        let save = SaveMemoryTool::new(store.clone());
        let recall = RecallMemoriesTool::new(store.clone());
        let ctx = ctx_for("u1");

        let result = save
            .call(
                serde_json::json!({"content": "Tour starts in Berlin", "type": "fact"}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(store.len().await, 1);

        let result = recall
            .call(serde_json::json!({"query": "berlin dates"}), &ctx)
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.message.contains("[fact] Tour starts in Berlin"));
    }

    #[tokio::test]
    async fn test_recall_is_user_scoped() {
        let store = Arc::new(MemoryStore::new());
        store.save(Some("u1"), "private budget numbers", MemoryKind::Fact).await;

        let hits = store.recall(Some("u2"), "budget", 10).await;
        assert!(hits.is_empty());
        let hits = store.recall(Some("u1"), "budget", 10).await;
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_recall_newest_first_and_limited() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.save(None, &format!("release note {}", i), MemoryKind::Summary).await;
        }
        let hits = store.recall(None, "release", 3).await;
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].content, "release note 4");
    }

    #[tokio::test]
    async fn test_unknown_kind_defaults_to_fact() {
        let store = Arc::new(MemoryStore::new());
        let save = SaveMemoryTool::new(store.clone());
        let result = save
            .call(
                serde_json::json!({"content": "x", "type": "gossip"}),
                &ctx_for("u1"),
            )
            .await
            .unwrap();
        assert_eq!(result.message, "Saved fact to memory.");
    }

    #[tokio::test]
    async fn test_content_limit_counts_characters() {
        let store = Arc::new(MemoryStore::new());
        let save = SaveMemoryTool::new(store.clone());
        let ctx = ctx_for("u1");

        // 3 bytes per char: within the limit in chars, well over it in bytes
        let lyrics = "\u{266A}".repeat(MAX_MEMORY_CONTENT);
        let result = save
            .call(serde_json::json!({"content": lyrics}), &ctx)
            .await
            .unwrap();
        assert!(result.success, "{}", result.message);

        let too_long = "\u{266A}".repeat(MAX_MEMORY_CONTENT + 1);
        let result = save
            .call(serde_json::json!({"content": too_long}), &ctx)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains(&format!("{} chars", MAX_MEMORY_CONTENT + 1)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_oldest_memories_evicted_at_capacity() {
        let store = MemoryStore::with_capacity(3);
        for i in 0..5 {
            store.save(None, &format!("setlist draft {}", i), MemoryKind::Fact).await;
        }
        assert_eq!(store.len().await, 3);
        let hits = store.recall(None, "setlist", 10).await;
        let contents: Vec<&str> = hits.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["setlist draft 4", "setlist draft 3", "setlist draft 2"]);
    }
}
