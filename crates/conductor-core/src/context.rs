//! Session state and context assembly
//!
//! A [`Session`] is the single mutable record of a conversation; only the
//! service façade writes to it. Everything else receives an
//! [`ExecutionContext`] snapshot produced by a [`ContextResolver`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::tools::memory::MemoryStore;
use crate::types::{ChatMessage, ExecutionContext, Role};

pub const HISTORY_TRUNCATION_MARKER: &str = "[...earlier history truncated]";

/// Messages a session keeps; older ones are dropped on push
pub const MAX_SESSION_HISTORY: usize = 200;

/// Owned conversation state
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub conversation_id: String,
    pub project_id: Option<String>,
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
    pub active_module: Option<String>,
    pub brand_profile: Option<Value>,
    pub history: Vec<ChatMessage>,
}

impl Session {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ..Default::default()
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_brand_profile(mut self, brand_profile: Value) -> Self {
        self.brand_profile = Some(brand_profile);
        self
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.history.push(message);
        if self.history.len() > MAX_SESSION_HISTORY {
            let excess = self.history.len() - MAX_SESSION_HISTORY;
            self.history.drain(..excess);
        }
    }

    /// Immutable view with the most recent `history_limit` messages
    pub fn snapshot(&self, history_limit: usize) -> ExecutionContext {
        let skip = self.history.len().saturating_sub(history_limit);
        ExecutionContext {
            project_id: self.project_id.clone(),
            organization_id: self.organization_id.clone(),
            user_id: self.user_id.clone(),
            active_module: self.active_module.clone(),
            brand_profile: self.brand_profile.clone(),
            chat_history: self.history[skip..].to_vec(),
            ..Default::default()
        }
    }
}

/// Turns session state into an execution context
#[async_trait]
pub trait ContextResolver: Send + Sync {
    async fn resolve(&self, session: &Session, query: &str) -> Result<ExecutionContext>;
}

/// Default resolver: session snapshot plus memories relevant to the query
pub struct SnapshotResolver {
    history_limit: usize,
    memory: Option<Arc<MemoryStore>>,
    memory_limit: usize,
}

impl SnapshotResolver {
    pub fn new() -> Self {
        Self {
            history_limit: 10,
            memory: None,
            memory_limit: 5,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }
}

impl Default for SnapshotResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextResolver for SnapshotResolver {
    async fn resolve(&self, session: &Session, query: &str) -> Result<ExecutionContext> {
        let context = session.snapshot(self.history_limit);
        let Some(memory) = &self.memory else {
            return Ok(context);
        };

        let memories = memory
            .recall(session.user_id.as_deref(), query, self.memory_limit)
            .await;
        if memories.is_empty() {
            return Ok(context);
        }
        debug!("Resolved {} relevant memories for context", memories.len());
        let section = memories
            .iter()
            .map(|m| format!("- [{}] {}", m.kind, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(context.with_memory(section))
    }
}

/// Context fields worth showing the model, without history or the memory blob
pub fn lean_context_json(context: &ExecutionContext) -> Value {
    let mut map = Map::new();
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(v) = value {
            map.insert(key.to_string(), v);
        }
    };
    put("projectId", context.project_id.clone().map(Value::String));
    put("organizationId", context.organization_id.clone().map(Value::String));
    put("userId", context.user_id.clone().map(Value::String));
    put("activeModule", context.active_module.clone().map(Value::String));
    put("brandProfile", context.brand_profile.clone());
    put("traceId", context.trace_id.clone().map(Value::String));
    put("swarmId", context.swarm_id.clone().map(Value::String));
    put("delegationDepth", Some(Value::from(context.depth)));
    if !context.attachments.is_empty() {
        put("attachmentCount", Some(Value::from(context.attachments.len())));
    }
    Value::Object(map)
}

/// Render history as `ROLE: text` lines, keeping the newest `budget` chars.
///
/// System messages are skipped. When older text is cut, the result starts
/// with [`HISTORY_TRUNCATION_MARKER`].
pub fn history_tail(history: &[ChatMessage], budget: usize) -> String {
    let rendered = history
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| format!("{}: {}", m.role.to_string().to_uppercase(), m.text))
        .collect::<Vec<_>>()
        .join("\n");

    let total = rendered.chars().count();
    if total <= budget {
        return rendered;
    }

    let skip = total - budget;
    let cut = rendered
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(rendered.len());
    format!("{}\n{}", HISTORY_TRUNCATION_MARKER, &rendered[cut..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::memory::MemoryKind;

    #[test]
    fn test_snapshot_limits_history() {
        let mut session = Session::new("c1").with_project("p1");
        for i in 0..15 {
            session.push(ChatMessage::user(format!("msg {}", i)));
        }
        let ctx = session.snapshot(10);
        assert_eq!(ctx.chat_history.len(), 10);
        assert_eq!(ctx.chat_history[0].text, "msg 5");
        assert_eq!(ctx.project_id.as_deref(), Some("p1"));
        assert_eq!(ctx.depth, 0);
        assert!(ctx.trace_id.is_none());
    }

    #[test]
    fn test_session_history_is_capped() {
        let mut session = Session::new("c1");
        for i in 0..MAX_SESSION_HISTORY + 5 {
            session.push(ChatMessage::user(format!("msg {}", i)));
        }
        assert_eq!(session.history.len(), MAX_SESSION_HISTORY);
        assert_eq!(session.history[0].text, "msg 5");
    }

    #[test]
    fn test_lean_context_excludes_history_and_memory() {
        let ctx = ExecutionContext {
            project_id: Some("p1".to_string()),
            memory_context: Some("secret memories".to_string()),
            chat_history: vec![ChatMessage::user("hello there")],
            ..Default::default()
        };
        let json = lean_context_json(&ctx);
        let text = json.to_string();
        assert_eq!(json["projectId"], "p1");
        assert!(!text.contains("hello there"));
        assert!(!text.contains("secret memories"));
        assert!(json.get("organizationId").is_none());
    }

    #[test]
    fn test_history_tail_within_budget() {
        let history = vec![
            ChatMessage::user("hi"),
            ChatMessage::new(Role::System, "internal"),
            ChatMessage::model("hello"),
        ];
        let tail = history_tail(&history, 4000);
        assert_eq!(tail, "USER: hi\nMODEL: hello");
    }

    #[test]
    fn test_history_tail_truncates_oldest() {
        let history = vec![
            ChatMessage::user("a".repeat(50)),
            ChatMessage::model("the most recent answer"),
        ];
        let tail = history_tail(&history, 30);
        assert!(tail.starts_with(HISTORY_TRUNCATION_MARKER));
        assert!(tail.ends_with("MODEL: the most recent answer"));
        let body = tail.trim_start_matches(HISTORY_TRUNCATION_MARKER).trim_start_matches('\n');
        assert_eq!(body.chars().count(), 30);
    }

    #[test]
    fn test_history_tail_multibyte_safe() {
        let history = vec![ChatMessage::user("ééééééééééééééééééé")];
        let tail = history_tail(&history, 5);
        assert!(tail.ends_with("ééééé"));
    }

    #[tokio::test]
    async fn test_snapshot_resolver_attaches_memories() {
        let memory = Arc::new(MemoryStore::new());
        memory
            .save(Some("u1"), "Artist prefers vinyl releases", MemoryKind::Fact)
            .await;
        let resolver = SnapshotResolver::new().with_memory(memory);
        let session = Session::new("c1").with_user("u1");

        let ctx = resolver.resolve(&session, "plan the vinyl launch").await.unwrap();
        let memory_section = ctx.memory_context.unwrap();
        assert!(memory_section.contains("[fact] Artist prefers vinyl releases"));

        let ctx = resolver.resolve(&session, "unrelated").await.unwrap();
        assert!(ctx.memory_context.is_none());
    }
}
