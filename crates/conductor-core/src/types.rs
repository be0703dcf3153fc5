//! Core value types shared by every layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::usage::TokenUsage;

/// Who authored a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Model => write!(f, "model"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A single turn in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, text)
    }
}

/// Inline file payload (image, PDF) forwarded to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub mime_type: String,
    pub base64: String,
}

/// A structured function call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Immutable snapshot of session and workspace state for one execution.
///
/// Callees extend a context through the `with_*` methods, which return a new
/// value; nothing downstream mutates a context it did not create.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand_profile: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_context: Option<String>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swarm_id: Option<String>,
    #[serde(default)]
    pub depth: u32,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context bound to a running trace node and its swarm
    pub fn with_trace(&self, trace_id: impl Into<String>, swarm_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            swarm_id: Some(swarm_id.into()),
            ..self.clone()
        }
    }

    /// Context handed to a delegated child: one level deeper, same swarm
    pub fn delegated(&self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self.clone()
        }
    }

    pub fn with_attachments(&self, attachments: Vec<Attachment>) -> Self {
        Self {
            attachments,
            ..self.clone()
        }
    }

    pub fn with_memory(&self, memory_context: impl Into<String>) -> Self {
        Self {
            memory_context: Some(memory_context.into()),
            ..self.clone()
        }
    }
}

/// Kind of a caller-facing progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    Thought,
    Tool,
    Token,
}

/// Real-time progress emitted while an agent works
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,
}

/// Optional sink for progress events.
///
/// Sending never fails from the caller's point of view: a missing or closed
/// receiver just drops the event.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl Progress {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// A connected sink and the receiver that drains it
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn thought(&self, content: impl Into<String>) {
        self.emit(ProgressEvent {
            kind: ProgressKind::Thought,
            content: content.into(),
            tool_name: None,
            tool_args: None,
        });
    }

    pub fn tool(&self, name: &str, args: &Value) {
        self.emit(ProgressEvent {
            kind: ProgressKind::Tool,
            content: format!("Calling tool: {}", name),
            tool_name: Some(name.to_string()),
            tool_args: Some(args.clone()),
        });
    }

    pub fn token(&self, chunk: impl Into<String>) {
        self.emit(ProgressEvent {
            kind: ProgressKind::Token,
            content: chunk.into(),
            tool_name: None,
            tool_args: None,
        });
    }
}

/// What an agent hands back after one execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl AgentResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_calls(mut self, tool_calls: Vec<ToolCallRequest>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

/// Category an agent belongs to in the roster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentCategory {
    Manager,
    Department,
    #[default]
    Specialist,
}

impl std::fmt::Display for AgentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::Manager => "manager",
            Self::Department => "department",
            Self::Specialist => "specialist",
        })
    }
}

/// Public identity of a registered agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub category: AgentCategory,
    #[serde(default)]
    pub tool_names: Vec<String>,
}

impl AgentDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            category: AgentCategory::Specialist,
            tool_names: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: AgentCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tool_names = tools.iter().map(|t| t.to_string()).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display() {
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Model.to_string(), "model");
        assert_eq!(Role::System.to_string(), "system");
    }

    #[test]
    fn test_context_extension_leaves_original_untouched() {
        let root = ExecutionContext {
            project_id: Some("p1".to_string()),
            ..Default::default()
        };
        let traced = root.with_trace("t1", "t1");
        let child = traced.delegated();

        assert!(root.trace_id.is_none());
        assert_eq!(root.depth, 0);
        assert_eq!(traced.trace_id.as_deref(), Some("t1"));
        assert_eq!(child.depth, 1);
        assert_eq!(child.swarm_id.as_deref(), Some("t1"));
        assert_eq!(child.project_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_context_serializes_camel_case_without_nulls() {
        let ctx = ExecutionContext {
            project_id: Some("p1".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["projectId"], "p1");
        assert!(json.get("organizationId").is_none());
        assert_eq!(json["depth"], 0);
    }

    #[tokio::test]
    async fn test_progress_channel() {
        let (progress, mut rx) = Progress::channel();
        progress.thought("thinking");
        progress.tool("save_memory", &serde_json::json!({"content": "x"}));
        progress.token("abc");
        drop(progress);

        let mut kinds = Vec::new();
        while let Some(ev) = rx.recv().await {
            kinds.push(ev.kind);
        }
        assert_eq!(
            kinds,
            vec![ProgressKind::Thought, ProgressKind::Tool, ProgressKind::Token]
        );
    }

    #[test]
    fn test_progress_none_is_silent() {
        let progress = Progress::none();
        progress.thought("nobody listening");
    }

    #[test]
    fn test_progress_event_serialization() {
        let ev = ProgressEvent {
            kind: ProgressKind::Tool,
            content: "Calling tool: x".to_string(),
            tool_name: Some("x".to_string()),
            tool_args: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "tool");
        assert_eq!(json["toolName"], "x");
    }

    #[test]
    fn test_agent_response_builders() {
        let resp = AgentResponse::text("done")
            .with_data(serde_json::json!({"k": 1}))
            .with_usage(TokenUsage::new(1, 1));
        assert_eq!(resp.text, "done");
        assert_eq!(resp.data.unwrap()["k"], 1);
        assert_eq!(resp.usage.total_tokens(), 2);
    }
}
