//! Execution traces
//!
//! Every agent execution is recorded as a [`TraceNode`]: created pending,
//! appended to with steps, then finalized exactly once. Nodes link to their
//! parent and share the `swarm_id` of the root of their delegation chain.
//!
//! Persistence sits behind [`TracePersistence`]. The engine never talks to a
//! backend directly; it goes through [`TraceRecorder`], which keeps running
//! when the backend is unavailable.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ConductorError;
use crate::usage::TokenUsage;

/// Lifecycle status of a trace node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TraceStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("Unknown trace status '{}'", other)),
        }
    }
}

/// Kind of a recorded step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Thought,
    ToolCall,
    ToolResult,
    Routing,
    FinalResponse,
    Error,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thought => "thought",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Routing => "routing",
            Self::FinalResponse => "final_response",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "thought" => Ok(Self::Thought),
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            "routing" => Ok(Self::Routing),
            "final_response" => Ok(Self::FinalResponse),
            "error" => Ok(Self::Error),
            other => Err(anyhow::anyhow!("Unknown step kind '{}'", other)),
        }
    }
}

/// A single appended step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl TraceStep {
    pub fn new(kind: StepKind, content: Value) -> Self {
        Self {
            kind,
            content,
            timestamp: Utc::now(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// One recorded agent execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub swarm_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub input: String,
    pub metadata: Value,
    pub status: TraceStatus,
    pub steps: Vec<TraceStep>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Parameters for starting a trace
#[derive(Debug, Clone, Default)]
pub struct NewTrace {
    pub user_id: String,
    pub agent_id: String,
    pub input: String,
    pub metadata: Value,
    pub parent_id: Option<String>,
    /// Swarm to join; `None` makes the new node its own swarm root
    pub swarm_id: Option<String>,
}

impl NewTrace {
    pub fn new(user_id: impl Into<String>, agent_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            input: input.into(),
            metadata: Value::Object(Default::default()),
            parent_id: None,
            swarm_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_swarm(mut self, swarm_id: Option<String>) -> Self {
        self.swarm_id = swarm_id;
        self
    }

    /// Build the pending node for a freshly generated id
    pub fn into_node(self, id: String) -> TraceNode {
        let swarm_id = self.swarm_id.unwrap_or_else(|| id.clone());
        TraceNode {
            id,
            parent_id: self.parent_id,
            swarm_id,
            user_id: self.user_id,
            agent_id: self.agent_id,
            input: self.input,
            metadata: self.metadata,
            status: TraceStatus::Pending,
            steps: Vec::new(),
            output: None,
            error: None,
            usage: TokenUsage::default(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Storage backend for traces.
///
/// Implementations are append-only: steps may only be added to pending
/// nodes, and the terminal status write happens once. Writes to a finalized
/// node fail with [`ConductorError::TraceFinalized`].
#[async_trait]
pub trait TracePersistence: Send + Sync {
    async fn start_trace(&self, trace: NewTrace) -> Result<String>;
    async fn add_step(&self, trace_id: &str, step: TraceStep) -> Result<()>;
    async fn complete_trace(&self, trace_id: &str, output: Option<Value>, usage: TokenUsage) -> Result<()>;
    async fn fail_trace(&self, trace_id: &str, error: &str) -> Result<()>;
    async fn get_trace(&self, trace_id: &str) -> Result<Option<TraceNode>>;
    async fn list_swarm(&self, swarm_id: &str) -> Result<Vec<TraceNode>>;
}

#[derive(Default)]
struct TraceTable {
    nodes: HashMap<String, TraceNode>,
    order: Vec<String>,
}

impl TraceTable {
    fn pending_mut(&mut self, trace_id: &str) -> Result<&mut TraceNode> {
        let node = self
            .nodes
            .get_mut(trace_id)
            .ok_or_else(|| ConductorError::TraceNotFound(trace_id.to_string()))?;
        if node.status != TraceStatus::Pending {
            return Err(ConductorError::TraceFinalized(trace_id.to_string()).into());
        }
        Ok(node)
    }
}

/// Process-local trace store
#[derive(Default)]
pub struct InMemoryTraceStore {
    table: RwLock<TraceTable>,
}

impl InMemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every node in creation order
    pub async fn all(&self) -> Vec<TraceNode> {
        let table = self.table.read().await;
        table
            .order
            .iter()
            .filter_map(|id| table.nodes.get(id).cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TracePersistence for InMemoryTraceStore {
    async fn start_trace(&self, trace: NewTrace) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let node = trace.into_node(id.clone());
        let mut table = self.table.write().await;
        table.order.push(id.clone());
        table.nodes.insert(id.clone(), node);
        Ok(id)
    }

    async fn add_step(&self, trace_id: &str, step: TraceStep) -> Result<()> {
        let mut table = self.table.write().await;
        table.pending_mut(trace_id)?.steps.push(step);
        Ok(())
    }

    async fn complete_trace(&self, trace_id: &str, output: Option<Value>, usage: TokenUsage) -> Result<()> {
        let mut table = self.table.write().await;
        let node = table.pending_mut(trace_id)?;
        node.status = TraceStatus::Completed;
        node.output = output;
        node.usage = usage;
        node.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_trace(&self, trace_id: &str, error: &str) -> Result<()> {
        let mut table = self.table.write().await;
        let node = table.pending_mut(trace_id)?;
        node.status = TraceStatus::Failed;
        node.error = Some(error.to_string());
        node.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn get_trace(&self, trace_id: &str) -> Result<Option<TraceNode>> {
        Ok(self.table.read().await.nodes.get(trace_id).cloned())
    }

    async fn list_swarm(&self, swarm_id: &str) -> Result<Vec<TraceNode>> {
        let table = self.table.read().await;
        Ok(table
            .order
            .iter()
            .filter_map(|id| table.nodes.get(id))
            .filter(|node| node.swarm_id == swarm_id)
            .cloned()
            .collect())
    }
}

const LOCAL_ID_PREFIX: &str = "local-";

/// Failure-tolerant front for a [`TracePersistence`] backend.
///
/// When the backend is missing or `start_trace` fails, a locally generated
/// id (`local-<uuid>`) is returned and every later call for that id is a
/// no-op. Other backend errors are logged and swallowed: tracing never fails
/// an execution.
#[derive(Clone, Default)]
pub struct TraceRecorder {
    backend: Option<Arc<dyn TracePersistence>>,
}

impl TraceRecorder {
    pub fn new(backend: Arc<dyn TracePersistence>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub fn is_local(trace_id: &str) -> bool {
        trace_id.starts_with(LOCAL_ID_PREFIX)
    }

    fn local_id() -> String {
        format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4())
    }

    fn backend_for(&self, trace_id: &str) -> Option<&Arc<dyn TracePersistence>> {
        if Self::is_local(trace_id) {
            return None;
        }
        self.backend.as_ref()
    }

    pub async fn start(&self, trace: NewTrace) -> String {
        let Some(backend) = &self.backend else {
            return Self::local_id();
        };
        let agent_id = trace.agent_id.clone();
        match backend.start_trace(trace).await {
            Ok(id) => {
                debug!("Started trace {} for agent '{}'", id, agent_id);
                id
            }
            Err(e) => {
                warn!("Trace backend unavailable, continuing with a local trace id: {}", e);
                Self::local_id()
            }
        }
    }

    pub async fn add_step(&self, trace_id: &str, step: TraceStep) {
        if let Some(backend) = self.backend_for(trace_id) {
            if let Err(e) = backend.add_step(trace_id, step).await {
                warn!("Failed to record trace step on {}: {}", trace_id, e);
            }
        }
    }

    pub async fn complete(&self, trace_id: &str, output: Option<Value>, usage: TokenUsage) {
        if let Some(backend) = self.backend_for(trace_id) {
            if let Err(e) = backend.complete_trace(trace_id, output, usage).await {
                warn!("Failed to complete trace {}: {}", trace_id, e);
            }
        }
    }

    pub async fn fail(&self, trace_id: &str, error: &str) {
        if let Some(backend) = self.backend_for(trace_id) {
            if let Err(e) = backend.fail_trace(trace_id, error).await {
                warn!("Failed to mark trace {} as failed: {}", trace_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_root_trace_is_its_own_swarm() {
        let store = InMemoryTraceStore::new();
        let id = store.start_trace(NewTrace::new("u1", "legal", "draft")).await.unwrap();
        let node = store.get_trace(&id).await.unwrap().unwrap();
        assert_eq!(node.swarm_id, id);
        assert_eq!(node.status, TraceStatus::Pending);
        assert!(node.parent_id.is_none());
    }

    #[tokio::test]
    async fn test_child_inherits_swarm() {
        let store = InMemoryTraceStore::new();
        let root = store.start_trace(NewTrace::new("u1", "generalist", "plan")).await.unwrap();
        let child = store
            .start_trace(
                NewTrace::new("u1", "legal", "review")
                    .with_parent(Some(root.clone()))
                    .with_swarm(Some(root.clone())),
            )
            .await
            .unwrap();

        let swarm = store.list_swarm(&root).await.unwrap();
        assert_eq!(swarm.len(), 2);
        assert_eq!(swarm[0].id, root);
        assert_eq!(swarm[1].id, child);
        assert_eq!(swarm[1].parent_id.as_deref(), Some(root.as_str()));
    }

    #[tokio::test]
    async fn test_finalize_once() {
        let store = InMemoryTraceStore::new();
        let id = store.start_trace(NewTrace::new("u1", "music", "mix")).await.unwrap();
        store
            .add_step(&id, TraceStep::new(StepKind::Thought, json!({"text": "hmm"})))
            .await
            .unwrap();
        store
            .complete_trace(&id, Some(json!({"text": "done"})), TokenUsage::new(5, 5))
            .await
            .unwrap();

        let err = store.fail_trace(&id, "late").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConductorError>(),
            Some(ConductorError::TraceFinalized(_))
        ));
        let err = store
            .add_step(&id, TraceStep::new(StepKind::Thought, json!({})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already finalized"));

        let node = store.get_trace(&id).await.unwrap().unwrap();
        assert_eq!(node.status, TraceStatus::Completed);
        assert_eq!(node.steps.len(), 1);
        assert_eq!(node.usage.total_tokens(), 10);
        assert!(node.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_trace() {
        let store = InMemoryTraceStore::new();
        let err = store.fail_trace("nope", "x").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConductorError>(),
            Some(ConductorError::TraceNotFound(_))
        ));
    }

    struct BrokenBackend;

    #[async_trait]
    impl TracePersistence for BrokenBackend {
        async fn start_trace(&self, _trace: NewTrace) -> Result<String> {
            anyhow::bail!("database offline")
        }
        async fn add_step(&self, _trace_id: &str, _step: TraceStep) -> Result<()> {
            panic!("must not be called for local ids")
        }
        async fn complete_trace(&self, _trace_id: &str, _output: Option<Value>, _usage: TokenUsage) -> Result<()> {
            panic!("must not be called for local ids")
        }
        async fn fail_trace(&self, _trace_id: &str, _error: &str) -> Result<()> {
            panic!("must not be called for local ids")
        }
        async fn get_trace(&self, _trace_id: &str) -> Result<Option<TraceNode>> {
            Ok(None)
        }
        async fn list_swarm(&self, _swarm_id: &str) -> Result<Vec<TraceNode>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_recorder_tolerates_unavailable_backend() {
        let recorder = TraceRecorder::new(Arc::new(BrokenBackend));
        let id = recorder.start(NewTrace::new("u1", "legal", "x")).await;
        assert!(TraceRecorder::is_local(&id));

        recorder
            .add_step(&id, TraceStep::new(StepKind::Thought, json!({})))
            .await;
        recorder.complete(&id, None, TokenUsage::default()).await;
        recorder.fail(&id, "ignored").await;
    }

    #[tokio::test]
    async fn test_disabled_recorder() {
        let recorder = TraceRecorder::disabled();
        let id = recorder.start(NewTrace::new("u1", "legal", "x")).await;
        assert!(id.starts_with("local-"));
    }

    #[test]
    fn test_step_kind_round_trip_names() {
        for kind in [
            StepKind::Thought,
            StepKind::ToolCall,
            StepKind::ToolResult,
            StepKind::Routing,
            StepKind::FinalResponse,
            StepKind::Error,
        ] {
            let parsed: StepKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                json!(kind.as_str())
            );
        }
    }
}
