//! Executor: runs one agent invocation inside a trace node
//!
//! Every execution (top-level or delegated) goes through [`Executor::execute`]:
//! resolve the agent, open a pending trace node in the right swarm, enforce
//! the delegation depth, mirror progress into trace steps and finalize the
//! node exactly once.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentRun;
use crate::agents::registry::AgentRegistry;
use crate::error::ConductorError;
use crate::tools::Delegator;
use crate::trace::{NewTrace, StepKind, TraceRecorder, TraceStep};
use crate::types::{
    AgentResponse, Attachment, ExecutionContext, Progress, ProgressEvent, ProgressKind,
};

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Deepest delegation level allowed; the root call is depth 0
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_agent")]
    pub default_agent: String,
}

fn default_max_depth() -> u32 {
    5
}

fn default_agent() -> String {
    "generalist".to_string()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            default_agent: default_agent(),
        }
    }
}

/// Per-call options besides the task and context
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub progress: Progress,
    pub parent_trace_id: Option<String>,
    pub cancel: CancellationToken,
    pub attachments: Vec<Attachment>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_parent(mut self, parent_trace_id: Option<String>) -> Self {
        self.parent_trace_id = parent_trace_id;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

struct ExecutorInner {
    agents: Arc<AgentRegistry>,
    traces: TraceRecorder,
    config: ExecutorConfig,
}

/// Cheap to clone; clones share the same registry and trace backend
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    pub fn new(agents: Arc<AgentRegistry>, traces: TraceRecorder) -> Self {
        Self::with_config(agents, traces, ExecutorConfig::default())
    }

    pub fn with_config(
        agents: Arc<AgentRegistry>,
        traces: TraceRecorder,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                agents,
                traces,
                config,
            }),
        }
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.inner.agents
    }

    pub fn traces(&self) -> &TraceRecorder {
        &self.inner.traces
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Run `task` on `agent_id` inside a new trace node.
    ///
    /// Errors are not swallowed: the trace is marked failed and the error is
    /// returned so a delegating parent can react.
    pub async fn execute(
        &self,
        agent_id: &str,
        task: &str,
        context: ExecutionContext,
        options: ExecuteOptions,
    ) -> Result<AgentResponse> {
        let agent = self
            .inner
            .agents
            .resolve_with_fallback(agent_id, &self.inner.config.default_agent)
            .await?;
        let resolved_id = agent.descriptor().id.clone();
        let traces = &self.inner.traces;

        let user = context
            .user_id
            .clone()
            .unwrap_or_else(|| "anonymous".to_string());
        let trace_id = traces
            .start(
                NewTrace::new(user, resolved_id.as_str(), task)
                    .with_metadata(serde_json::json!({
                        "requestedAgent": agent_id,
                        "depth": context.depth,
                    }))
                    .with_parent(options.parent_trace_id.clone())
                    .with_swarm(context.swarm_id.clone()),
            )
            .await;
        let swarm_id = context
            .swarm_id
            .clone()
            .unwrap_or_else(|| trace_id.clone());

        let max_depth = self.inner.config.max_depth;
        if context.depth > max_depth {
            let err = ConductorError::DepthExceeded {
                depth: context.depth,
                max: max_depth,
            };
            warn!("Refusing to run '{}': {}", resolved_id, err);
            self.finish_failed(&trace_id, &err.to_string()).await;
            return Err(err.into());
        }

        info!(
            "Executing agent '{}' (trace {}, swarm {}, depth {})",
            resolved_id, trace_id, swarm_id, context.depth
        );

        let (agent_progress, events) = Progress::channel();
        let run = AgentRun {
            context: context.with_trace(trace_id.as_str(), swarm_id.as_str()),
            progress: agent_progress,
            cancel: options.cancel.clone(),
            attachments: options.attachments,
            delegator: Some(Arc::new(self.clone()) as Arc<dyn Delegator>),
        };

        let (result, ()) = tokio::join!(
            agent.execute(task, run),
            self.forward_progress(&trace_id, events, &options.progress)
        );

        match result {
            Ok(mut response) => {
                traces
                    .add_step(
                        &trace_id,
                        TraceStep::new(
                            StepKind::FinalResponse,
                            serde_json::json!({ "text": response.text }),
                        )
                        .with_usage(response.usage),
                    )
                    .await;
                let output = serde_json::json!({
                    "text": response.text,
                    "data": response.data,
                });
                traces.complete(&trace_id, Some(output), response.usage).await;
                debug!("Trace {} completed", trace_id);
                response.trace_id = Some(trace_id);
                Ok(response)
            }
            Err(e) => {
                warn!("Agent '{}' failed in trace {}: {}", resolved_id, trace_id, e);
                self.finish_failed(&trace_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn finish_failed(&self, trace_id: &str, message: &str) {
        let traces = &self.inner.traces;
        traces
            .add_step(
                trace_id,
                TraceStep::new(StepKind::Error, serde_json::json!({ "message": message })),
            )
            .await;
        traces.fail(trace_id, message).await;
    }

    /// Mirror agent progress into trace steps (in order) and on to the caller.
    /// Consecutive tokens are recorded as one step.
    async fn forward_progress(
        &self,
        trace_id: &str,
        mut events: mpsc::UnboundedReceiver<ProgressEvent>,
        caller: &Progress,
    ) {
        let traces = &self.inner.traces;
        let mut tokens = String::new();
        while let Some(event) = events.recv().await {
            if event.kind == ProgressKind::Token {
                tokens.push_str(&event.content);
                caller.emit(event);
                continue;
            }
            if !tokens.is_empty() {
                traces.add_step(trace_id, token_step(std::mem::take(&mut tokens))).await;
            }
            let step = match event.kind {
                ProgressKind::Tool => TraceStep::new(
                    StepKind::ToolCall,
                    serde_json::json!({
                        "tool": event.tool_name,
                        "args": event.tool_args.clone().unwrap_or(Value::Null),
                    }),
                ),
                _ => TraceStep::new(
                    StepKind::Thought,
                    serde_json::json!({ "text": event.content }),
                ),
            };
            traces.add_step(trace_id, step).await;
            caller.emit(event);
        }
        if !tokens.is_empty() {
            traces.add_step(trace_id, token_step(tokens)).await;
        }
    }
}

fn token_step(text: String) -> TraceStep {
    TraceStep::new(
        StepKind::Thought,
        serde_json::json!({ "text": text, "streamed": true }),
    )
}

#[async_trait]
impl Delegator for Executor {
    async fn delegate(
        &self,
        agent_id: &str,
        task: &str,
        context: ExecutionContext,
        options: ExecuteOptions,
    ) -> Result<AgentResponse> {
        self.execute(agent_id, task, context, options).await
    }
}
