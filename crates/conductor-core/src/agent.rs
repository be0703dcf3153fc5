//! Agent trait and the tool-calling execution loop

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agents::profile::AgentProfile;
use crate::context::{history_tail, lean_context_json};
use crate::error::{ConductorError, is_cancellation};
use crate::provider::{GenerateRequest, ModelProvider, ToolDefinition, stream_generate};
use crate::tools::{
    Delegator, ToolContext, ToolRegistry, dispatch_tool_call, merge_tool_definitions,
};
use crate::types::{AgentDescriptor, AgentResponse, Attachment, ExecutionContext, Progress};

/// Paragraph appended to every agent prompt describing the shared tools
pub(crate) const SHARED_TOOL_PROTOCOL: &str = "SUPERPOWERS:\n\
- Memory: use save_memory for durable facts, rules and preferences; use recall_memories before answering questions about past work.\n\
- Reflection: use verify_output to check important drafts against their goal before returning them.\n\
- Approval: call request_approval before any public or irreversible action.\n\
- Teamwork: use delegate_task to hand work to a colleague, or consult_experts to ask several at once.";

/// Tuning knobs for the agent loops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLoopConfig {
    #[serde(default = "default_max_tools")]
    pub max_tools: usize,
    #[serde(default = "default_history_char_budget")]
    pub history_char_budget: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_stalled_iterations")]
    pub max_stalled_iterations: usize,
    #[serde(default = "default_max_tool_output")]
    pub max_tool_output: usize,
}

fn default_max_tools() -> usize {
    20
}

fn default_history_char_budget() -> usize {
    4000
}

fn default_max_iterations() -> usize {
    5
}

fn default_max_stalled_iterations() -> usize {
    2
}

fn default_max_tool_output() -> usize {
    20_000
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_tools: default_max_tools(),
            history_char_budget: default_history_char_budget(),
            max_iterations: default_max_iterations(),
            max_stalled_iterations: default_max_stalled_iterations(),
            max_tool_output: default_max_tool_output(),
        }
    }
}

/// Everything one agent execution receives besides the task text
#[derive(Clone, Default)]
pub struct AgentRun {
    pub context: ExecutionContext,
    pub progress: Progress,
    pub cancel: CancellationToken,
    pub attachments: Vec<Attachment>,
    pub delegator: Option<Arc<dyn Delegator>>,
}

impl AgentRun {
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            context,
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_delegator(mut self, delegator: Arc<dyn Delegator>) -> Self {
        self.delegator = Some(delegator);
        self
    }

    /// Attachments explicitly passed to this run, else the context's
    pub fn attachments(&self) -> Vec<Attachment> {
        if self.attachments.is_empty() {
            self.context.attachments.clone()
        } else {
            self.attachments.clone()
        }
    }

    pub fn tool_context(&self) -> ToolContext {
        ToolContext::new(self.context.clone())
            .with_delegator(self.delegator.clone())
            .with_progress(self.progress.clone())
            .with_cancel(self.cancel.clone())
    }
}

/// A unit that can execute tasks
#[async_trait]
pub trait Agent: Send + Sync {
    fn descriptor(&self) -> &AgentDescriptor;

    /// Run one task. Failures come back as response text; only cancellation
    /// is returned as an error.
    async fn execute(&self, task: &str, run: AgentRun) -> Result<AgentResponse>;
}

/// First `max` characters of `s`, never splitting a character
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}... [truncated]", &s[..idx]),
        None => s.to_string(),
    }
}

/// Assemble the single prompt an agent sends on its first model call
pub(crate) fn compose_prompt(
    system_prompt: &str,
    context: &ExecutionContext,
    task: &str,
    history_budget: usize,
) -> String {
    let mut prompt = String::new();
    if !system_prompt.is_empty() {
        prompt.push_str(system_prompt);
        prompt.push_str("\n\n");
    }
    prompt.push_str(SHARED_TOOL_PROTOCOL);

    let lean = serde_json::to_string_pretty(&lean_context_json(context))
        .unwrap_or_else(|_| "{}".to_string());
    prompt.push_str(&format!("\n\nCONTEXT:\n{}", lean));

    if let Some(memory) = context.memory_context.as_deref().filter(|m| !m.is_empty()) {
        prompt.push_str(&format!("\n\nRELEVANT MEMORIES:\n{}", memory));
    }

    let history = history_tail(&context.chat_history, history_budget);
    if !history.is_empty() {
        prompt.push_str(&format!("\n\nHISTORY:\n{}", history));
    }

    prompt.push_str(&format!("\n\nTASK:\n{}", task));
    prompt
}

/// Turn a failed run into response text, letting cancellation through
pub(crate) fn recover_failure(agent_id: &str, result: Result<AgentResponse>) -> Result<AgentResponse> {
    match result {
        Ok(response) => Ok(response),
        Err(e) if is_cancellation(&e) => Err(e),
        Err(e) => {
            warn!("Agent '{}' failed: {:#}", agent_id, e);
            Ok(AgentResponse::text(format!("Error executing task: {}", e)).with_error(e.to_string()))
        }
    }
}

pub(crate) fn bail_if_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ConductorError::Cancelled.into());
    }
    Ok(())
}

/// Tool-calling agent driven by an [`AgentProfile`]
pub struct SpecialistAgent {
    descriptor: AgentDescriptor,
    pub(crate) system_prompt: String,
    preferred_tools: Vec<String>,
    pub(crate) provider: Arc<dyn ModelProvider>,
    pub(crate) shared_tools: Arc<ToolRegistry>,
    pub(crate) functions: ToolRegistry,
    pub(crate) config: AgentLoopConfig,
}

impl SpecialistAgent {
    pub fn new(
        profile: &AgentProfile,
        provider: Arc<dyn ModelProvider>,
        shared_tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            descriptor: profile.descriptor(),
            system_prompt: profile.system_prompt.clone(),
            preferred_tools: profile.tools.clone(),
            provider,
            shared_tools,
            functions: ToolRegistry::new(),
            config: AgentLoopConfig::default(),
        }
    }

    /// Agent-local functions, consulted before the shared registry
    pub fn with_functions(mut self, functions: ToolRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_config(mut self, config: AgentLoopConfig) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let declared: Vec<ToolDefinition> = self
            .functions
            .list_tools()
            .into_iter()
            .chain(self.shared_tools.filter_tools(&self.preferred_tools))
            .collect();
        merge_tool_definitions(declared, self.shared_tools.list_tools(), self.config.max_tools)
    }

    async fn run(&self, task: &str, run: &AgentRun) -> Result<AgentResponse> {
        let preview: String = task.chars().take(50).collect();
        run.progress.thought(format!("Analyzing request: \"{}...\"", preview));

        let request = GenerateRequest::new(compose_prompt(
            &self.system_prompt,
            &run.context,
            task,
            self.config.history_char_budget,
        ))
        .with_tools(self.tool_definitions())
        .with_attachments(run.attachments());

        let (streamed, response) =
            stream_generate(self.provider.as_ref(), &request, &run.progress, &run.cancel).await?;

        if let Some(call) = response.function_calls.first() {
            debug!("Agent '{}' requested tool {}", self.descriptor.id, call.name);
            run.progress.tool(&call.name, &call.arguments);
            let result =
                dispatch_tool_call(&self.functions, &self.shared_tools, call, &run.tool_context())
                    .await;
            bail_if_cancelled(&run.cancel)?;
            run.progress.thought(format!("Tool {} completed.", call.name));

            let output = serde_json::to_string(&result)?;
            return Ok(AgentResponse {
                text: format!(
                    "[Tool: {}] Output: {}",
                    call.name,
                    truncate_chars(&output, self.config.max_tool_output)
                ),
                data: Some(serde_json::to_value(&result)?),
                usage: response.usage + result.usage,
                tool_calls: response.function_calls.clone(),
                ..Default::default()
            });
        }

        let text = if response.text.is_empty() {
            streamed
        } else {
            response.text
        };
        Ok(AgentResponse::text(text).with_usage(response.usage))
    }
}

#[async_trait]
impl Agent for SpecialistAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn execute(&self, task: &str, run: AgentRun) -> Result<AgentResponse> {
        let result = self.run(task, &run).await;
        recover_failure(&self.descriptor.id, result)
    }
}
