//! Delegation tools: delegate_task and consult_experts
//!
//! Both run child executions through a [`Delegator`] (the executor in
//! production). Children get the parent's trace as their parent, a context
//! one level deeper, no progress sink and a child cancellation token.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{ToolContext, ToolHandler, ToolResult, json_schema, required_str};
use crate::agents::catalog::{AGENT_ALIASES, KNOWN_AGENT_IDS};
use crate::executor::ExecuteOptions;
use crate::types::{AgentResponse, ExecutionContext, Progress};

/// Runs a task on another agent on behalf of a tool
#[async_trait]
pub trait Delegator: Send + Sync {
    async fn delegate(
        &self,
        agent_id: &str,
        task: &str,
        context: ExecutionContext,
        options: ExecuteOptions,
    ) -> Result<AgentResponse>;
}

fn default_valid_ids() -> Vec<String> {
    KNOWN_AGENT_IDS
        .iter()
        .copied()
        .chain(AGENT_ALIASES.iter().map(|(alias, _)| *alias))
        .map(str::to_string)
        .collect()
}

fn child_options(ctx: &ToolContext) -> ExecuteOptions {
    ExecuteOptions {
        progress: Progress::none(),
        parent_trace_id: ctx.context.trace_id.clone(),
        cancel: ctx.cancel.child_token(),
        attachments: Vec::new(),
    }
}

/// Outcome of one consultation, in the order it was requested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationOutcome {
    pub target_agent_id: String,
    pub task: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── delegate_task ──────────────────────────────────────────────────

pub struct DelegateTaskTool {
    valid_ids: Vec<String>,
}

impl DelegateTaskTool {
    pub fn new(valid_ids: Vec<String>) -> Self {
        Self { valid_ids }
    }
}

impl Default for DelegateTaskTool {
    fn default() -> Self {
        Self::new(default_valid_ids())
    }
}

#[async_trait]
impl ToolHandler for DelegateTaskTool {
    fn name(&self) -> &str {
        "delegate_task"
    }

    fn description(&self) -> &str {
        "Hand a sub-task to another specialist agent and wait for its answer."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "targetAgentId": {
                    "type": "string",
                    "description": "Id of the agent that should do the work."
                },
                "task": {
                    "type": "string",
                    "description": "Self-contained description of the sub-task."
                }
            }),
            vec!["targetAgentId", "task"],
        )
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let target = required_str(&args, "targetAgentId")?;
        let task = required_str(&args, "task")?;

        if !self.valid_ids.iter().any(|id| id == target) {
            return Ok(ToolResult::failure(format!(
                "Unknown agent '{}'. Valid agents: {}",
                target,
                self.valid_ids.join(", ")
            ))
            .with_data(serde_json::json!({ "validAgentIds": self.valid_ids })));
        }

        let Some(delegator) = &ctx.delegator else {
            return Ok(ToolResult::failure("Delegation is not available in this context"));
        };

        ctx.progress.thought(format!("Delegating to {}: {}", target, task));
        info!("Delegating task to '{}' (depth {})", target, ctx.context.depth + 1);

        match delegator
            .delegate(target, task, ctx.context.delegated(), child_options(ctx))
            .await
        {
            Ok(response) => Ok(ToolResult::success(response.text.clone()).with_data(
                serde_json::json!({
                    "agentId": target,
                    "text": response.text,
                    "data": response.data,
                }),
            )),
            Err(e) => Ok(ToolResult::failure(format!("Delegation failed: {}", e))),
        }
    }
}

// ─── consult_experts ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Consultation {
    target_agent_id: String,
    task: String,
}

pub struct ConsultExpertsTool {
    valid_ids: Vec<String>,
}

impl ConsultExpertsTool {
    pub fn new(valid_ids: Vec<String>) -> Self {
        Self { valid_ids }
    }
}

impl Default for ConsultExpertsTool {
    fn default() -> Self {
        Self::new(default_valid_ids())
    }
}

#[async_trait]
impl ToolHandler for ConsultExpertsTool {
    fn name(&self) -> &str {
        "consult_experts"
    }

    fn description(&self) -> &str {
        "Ask several agents in parallel and collect all their answers."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "consultations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "targetAgentId": { "type": "string" },
                            "task": { "type": "string" }
                        },
                        "required": ["targetAgentId", "task"]
                    }
                }
            }),
            vec!["consultations"],
        )
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let consultations: Vec<Consultation> = serde_json::from_value(
            args.get("consultations").cloned().unwrap_or(Value::Null),
        )?;
        if consultations.is_empty() {
            return Ok(ToolResult::failure("No consultations given"));
        }
        let Some(delegator) = &ctx.delegator else {
            return Ok(ToolResult::failure("Delegation is not available in this context"));
        };

        ctx.progress
            .thought(format!("Consulting {} experts in parallel", consultations.len()));
        debug!("consult_experts fan-out of {}", consultations.len());

        let calls = consultations.iter().map(|c| async move {
            if !self.valid_ids.iter().any(|id| *id == c.target_agent_id) {
                return Err(anyhow!("Unknown agent '{}'", c.target_agent_id));
            }
            delegator
                .delegate(
                    &c.target_agent_id,
                    &c.task,
                    ctx.context.delegated(),
                    child_options(ctx),
                )
                .await
        });
        let results = join_all(calls).await;
        let outcomes: Vec<DelegationOutcome> = results
            .into_iter()
            .zip(consultations)
            .map(|(result, c)| match result {
                Ok(response) => DelegationOutcome {
                    target_agent_id: c.target_agent_id,
                    task: c.task,
                    success: true,
                    response: Some(response.text),
                    error: None,
                },
                Err(e) => DelegationOutcome {
                    target_agent_id: c.target_agent_id,
                    task: c.task,
                    success: false,
                    response: None,
                    error: Some(e.to_string()),
                },
            })
            .collect();

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        Ok(
            ToolResult::success(format!("{}/{} consultations succeeded", succeeded, outcomes.len()))
                .with_data(serde_json::json!({ "results": outcomes })),
        )
    }
}
