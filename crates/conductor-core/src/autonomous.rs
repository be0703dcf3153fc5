//! Streaming think/act loop for agents that answer in JSON steps
//!
//! The model emits a sequence of `{"thought": ..}`, `{"tool": .., "args": ..}`
//! and `{"final_response": ..}` objects inline in one stream. Objects are
//! pulled out of the stream as soon as they close and acted on immediately;
//! tool output is fed back as observations on the next iteration.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agent::{
    Agent, AgentLoopConfig, AgentRun, SpecialistAgent, bail_if_cancelled, compose_prompt,
    recover_failure, truncate_chars,
};
use crate::agents::profile::AgentProfile;
use crate::provider::{GenerateRequest, ModelProvider, StreamingResponse, cancellable};
use crate::stream_parser::{StreamScanner, extract_json_objects};
use crate::tools::{ToolContext, ToolRegistry, dispatch_tool_call};
use crate::types::{AgentDescriptor, AgentResponse, ToolCallRequest};
use crate::usage::TokenUsage;

const JSON_STEP_PROTOCOL: &str = "RESPONSE FORMAT:\n\
Reply ONLY with a sequence of JSON objects, one per step:\n\
{\"thought\": \"what you are thinking\"}\n\
{\"tool\": \"tool_name\", \"args\": { ... }}\n\
{\"final_response\": \"your answer to the user\"}\n\
After a tool call, stop and wait for its output. Emit final_response once you are done.";

#[derive(Debug, Clone, PartialEq)]
struct CallRecord {
    name: String,
    args: String,
    success: bool,
}

#[derive(Debug, Default)]
struct LoopState {
    usage: TokenUsage,
    observations: Vec<String>,
    calls: Vec<CallRecord>,
    tool_calls: Vec<ToolCallRequest>,
    progressed: bool,
    final_response: Option<String>,
    loop_detected: Option<String>,
}

impl LoopState {
    fn done(&self) -> bool {
        self.final_response.is_some() || self.loop_detected.is_some()
    }
}

/// Agent running the JSON step protocol
pub struct AutonomousAgent {
    inner: SpecialistAgent,
}

impl AutonomousAgent {
    pub fn new(
        profile: &AgentProfile,
        provider: Arc<dyn ModelProvider>,
        shared_tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            inner: SpecialistAgent::new(profile, provider, shared_tools),
        }
    }

    pub fn with_functions(mut self, functions: ToolRegistry) -> Self {
        self.inner = self.inner.with_functions(functions);
        self
    }

    pub fn with_config(mut self, config: AgentLoopConfig) -> Self {
        self.inner = self.inner.with_config(config);
        self
    }

    fn config(&self) -> &AgentLoopConfig {
        &self.inner.config
    }

    fn continuation_prompt(&self, task: &str, observations: &[String]) -> String {
        let mut prompt = String::new();
        if !self.inner.system_prompt.is_empty() {
            prompt.push_str(&self.inner.system_prompt);
            prompt.push_str("\n\n");
        }
        prompt.push_str(JSON_STEP_PROTOCOL);
        prompt.push_str(&format!("\n\nTASK:\n{}", task));
        prompt.push_str(&format!("\n\nOBSERVATIONS:\n{}", observations.join("\n")));
        prompt.push_str("\n\nContinue from here. Emit more steps, or final_response when done.");
        prompt
    }

    async fn run_tool(
        &self,
        name: &str,
        args: Value,
        state: &mut LoopState,
        run: &AgentRun,
        ctx: &ToolContext,
    ) -> Result<()> {
        let key = serde_json::to_string(&args)?;
        let repeats_failure = state
            .calls
            .iter()
            .any(|c| c.name == name && c.args == key && !c.success);
        if repeats_failure {
            warn!("Loop detected: '{}' repeated with the same failing arguments", name);
            state.loop_detected = Some(name.to_string());
            return Ok(());
        }

        run.progress.tool(name, &args);
        let call = ToolCallRequest::new(name, args);
        let result = dispatch_tool_call(&self.inner.functions, &self.inner.shared_tools, &call, ctx).await;
        bail_if_cancelled(&run.cancel)?;
        run.progress.thought(format!("Tool {} completed.", name));

        state.usage += result.usage;
        let output = serde_json::to_string(&result)?;
        state.observations.push(format!(
            "[Tool: {}] Output: {}",
            name,
            truncate_chars(&output, self.config().max_tool_output)
        ));
        state.calls.push(CallRecord {
            name: name.to_string(),
            args: key,
            success: result.success,
        });
        state.tool_calls.push(call);
        Ok(())
    }

    async fn handle_step(
        &self,
        step: Value,
        state: &mut LoopState,
        run: &AgentRun,
        ctx: &ToolContext,
    ) -> Result<()> {
        if let Some(thought) = step.get("thought").and_then(|v| v.as_str()) {
            run.progress.thought(thought);
            state.observations.push(format!("THOUGHT: {}", thought));
            state.progressed = true;
        }
        if let Some(name) = step.get("tool").and_then(|v| v.as_str()) {
            let args = step
                .get("args")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            state.progressed = true;
            self.run_tool(name, args, state, run, ctx).await?;
            if state.done() {
                return Ok(());
            }
        }
        if let Some(answer) = step.get("final_response") {
            let text = match answer {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            state.final_response = Some(text);
            state.progressed = true;
        }
        Ok(())
    }

    /// One model call; returns the raw text the model produced
    async fn iterate(
        &self,
        request: &GenerateRequest,
        state: &mut LoopState,
        run: &AgentRun,
        ctx: &ToolContext,
    ) -> Result<String> {
        let StreamingResponse { stream, response } =
            cancellable(&run.cancel, self.inner.provider.generate_stream(request)).await?;

        let mut raw = String::new();
        let mut scanned = false;
        if let Some(source) = stream {
            scanned = true;
            let mut chunks = source.into_stream();
            let mut scanner = StreamScanner::new();
            while let Some(chunk) =
                cancellable(&run.cancel, async { chunks.next().await.transpose() }).await?
            {
                run.progress.token(chunk.as_str());
                raw.push_str(&chunk);
                for step in scanner.push(&chunk) {
                    self.handle_step(step, state, run, ctx).await?;
                    if state.done() {
                        break;
                    }
                }
                if state.done() {
                    debug!("Stopping stream consumption early");
                    break;
                }
            }
        }

        let response = cancellable(&run.cancel, response).await?;
        state.usage += response.usage;
        if state.done() {
            return Ok(raw);
        }

        if !scanned {
            raw = response.text.clone();
            let (steps, _) = extract_json_objects(&response.text);
            for step in steps {
                self.handle_step(step, state, run, ctx).await?;
                if state.done() {
                    return Ok(raw);
                }
            }
        }

        for call in response.function_calls {
            state.progressed = true;
            self.run_tool(&call.name, call.arguments, state, run, ctx).await?;
            if state.done() {
                break;
            }
        }
        Ok(raw)
    }

    async fn run(&self, task: &str, run: &AgentRun) -> Result<AgentResponse> {
        let preview: String = task.chars().take(50).collect();
        run.progress.thought(format!("Analyzing request: \"{}...\"", preview));

        let ctx = run.tool_context();
        let tools = self.inner.tool_definitions();
        let mut state = LoopState::default();
        let mut stalled = 0;
        let mut last_raw = String::new();

        for iteration in 1..=self.config().max_iterations {
            bail_if_cancelled(&run.cancel)?;
            let request = if iteration == 1 {
                let prompt = format!(
                    "{}\n\n{}",
                    compose_prompt(
                        &self.inner.system_prompt,
                        &run.context,
                        task,
                        self.config().history_char_budget
                    ),
                    JSON_STEP_PROTOCOL
                );
                GenerateRequest::new(prompt).with_attachments(run.attachments())
            } else {
                GenerateRequest::new(self.continuation_prompt(task, &state.observations))
            }
            .with_tools(tools.clone())
            .with_json_output();

            state.progressed = false;
            last_raw = self.iterate(&request, &mut state, run, &ctx).await?;

            if let Some(tool) = state.loop_detected.take() {
                return Ok(AgentResponse::text(format!(
                    "Loop detected: '{}' was called again with the same arguments after it failed. Stopping.",
                    tool
                ))
                .with_data(serde_json::json!({
                    "loopDetected": true,
                    "tool": tool,
                    "iterations": iteration,
                }))
                .with_usage(state.usage)
                .with_calls(state.tool_calls));
            }

            if let Some(answer) = state.final_response.take() {
                info!("Autonomous loop finished after {} iteration(s)", iteration);
                return Ok(AgentResponse::text(answer)
                    .with_data(serde_json::json!({ "iterations": iteration }))
                    .with_usage(state.usage)
                    .with_calls(state.tool_calls));
            }

            if state.progressed {
                stalled = 0;
                continue;
            }
            stalled += 1;
            debug!("No progress on iteration {} ({} stalled)", iteration, stalled);
            if stalled >= self.config().max_stalled_iterations {
                warn!("Autonomous loop stalled after {} iterations", iteration);
                let text = if last_raw.trim().is_empty() {
                    format!("Stopped: no progress after {} attempts.", stalled)
                } else {
                    last_raw.trim().to_string()
                };
                return Ok(AgentResponse::text(text)
                    .with_data(serde_json::json!({ "stalled": true, "iterations": iteration }))
                    .with_usage(state.usage)
                    .with_calls(state.tool_calls));
            }
        }

        let max_iterations = self.config().max_iterations;
        warn!("Autonomous loop hit the iteration limit ({})", max_iterations);
        Ok(AgentResponse::text(format!(
            "Reached the iteration limit ({}) without a final response.",
            max_iterations
        ))
        .with_data(serde_json::json!({
            "iterationLimit": true,
            "observations": state.observations,
            "lastOutput": last_raw,
        }))
        .with_usage(state.usage)
        .with_calls(state.tool_calls))
    }
}

#[async_trait]
impl Agent for AutonomousAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        self.inner.descriptor()
    }

    async fn execute(&self, task: &str, run: AgentRun) -> Result<AgentResponse> {
        let result = self.run(task, &run).await;
        recover_failure(&self.inner.descriptor().id, result)
    }
}
