//! Test doubles shared by the unit tests

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::provider::{ChunkSource, GenerateRequest, ModelProvider, ModelResponse, StreamingResponse};
use crate::tools::{ToolContext, ToolHandler, ToolResult, json_schema};
use crate::usage::TokenUsage;

/// One canned model reply
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    chunks: Option<Vec<String>>,
    response: std::result::Result<ModelResponse, String>,
    delay: Option<Duration>,
}

impl ScriptedTurn {
    /// Non-streaming text reply
    pub fn text(text: &str) -> Self {
        Self {
            chunks: None,
            response: Ok(ModelResponse::text(text)),
            delay: None,
        }
    }

    /// Streamed reply; `final_text` is what the resolved response carries
    pub fn streamed(chunks: Vec<&str>, final_text: &str) -> Self {
        Self {
            chunks: Some(chunks.into_iter().map(str::to_string).collect()),
            response: Ok(ModelResponse::text(final_text)),
            delay: None,
        }
    }

    pub fn call(name: &str, args: Value) -> Self {
        Self {
            chunks: None,
            response: Ok(ModelResponse::call(name, args)),
            delay: None,
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            chunks: None,
            response: Err(message.to_string()),
            delay: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        if let Ok(response) = &mut self.response {
            response.usage = usage;
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Provider that replays a fixed script and records every request
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }

    async fn next_turn(&self, request: &GenerateRequest) -> Result<ScriptedTurn> {
        self.requests.lock().unwrap().push(request.clone());
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("script exhausted"))?;
        if let Some(delay) = turn.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(turn)
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<ModelResponse> {
        let turn = self.next_turn(request).await?;
        turn.response.map_err(|e| anyhow::anyhow!(e))
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<StreamingResponse> {
        let turn = self.next_turn(request).await?;
        let response = turn.response.map_err(|e| anyhow::anyhow!(e))?;
        Ok(StreamingResponse {
            stream: turn.chunks.map(ChunkSource::Chunks),
            response: Box::pin(async move { Ok(response) }),
        })
    }
}

/// Tool that counts its invocations and echoes its `value` argument
pub struct CountingTool {
    name: String,
    calls: AtomicUsize,
    fail: bool,
    usage: TokenUsage,
}

impl CountingTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
            fail: false,
            usage: TokenUsage::default(),
        }
    }

    /// Variant whose results always report failure
    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    /// Report this much model usage from every successful call
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolHandler for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Counts calls"
    }

    fn input_schema(&self) -> Value {
        json_schema(serde_json::json!({ "value": { "type": "string" } }), vec![])
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Ok(ToolResult::failure(format!("{} failed", self.name)));
        }
        let value = args.get("value").and_then(|v| v.as_str()).unwrap_or("");
        Ok(ToolResult::success(format!("counted {}", value)).with_usage(self.usage))
    }
}
