//! Anthropic Claude provider (Messages API)

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::provider::{
    ChunkSource, GenerateRequest, ModelProvider, ModelResponse, StreamingResponse,
};
use crate::types::{Attachment, ToolCallRequest};
use crate::usage::PricingTable;

const API_VERSION: &str = "2023-06-01";

const JSON_OUTPUT_INSTRUCTION: &str =
    "Respond with a single valid JSON object and nothing else. Do not wrap it in code fences.";

/// Anthropic Claude provider
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    pricing: PricingTable,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String, base_url: String, max_tokens: u32) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout, using defaults: {}", e);
                Client::new()
            });

        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            max_tokens,
            pricing: PricingTable::default(),
        }
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_body(&self, request: &GenerateRequest, stream: bool) -> Value {
        let mut content: Vec<Value> = request.attachments.iter().filter_map(attachment_block).collect();
        content.push(serde_json::json!({ "type": "text", "text": request.prompt }));

        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "messages": [{ "role": "user", "content": content }],
        });

        let system = match (request.system.as_deref(), request.json_output) {
            (Some(system), true) => Some(format!("{}\n\n{}", system, JSON_OUTPUT_INSTRUCTION)),
            (Some(system), false) => Some(system.to_string()),
            (None, true) => Some(JSON_OUTPUT_INSTRUCTION.to_string()),
            (None, false) => None,
        };
        if let Some(system) = system {
            body["system"] = Value::String(system);
        }

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.input_schema,
                        })
                    })
                    .collect(),
            );
        }
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .context("Failed to send request to Anthropic API")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Anthropic API request failed with status {}: {}",
                status,
                error_text
            ));
        }
        Ok(response)
    }

    fn convert_response(&self, resp: AnthropicApiResponse) -> ModelResponse {
        let mut text = String::new();
        let mut function_calls = Vec::new();
        for block in resp.content {
            match block {
                AnthropicBlock::Text { text: t } => text.push_str(&t),
                AnthropicBlock::ToolUse { name, input, .. } => {
                    function_calls.push(ToolCallRequest::new(name, input))
                }
                AnthropicBlock::Other => {}
            }
        }
        ModelResponse {
            text,
            function_calls,
            usage: self.pricing.usage_for(
                &self.model,
                resp.usage.input_tokens,
                resp.usage.output_tokens,
            ),
        }
    }
}

fn attachment_block(attachment: &Attachment) -> Option<Value> {
    let kind = if attachment.mime_type.starts_with("image/") {
        "image"
    } else if attachment.mime_type == "application/pdf" {
        "document"
    } else {
        debug!("Skipping unsupported attachment type {}", attachment.mime_type);
        return None;
    };
    Some(serde_json::json!({
        "type": kind,
        "source": {
            "type": "base64",
            "media_type": attachment.mime_type,
            "data": attachment.base64,
        }
    }))
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<ModelResponse> {
        let body = self.build_body(request, false);
        debug!(
            "Anthropic request: model={}, prompt_chars={}, tools={}",
            self.model,
            request.prompt.len(),
            request.tools.len()
        );

        let api_response: AnthropicApiResponse = self
            .post(&body)
            .await?
            .json()
            .await
            .context("Failed to parse Anthropic API response")?;

        debug!(
            "Anthropic response: blocks={}, stop_reason={:?}",
            api_response.content.len(),
            api_response.stop_reason
        );
        Ok(self.convert_response(api_response))
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<StreamingResponse> {
        let body = self.build_body(request, true);
        debug!(
            "Anthropic streaming request: model={}, prompt_chars={}",
            self.model,
            request.prompt.len()
        );
        let response = self.post(&body).await?;

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<Result<String>>();
        let (done_tx, done_rx) = oneshot::channel::<Result<ModelResponse>>();
        let model = self.model.clone();
        let pricing = self.pricing.clone();

        tokio::spawn(pump_events(
            response.bytes_stream(),
            chunk_tx,
            done_tx,
            move |message| ModelResponse {
                text: message.text,
                function_calls: message.function_calls,
                usage: pricing.usage_for(&model, message.input_tokens, message.output_tokens),
            },
        ));

        Ok(StreamingResponse {
            stream: Some(ChunkSource::Stream(
                UnboundedReceiverStream::new(chunk_rx).boxed(),
            )),
            response: Box::pin(async move {
                done_rx
                    .await
                    .context("Anthropic stream task ended without a response")?
            }),
        })
    }
}

/// Read the event stream, forwarding text deltas and resolving `done_tx`
/// with the assembled response.
///
/// Deltas stop being forwarded once the chunk receiver is gone, but the
/// stream keeps draining for the final response. Once the response
/// receiver is dropped too (the caller was cancelled), the body stream is
/// dropped, which closes the HTTP connection.
async fn pump_events<S, B, E, F>(
    body: S,
    chunk_tx: mpsc::UnboundedSender<Result<String>>,
    mut done_tx: oneshot::Sender<Result<ModelResponse>>,
    finish: F,
) where
    S: Stream<Item = std::result::Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: std::error::Error + Send + Sync + 'static,
    F: FnOnce(StreamedMessage) -> ModelResponse + Send,
{
    let read = async move {
        let mut body = std::pin::pin!(body);
        let mut events = SseAccumulator::default();
        let mut forwarding = true;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("Failed to read Anthropic event stream")?;
            for delta in events.push(chunk.as_ref()) {
                if forwarding && chunk_tx.send(Ok(delta)).is_err() {
                    forwarding = false;
                }
            }
        }
        events.finish()
    };

    let result = tokio::select! {
        _ = done_tx.closed() => {
            debug!("Anthropic stream abandoned by caller, closing connection");
            return;
        }
        result = read => result,
    };
    let _ = done_tx.send(result.map(finish));
}

/// Message assembled from a server-sent event stream
#[derive(Debug, Default, PartialEq)]
struct StreamedMessage {
    text: String,
    function_calls: Vec<ToolCallRequest>,
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Default)]
struct PendingToolUse {
    name: String,
    input_json: String,
}

/// Incremental parser for the Messages API event stream.
///
/// Bytes are buffered until a full line is available, so events and UTF-8
/// sequences split across network chunks are handled.
#[derive(Debug, Default)]
struct SseAccumulator {
    pending: Vec<u8>,
    text: String,
    tools: BTreeMap<u64, PendingToolUse>,
    input_tokens: u64,
    output_tokens: u64,
    error: Option<String>,
}

impl SseAccumulator {
    /// Feed raw bytes; returns the text deltas completed by them
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut deltas = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim_end().strip_prefix("data:") else {
                continue;
            };
            let Ok(event) = serde_json::from_str::<Value>(data.trim()) else {
                continue;
            };
            if let Some(delta) = self.apply(&event) {
                deltas.push(delta);
            }
        }
        deltas
    }

    fn apply(&mut self, event: &Value) -> Option<String> {
        match event["type"].as_str()? {
            "message_start" => {
                let usage = &event["message"]["usage"];
                self.input_tokens = usage["input_tokens"].as_u64().unwrap_or(0);
                self.output_tokens = usage["output_tokens"].as_u64().unwrap_or(0);
                None
            }
            "content_block_start" => {
                let block = &event["content_block"];
                if block["type"] == "tool_use" {
                    let index = event["index"].as_u64().unwrap_or(0);
                    self.tools.insert(
                        index,
                        PendingToolUse {
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            input_json: String::new(),
                        },
                    );
                }
                None
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str()? {
                    "text_delta" => {
                        let text = delta["text"].as_str()?.to_string();
                        self.text.push_str(&text);
                        Some(text)
                    }
                    "input_json_delta" => {
                        let index = event["index"].as_u64().unwrap_or(0);
                        if let Some(tool) = self.tools.get_mut(&index) {
                            tool.input_json
                                .push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                        None
                    }
                    _ => None,
                }
            }
            "message_delta" => {
                if let Some(output) = event["usage"]["output_tokens"].as_u64() {
                    self.output_tokens = output;
                }
                None
            }
            "error" => {
                self.error = Some(
                    event["error"]["message"]
                        .as_str()
                        .unwrap_or("unknown stream error")
                        .to_string(),
                );
                None
            }
            _ => None,
        }
    }

    fn finish(self) -> Result<StreamedMessage> {
        if let Some(error) = self.error {
            return Err(anyhow!("Anthropic stream error: {}", error));
        }
        let mut function_calls = Vec::with_capacity(self.tools.len());
        for tool in self.tools.into_values() {
            let arguments = if tool.input_json.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&tool.input_json).with_context(|| {
                    format!("Invalid arguments streamed for tool '{}'", tool.name)
                })?
            };
            function_calls.push(ToolCallRequest::new(tool.name, arguments));
        }
        Ok(StreamedMessage {
            text: self.text,
            function_calls,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        })
    }
}

// ── Anthropic wire types ──

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[allow(dead_code)]
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicApiResponse {
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}
