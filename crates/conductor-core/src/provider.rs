//! Model provider abstraction
//!
//! The engine treats the language model as an opaque capability: a prompt
//! plus tool schemas in, text and/or function-call requests out, optionally
//! as an incremental stream. Streaming sources come in three shapes (a pull
//! reader, an async stream, or a pre-collected list of chunks); they are all
//! normalised into one [`ChunkStream`] here so the agent loops only ever
//! consume a single kind of stream.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ConductorError;
use crate::types::{Attachment, Progress, ToolCallRequest};
use crate::usage::TokenUsage;

/// Tool definition offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One model invocation
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub attachments: Vec<Attachment>,
    /// Ask the model for a single JSON object instead of prose
    pub json_output: bool,
    pub max_tokens: Option<u32>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_json_output(mut self) -> Self {
        self.json_output = true;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Final result of a model invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub function_calls: Vec<ToolCallRequest>,
    pub usage: TokenUsage,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn call(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            function_calls: vec![ToolCallRequest::new(name, arguments)],
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// The single stream shape the engine consumes
pub type ChunkStream = BoxStream<'static, Result<String>>;

/// Pull-based chunk source: `Ok(None)` marks the end of the stream
#[async_trait]
pub trait ChunkReader: Send {
    async fn read(&mut self) -> Result<Option<String>>;
}

/// Streaming sources as providers hand them over
pub enum ChunkSource {
    Reader(Box<dyn ChunkReader>),
    Stream(ChunkStream),
    Chunks(Vec<String>),
}

impl ChunkSource {
    /// Normalise any source into a [`ChunkStream`]
    pub fn into_stream(self) -> ChunkStream {
        match self {
            Self::Reader(reader) => stream::unfold(Some(reader), |state| async move {
                let mut reader = state?;
                match reader.read().await {
                    Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                    Ok(None) => None,
                    Err(e) => Some((Err(e), None)),
                }
            })
            .boxed(),
            Self::Stream(stream) => stream,
            Self::Chunks(chunks) => stream::iter(chunks.into_iter().map(Ok)).boxed(),
        }
    }
}

impl std::fmt::Debug for ChunkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reader(_) => write!(f, "ChunkSource::Reader"),
            Self::Stream(_) => write!(f, "ChunkSource::Stream"),
            Self::Chunks(c) => write!(f, "ChunkSource::Chunks({})", c.len()),
        }
    }
}

/// Streaming invocation: the chunk stream (if any) plus the final response
pub struct StreamingResponse {
    pub stream: Option<ChunkSource>,
    pub response: BoxFuture<'static, Result<ModelResponse>>,
}

impl StreamingResponse {
    /// A response with no stream attached
    pub fn ready(response: ModelResponse) -> Self {
        Self {
            stream: None,
            response: Box::pin(async move { Ok(response) }),
        }
    }
}

/// Trait every model backend implements
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name (e.g. "anthropic")
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerateRequest) -> Result<ModelResponse>;

    /// Streaming variant. Providers without streaming support fall back to
    /// the non-streaming call with no stream attached.
    async fn generate_stream(&self, request: &GenerateRequest) -> Result<StreamingResponse> {
        let response = self.generate(request).await?;
        Ok(StreamingResponse::ready(response))
    }
}

/// Run `fut` unless `cancel` fires first
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ConductorError::Cancelled.into()),
        result = fut => result,
    }
}

/// Invoke the model in streaming mode, emitting a `token` event per chunk.
///
/// Returns the accumulated stream text and the final response. When the
/// provider attaches no stream, the non-streaming result is awaited directly.
pub async fn stream_generate(
    provider: &dyn ModelProvider,
    request: &GenerateRequest,
    progress: &Progress,
    cancel: &CancellationToken,
) -> Result<(String, ModelResponse)> {
    cancellable(cancel, async {
        let StreamingResponse { stream, response } = provider.generate_stream(request).await?;
        let mut buffer = String::new();
        if let Some(source) = stream {
            let mut chunks = source.into_stream();
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk?;
                progress.token(chunk.as_str());
                buffer.push_str(&chunk);
            }
        }
        let response = response.await?;
        Ok((buffer, response))
    })
    .await
}
