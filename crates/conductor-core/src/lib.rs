//! conductor-core - routing and execution engine for a roster of agents
//!
//! This crate provides:
//! - Confidence-gated router that picks an agent for each request
//! - Executor that wraps every agent run in a trace node and enforces delegation depth
//! - Tool-calling and streaming JSON-step agent loops
//! - Tool registry with JSON-schema argument validation and shared tools
//!   (memory, self-critique, delegation, parallel consultation, host commands)
//! - Append-only execution traces grouped into swarms
//! - Service façade tying session context, routing and execution together
//! - Host-side runner for scheduled and event-triggered agent tasks

pub mod agent;
pub mod agents;
pub mod autonomous;
pub mod context;
pub mod error;
pub mod executor;
pub mod proactive;
pub mod provider;
pub mod providers;
pub mod router;
pub mod service;
pub mod stream_parser;
pub mod tools;
pub mod trace;
pub mod types;
pub mod usage;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use agent::{Agent, AgentLoopConfig, AgentRun, SpecialistAgent};
pub use agents::{AgentOverride, AgentProfile, AgentRegistry, builtin_profiles};
pub use autonomous::AutonomousAgent;
pub use context::{ContextResolver, Session, SnapshotResolver};
pub use error::{ConductorError, is_cancellation};
pub use executor::{ExecuteOptions, Executor, ExecutorConfig};
pub use provider::{GenerateRequest, ModelProvider, ModelResponse, StreamingResponse};
pub use proactive::{ProactiveRunner, Subscription, TaskOutcome, Trigger};
pub use providers::AnthropicProvider;
pub use router::{Router, RouterConfig, RoutingDecision};
pub use service::{AgentService, Reply, SendOptions, ServiceBuilder};
pub use tools::host::HostCommand;
pub use tools::{ToolContext, ToolHandler, ToolRegistry, ToolResult};
pub use trace::{InMemoryTraceStore, TraceNode, TracePersistence, TraceRecorder, TraceStatus};
pub use types::{
    AgentDescriptor, AgentResponse, Attachment, ChatMessage, ExecutionContext, Progress,
    ProgressEvent, ProgressKind, Role,
};
pub use usage::TokenUsage;
