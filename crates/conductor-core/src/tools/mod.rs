//! Tool registry, argument validation and dispatch
//!
//! Tools are looked up by name. Every handler returns the same
//! [`ToolResult`] envelope, and arguments are checked against the handler's
//! JSON schema before the handler ever runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::provider::ToolDefinition;
use crate::types::{ExecutionContext, Progress, ToolCallRequest};
use crate::usage::TokenUsage;

pub mod critique;
pub mod delegate;
pub mod host;
pub mod memory;

pub use delegate::Delegator;

/// Cross-cutting tools every agent gets on top of its own
pub const SHARED_TOOL_NAMES: &[&str] = &[
    "delegate_task",
    "consult_experts",
    "save_memory",
    "recall_memories",
    "verify_output",
    "request_approval",
    "schedule_task",
    "subscribe_event",
    "send_notification",
    "speak",
];

/// Tools that survive the per-agent tool cap first
pub const PRIORITY_TOOL_NAMES: &[&str] = &["delegate_task", "consult_experts"];

/// Uniform result envelope returned by every tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
    /// Model usage spent inside the tool, billed to the calling agent
    #[serde(skip)]
    pub usage: TokenUsage,
}

impl ToolResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            message: message.into(),
            usage: TokenUsage::default(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            data: None,
            message: error.clone(),
            error: Some(error),
            usage: TokenUsage::default(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Structured result for arguments that failed schema validation
    pub fn invalid_arguments(tool_name: &str, errors: Vec<String>) -> Self {
        Self::failure(format!(
            "Invalid arguments for tool '{}': {}",
            tool_name,
            errors.join("; ")
        ))
        .with_data(serde_json::json!({
            "validationErrors": errors,
        }))
    }

    /// Result for a name no registry knows
    pub fn not_implemented(tool_name: &str, suggestions: Vec<String>) -> Self {
        let mut message = format!("Error: Tool '{}' not implemented.", tool_name);
        if !suggestions.is_empty() {
            message.push_str(&format!(" Did you mean: {}?", suggestions.join(", ")));
        }
        Self::failure(message).with_data(serde_json::json!({
            "suggestions": suggestions,
        }))
    }
}

/// What a tool sees of the execution it runs in
#[derive(Clone, Default)]
pub struct ToolContext {
    pub context: ExecutionContext,
    pub delegator: Option<Arc<dyn Delegator>>,
    pub progress: Progress,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            context,
            ..Default::default()
        }
    }

    pub fn with_delegator(mut self, delegator: Option<Arc<dyn Delegator>>) -> Self {
        self.delegator = delegator;
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Individual tool handler
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult>;
}

struct RegisteredTool {
    handler: Arc<dyn ToolHandler>,
    validator: Option<JSONSchema>,
}

impl RegisteredTool {
    fn validate(&self, args: &Value) -> std::result::Result<(), Vec<String>> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        match validator.validate(args) {
            Ok(()) => Ok(()),
            Err(errors) => Err(errors.map(|e| e.to_string()).collect()),
        }
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.handler.name().to_string(),
            description: self.handler.description().to_string(),
            input_schema: self.handler.input_schema(),
        }
    }
}

/// Registry of available tools
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Create a new empty tool registry
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool handler, compiling its argument schema
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.name().to_string();
        let schema = handler.input_schema();
        let validator = match JSONSchema::compile(&schema) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                warn!("Tool {} has an invalid input schema, skipping validation: {}", name, e);
                None
            }
        };
        debug!("Registering tool: {}", name);
        self.tools.insert(name, RegisteredTool { handler, validator });
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|t| Arc::clone(&t.handler))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get tool definitions for only the named tools, in the given order
    pub fn filter_tools(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(RegisteredTool::definition)
            .collect()
    }

    /// Every definition, sorted by name
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.filter_tools(&self.names())
    }

    /// Check arguments against the tool's schema without running it
    pub fn validate(&self, name: &str, args: &Value) -> std::result::Result<(), Vec<String>> {
        match self.tools.get(name) {
            Some(tool) => tool.validate(args),
            None => Err(vec![format!("Unknown tool: {}", name)]),
        }
    }

    /// Validate and run a tool. Never fails: unknown tools, invalid
    /// arguments and handler errors all come back as failed results.
    pub async fn dispatch(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::not_implemented(name, self.suggest(name));
        };

        if let Err(errors) = tool.validate(&args) {
            warn!("Rejected call to {}: {}", name, errors.join("; "));
            return ToolResult::invalid_arguments(name, errors);
        }

        debug!("Executing tool: {} with input: {}", name, args);
        match tool.handler.call(args, ctx).await {
            Ok(result) => {
                debug!("Tool {} finished (success={})", name, result.success);
                result
            }
            Err(e) => {
                warn!("Tool {} failed: {}", name, e);
                ToolResult::failure(format!("Tool '{}' failed: {}", name, e))
            }
        }
    }

    /// Up to five registered names close to `name`
    pub fn suggest(&self, name: &str) -> Vec<String> {
        suggest_names(name, self.tools.keys().map(String::as_str))
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch a model-requested call: agent-local functions first, then the
/// shared registry, else a "not implemented" result.
pub async fn dispatch_tool_call(
    local: &ToolRegistry,
    global: &ToolRegistry,
    call: &ToolCallRequest,
    ctx: &ToolContext,
) -> ToolResult {
    let args = normalize_arguments(&call.arguments);
    if local.contains(&call.name) {
        return local.dispatch(&call.name, args, ctx).await;
    }
    if global.contains(&call.name) {
        return global.dispatch(&call.name, args, ctx).await;
    }
    let names: Vec<&str> = local
        .tools
        .keys()
        .chain(global.tools.keys())
        .map(String::as_str)
        .collect();
    ToolResult::not_implemented(&call.name, suggest_names(&call.name, names.into_iter()))
}

/// Models sometimes send arguments as an encoded JSON string or null
fn normalize_arguments(args: &Value) -> Value {
    match args {
        Value::Null => Value::Object(Default::default()),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| args.clone()),
        other => other.clone(),
    }
}

/// Merge agent-declared tools with the shared set.
///
/// Declared tools win name collisions. When the merged list exceeds
/// `max_tools`, priority tools are kept first and the rest fill the
/// remaining slots in order.
pub fn merge_tool_definitions(
    declared: Vec<ToolDefinition>,
    shared: Vec<ToolDefinition>,
    max_tools: usize,
) -> Vec<ToolDefinition> {
    let mut seen = HashSet::new();
    let merged: Vec<ToolDefinition> = declared
        .into_iter()
        .chain(shared)
        .filter(|t| seen.insert(t.name.clone()))
        .collect();

    if merged.len() <= max_tools {
        return merged;
    }

    let (priority, rest): (Vec<_>, Vec<_>) = merged
        .into_iter()
        .partition(|t| PRIORITY_TOOL_NAMES.contains(&t.name.as_str()));
    let mut kept = priority;
    kept.truncate(max_tools);
    let remaining = max_tools - kept.len();
    kept.extend(rest.into_iter().take(remaining));
    kept
}

fn suggest_names<'a>(name: &str, candidates: impl Iterator<Item = &'a str>) -> Vec<String> {
    let target = name.to_lowercase();
    let threshold = (target.chars().count() / 3).max(2);
    let mut scored: Vec<(usize, &str)> = candidates
        .filter_map(|candidate| {
            let lower = candidate.to_lowercase();
            if lower.contains(&target) || target.contains(&lower) {
                return Some((0, candidate));
            }
            let distance = levenshtein(&target, &lower);
            (distance <= threshold).then_some((distance, candidate))
        })
        .collect();
    scored.sort();
    scored.dedup();
    scored.into_iter().take(5).map(|(_, n)| n.to_string()).collect()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = if ca == *cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Helper function to create a JSON schema for tool input
pub fn json_schema(properties: Value, required: Vec<&str>) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Read a required string argument
pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("Missing '{}' parameter", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTool {
        calls: AtomicUsize,
    }

    impl EchoTool {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo a message back"
        }

        fn input_schema(&self) -> Value {
            json_schema(
                serde_json::json!({
                    "message": {
                        "type": "string",
                        "description": "Text to echo"
                    }
                }),
                vec!["message"],
            )
        }

        async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let message = required_str(&args, "message")?;
            Ok(ToolResult::success(message.to_string()))
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl ToolHandler for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "Always errors"
        }

        fn input_schema(&self) -> Value {
            json_schema(serde_json::json!({}), vec![])
        }

        async fn call(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
            anyhow::bail!("disk on fire")
        }
    }

    fn def(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: format!("{} tool", name),
            input_schema: json_schema(serde_json::json!({}), vec![]),
        }
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::new()));
        assert_eq!(registry.len(), 1);

        let result = registry
            .dispatch("echo", serde_json::json!({"message": "hi"}), &ToolContext::default())
            .await;
        assert!(result.success);
        assert_eq!(result.message, "hi");
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_reach_handler() {
        let echo = Arc::new(EchoTool::new());
        let mut registry = ToolRegistry::new();
        registry.register(echo.clone());

        let result = registry
            .dispatch("echo", serde_json::json!({"message": 42}), &ToolContext::default())
            .await;
        assert!(!result.success);
        assert!(result.message.contains("Invalid arguments for tool 'echo'"));
        assert!(result.data.unwrap()["validationErrors"].as_array().unwrap().len() >= 1);

        let result = registry
            .dispatch("echo", serde_json::json!({}), &ToolContext::default())
            .await;
        assert!(!result.success);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(BrokenTool));
        let result = registry
            .dispatch("broken", serde_json::json!({}), &ToolContext::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Tool 'broken' failed: disk on fire"));
    }

    #[tokio::test]
    async fn test_unknown_tool_suggests_similar_names() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::new()));
        let result = registry
            .dispatch("ecoh", serde_json::json!({}), &ToolContext::default())
            .await;
        assert!(!result.success);
        assert!(result.message.contains("not implemented"));
        assert!(result.message.contains("Did you mean: echo?"));
    }

    #[tokio::test]
    async fn test_local_functions_take_precedence() {
        struct LocalEcho;

        #[async_trait]
        impl ToolHandler for LocalEcho {
            fn name(&self) -> &str {
                "echo"
            }
            fn description(&self) -> &str {
                "Agent-specific echo"
            }
            fn input_schema(&self) -> Value {
                json_schema(serde_json::json!({}), vec![])
            }
            async fn call(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
                Ok(ToolResult::success("local"))
            }
        }

        let mut local = ToolRegistry::new();
        local.register(Arc::new(LocalEcho));
        let mut global = ToolRegistry::new();
        global.register(Arc::new(EchoTool::new()));

        let call = ToolCallRequest::new("echo", serde_json::json!({"message": "x"}));
        let result = dispatch_tool_call(&local, &global, &call, &ToolContext::default()).await;
        assert_eq!(result.message, "local");

        let call = ToolCallRequest::new("missing_tool", serde_json::json!({}));
        let result = dispatch_tool_call(&local, &global, &call, &ToolContext::default()).await;
        assert!(!result.success);
        assert!(result.message.contains("'missing_tool' not implemented"));
    }

    #[tokio::test]
    async fn test_string_encoded_arguments_are_decoded() {
        let mut global = ToolRegistry::new();
        global.register(Arc::new(EchoTool::new()));
        let call = ToolCallRequest::new("echo", Value::String(r#"{"message":"packed"}"#.to_string()));
        let result = dispatch_tool_call(&ToolRegistry::new(), &global, &call, &ToolContext::default()).await;
        assert!(result.success);
        assert_eq!(result.message, "packed");
    }

    #[test]
    fn test_merge_declared_wins() {
        let mut declared = def("save_memory");
        declared.description = "agent version".to_string();
        let merged = merge_tool_definitions(
            vec![declared, def("mix_track")],
            vec![def("save_memory"), def("delegate_task")],
            20,
        );
        assert_eq!(merged.len(), 3);
        let save = merged.iter().find(|t| t.name == "save_memory").unwrap();
        assert_eq!(save.description, "agent version");
    }

    #[test]
    fn test_merge_cap_keeps_priority_tools() {
        let declared: Vec<ToolDefinition> = (0..10).map(|i| def(&format!("tool_{}", i))).collect();
        let shared = vec![def("save_memory"), def("delegate_task"), def("consult_experts")];
        let merged = merge_tool_definitions(declared, shared, 5);
        assert_eq!(merged.len(), 5);
        let names: Vec<&str> = merged.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"delegate_task"));
        assert!(names.contains(&"consult_experts"));
        assert!(names.contains(&"tool_0"));
        assert!(!names.contains(&"save_memory"));
    }

    #[test]
    fn test_filter_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::new()));

        let filtered = registry.filter_tools(&["echo".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "echo");

        let filtered_empty = registry.filter_tools(&["nonexistent".to_string()]);
        assert!(filtered_empty.is_empty());
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_tool_result_serialization_skips_empty_fields() {
        let json = serde_json::to_value(ToolResult::success("ok")).unwrap();
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());
        assert!(json.get("data").is_none());
    }
}
