//! Query routing: pick the agent best suited to a request
//!
//! The model sees the candidate roster, a context summary and the sanitized
//! query, and answers with a JSON decision. Anything short of a confident,
//! valid decision lands on the fallback agent. Routing never fails.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::catalog::canonical_agent_id;
use crate::agents::registry::AgentRegistry;
use crate::context::lean_context_json;
use crate::provider::{GenerateRequest, ModelProvider, cancellable};
use crate::stream_parser::extract_json_objects;
use crate::trace::{NewTrace, StepKind, TraceRecorder, TraceStep};
use crate::types::ExecutionContext;
use crate::usage::TokenUsage;

/// Router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Decisions below this confidence go to the fallback agent
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_fallback_agent")]
    pub fallback_agent: String,
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_fallback_agent() -> String {
    "generalist".to_string()
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            fallback_agent: default_fallback_agent(),
        }
    }
}

/// Structured decision the model is asked for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub target_agent_id: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Removal passes applied in order: script/style blocks with their
/// content, remaining tags, `javascript:` URIs, inline `on*=` handlers
fn sanitizer_passes() -> &'static [Regex] {
    static PASSES: OnceLock<Vec<Regex>> = OnceLock::new();
    PASSES.get_or_init(|| {
        [
            r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>",
            r"(?s)</?[a-zA-Z][^>]*>",
            r"(?i)javascript\s*:",
            r"(?i)\bon[a-z]+\s*=",
        ]
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("Skipping invalid sanitizer pattern {}: {}", pattern, e);
                None
            }
        })
        .collect()
    })
}

/// Strip markup and script-like sequences before a query reaches a prompt
pub fn sanitize_query(query: &str) -> String {
    sanitizer_passes()
        .iter()
        .fold(query.to_string(), |text, re| re.replace_all(&text, "").into_owned())
        .trim()
        .to_string()
}

/// Routes queries to agents
pub struct Router {
    provider: Arc<dyn ModelProvider>,
    agents: Arc<AgentRegistry>,
    traces: TraceRecorder,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        agents: Arc<AgentRegistry>,
        traces: TraceRecorder,
    ) -> Self {
        Self {
            provider,
            agents,
            traces,
            config: RouterConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn candidate_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = self.agents.ids().into_iter().collect();
        ids.insert(self.config.fallback_agent.clone());
        ids
    }

    fn build_prompt(&self, context: &ExecutionContext, query: &str) -> String {
        let mut roster = String::new();
        for d in self.agents.descriptors() {
            roster.push_str(&format!("- {} ({}): {}\n", d.id, d.name, d.description));
        }
        if !self.agents.contains(&self.config.fallback_agent) {
            roster.push_str(&format!(
                "- {} (Fallback): General assistance when no specialist fits.\n",
                self.config.fallback_agent
            ));
        }

        let summary = serde_json::to_string(&lean_context_json(context))
            .unwrap_or_else(|_| "{}".to_string());
        format!(
            "You are the dispatcher for a team of specialist agents. Choose the single best \
agent for the user's request.\n\nAGENTS:\n{}\nCONTEXT:\n{}\n\nREQUEST:\n{}\n\n\
Respond with one JSON object: {{\"targetAgentId\": \"<id>\", \"confidence\": <0.0-1.0>, \
\"reasoning\": \"<one sentence>\"}}",
            roster,
            summary,
            sanitize_query(query)
        )
    }

    async fn decide(
        &self,
        context: &ExecutionContext,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<(RoutingDecision, TokenUsage)> {
        let request = GenerateRequest::new(self.build_prompt(context, query))
            .with_json_output()
            .with_max_tokens(512);
        let response = cancellable(cancel, self.provider.generate(&request))
            .await
            .map_err(|e| anyhow!("Routing call failed: {}", e))?;

        let (objects, _) = extract_json_objects(&response.text);
        let decision = objects
            .into_iter()
            .find_map(|v| serde_json::from_value::<RoutingDecision>(v).ok())
            .ok_or_else(|| anyhow!("JSON Parse Error"))?;
        Ok((decision, response.usage))
    }

    /// Choose an agent for `query`. Always returns an id.
    pub async fn route(&self, context: &ExecutionContext, query: &str) -> String {
        self.route_with_cancel(context, query, &CancellationToken::new())
            .await
    }

    pub async fn route_with_cancel(
        &self,
        context: &ExecutionContext,
        query: &str,
        cancel: &CancellationToken,
    ) -> String {
        let fallback = self.config.fallback_agent.clone();
        let (proposed, selected, confidence, reasoning, usage) =
            match self.decide(context, query, cancel).await {
                Ok((decision, usage)) => {
                    let proposed = decision.target_agent_id.trim().to_lowercase();
                    let canonical = canonical_agent_id(&proposed).to_string();
                    let selected = if !self.candidate_ids().contains(&canonical) {
                        debug!("Router proposed unknown agent '{}'", proposed);
                        fallback.clone()
                    } else if !(0.0..=1.0).contains(&decision.confidence) {
                        warn!(
                            "Router confidence {} is outside [0, 1], ignoring decision",
                            decision.confidence
                        );
                        fallback.clone()
                    } else if decision.confidence < self.config.confidence_threshold {
                        debug!(
                            "Router confidence {:.2} below threshold {:.2}",
                            decision.confidence, self.config.confidence_threshold
                        );
                        fallback.clone()
                    } else {
                        canonical
                    };
                    (
                        proposed,
                        selected,
                        decision.confidence,
                        decision.reasoning,
                        usage,
                    )
                }
                Err(e) => {
                    warn!("Routing failed, using {}: {}", fallback, e);
                    (
                        String::new(),
                        fallback.clone(),
                        0.0,
                        format!("{}, fallback to {}", e, fallback),
                        TokenUsage::default(),
                    )
                }
            };

        info!("Routed request to '{}' (confidence {:.2})", selected, confidence);
        let step = TraceStep::new(
            StepKind::Routing,
            serde_json::json!({
                "query": sanitize_query(query),
                "proposedAgent": proposed,
                "selectedAgent": selected,
                "confidence": confidence,
                "reasoning": reasoning,
                "overridden": canonical_agent_id(&proposed) != selected,
            }),
        )
        .with_usage(usage);
        self.record(context, step, usage).await;
        selected
    }

    async fn record(&self, context: &ExecutionContext, step: TraceStep, usage: TokenUsage) {
        if let Some(trace_id) = &context.trace_id {
            self.traces.add_step(trace_id, step).await;
            return;
        }
        let user = context.user_id.clone().unwrap_or_else(|| "anonymous".to_string());
        let input = step.content["query"].as_str().unwrap_or_default().to_string();
        let trace_id = self
            .traces
            .start(NewTrace::new(user, "router", input).with_swarm(context.swarm_id.clone()))
            .await;
        let output = step.content.clone();
        self.traces.add_step(&trace_id, step).await;
        self.traces.complete(&trace_id, Some(output), usage).await;
    }
}
