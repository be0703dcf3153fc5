//! verify_output: a second model pass that grades a draft

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{ToolContext, ToolHandler, ToolResult, json_schema, required_str};
use crate::provider::{GenerateRequest, ModelProvider, cancellable};
use crate::stream_parser::extract_json_objects;

const CRITIC_SYSTEM: &str = "You are a strict reviewer. Grade the draft against the stated goal. \
Respond with a single JSON object: {\"score\": <0-10>, \"critique\": \"...\", \"passed\": <true|false>}.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub critique: String,
    #[serde(default)]
    pub passed: bool,
}

pub struct VerifyOutputTool {
    provider: Arc<dyn ModelProvider>,
}

impl VerifyOutputTool {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ToolHandler for VerifyOutputTool {
    fn name(&self) -> &str {
        "verify_output"
    }

    fn description(&self) -> &str {
        "Have a reviewer check a draft against its goal before returning it. Returns a score, critique and pass/fail."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "content": {
                    "type": "string",
                    "description": "The draft to review."
                },
                "goal": {
                    "type": "string",
                    "description": "What the draft is supposed to achieve."
                }
            }),
            vec!["content", "goal"],
        )
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let content = required_str(&args, "content")?;
        let goal = required_str(&args, "goal")?;

        let request = GenerateRequest::new(format!("GOAL:\n{}\n\nDRAFT:\n{}", goal, content))
            .with_system(CRITIC_SYSTEM)
            .with_json_output();
        let response = cancellable(&ctx.cancel, self.provider.generate(&request)).await?;

        let (objects, _) = extract_json_objects(&response.text);
        let parsed = objects
            .into_iter()
            .find_map(|v| serde_json::from_value::<Critique>(v).ok());

        match parsed {
            Some(critique) => {
                debug!("verify_output score={} passed={}", critique.score, critique.passed);
                let verdict = if critique.passed { "PASSED" } else { "NEEDS WORK" };
                Ok(ToolResult::success(format!(
                    "{} ({}/10): {}",
                    verdict, critique.score, critique.critique
                ))
                .with_data(serde_json::to_value(&critique)?)
                .with_usage(response.usage))
            }
            None => Ok(ToolResult::success(response.text.clone())
                .with_data(serde_json::json!({ "raw": response.text }))
                .with_usage(response.usage)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ModelResponse;
    use crate::usage::TokenUsage;

    struct FixedCritic(&'static str);

    #[async_trait]
    impl ModelProvider for FixedCritic {
        fn name(&self) -> &str {
            "critic"
        }

        async fn generate(&self, request: &GenerateRequest) -> Result<ModelResponse> {
            assert!(request.json_output);
            Ok(ModelResponse {
                usage: TokenUsage::new(40, 12),
                ..ModelResponse::text(self.0)
            })
        }
    }

    #[tokio::test]
    async fn test_structured_critique() {
        let tool = VerifyOutputTool::new(Arc::new(FixedCritic(
            r#"```json
{"score": 8, "critique": "Tight copy", "passed": true}
```"#,
        )));
        let result = tool
            .call(
                serde_json::json!({"content": "Out now!", "goal": "announce single"}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.message, "PASSED (8/10): Tight copy");
        assert_eq!(result.data.unwrap()["passed"], true);
        assert_eq!(result.usage.total_tokens(), 52);
    }

    #[tokio::test]
    async fn test_unstructured_critique_falls_back_to_text() {
        let tool = VerifyOutputTool::new(Arc::new(FixedCritic("Looks fine to me")));
        let result = tool
            .call(
                serde_json::json!({"content": "x", "goal": "y"}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.message, "Looks fine to me");
    }
}
