//! Tools that hand work to the embedding application
//!
//! Approval requests, scheduled runs, event subscriptions, notifications and
//! speech all leave the engine as [`HostCommand`]s on an mpsc channel. The
//! host decides what to do with them.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use super::{ToolContext, ToolHandler, ToolResult, json_schema, required_str};

/// Requests sent from shared tools to the host application
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostCommand {
    ApprovalRequested {
        id: String,
        content: String,
        kind: String,
        trace_id: Option<String>,
    },
    Schedule {
        id: String,
        agent_id: String,
        task: String,
        execute_at: DateTime<Utc>,
    },
    Subscribe {
        id: String,
        agent_id: String,
        event_pattern: String,
        task: String,
    },
    Notify {
        title: String,
        body: String,
    },
    Speak {
        text: String,
        voice: Option<String>,
    },
}

/// Never waits on the host; a full queue fails the tool call instead
fn send(tx: &mpsc::Sender<HostCommand>, command: HostCommand) -> Result<()> {
    match tx.try_send(command) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(anyhow!("Host command queue is full, try again later")),
        Err(TrySendError::Closed(_)) => Err(anyhow!("Host is not accepting commands")),
    }
}

fn command_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

// ─── request_approval ───────────────────────────────────────────────

pub struct RequestApprovalTool {
    command_tx: mpsc::Sender<HostCommand>,
}

impl RequestApprovalTool {
    pub fn new(command_tx: mpsc::Sender<HostCommand>) -> Self {
        Self { command_tx }
    }
}

#[async_trait]
impl ToolHandler for RequestApprovalTool {
    fn name(&self) -> &str {
        "request_approval"
    }

    fn description(&self) -> &str {
        "Request user approval for high-stakes actions. Use before any public or irreversible action."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "content": {
                    "type": "string",
                    "description": "Content or action requiring approval."
                },
                "type": {
                    "type": "string",
                    "description": "Type of action (e.g., \"post\", \"email\")."
                }
            }),
            vec!["content"],
        )
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let content = required_str(&args, "content")?;
        let kind = args
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("action")
            .to_string();
        let id = command_id("approval");

        send(
            &self.command_tx,
            HostCommand::ApprovalRequested {
                id: id.clone(),
                content: content.to_string(),
                kind: kind.clone(),
                trace_id: ctx.context.trace_id.clone(),
            },
        )?;

        Ok(ToolResult::success(format!(
            "[APPROVAL REQUESTED] {} ({}). Waiting for the user to approve before proceeding.",
            content, kind
        ))
        .with_data(serde_json::json!({ "approvalId": id, "status": "pending" })))
    }
}

// ─── schedule_task ──────────────────────────────────────────────────

pub struct ScheduleTaskTool {
    command_tx: mpsc::Sender<HostCommand>,
}

impl ScheduleTaskTool {
    pub fn new(command_tx: mpsc::Sender<HostCommand>) -> Self {
        Self { command_tx }
    }
}

#[async_trait]
impl ToolHandler for ScheduleTaskTool {
    fn name(&self) -> &str {
        "schedule_task"
    }

    fn description(&self) -> &str {
        "Schedule a task to be run by an agent at a specific time (RFC 3339 timestamp)."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "agentId": {
                    "type": "string",
                    "description": "Agent that should run the task."
                },
                "task": {
                    "type": "string",
                    "description": "What the agent should do."
                },
                "executeAt": {
                    "type": "string",
                    "description": "When to run it, e.g. 2026-03-01T09:00:00Z."
                }
            }),
            vec!["agentId", "task", "executeAt"],
        )
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let agent_id = required_str(&args, "agentId")?;
        let task = required_str(&args, "task")?;
        let raw_time = required_str(&args, "executeAt")?;

        let execute_at = match DateTime::parse_from_rfc3339(raw_time) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => {
                return Ok(ToolResult::failure(format!(
                    "Invalid executeAt '{}': {}",
                    raw_time, e
                )));
            }
        };
        if execute_at <= Utc::now() {
            return Ok(ToolResult::failure(format!(
                "executeAt {} is in the past",
                execute_at.to_rfc3339()
            )));
        }

        let id = command_id("sched");
        debug!("Scheduling task {} for agent '{}' at {}", id, agent_id, execute_at);
        send(
            &self.command_tx,
            HostCommand::Schedule {
                id: id.clone(),
                agent_id: agent_id.to_string(),
                task: task.to_string(),
                execute_at,
            },
        )?;

        Ok(ToolResult::success(format!(
            "Scheduled task [{}] for {} at {}",
            id,
            agent_id,
            execute_at.to_rfc3339()
        ))
        .with_data(serde_json::json!({ "taskId": id })))
    }
}

// ─── subscribe_event ────────────────────────────────────────────────

pub struct SubscribeEventTool {
    command_tx: mpsc::Sender<HostCommand>,
}

impl SubscribeEventTool {
    pub fn new(command_tx: mpsc::Sender<HostCommand>) -> Self {
        Self { command_tx }
    }
}

#[async_trait]
impl ToolHandler for SubscribeEventTool {
    fn name(&self) -> &str {
        "subscribe_event"
    }

    fn description(&self) -> &str {
        "Run a task on an agent whenever a matching event fires (e.g. 'release.published')."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "agentId": { "type": "string" },
                "eventPattern": {
                    "type": "string",
                    "description": "Event name or pattern to listen for."
                },
                "task": { "type": "string" }
            }),
            vec!["agentId", "eventPattern", "task"],
        )
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let agent_id = required_str(&args, "agentId")?;
        let event_pattern = required_str(&args, "eventPattern")?;
        let task = required_str(&args, "task")?;
        let id = command_id("sub");

        send(
            &self.command_tx,
            HostCommand::Subscribe {
                id: id.clone(),
                agent_id: agent_id.to_string(),
                event_pattern: event_pattern.to_string(),
                task: task.to_string(),
            },
        )?;

        Ok(ToolResult::success(format!(
            "Subscribed {} to '{}' [{}]",
            agent_id, event_pattern, id
        ))
        .with_data(serde_json::json!({ "subscriptionId": id })))
    }
}

// ─── send_notification ──────────────────────────────────────────────

pub struct SendNotificationTool {
    command_tx: mpsc::Sender<HostCommand>,
}

impl SendNotificationTool {
    pub fn new(command_tx: mpsc::Sender<HostCommand>) -> Self {
        Self { command_tx }
    }
}

#[async_trait]
impl ToolHandler for SendNotificationTool {
    fn name(&self) -> &str {
        "send_notification"
    }

    fn description(&self) -> &str {
        "Send a short notification to the user."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "title": { "type": "string" },
                "body": { "type": "string" }
            }),
            vec!["title", "body"],
        )
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let title = required_str(&args, "title")?;
        let body = required_str(&args, "body")?;
        send(
            &self.command_tx,
            HostCommand::Notify {
                title: title.to_string(),
                body: body.to_string(),
            },
        )?;
        Ok(ToolResult::success(format!("Notification sent: {}", title)))
    }
}

// ─── speak ──────────────────────────────────────────────────────────

pub struct SpeakTool {
    command_tx: mpsc::Sender<HostCommand>,
}

impl SpeakTool {
    pub fn new(command_tx: mpsc::Sender<HostCommand>) -> Self {
        Self { command_tx }
    }
}

#[async_trait]
impl ToolHandler for SpeakTool {
    fn name(&self) -> &str {
        "speak"
    }

    fn description(&self) -> &str {
        "Read text aloud to the user via text-to-speech."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "text": { "type": "string" },
                "voice": {
                    "type": "string",
                    "description": "Optional voice name."
                }
            }),
            vec!["text"],
        )
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let text = required_str(&args, "text")?;
        let voice = args.get("voice").and_then(|v| v.as_str()).map(str::to_string);
        send(
            &self.command_tx,
            HostCommand::Speak {
                text: text.to_string(),
                voice,
            },
        )?;
        Ok(ToolResult::success("Speech queued."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionContext;

    #[tokio::test]
    async fn test_request_approval_sends_command() {
        let (tx, mut rx) = mpsc::channel(4);
        let tool = RequestApprovalTool::new(tx);
        let ctx = ToolContext::new(ExecutionContext {
            trace_id: Some("t1".to_string()),
            ..Default::default()
        });

        let result = tool
            .call(
                serde_json::json!({"content": "Post the tour announcement", "type": "post"}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.message.starts_with("[APPROVAL REQUESTED]"));
        assert!(result.message.contains("Post the tour announcement"));

        match rx.recv().await.unwrap() {
            HostCommand::ApprovalRequested { kind, trace_id, .. } => {
                assert_eq!(kind, "post");
                assert_eq!(trace_id.as_deref(), Some("t1"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_schedule_rejects_past_and_garbage_times() {
        let (tx, mut rx) = mpsc::channel(4);
        let tool = ScheduleTaskTool::new(tx);
        let ctx = ToolContext::default();

        let result = tool
            .call(
                serde_json::json!({"agentId": "social", "task": "post", "executeAt": "tomorrow"}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(!result.success);

        let result = tool
            .call(
                serde_json::json!({"agentId": "social", "task": "post", "executeAt": "2001-01-01T00:00:00Z"}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_schedule_future_time() {
        let (tx, mut rx) = mpsc::channel(4);
        let tool = ScheduleTaskTool::new(tx);
        let when = (Utc::now() + chrono::Duration::hours(2)).to_rfc3339();
        let result = tool
            .call(
                serde_json::json!({"agentId": "social", "task": "post teaser", "executeAt": when}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert!(matches!(rx.recv().await, Some(HostCommand::Schedule { .. })));
    }

    #[tokio::test]
    async fn test_closed_host_channel_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let tool = SendNotificationTool::new(tx);
        let err = tool
            .call(
                serde_json::json!({"title": "Hi", "body": "there"}),
                &ToolContext::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Host is not accepting commands"));
    }

    #[tokio::test]
    async fn test_full_host_queue_fails_without_waiting() {
        let (tx, _rx) = mpsc::channel(1);
        let tool = SendNotificationTool::new(tx);
        let args = serde_json::json!({"title": "Hi", "body": "there"});
        tool.call(args.clone(), &ToolContext::default()).await.unwrap();

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            tool.call(args, &ToolContext::default()),
        )
        .await
        .expect("a full queue must not block the agent")
        .unwrap_err();
        assert!(err.to_string().contains("queue is full"));
    }

    #[test]
    fn test_host_command_serialization() {
        let cmd = HostCommand::Speak {
            text: "hello".to_string(),
            voice: None,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "speak");
    }
}
