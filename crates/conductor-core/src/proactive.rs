//! Host-side runner for scheduled and event-triggered agent tasks
//!
//! Shared tools only emit [`HostCommand`]s. A host that wants
//! `schedule_task` and `subscribe_event` to actually do something feeds
//! those commands to a [`ProactiveRunner`], which keeps them in memory and
//! runs the task through [`AgentService::run_agent`] when the time comes or
//! a matching event is emitted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::service::AgentService;
use crate::tools::host::HostCommand;
use crate::types::AgentResponse;

/// Why a proactive task ran
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Schedule { execute_at: DateTime<Utc> },
    Event { name: String, data: Value },
}

/// Standing instruction to run a task whenever a matching event fires
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub agent_id: String,
    pub event_pattern: String,
    pub task: String,
}

/// Result of one proactive run, delivered on the outcome channel
#[derive(Debug)]
pub struct TaskOutcome {
    pub task_id: String,
    pub agent_id: String,
    pub trigger: Trigger,
    pub result: std::result::Result<AgentResponse, String>,
}

/// `release.published` matches itself, `release.*` and `*`
fn pattern_matches(pattern: &str, event: &str) -> bool {
    if pattern == "*" || pattern == event {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => false,
    }
}

fn proactive_prompt(task: &str, trigger: &Trigger) -> String {
    match trigger {
        Trigger::Schedule { .. } => format!("[PROACTIVE TRIGGER] {}", task),
        Trigger::Event { name, data } => format!(
            "[PROACTIVE TRIGGER] {}\nSystem Event Context ({}): {}",
            task, name, data
        ),
    }
}

struct RunnerInner {
    service: Arc<AgentService>,
    /// Pending one-shot tasks (task_id -> CancellationToken)
    scheduled: RwLock<HashMap<String, CancellationToken>>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    shutdown: CancellationToken,
    outcome_tx: mpsc::UnboundedSender<TaskOutcome>,
}

/// Keeps scheduled tasks and event subscriptions alive for a service
#[derive(Clone)]
pub struct ProactiveRunner {
    inner: Arc<RunnerInner>,
}

impl ProactiveRunner {
    pub fn new(service: Arc<AgentService>) -> (Self, mpsc::UnboundedReceiver<TaskOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let runner = Self {
            inner: Arc::new(RunnerInner {
                service,
                scheduled: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                outcome_tx,
            }),
        };
        (runner, outcome_rx)
    }

    /// Take ownership of schedule and subscribe commands.
    ///
    /// Anything else is handed back for the host to deal with.
    pub async fn handle(&self, command: HostCommand) -> Option<HostCommand> {
        match command {
            HostCommand::Schedule {
                id,
                agent_id,
                task,
                execute_at,
            } => {
                self.schedule(id, agent_id, task, execute_at).await;
                None
            }
            HostCommand::Subscribe {
                id,
                agent_id,
                event_pattern,
                task,
            } => {
                self.subscribe(Subscription {
                    id,
                    agent_id,
                    event_pattern,
                    task,
                })
                .await;
                None
            }
            other => Some(other),
        }
    }

    /// Run `task` on `agent_id` at `execute_at`; past times run immediately
    pub async fn schedule(
        &self,
        id: String,
        agent_id: String,
        task: String,
        execute_at: DateTime<Utc>,
    ) {
        let token = CancellationToken::new();
        {
            let mut scheduled = self.inner.scheduled.write().await;
            if scheduled.contains_key(&id) {
                warn!("Task {} is already scheduled", id);
                return;
            }
            scheduled.insert(id.clone(), token.clone());
        }

        let delay = (execute_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(0));
        info!("Task {} for agent '{}' scheduled in {:?}", id, agent_id, delay);
        let wake_time = Instant::now() + delay;

        let runner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Scheduled task {} cancelled", id);
                }
                _ = runner.inner.shutdown.cancelled() => {
                    debug!("Scheduled task {} dropped on shutdown", id);
                }
                _ = sleep_until(wake_time) => {
                    runner.inner.scheduled.write().await.remove(&id);
                    runner
                        .execute(id, agent_id, task, Trigger::Schedule { execute_at })
                        .await;
                }
            }
        });
    }

    pub async fn subscribe(&self, subscription: Subscription) {
        info!(
            "Agent '{}' subscribed to '{}' [{}]",
            subscription.agent_id, subscription.event_pattern, subscription.id
        );
        self.inner
            .subscriptions
            .write()
            .await
            .insert(subscription.id.clone(), subscription);
    }

    /// Fire an event; every matching subscription runs concurrently.
    ///
    /// Returns how many subscriptions were triggered.
    pub async fn emit(&self, event: &str, data: Value) -> usize {
        let matching: Vec<Subscription> = self
            .inner
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| pattern_matches(&s.event_pattern, event))
            .cloned()
            .collect();

        debug!("Event '{}' matched {} subscription(s)", event, matching.len());
        for subscription in &matching {
            let runner = self.clone();
            let trigger = Trigger::Event {
                name: event.to_string(),
                data: data.clone(),
            };
            let subscription = subscription.clone();
            tokio::spawn(async move {
                runner
                    .execute(subscription.id, subscription.agent_id, subscription.task, trigger)
                    .await;
            });
        }
        matching.len()
    }

    /// Cancel a scheduled task or remove a subscription
    pub async fn cancel(&self, id: &str) -> bool {
        if let Some(token) = self.inner.scheduled.write().await.remove(id) {
            token.cancel();
            return true;
        }
        self.inner.subscriptions.write().await.remove(id).is_some()
    }

    /// Scheduled tasks that have not fired yet
    pub async fn pending_count(&self) -> usize {
        self.inner.scheduled.read().await.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().await.len()
    }

    /// Drop every pending schedule
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.scheduled.write().await.clear();
    }

    async fn execute(&self, task_id: String, agent_id: String, task: String, trigger: Trigger) {
        info!("Triggering agent '{}' for task {}", agent_id, task_id);
        let prompt = proactive_prompt(&task, &trigger);
        let result = self
            .inner
            .service
            .run_agent(&agent_id, &prompt, None, None)
            .await
            .map_err(|e| {
                warn!("Proactive task {} failed: {:#}", task_id, e);
                e.to_string()
            });

        let outcome = TaskOutcome {
            task_id,
            agent_id,
            trigger,
            result,
        };
        if self.inner.outcome_tx.send(outcome).is_err() {
            debug!("No listener for proactive task outcomes");
        }
    }
}
