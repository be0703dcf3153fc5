//! End-to-end behaviour of the service façade against a scripted model

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use conductor_core::trace::{NewTrace, TraceStep};
use conductor_core::{
    AgentService, ConductorError, GenerateRequest, InMemoryTraceStore, ModelProvider,
    ModelResponse, SendOptions, TokenUsage, TraceNode, TracePersistence, TraceRecorder,
    TraceStatus,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

const DISPATCHER_MARKER: &str = "You are the dispatcher";

/// Replays queued responses, then repeats `fallback` (if any)
struct MockModel {
    turns: Mutex<VecDeque<ModelResponse>>,
    fallback: Option<ModelResponse>,
    delay: Option<Duration>,
    routing_calls: AtomicUsize,
    calls: AtomicUsize,
}

impl MockModel {
    fn new(turns: Vec<ModelResponse>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            fallback: None,
            delay: None,
            routing_calls: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn repeating(response: ModelResponse) -> Self {
        Self {
            fallback: Some(response),
            ..Self::new(vec![])
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ModelProvider for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<ModelResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.prompt.starts_with(DISPATCHER_MARKER) {
            self.routing_calls.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.turns.lock().unwrap().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| anyhow::anyhow!("mock model has no more turns"))
    }
}

fn route(agent: &str, confidence: f64) -> ModelResponse {
    ModelResponse::text(
        json!({ "targetAgentId": agent, "confidence": confidence, "reasoning": "fits" })
            .to_string(),
    )
}

fn build(model: MockModel) -> (AgentService, Arc<MockModel>, Arc<InMemoryTraceStore>) {
    let model = Arc::new(model);
    let store = Arc::new(InMemoryTraceStore::new());
    let service = AgentService::builder(model.clone())
        .with_traces(TraceRecorder::new(store.clone()))
        .build();
    (service, model, store)
}

fn non_router(nodes: Vec<TraceNode>) -> Vec<TraceNode> {
    nodes.into_iter().filter(|n| n.agent_id != "router").collect()
}

#[tokio::test]
async fn confident_routing_reaches_specialist() {
    let (service, _, _) = build(MockModel::new(vec![
        route("legal", 0.95),
        ModelResponse::text("Contract drafted."),
    ]));
    let reply = service
        .send_message("c1", "Draft a publishing contract", SendOptions::new())
        .await
        .unwrap();
    assert_eq!(reply.agent_id, "legal");
    assert_eq!(reply.text, "Contract drafted.");
}

#[tokio::test]
async fn low_confidence_routing_falls_back() {
    let (service, _, store) = build(MockModel::new(vec![
        route("legal", 0.5),
        ModelResponse::text("Happy to help."),
    ]));
    let reply = service
        .send_message("c1", "Draft a publishing contract", SendOptions::new())
        .await
        .unwrap();
    assert_eq!(reply.agent_id, "generalist");

    let router = store
        .all()
        .await
        .into_iter()
        .find(|n| n.agent_id == "router")
        .unwrap();
    let step = &router.steps[0].content;
    assert_eq!(step["proposedAgent"], "legal");
    assert_eq!(step["selectedAgent"], "generalist");
    assert_eq!(step["overridden"], true);
}

#[tokio::test]
async fn delegation_stays_in_one_swarm() {
    let (service, _, store) = build(MockModel::new(vec![
        ModelResponse::call(
            "delegate_task",
            json!({ "targetAgentId": "legal", "task": "Review the split sheet" }),
        ),
        ModelResponse::text("Split sheet looks fine."),
    ]));
    let reply = service
        .send_message("c1", "Plan the release", SendOptions::new().with_agent("producer"))
        .await
        .unwrap();
    assert!(reply.text.starts_with("[Tool: delegate_task] Output:"));
    assert!(reply.text.contains("Split sheet looks fine."));

    let nodes = non_router(store.all().await);
    assert_eq!(nodes.len(), 2);
    let (root, child) = (&nodes[0], &nodes[1]);
    assert_eq!(root.agent_id, "producer");
    assert_eq!(root.swarm_id, root.id);
    assert_eq!(child.agent_id, "legal");
    assert_eq!(child.swarm_id, root.id);
    assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
    assert_eq!(child.metadata["depth"], 1);
    assert!(nodes.iter().all(|n| n.status == TraceStatus::Completed));
}

#[tokio::test]
async fn consultation_with_unknown_agent_reports_one_error() {
    let (service, model, _) = build(MockModel::new(vec![
        ModelResponse::call(
            "consult_experts",
            json!({ "consultations": [
                { "targetAgentId": "legal", "task": "Check the clause" },
                { "targetAgentId": "wizard", "task": "Cast a spell" }
            ]}),
        ),
        ModelResponse::text("Clause is enforceable."),
    ]));
    let response = service
        .run_agent("producer", "Gather opinions", None, None)
        .await
        .unwrap();

    let results = response.data.unwrap()["data"]["results"].clone();
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 2);
    let errors: Vec<&Value> = results.iter().filter(|r| r["success"] == false).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["targetAgentId"], "wizard");
    assert_eq!(results[0]["response"], "Clause is enforceable.");
    assert_eq!(model.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn self_delegation_terminates_with_every_trace_finalized() {
    let (service, _, store) = build(MockModel::repeating(ModelResponse::call(
        "delegate_task",
        json!({ "targetAgentId": "producer", "task": "Do it again" }),
    )));
    let response = service
        .run_agent("producer", "Do it", None, None)
        .await
        .unwrap();
    assert!(response.text.contains("Delegation failed"));

    let nodes = store.all().await;
    assert_eq!(nodes.len(), 7);
    assert!(nodes.iter().all(|n| n.status != TraceStatus::Pending));
    let failed: Vec<&TraceNode> = nodes
        .iter()
        .filter(|n| n.status == TraceStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .error
        .as_deref()
        .unwrap()
        .contains("Maximum delegation depth"));
    assert!(nodes.iter().all(|n| n.swarm_id == nodes[0].id));
}

#[tokio::test]
async fn second_message_while_busy_is_rejected() {
    let (service, model, _) = build(
        MockModel::new(vec![route("legal", 0.95), ModelResponse::text("done")])
            .with_delay(Duration::from_millis(50)),
    );
    let service = Arc::new(service);

    let first = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .send_message("c1", "Draft a publishing contract", SendOptions::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = service
        .send_message("c1", "Are you there?", SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConductorError>(),
        Some(ConductorError::Busy(_))
    ));

    let reply = first.await.unwrap().unwrap();
    assert_eq!(reply.text, "done");
    assert_eq!(model.routing_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancellation_fails_the_trace() {
    let (service, _, store) = build(
        MockModel::new(vec![ModelResponse::text("too late")])
            .with_delay(Duration::from_secs(30)),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let reply = service
        .send_message(
            "c1",
            "Mix the album",
            SendOptions::new().with_agent("music").with_cancel(cancel),
        )
        .await
        .unwrap();
    assert_eq!(reply.text, "Error: Operation cancelled by user.");

    let nodes = store.all().await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].status, TraceStatus::Failed);
}

/// Backend that refuses every write
struct OfflineStore;

#[async_trait]
impl TracePersistence for OfflineStore {
    async fn start_trace(&self, _trace: NewTrace) -> Result<String> {
        anyhow::bail!("connection refused")
    }
    async fn add_step(&self, _trace_id: &str, _step: TraceStep) -> Result<()> {
        anyhow::bail!("connection refused")
    }
    async fn complete_trace(&self, _trace_id: &str, _output: Option<Value>, _usage: TokenUsage) -> Result<()> {
        anyhow::bail!("connection refused")
    }
    async fn fail_trace(&self, _trace_id: &str, _error: &str) -> Result<()> {
        anyhow::bail!("connection refused")
    }
    async fn get_trace(&self, _trace_id: &str) -> Result<Option<TraceNode>> {
        Ok(None)
    }
    async fn list_swarm(&self, _swarm_id: &str) -> Result<Vec<TraceNode>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn offline_trace_backend_never_fails_a_request() {
    let model = Arc::new(MockModel::new(vec![
        route("finance", 0.9),
        ModelResponse::text("Budget approved."),
    ]));
    let service = AgentService::builder(model)
        .with_traces(TraceRecorder::new(Arc::new(OfflineStore)))
        .build();
    let reply = service
        .send_message("c1", "Approve the tour budget", SendOptions::new())
        .await
        .unwrap();
    assert_eq!(reply.agent_id, "finance");
    assert_eq!(reply.text, "Budget approved.");
    assert!(TraceRecorder::is_local(reply.trace_id.as_deref().unwrap()));
}
