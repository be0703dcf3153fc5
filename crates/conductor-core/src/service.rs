//! Service façade: context resolution, routing and execution for one message
//!
//! [`AgentService`] is the only writer of [`Session`] state. Each call to
//! [`AgentService::send_message`] appends the user message, resolves an
//! [`ExecutionContext`], routes (unless an agent is forced), executes and
//! appends the reply. Executor errors never reach the caller as errors.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use lru::LruCache;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentLoopConfig;
use crate::agents::catalog::{AGENT_ALIASES, builtin_profiles};
use crate::agents::profile::AgentProfile;
use crate::agents::registry::AgentRegistry;
use crate::context::{ContextResolver, Session, SnapshotResolver};
use crate::error::ConductorError;
use crate::executor::{ExecuteOptions, Executor, ExecutorConfig};
use crate::provider::ModelProvider;
use crate::router::{Router, RouterConfig};
use crate::tools::ToolRegistry;
use crate::tools::critique::VerifyOutputTool;
use crate::tools::delegate::{ConsultExpertsTool, DelegateTaskTool};
use crate::tools::host::{
    HostCommand, RequestApprovalTool, ScheduleTaskTool, SendNotificationTool, SpeakTool,
    SubscribeEventTool,
};
use crate::tools::memory::{MemoryStore, RecallMemoriesTool, SaveMemoryTool};
use crate::trace::TraceRecorder;
use crate::types::{AgentResponse, Attachment, ChatMessage, ExecutionContext, Progress};

/// Options for one `send_message` call
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub attachments: Vec<Attachment>,
    /// Skip routing and run this agent
    pub forced_agent_id: Option<String>,
    pub progress: Progress,
    pub cancel: CancellationToken,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.forced_agent_id = Some(agent_id.into());
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

/// What the user sees for one message
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub agent_id: String,
    pub text: String,
    pub trace_id: Option<String>,
}

/// Removes the conversation from the in-flight set when dropped
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    conversation_id: String,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, conversation_id: &str) -> Result<Self> {
        let mut active = set.lock().unwrap_or_else(|poisoned| {
            warn!("In-flight set mutex was poisoned, recovering");
            poisoned.into_inner()
        });
        if !active.insert(conversation_id.to_string()) {
            return Err(ConductorError::Busy(conversation_id.to_string()).into());
        }
        Ok(Self {
            set,
            conversation_id: conversation_id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut active = self
            .set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.conversation_id);
    }
}

/// Conversations kept in memory before the least recently used is dropped
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

/// Top-level entry point
pub struct AgentService {
    router: Router,
    executor: Executor,
    resolver: Arc<dyn ContextResolver>,
    sessions: AsyncMutex<LruCache<String, Session>>,
    in_flight: Mutex<HashSet<String>>,
}

impl AgentService {
    pub fn new(router: Router, executor: Executor, resolver: Arc<dyn ContextResolver>) -> Self {
        Self {
            router,
            executor,
            resolver,
            sessions: AsyncMutex::new(LruCache::new(session_capacity(DEFAULT_MAX_SESSIONS))),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Cap the number of conversations held in memory
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.sessions = AsyncMutex::new(LruCache::new(session_capacity(max_sessions)));
        self
    }

    /// Builder wiring the built-in roster and shared tools around `provider`
    pub fn builder(provider: Arc<dyn ModelProvider>) -> ServiceBuilder {
        ServiceBuilder::new(provider)
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Seed or replace a conversation's session
    pub async fn register_session(&self, session: Session) {
        let id = session.conversation_id.clone();
        let mut sessions = self.sessions.lock().await;
        if let Some((evicted, _)) = sessions.push(id.clone(), session)
            && evicted != id
        {
            debug!("Evicted session {}", evicted);
        }
    }

    pub async fn session(&self, conversation_id: &str) -> Option<Session> {
        self.sessions.lock().await.peek(conversation_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Handle one user message.
    ///
    /// Returns `Err` only for [`ConductorError::Busy`]; every other failure
    /// becomes reply text.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<Reply> {
        let _in_flight = InFlight::acquire(&self.in_flight, conversation_id)?;

        let session = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_or_insert_mut(conversation_id.to_string(), || Session::new(conversation_id));
            session.push(ChatMessage::user(text));
            session.clone()
        };

        let context = match self.resolver.resolve(&session, text).await {
            Ok(context) => context,
            Err(e) => {
                warn!("Context resolution failed for {}: {}", conversation_id, e);
                session.snapshot(10)
            }
        };
        let context = context.with_attachments(options.attachments.clone());

        let agent_id = match &options.forced_agent_id {
            Some(forced) => {
                debug!("Routing skipped, forced agent '{}'", forced);
                forced.clone()
            }
            None => {
                self.router
                    .route_with_cancel(&context, text, &options.cancel)
                    .await
            }
        };

        let execute_options = ExecuteOptions::new()
            .with_progress(options.progress)
            .with_cancel(options.cancel)
            .with_attachments(options.attachments);
        let reply = match self
            .executor
            .execute(&agent_id, text, context, execute_options)
            .await
        {
            Ok(response) => Reply {
                agent_id: agent_id.clone(),
                text: response.text,
                trace_id: response.trace_id,
            },
            Err(e) => {
                warn!("Execution failed for conversation {}: {}", conversation_id, e);
                Reply {
                    agent_id: agent_id.clone(),
                    text: format!("Error: {}", e),
                    trace_id: None,
                }
            }
        };

        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(conversation_id) {
            Some(session) => session.push(ChatMessage::model(reply.text.clone())),
            None => debug!("Session {} evicted before the reply landed", conversation_id),
        }
        info!(
            "Conversation {} answered by '{}' ({} chars)",
            conversation_id,
            reply.agent_id,
            reply.text.len()
        );
        Ok(reply)
    }

    /// Run an agent directly, outside any conversation.
    ///
    /// Not subject to the single-flight guard. A parent context makes this a
    /// nested run one level deeper in the parent's swarm.
    pub async fn run_agent(
        &self,
        agent_id: &str,
        task: &str,
        parent_context: Option<ExecutionContext>,
        parent_trace_id: Option<String>,
    ) -> Result<AgentResponse> {
        let context = parent_context
            .map(|ctx| ctx.delegated())
            .unwrap_or_default();
        self.executor
            .execute(
                agent_id,
                task,
                context,
                ExecuteOptions::new().with_parent(parent_trace_id),
            )
            .await
    }
}

/// Assembles an [`AgentService`] with the shared tool set
pub struct ServiceBuilder {
    provider: Arc<dyn ModelProvider>,
    profiles: Vec<AgentProfile>,
    traces: TraceRecorder,
    resolver: Option<Arc<dyn ContextResolver>>,
    memory: Arc<MemoryStore>,
    host: Option<mpsc::Sender<HostCommand>>,
    router_config: RouterConfig,
    executor_config: ExecutorConfig,
    loop_config: AgentLoopConfig,
    max_sessions: usize,
}

fn session_capacity(max_sessions: usize) -> NonZeroUsize {
    NonZeroUsize::new(max_sessions).unwrap_or(NonZeroUsize::MIN)
}

impl ServiceBuilder {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            profiles: builtin_profiles(),
            traces: TraceRecorder::disabled(),
            resolver: None,
            memory: Arc::new(MemoryStore::new()),
            host: None,
            router_config: RouterConfig::default(),
            executor_config: ExecutorConfig::default(),
            loop_config: AgentLoopConfig::default(),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    /// Replace the roster
    pub fn with_profiles(mut self, profiles: Vec<AgentProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_traces(mut self, traces: TraceRecorder) -> Self {
        self.traces = traces;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ContextResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = memory;
        self
    }

    /// Channel for approval, scheduling and notification requests.
    /// Without one, host tools report that the host is unavailable.
    pub fn with_host(mut self, host: mpsc::Sender<HostCommand>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_router_config(mut self, config: RouterConfig) -> Self {
        self.router_config = config;
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    pub fn with_loop_config(mut self, config: AgentLoopConfig) -> Self {
        self.loop_config = config;
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    fn shared_tools(&self, valid_ids: Vec<String>) -> ToolRegistry {
        let host = match &self.host {
            Some(tx) => tx.clone(),
            None => mpsc::channel(1).0,
        };

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DelegateTaskTool::new(valid_ids.clone())));
        registry.register(Arc::new(ConsultExpertsTool::new(valid_ids)));
        registry.register(Arc::new(SaveMemoryTool::new(self.memory.clone())));
        registry.register(Arc::new(RecallMemoriesTool::new(self.memory.clone())));
        registry.register(Arc::new(VerifyOutputTool::new(self.provider.clone())));
        registry.register(Arc::new(RequestApprovalTool::new(host.clone())));
        registry.register(Arc::new(ScheduleTaskTool::new(host.clone())));
        registry.register(Arc::new(SubscribeEventTool::new(host.clone())));
        registry.register(Arc::new(SendNotificationTool::new(host.clone())));
        registry.register(Arc::new(SpeakTool::new(host)));
        registry
    }

    pub fn build(self) -> AgentService {
        let valid_ids: Vec<String> = self
            .profiles
            .iter()
            .map(|p| p.id.clone())
            .chain(AGENT_ALIASES.iter().map(|(alias, _)| alias.to_string()))
            .collect();
        let shared = Arc::new(self.shared_tools(valid_ids));
        info!("Registered {} shared tools", shared.len());

        let mut agents = AgentRegistry::from_profiles(
            self.profiles,
            self.provider.clone(),
            shared,
            self.loop_config,
        );
        if !agents.contains(&self.executor_config.default_agent) {
            warn!(
                "Default agent '{}' is not in the roster",
                self.executor_config.default_agent
            );
        }
        agents.set_default_agent(&self.executor_config.default_agent);
        let agents = Arc::new(agents);

        let router = Router::new(self.provider, agents.clone(), self.traces.clone())
            .with_config(self.router_config);
        let executor = Executor::with_config(agents, self.traces, self.executor_config);
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(SnapshotResolver::new().with_memory(self.memory)));
        AgentService::new(router, executor, resolver).with_max_sessions(self.max_sessions)
    }
}
