//! Agent registry: lazy construction and default-agent fallback

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::catalog::{DEFAULT_AGENT_ID, canonical_agent_id};
use super::profile::AgentProfile;
use crate::agent::{Agent, AgentLoopConfig, SpecialistAgent};
use crate::autonomous::AutonomousAgent;
use crate::error::ConductorError;
use crate::provider::ModelProvider;
use crate::tools::ToolRegistry;
use crate::types::AgentDescriptor;

/// Builds an agent on first use
pub type AgentLoader =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Agent>>> + Send + Sync>;

struct AgentEntry {
    descriptor: AgentDescriptor,
    loader: Option<AgentLoader>,
    instance: OnceCell<Arc<dyn Agent>>,
}

impl AgentEntry {
    async fn load(&self) -> Result<Arc<dyn Agent>> {
        let agent = self
            .instance
            .get_or_try_init(|| async {
                let loader = self.loader.clone().ok_or_else(|| {
                    anyhow::anyhow!("Agent '{}' has no loader", self.descriptor.id)
                })?;
                debug!("Loading agent '{}'", self.descriptor.id);
                loader().await
            })
            .await?;
        Ok(Arc::clone(agent))
    }
}

/// Registered agents keyed by id
pub struct AgentRegistry {
    entries: HashMap<String, AgentEntry>,
    order: Vec<String>,
    default_agent_id: String,
}

impl AgentRegistry {
    pub fn new(default_agent_id: impl Into<String>) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            default_agent_id: default_agent_id.into(),
        }
    }

    fn insert(&mut self, entry: AgentEntry) {
        let id = entry.descriptor.id.clone();
        if self.entries.insert(id.clone(), entry).is_none() {
            self.order.push(id);
        }
    }

    /// Register an already constructed agent
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        let descriptor = agent.descriptor().clone();
        debug!("Registering agent '{}'", descriptor.id);
        self.insert(AgentEntry {
            descriptor,
            loader: None,
            instance: OnceCell::new_with(Some(agent)),
        });
    }

    /// Register metadata now and build the agent on first lookup
    pub fn register_lazy(&mut self, descriptor: AgentDescriptor, loader: AgentLoader) {
        debug!("Registering lazy agent '{}'", descriptor.id);
        self.insert(AgentEntry {
            descriptor,
            loader: Some(loader),
            instance: OnceCell::new(),
        });
    }

    /// Registry holding one agent per profile.
    ///
    /// Autonomous profiles get the JSON step loop, the rest the single-shot
    /// tool-calling loop. Nothing is built until first use.
    pub fn from_profiles(
        profiles: Vec<AgentProfile>,
        provider: Arc<dyn ModelProvider>,
        shared_tools: Arc<ToolRegistry>,
        config: AgentLoopConfig,
    ) -> Self {
        let mut registry = Self::new(DEFAULT_AGENT_ID);
        for profile in profiles {
            let descriptor = profile.descriptor();
            let provider = provider.clone();
            let shared_tools = shared_tools.clone();
            let config = config.clone();
            let profile = Arc::new(profile);
            let loader: AgentLoader = Arc::new(move || {
                let profile = profile.clone();
                let provider = provider.clone();
                let shared_tools = shared_tools.clone();
                let config = config.clone();
                async move {
                    let agent: Arc<dyn Agent> = if profile.autonomous {
                        Arc::new(
                            AutonomousAgent::new(&profile, provider, shared_tools)
                                .with_config(config),
                        )
                    } else {
                        Arc::new(
                            SpecialistAgent::new(&profile, provider, shared_tools)
                                .with_config(config),
                        )
                    };
                    Ok::<_, anyhow::Error>(agent)
                }
                .boxed()
            });
            registry.register_lazy(descriptor, loader);
        }
        info!("Agent registry ready with {} agents", registry.len());
        registry
    }

    /// Canonical registered id for `id`, following aliases
    pub fn canonical_id(&self, id: &str) -> Option<&str> {
        let canonical = canonical_agent_id(id);
        self.entries
            .get_key_value(canonical)
            .map(|(key, _)| key.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.canonical_id(id).is_some()
    }

    pub fn default_agent_id(&self) -> &str {
        &self.default_agent_id
    }

    pub fn set_default_agent(&mut self, id: &str) {
        self.default_agent_id = canonical_agent_id(id).to_string();
    }

    /// Look up and, if needed, build the agent registered under `id`
    pub async fn get(&self, id: &str) -> Result<Option<Arc<dyn Agent>>> {
        let Some(canonical) = self.canonical_id(id) else {
            return Ok(None);
        };
        match self.entries.get(canonical) {
            Some(entry) => entry.load().await.map(Some),
            None => Ok(None),
        }
    }

    /// Agent for `id`, falling back to the default agent when `id` is
    /// unknown or fails to load
    pub async fn resolve(&self, id: &str) -> Result<Arc<dyn Agent>> {
        self.resolve_with_fallback(id, &self.default_agent_id).await
    }

    pub async fn resolve_with_fallback(&self, id: &str, fallback: &str) -> Result<Arc<dyn Agent>> {
        match self.get(id).await {
            Ok(Some(agent)) => return Ok(agent),
            Ok(None) => warn!("Unknown agent '{}', falling back to '{}'", id, fallback),
            Err(e) => warn!(
                "Failed to load agent '{}', falling back to '{}': {}",
                id, fallback, e
            ),
        }

        if canonical_agent_id(id) != fallback {
            if let Some(agent) = self.get(fallback).await? {
                return Ok(agent);
            }
        }
        Err(ConductorError::UnknownAgent(id.to_string()).into())
    }

    /// Descriptors in registration order
    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
