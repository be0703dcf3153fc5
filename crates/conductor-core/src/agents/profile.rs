//! Agent profile: identity, prompt and tool selection

use serde::{Deserialize, Serialize};

use crate::types::{AgentCategory, AgentDescriptor};

/// Declarative definition of an agent, loadable from config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: AgentCategory,
    #[serde(default)]
    pub system_prompt: String,
    /// Shared tools this agent leans on; listed first when the tool cap applies
    #[serde(default)]
    pub tools: Vec<String>,
    /// Run the streaming thought/tool/final_response loop instead of single-shot tool calling
    #[serde(default)]
    pub autonomous: bool,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            category: AgentCategory::Specialist,
            system_prompt: String::new(),
            tools: Vec::new(),
            autonomous: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: AgentCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn autonomous(mut self) -> Self {
        self.autonomous = true;
        self
    }

    pub fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            category: self.category,
            tool_names: self.tools.clone(),
        }
    }

    /// Apply the fields a config entry actually sets
    pub fn apply(&mut self, overrides: AgentOverride) {
        if let Some(name) = overrides.name {
            self.name = name;
        }
        if let Some(description) = overrides.description {
            self.description = description;
        }
        if let Some(category) = overrides.category {
            self.category = category;
        }
        if let Some(system_prompt) = overrides.system_prompt {
            self.system_prompt = system_prompt;
        }
        if let Some(tools) = overrides.tools {
            self.tools = tools;
        }
        if let Some(autonomous) = overrides.autonomous {
            self.autonomous = autonomous;
        }
    }
}

/// `[[agents]]` config entry.
///
/// Absent fields leave a built-in profile untouched; present ones replace it,
/// so `autonomous = false` or `category = "specialist"` can switch a built-in back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOverride {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<AgentCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomous: Option<bool>,
}

impl AgentOverride {
    /// New profile for an id the roster does not have yet; the name defaults to the id
    pub fn into_profile(self) -> AgentProfile {
        let mut profile = AgentProfile::new(self.id.clone(), self.id.clone());
        profile.apply(self);
        profile
    }
}
