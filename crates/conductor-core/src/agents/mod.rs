//! Agent roster: profiles, the built-in catalog and the registry

pub mod catalog;
pub mod profile;
pub mod registry;

pub use catalog::{AGENT_ALIASES, DEFAULT_AGENT_ID, KNOWN_AGENT_IDS, builtin_profiles};
pub use profile::{AgentOverride, AgentProfile};
pub use registry::{AgentLoader, AgentRegistry};
