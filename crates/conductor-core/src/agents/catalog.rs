//! Built-in agent roster

use super::profile::AgentProfile;
use crate::types::AgentCategory;

/// Every agent id the engine knows about, in roster order
pub const KNOWN_AGENT_IDS: &[&str] = &[
    "marketing",
    "legal",
    "finance",
    "producer",
    "music",
    "director",
    "screenwriter",
    "video",
    "social",
    "publicist",
    "road",
    "publishing",
    "licensing",
    "brand",
    "devops",
    "security",
    "merchandise",
    "generalist",
];

/// Alternate spellings models use, mapped to their canonical id
pub const AGENT_ALIASES: &[(&str, &str)] = &[("road-manager", "road")];

pub const DEFAULT_AGENT_ID: &str = "generalist";

/// Resolve an alias to its canonical id; other ids pass through unchanged
pub fn canonical_agent_id(id: &str) -> &str {
    AGENT_ALIASES
        .iter()
        .find(|(alias, _)| *alias == id)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(id)
}

pub fn is_known_agent(id: &str) -> bool {
    KNOWN_AGENT_IDS.contains(&canonical_agent_id(id))
}

const GENERALIST_PROMPT: &str = "You are Agent Zero, the generalist of a creative studio's agent team. \
You handle general questions, multi-step reasoning and anything no specialist owns. \
Break large problems down, delegate to specialists when their expertise matters, and \
verify your work before answering.";

fn specialist(
    id: &str,
    name: &str,
    description: &str,
    category: AgentCategory,
    tools: &[&str],
) -> AgentProfile {
    AgentProfile::new(id, name)
        .with_description(description)
        .with_category(category)
        .with_system_prompt(format!(
            "You are the {} for an independent music and media studio. {} \
Stay within your specialty and hand anything else to the right colleague.",
            name, description
        ))
        .with_tools(tools)
}

/// Profiles for the whole built-in roster
pub fn builtin_profiles() -> Vec<AgentProfile> {
    use AgentCategory::{Department, Manager, Specialist};
    vec![
        AgentProfile::new("generalist", "Agent Zero")
            .with_description("General assistance, complex reasoning, fallback.")
            .with_system_prompt(GENERALIST_PROMPT)
            .autonomous(),
        specialist(
            "marketing",
            "Marketing Director",
            "Plans campaigns, release rollouts and audience growth.",
            Department,
            &["schedule_task"],
        ),
        specialist(
            "legal",
            "Legal Counsel",
            "Reviews contracts, rights and compliance questions.",
            Department,
            &["request_approval"],
        ),
        specialist(
            "finance",
            "Finance Manager",
            "Budgets, royalties, forecasts and expense tracking.",
            Department,
            &[],
        ),
        specialist(
            "producer",
            "Executive Producer",
            "Coordinates projects, timelines and the team's priorities.",
            Manager,
            &["delegate_task", "consult_experts"],
        ),
        specialist(
            "music",
            "Music Supervisor",
            "Composition, arrangement, mixing and audio direction.",
            Specialist,
            &[],
        ),
        specialist(
            "director",
            "Creative Director",
            "Visual identity, art direction and creative briefs.",
            Manager,
            &["verify_output"],
        ),
        specialist(
            "screenwriter",
            "Screenwriter",
            "Scripts, treatments and story structure.",
            Specialist,
            &[],
        ),
        specialist(
            "video",
            "Video Producer",
            "Music videos, edits and shot lists.",
            Specialist,
            &[],
        ),
        specialist(
            "social",
            "Social Media Manager",
            "Posts, content calendars and community engagement.",
            Specialist,
            &["schedule_task", "request_approval"],
        ),
        specialist(
            "publicist",
            "Publicist",
            "Press releases, media outreach and interviews.",
            Specialist,
            &["request_approval"],
        ),
        specialist(
            "road",
            "Road Manager",
            "Tour routing, logistics, travel and advancing shows.",
            Specialist,
            &["schedule_task"],
        ),
        specialist(
            "publishing",
            "Publishing Administrator",
            "Song registrations, splits and publishing royalties.",
            Department,
            &[],
        ),
        specialist(
            "licensing",
            "Licensing Manager",
            "Sync deals, clearances and sample licensing.",
            Department,
            &[],
        ),
        specialist(
            "brand",
            "Brand Manager",
            "Brand guidelines, partnerships and consistency of voice.",
            Specialist,
            &["verify_output"],
        ),
        specialist(
            "devops",
            "DevOps Engineer",
            "Deployments, infrastructure and site reliability.",
            Specialist,
            &["send_notification"],
        ),
        specialist(
            "security",
            "Security Officer",
            "Account security, access reviews and incident response.",
            Specialist,
            &["send_notification"],
        ),
        AgentProfile::new("merchandise", "Merchandise Specialist")
            .with_description(
                "AI-powered merchandise creation expert. Handles product design, mockup \
generation, video production, and manufacturing coordination.",
            )
            .with_system_prompt(
                "You are the Merchandise Specialist. You design products, describe mockups, \
plan promo videos for merch drops and coordinate manufacturing.",
            )
            .with_tools(&["verify_output", "request_approval"]),
    ]
}
