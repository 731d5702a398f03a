//! Explicit validators for user-supplied entity fields
//!
//! Validation runs inside the factories and service entry points that
//! materialize records, returning typed errors; nothing is enforced through
//! attribute magic at a distance.

use crate::models::{AgentType, Capability, ModelConfig, RegisterAgent};
use crate::{OrchestratorError, Result};

/// Session titles that say nothing about the work are rejected.
static BANNED_SESSION_TITLES: &[&str] = &[
    "test",
    "testing",
    "session",
    "new session",
    "task",
    "todo",
    "untitled",
    "my session",
    "work",
    "stuff",
    "misc",
    "temp",
    "tmp",
    "foo",
    "bar",
];

/// Task titles must lead with one of these action verbs.
static TASK_ACTION_VERBS: &[&str] = &[
    "implement",
    "add",
    "create",
    "build",
    "fix",
    "refactor",
    "design",
    "test",
    "review",
    "update",
    "remove",
    "optimize",
    "integrate",
    "document",
    "investigate",
    "migrate",
    "deploy",
    "analyze",
    "configure",
    "validate",
    "audit",
    "extend",
];

/// Generic agent names carry no routing signal and are rejected.
static BANNED_AGENT_NAMES: &[&str] = &[
    "agent", "bot", "worker", "assistant", "helper", "ai", "model", "test", "default",
];

pub const MAX_TITLE_LENGTH: usize = 200;

/// Validate a session title: non-empty, bounded, and not a generic phrase.
pub fn validate_session_title(title: &str) -> Result<()> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::Validation(
            "Session title cannot be empty".to_string(),
        ));
    }
    if trimmed.len() > MAX_TITLE_LENGTH {
        return Err(OrchestratorError::Validation(format!(
            "Session title exceeds {MAX_TITLE_LENGTH} characters"
        )));
    }
    let lowered = trimmed.to_lowercase();
    if BANNED_SESSION_TITLES.contains(&lowered.as_str()) {
        return Err(OrchestratorError::Validation(format!(
            "Session title '{trimmed}' is too generic"
        )));
    }
    Ok(())
}

/// Validate a task title: must begin with a known action verb.
pub fn validate_task_title(title: &str) -> Result<()> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::Validation(
            "Task title cannot be empty".to_string(),
        ));
    }
    if trimmed.len() > MAX_TITLE_LENGTH {
        return Err(OrchestratorError::Validation(format!(
            "Task title exceeds {MAX_TITLE_LENGTH} characters"
        )));
    }
    let first_word = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    if !TASK_ACTION_VERBS.contains(&first_word.as_str()) {
        return Err(OrchestratorError::Validation(format!(
            "Task title must begin with an action verb, got '{first_word}'"
        )));
    }
    Ok(())
}

/// Validate an agent name: descriptive, capitalized, not a generic label.
pub fn validate_agent_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.len() < 3 {
        return Err(OrchestratorError::Validation(
            "Agent name must be at least 3 characters".to_string(),
        ));
    }
    if !trimmed.chars().next().is_some_and(|c| c.is_uppercase()) {
        return Err(OrchestratorError::Validation(
            "Agent name must be capitalized".to_string(),
        ));
    }
    let lowered = trimmed.to_lowercase();
    if BANNED_AGENT_NAMES.contains(&lowered.as_str()) {
        return Err(OrchestratorError::Validation(format!(
            "Agent name '{trimmed}' is too generic"
        )));
    }
    Ok(())
}

/// Primary capabilities must align with the declared agent type.
pub fn validate_capability_alignment(
    agent_type: AgentType,
    primary: &[Capability],
) -> Result<()> {
    if primary.is_empty() {
        return Err(OrchestratorError::Validation(
            "At least one primary capability is required".to_string(),
        ));
    }
    let allowed = agent_type.allowed_primary_capabilities();
    for capability in primary {
        if !allowed.contains(capability) {
            return Err(OrchestratorError::Validation(format!(
                "Capability {capability:?} is not allowed as primary for {agent_type:?}"
            )));
        }
    }
    Ok(())
}

/// Model config: `provider/model` shape, temperature in [0, 2], a real
/// system prompt template.
pub fn validate_model_config(config: &ModelConfig) -> Result<()> {
    let mut parts = config.provider_model.splitn(2, '/');
    let provider = parts.next().unwrap_or_default();
    let model = parts.next().unwrap_or_default();
    if provider.is_empty() || model.is_empty() {
        return Err(OrchestratorError::Validation(format!(
            "Model config '{}' must have the shape provider/model",
            config.provider_model
        )));
    }
    if !(0.0..=2.0).contains(&config.temperature) {
        return Err(OrchestratorError::Validation(format!(
            "Temperature {} is outside [0, 2]",
            config.temperature
        )));
    }
    if config.max_tokens == 0 {
        return Err(OrchestratorError::Validation(
            "max_tokens must be positive".to_string(),
        ));
    }
    if config.system_prompt_template.len() < crate::constants::MIN_SYSTEM_PROMPT_LEN {
        return Err(OrchestratorError::Validation(format!(
            "System prompt template must be at least {} characters",
            crate::constants::MIN_SYSTEM_PROMPT_LEN
        )));
    }
    Ok(())
}

/// Session duration bound: [60, 86400] seconds.
pub fn validate_session_duration(seconds: u64) -> Result<()> {
    if !(crate::constants::MIN_SESSION_DURATION_SECS..=crate::constants::MAX_SESSION_DURATION_SECS)
        .contains(&seconds)
    {
        return Err(OrchestratorError::Validation(format!(
            "max_duration_seconds {seconds} is outside [{}, {}]",
            crate::constants::MIN_SESSION_DURATION_SECS,
            crate::constants::MAX_SESSION_DURATION_SECS
        )));
    }
    Ok(())
}

/// Full registration validation: name, capabilities, model config, and the
/// external-agent fields as a unit.
pub fn validate_agent_registration(request: &RegisterAgent) -> Result<()> {
    validate_agent_name(&request.name)?;
    validate_capability_alignment(request.agent_type, &request.primary_capabilities)?;
    validate_model_config(&request.model_config)?;

    if request.capacity <= 0.0 {
        return Err(OrchestratorError::Validation(
            "Agent capacity must be positive".to_string(),
        ));
    }

    if request.is_external {
        let endpoint = request.endpoint.as_deref().ok_or_else(|| {
            OrchestratorError::Validation("External agents require an endpoint".to_string())
        })?;
        let parsed = url::Url::parse(endpoint).map_err(|e| {
            OrchestratorError::Validation(format!("Invalid agent endpoint '{endpoint}': {e}"))
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(OrchestratorError::Validation(format!(
                "Agent endpoint scheme '{}' is not http(s)",
                parsed.scheme()
            )));
        }
        if request
            .auth_token
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .is_empty()
        {
            return Err(OrchestratorError::Validation(
                "External agents require an auth token".to_string(),
            ));
        }
    }

    Ok(())
}
