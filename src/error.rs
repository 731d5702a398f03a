use thiserror::Error;
use uuid::Uuid;

/// Convenience type alias for Results with OrchestratorError
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Main error type for the orchestration control plane
///
/// Every variant carries a stable machine code (see [`OrchestratorError::code`])
/// and maps to a transport status at the presentation boundary
/// (see [`OrchestratorError::http_status`]). Local recovery happens only where
/// a policy is defined (stale-version retries, lock retries); everything else
/// propagates to the top-level boundary, which logs with a correlation id.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No tenant bound to the current execution context")]
    TenantRequired,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Stale version for {entity} {id}: expected {expected}, found {actual}")]
    StaleVersion {
        entity: &'static str,
        id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("Dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Timed out acquiring lock on {resource}")]
    LockTimeout { resource: String },

    #[error("Lock on {resource} is not owned by {owner}")]
    LockNotOwned { resource: String, owner: String },

    #[error("Deadlock detected while waiting for {resource}")]
    DeadlockDetected { resource: String },

    #[error("Coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Agent {agent_id} reservation contended, routing must restart")]
    AgentContended { agent_id: Uuid },

    #[error("No agent available for the requested capabilities")]
    NoAgentAvailable,

    #[error("Executor failed: {0}")]
    ExecutorFailed(String),

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("External agent call failed: {0}")]
    ExternalAgent(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Stable machine code carried alongside the human message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::TenantRequired => "TENANT_REQUIRED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::StaleVersion { .. } => "STALE_VERSION",
            Self::CycleDetected(_) => "CYCLE_DETECTED",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::LockNotOwned { .. } => "LOCK_NOT_OWNED",
            Self::DeadlockDetected { .. } => "DEADLOCK_DETECTED",
            Self::CoordinationUnavailable(_) => "COORDINATION_UNAVAILABLE",
            Self::AgentContended { .. } => "AGENT_CONTENDED",
            Self::NoAgentAvailable => "NO_AGENT_AVAILABLE",
            Self::ExecutorFailed(_) => "EXECUTOR_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Configuration(_) => "CONFIGURATION",
            Self::ExternalAgent(_) => "EXECUTOR_FAILED",
            Self::Serialization(_) => "INTERNAL",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Status code the presentation layer maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::TenantRequired | Self::Configuration(_) => 400,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::InvalidTransition { .. }
            | Self::StaleVersion { .. }
            | Self::CycleDetected(_)
            | Self::LockTimeout { .. }
            | Self::LockNotOwned { .. }
            | Self::DeadlockDetected { .. }
            | Self::AgentContended { .. }
            | Self::NoAgentAvailable => 409,
            Self::QuotaExceeded(_) => 429,
            Self::CoordinationUnavailable(_) => 503,
            Self::ExecutorFailed(_) | Self::ExternalAgent(_) => 502,
            Self::Timeout { .. } => 504,
            Self::Cancelled | Self::Serialization(_) | Self::Internal(_) => 500,
        }
    }

    /// Whether the operation that produced this error may be safely retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StaleVersion { .. }
                | Self::LockTimeout { .. }
                | Self::DeadlockDetected { .. }
                | Self::AgentContended { .. }
                | Self::Timeout { .. }
        )
    }
}
