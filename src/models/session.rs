use super::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Kind of work a session represents
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionType {
    Planning,
    Execution,
    Review,
    Debug,
    Integration,
}

/// Lifecycle states of a session
///
/// The allowed transitions between these states are owned by the lifecycle
/// module; nothing else may assign `Session::status` directly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    PartiallyCompleted,
    Failed,
    Timeout,
    Stopped,
    Cancelled,
    Orphaned,
    Degraded,
}

impl SessionStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::PartiallyCompleted
                | SessionStatus::Cancelled
                | SessionStatus::Orphaned
        )
    }

    /// States a session can be retried from, subject to the retry gate.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            SessionStatus::Failed | SessionStatus::Timeout | SessionStatus::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Queued => "QUEUED",
            SessionStatus::Running => "RUNNING",
            SessionStatus::Paused => "PAUSED",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::PartiallyCompleted => "PARTIALLY_COMPLETED",
            SessionStatus::Failed => "FAILED",
            SessionStatus::Timeout => "TIMEOUT",
            SessionStatus::Stopped => "STOPPED",
            SessionStatus::Cancelled => "CANCELLED",
            SessionStatus::Orphaned => "ORPHANED",
            SessionStatus::Degraded => "DEGRADED",
        }
    }
}

/// Execution metrics owned 1:1 by a session
///
/// `started_at` is set exactly once on the first RUNNING entry,
/// `completed_at` when the session reaches COMPLETED, `failed_at` when it
/// reaches FAILED. The checkpoint counter mirrors `session.checkpoints`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub total_duration_seconds: f64,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub tokens_used: u64,
    pub api_calls: u64,
    pub api_errors: u64,
    pub retry_count: u32,
    pub success_rate: f64,
    pub confidence: f64,
    pub code_quality: f64,
    pub checkpoint_count: u32,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub cost_estimate: f64,
}

/// An opaque snapshot of session progress enabling retry from a known point.
/// Sequences are strictly increasing; checkpoints are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: u64,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A long-lived unit of work containing tasks, metrics, and checkpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub title: String,
    pub initial_prompt: String,
    pub session_type: SessionType,
    pub priority: Priority,
    pub status: SessionStatus,
    pub status_updated_at: DateTime<Utc>,
    pub agent_config: HashMap<String, serde_json::Value>,
    pub model_config: String,
    pub max_duration_seconds: u64,
    pub max_retries: u32,
    pub metrics: SessionMetrics,
    pub checkpoints: Vec<Checkpoint>,
    /// Checkpoints beyond this count evict the oldest on insert.
    pub checkpoint_retention: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: u64,
}

/// Input for session creation; validated by the orchestrator before a
/// `Session` is materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSession {
    pub title: String,
    pub initial_prompt: String,
    pub session_type: SessionType,
    pub priority: Priority,
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub agent_config: HashMap<String, serde_json::Value>,
    #[serde(default = "CreateSession::default_model_config")]
    pub model_config: String,
    /// Unset requests fall back to the orchestrator's configured default.
    #[serde(default)]
    pub max_duration_seconds: Option<u64>,
    #[serde(default)]
    pub checkpoint_retention: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CreateSession {
    fn default_model_config() -> String {
        "anthropic/claude-sonnet".to_string()
    }

    pub fn new(
        title: impl Into<String>,
        initial_prompt: impl Into<String>,
        session_type: SessionType,
        priority: Priority,
    ) -> Self {
        Self {
            title: title.into(),
            initial_prompt: initial_prompt.into(),
            session_type,
            priority,
            parent_id: None,
            agent_config: HashMap::new(),
            model_config: Self::default_model_config(),
            max_duration_seconds: None,
            checkpoint_retention: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

impl Session {
    /// Materialize a new PENDING session. Input validation has already run;
    /// this only assembles the record.
    pub fn from_request(tenant_id: Uuid, request: CreateSession) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            parent_id: request.parent_id,
            title: request.title,
            initial_prompt: request.initial_prompt,
            session_type: request.session_type,
            priority: request.priority,
            status: SessionStatus::Pending,
            status_updated_at: now,
            agent_config: request.agent_config,
            model_config: request.model_config,
            max_duration_seconds: request
                .max_duration_seconds
                .unwrap_or(crate::constants::DEFAULT_SESSION_DURATION_SECS),
            max_retries: crate::constants::MAX_SESSION_RETRIES,
            metrics: SessionMetrics::default(),
            checkpoints: Vec::new(),
            checkpoint_retention: request
                .checkpoint_retention
                .unwrap_or(crate::constants::DEFAULT_CHECKPOINT_RETENTION),
            result: None,
            error: None,
            tags: request.tags,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 1,
        }
    }

    pub fn last_checkpoint_sequence(&self) -> u64 {
        self.checkpoints.last().map(|c| c.sequence).unwrap_or(0)
    }

    /// Elapsed wall-clock time since the session first entered RUNNING.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        match self.metrics.started_at {
            Some(started) => (now - started).num_milliseconds() as f64 / 1000.0,
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::PartiallyCompleted.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(SessionStatus::Orphaned.is_terminal());
        assert!(!SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
    }

    #[test]
    fn test_resumable_states() {
        assert!(SessionStatus::Failed.is_resumable());
        assert!(SessionStatus::Timeout.is_resumable());
        assert!(SessionStatus::Stopped.is_resumable());
        assert!(!SessionStatus::Paused.is_resumable());
    }

    #[test]
    fn test_from_request_initial_state() {
        let request = CreateSession::new(
            "Implement OAuth token refresh",
            "Add rotating refresh tokens",
            SessionType::Execution,
            Priority::High,
        );
        let session = Session::from_request(Uuid::new_v4(), request);

        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.version, 1);
        assert_eq!(session.metrics.checkpoint_count, 0);
        assert_eq!(
            session.checkpoint_retention,
            crate::constants::DEFAULT_CHECKPOINT_RETENTION
        );
        assert!(session.metrics.started_at.is_none());
        assert_eq!(session.last_checkpoint_sequence(), 0);
    }

    #[test]
    fn test_status_serde_shape() {
        let json = serde_json::to_string(&SessionStatus::PartiallyCompleted).unwrap();
        assert_eq!(json, "\"PARTIALLY_COMPLETED\"");
    }
}
