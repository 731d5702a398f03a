use super::session::SessionStatus;
use super::task::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Typed events streamed to observers
///
/// Delivery is best-effort, at-least-once for in-process subscribers;
/// ordering is FIFO per session and undefined across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    SessionCreated {
        tenant_id: Uuid,
        session_id: Uuid,
        title: String,
        timestamp: DateTime<Utc>,
    },
    SessionStatusChanged {
        tenant_id: Uuid,
        session_id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
        timestamp: DateTime<Utc>,
    },
    SessionCompleted {
        tenant_id: Uuid,
        session_id: Uuid,
        success_rate: f64,
        timestamp: DateTime<Utc>,
    },
    SessionFailed {
        tenant_id: Uuid,
        session_id: Uuid,
        error: String,
        retryable: bool,
        timestamp: DateTime<Utc>,
    },
    TaskStatusChanged {
        tenant_id: Uuid,
        session_id: Uuid,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        timestamp: DateTime<Utc>,
    },
    AgentRegistered {
        tenant_id: Uuid,
        agent_id: Uuid,
        name: String,
        timestamp: DateTime<Utc>,
    },
    AgentHeartbeatLost {
        tenant_id: Uuid,
        agent_id: Uuid,
        last_active_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestratorEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::SessionStatusChanged { .. } => "session_status_changed",
            Self::SessionCompleted { .. } => "session_completed",
            Self::SessionFailed { .. } => "session_failed",
            Self::TaskStatusChanged { .. } => "task_status_changed",
            Self::AgentRegistered { .. } => "agent_registered",
            Self::AgentHeartbeatLost { .. } => "agent_heartbeat_lost",
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        match self {
            Self::SessionCreated { tenant_id, .. }
            | Self::SessionStatusChanged { tenant_id, .. }
            | Self::SessionCompleted { tenant_id, .. }
            | Self::SessionFailed { tenant_id, .. }
            | Self::TaskStatusChanged { tenant_id, .. }
            | Self::AgentRegistered { tenant_id, .. }
            | Self::AgentHeartbeatLost { tenant_id, .. } => *tenant_id,
        }
    }

    /// Session this event belongs to, when it is session-scoped.
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::SessionStatusChanged { session_id, .. }
            | Self::SessionCompleted { session_id, .. }
            | Self::SessionFailed { session_id, .. }
            | Self::TaskStatusChanged { session_id, .. } => Some(*session_id),
            Self::AgentRegistered { .. } | Self::AgentHeartbeatLost { .. } => None,
        }
    }
}
