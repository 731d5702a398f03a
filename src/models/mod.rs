//! Core data model for the orchestration control plane.
//!
//! Every persisted record carries `tenant_id`, creation/update timestamps, a
//! nullable soft-deletion marker, and an integer version used for optimistic
//! locking. Cross-references between records use ids, never object handles;
//! metrics are an owned sub-record of the session and checkpoints an owned
//! ordered sequence.

pub mod agent;
pub mod event;
pub mod session;
pub mod task;
pub mod tenant;

pub use agent::{
    Agent, AgentLoad, AgentPerformance, AgentTier, AgentType, Capability, ComplexityPreference,
    LoadLevel, ModelConfig, RegisterAgent, TaskOutcome,
};
pub use event::OrchestratorEvent;
pub use session::{
    Checkpoint, CreateSession, Session, SessionMetrics, SessionStatus, SessionType,
};
pub use task::{
    ComplexityLevel, CreateTask, DependencyKind, EstimateSource, Task, TaskDependency,
    TaskEstimate, TaskStatus, TaskType,
};
pub use tenant::{Tenant, TenantQuotas, TenantTier};

use serde::{Deserialize, Serialize};

/// Priority shared by sessions, tasks, and lock requests
///
/// Higher priorities are scheduled first; `weight` is the numeric rank used
/// for lock-queue ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Deferred,
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn weight(&self) -> i64 {
        match self {
            Priority::Deferred => 0,
            Priority::Low => 1,
            Priority::Medium => 2,
            Priority::High => 5,
            Priority::Critical => 10,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}
