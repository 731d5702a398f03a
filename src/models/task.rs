use super::agent::Capability;
use super::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle states of a task (the inner state machine)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Ready,
    Assigned,
    InProgress,
    Blocked,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Ready => "READY",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Feature,
    Bugfix,
    Refactor,
    Test,
    Documentation,
    Infrastructure,
    Research,
    Security,
}

/// Dependency scheduling semantics between two tasks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyKind {
    /// Predecessor must complete before the dependent starts
    FinishToStart,
    /// Predecessor must have started before the dependent starts
    StartToStart,
    /// Predecessor must complete before the dependent completes
    FinishToFinish,
    /// Predecessor must have started before the dependent completes
    StartToFinish,
}

/// A dependency edge, stored on the dependent task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDependency {
    pub target_task_id: Uuid,
    pub kind: DependencyKind,
    pub required: bool,
}

impl TaskDependency {
    pub fn finish_to_start(target: Uuid) -> Self {
        Self {
            target_task_id: target,
            kind: DependencyKind::FinishToStart,
            required: true,
        }
    }

    pub fn start_to_start(target: Uuid) -> Self {
        Self {
            target_task_id: target,
            kind: DependencyKind::StartToStart,
            required: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    Manual,
    Ai,
    Historical,
    Decomposition,
    Default,
}

/// PERT estimate triple plus derived planning data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEstimate {
    pub optimistic_hours: f64,
    pub likely_hours: f64,
    pub pessimistic_hours: f64,
    pub estimated_tokens: Option<u64>,
    pub estimated_cost: Option<f64>,
    pub required_capabilities: Vec<Capability>,
    /// Confidence in the estimate, 0.0..=1.0
    pub confidence: f64,
    pub source: EstimateSource,
}

impl TaskEstimate {
    pub fn new(optimistic: f64, likely: f64, pessimistic: f64, source: EstimateSource) -> Self {
        Self {
            optimistic_hours: optimistic,
            likely_hours: likely,
            pessimistic_hours: pessimistic,
            estimated_tokens: None,
            estimated_cost: None,
            required_capabilities: Vec::new(),
            confidence: 0.5,
            source,
        }
    }

    /// PERT expected value: (O + 4L + P) / 6
    pub fn expected_hours(&self) -> f64 {
        (self.optimistic_hours + 4.0 * self.likely_hours + self.pessimistic_hours) / 6.0
    }

    /// PERT standard deviation: (P - O) / 6
    pub fn stddev_hours(&self) -> f64 {
        (self.pessimistic_hours - self.optimistic_hours) / 6.0
    }

    pub fn complexity_level(&self) -> ComplexityLevel {
        ComplexityLevel::from_expected_hours(self.expected_hours())
    }
}

/// Complexity bucket derived from PERT expected hours
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplexityLevel {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Expert,
}

impl ComplexityLevel {
    pub fn from_expected_hours(hours: f64) -> Self {
        if hours < 0.25 {
            ComplexityLevel::Trivial
        } else if hours < 1.0 {
            ComplexityLevel::Simple
        } else if hours < 4.0 {
            ComplexityLevel::Moderate
        } else if hours < 8.0 {
            ComplexityLevel::Complex
        } else {
            ComplexityLevel::Expert
        }
    }
}

/// A node of the work DAG under a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub session_id: Uuid,
    pub tenant_id: Uuid,
    pub parent_task_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assigned_agent_id: Option<Uuid>,
    pub estimate: Option<TaskEstimate>,
    /// Edges to predecessor tasks, stored on the dependent side
    pub dependencies: Vec<TaskDependency>,
    /// Denormalized child ids, maintained by the task repository
    pub children: Vec<Uuid>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub artifacts: Vec<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: u64,
}

/// Input for task creation; validated before a `Task` is materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTask {
    pub session_id: Uuid,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub parent_task_id: Option<Uuid>,
    #[serde(default)]
    pub estimate: Option<TaskEstimate>,
    #[serde(default)]
    pub dependencies: Vec<TaskDependency>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CreateTask {
    pub fn new(
        session_id: Uuid,
        title: impl Into<String>,
        description: impl Into<String>,
        task_type: TaskType,
    ) -> Self {
        Self {
            session_id,
            title: title.into(),
            description: description.into(),
            task_type,
            priority: Priority::default(),
            parent_task_id: None,
            estimate: None,
            dependencies: Vec::new(),
            tags: Vec::new(),
        }
    }
}

impl Task {
    pub fn from_request(tenant_id: Uuid, request: CreateTask) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id: request.session_id,
            tenant_id,
            parent_task_id: request.parent_task_id,
            title: request.title,
            description: request.description,
            task_type: request.task_type,
            status: TaskStatus::Pending,
            priority: request.priority,
            assigned_agent_id: None,
            estimate: request.estimate,
            dependencies: request.dependencies,
            children: Vec::new(),
            result: None,
            error: None,
            artifacts: Vec::new(),
            tags: request.tags,
            metadata: HashMap::new(),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 1,
        }
    }

    pub fn expected_hours(&self) -> f64 {
        self.estimate.as_ref().map(|e| e.expected_hours()).unwrap_or(0.0)
    }

    pub fn complexity_level(&self) -> ComplexityLevel {
        ComplexityLevel::from_expected_hours(self.expected_hours())
    }

    /// Whether this task has reached IN_PROGRESS at any point.
    pub fn has_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}
