use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Types of specialized agents available in the system
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    Architect,
    Implementer,
    Reviewer,
    Debugger,
    Integrator,
    Orchestrator,
    Analyst,
    Optimizer,
}

/// Closed set of skills an agent can exercise
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    RequirementsAnalysis,
    SystemDesign,
    ApiDesign,
    DataModeling,
    CodeGeneration,
    TestGeneration,
    CodeReview,
    SecurityAudit,
    Debugging,
    Refactoring,
    PerformanceTuning,
    Documentation,
    Deployment,
    Monitoring,
    Orchestration,
    Integration,
    Migration,
    UiImplementation,
    Estimation,
    Research,
}

impl AgentType {
    /// Primary capabilities an agent of this type may declare.
    pub fn allowed_primary_capabilities(&self) -> &'static [Capability] {
        use Capability::*;
        match self {
            AgentType::Architect => &[
                SystemDesign,
                ApiDesign,
                DataModeling,
                RequirementsAnalysis,
                Estimation,
            ],
            AgentType::Implementer => &[
                CodeGeneration,
                TestGeneration,
                Refactoring,
                UiImplementation,
                Documentation,
            ],
            AgentType::Reviewer => &[CodeReview, SecurityAudit, Documentation, TestGeneration],
            AgentType::Debugger => &[Debugging, TestGeneration, PerformanceTuning],
            AgentType::Integrator => &[Integration, Migration, Deployment, ApiDesign],
            AgentType::Orchestrator => &[Orchestration, Estimation, RequirementsAnalysis],
            AgentType::Analyst => &[RequirementsAnalysis, Research, DataModeling, Estimation],
            AgentType::Optimizer => &[PerformanceTuning, Refactoring, Monitoring],
        }
    }
}

/// Model invocation settings of shape `provider/model`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt_template: String,
}

/// Performance classification derived from the counters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentTier {
    Elite,
    Advanced,
    Competent,
    Trainee,
    Degraded,
}

impl AgentTier {
    /// Routing score multiplier. DEGRADED zeroes an agent out of routing.
    pub fn multiplier(&self) -> f64 {
        match self {
            AgentTier::Elite => 1.10,
            AgentTier::Advanced => 1.05,
            AgentTier::Competent => 1.00,
            AgentTier::Trainee => 0.90,
            AgentTier::Degraded => 0.00,
        }
    }
}

/// Lifetime performance counters and running averages
///
/// Averages are maintained online: each completion folds into the average
/// without rescanning history. `total_tasks` always equals
/// `successful + failed + partial`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub partial_tasks: u64,
    pub avg_quality: f64,
    pub avg_execution_seconds: f64,
    pub avg_tokens_per_task: f64,
    pub avg_cost_per_task: f64,
    pub capability_success: HashMap<Capability, f64>,
    pub technology_success: HashMap<String, f64>,
    pub tier: AgentTier,
}

impl Default for AgentPerformance {
    fn default() -> Self {
        Self {
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            partial_tasks: 0,
            avg_quality: 0.0,
            avg_execution_seconds: 0.0,
            avg_tokens_per_task: 0.0,
            avg_cost_per_task: 0.0,
            capability_success: HashMap::new(),
            technology_success: HashMap::new(),
            tier: AgentTier::Trainee,
        }
    }
}

/// How one finished task went, fed back into the performance counters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Partial,
    Failure,
}

impl AgentPerformance {
    /// Overall success rate: (successful + 0.5 * partial) / total, 0 when idle.
    pub fn overall_success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        (self.successful_tasks as f64 + 0.5 * self.partial_tasks as f64) / self.total_tasks as f64
    }

    /// Fold one completed task into the counters and recompute the tier.
    #[allow(clippy::too_many_arguments)]
    pub fn record_outcome(
        &mut self,
        outcome: TaskOutcome,
        quality: f64,
        execution_seconds: f64,
        tokens: f64,
        cost: f64,
        capabilities: &[Capability],
        technologies: &[String],
    ) {
        let n = self.total_tasks as f64;
        self.total_tasks += 1;
        match outcome {
            TaskOutcome::Success => self.successful_tasks += 1,
            TaskOutcome::Partial => self.partial_tasks += 1,
            TaskOutcome::Failure => self.failed_tasks += 1,
        }

        self.avg_quality = online_mean(self.avg_quality, n, quality);
        self.avg_execution_seconds = online_mean(self.avg_execution_seconds, n, execution_seconds);
        self.avg_tokens_per_task = online_mean(self.avg_tokens_per_task, n, tokens);
        self.avg_cost_per_task = online_mean(self.avg_cost_per_task, n, cost);

        let hit = match outcome {
            TaskOutcome::Success => 1.0,
            TaskOutcome::Partial => 0.5,
            TaskOutcome::Failure => 0.0,
        };
        for capability in capabilities {
            let rate = self.capability_success.entry(*capability).or_insert(0.0);
            // Per-capability counts are not tracked separately; a smoothed
            // moving average keeps the rate responsive without them.
            *rate = 0.8 * *rate + 0.2 * hit;
        }
        for technology in technologies {
            let rate = self
                .technology_success
                .entry(technology.to_lowercase())
                .or_insert(0.0);
            *rate = 0.8 * *rate + 0.2 * hit;
        }

        self.tier = self.compute_tier();
    }

    fn compute_tier(&self) -> AgentTier {
        let overall = self.overall_success_rate();
        if overall >= 0.95 && self.avg_quality >= 0.9 {
            AgentTier::Elite
        } else if overall >= 0.85 {
            AgentTier::Advanced
        } else if overall >= 0.70 {
            AgentTier::Competent
        } else if overall >= 0.50 {
            AgentTier::Trainee
        } else {
            AgentTier::Degraded
        }
    }
}

fn online_mean(current: f64, count: f64, sample: f64) -> f64 {
    (current * count + sample) / (count + 1.0)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityPreference {
    Simple,
    Medium,
    Complex,
    Expert,
}

/// Load level derived from the current/capacity ratio
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadLevel {
    Idle,
    Optimal,
    High,
    Critical,
    Overloaded,
}

/// Current scheduling load of an agent
///
/// `current` stays at or below `capacity` except transiently during a
/// reservation; the coordination store arbitrates the atomic increment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoad {
    pub current: f64,
    pub capacity: f64,
    pub queue_length: u32,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub network_utilization: f64,
    pub peak: f64,
}

impl AgentLoad {
    pub fn with_capacity(capacity: f64) -> Self {
        Self {
            current: 0.0,
            capacity,
            queue_length: 0,
            cpu_utilization: 0.0,
            memory_utilization: 0.0,
            network_utilization: 0.0,
            peak: 0.0,
        }
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity <= 0.0 {
            return 1.0;
        }
        self.current / self.capacity
    }

    /// Fraction of capacity still available, clamped to [0, 1].
    pub fn headroom(&self) -> f64 {
        (1.0 - self.utilization()).clamp(0.0, 1.0)
    }

    pub fn level(&self) -> LoadLevel {
        let ratio = self.utilization();
        if ratio <= 0.0 {
            LoadLevel::Idle
        } else if ratio < 0.5 {
            LoadLevel::Optimal
        } else if ratio < 0.75 {
            LoadLevel::High
        } else if ratio < 1.0 {
            LoadLevel::Critical
        } else {
            LoadLevel::Overloaded
        }
    }

    pub fn is_overloaded(&self) -> bool {
        self.utilization() >= 1.0
    }
}

/// A worker capable of executing tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub agent_type: AgentType,
    pub description: Option<String>,
    /// Declared software revision of the agent itself
    pub agent_version: String,
    pub primary_capabilities: Vec<Capability>,
    pub secondary_capabilities: Vec<Capability>,
    pub model_config: ModelConfig,
    pub preferred_technologies: Vec<String>,
    pub avoided_technologies: Vec<String>,
    pub complexity_preference: ComplexityPreference,
    pub preferred_session_types: Vec<super::SessionType>,
    pub performance: AgentPerformance,
    pub load: AgentLoad,
    pub is_active: bool,
    pub maintenance_mode: bool,
    pub last_active_at: DateTime<Utc>,
    /// External agents live in a remote process and are dispatched over HTTP
    pub is_external: bool,
    pub endpoint: Option<String>,
    pub auth_token: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: u64,
}

/// Registration input; validated before an `Agent` is materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgent {
    pub name: String,
    pub agent_type: AgentType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "RegisterAgent::default_version")]
    pub agent_version: String,
    pub primary_capabilities: Vec<Capability>,
    #[serde(default)]
    pub secondary_capabilities: Vec<Capability>,
    pub model_config: ModelConfig,
    #[serde(default)]
    pub preferred_technologies: Vec<String>,
    #[serde(default)]
    pub avoided_technologies: Vec<String>,
    #[serde(default = "RegisterAgent::default_complexity")]
    pub complexity_preference: ComplexityPreference,
    #[serde(default)]
    pub preferred_session_types: Vec<super::SessionType>,
    #[serde(default = "RegisterAgent::default_capacity")]
    pub capacity: f64,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RegisterAgent {
    fn default_version() -> String {
        "1.0.0".to_string()
    }

    fn default_complexity() -> ComplexityPreference {
        ComplexityPreference::Medium
    }

    fn default_capacity() -> f64 {
        5.0
    }
}

impl Agent {
    pub fn from_request(tenant_id: Uuid, request: RegisterAgent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: request.name,
            agent_type: request.agent_type,
            description: request.description,
            agent_version: request.agent_version,
            primary_capabilities: request.primary_capabilities,
            secondary_capabilities: request.secondary_capabilities,
            model_config: request.model_config,
            preferred_technologies: request.preferred_technologies,
            avoided_technologies: request.avoided_technologies,
            complexity_preference: request.complexity_preference,
            preferred_session_types: request.preferred_session_types,
            performance: AgentPerformance::default(),
            load: AgentLoad::with_capacity(request.capacity),
            is_active: true,
            maintenance_mode: false,
            last_active_at: now,
            is_external: request.is_external,
            endpoint: request.endpoint,
            auth_token: request.auth_token,
            tags: request.tags,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 1,
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.primary_capabilities.contains(&capability)
            || self.secondary_capabilities.contains(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn performance_with(successful: u64, failed: u64, partial: u64, quality: f64) -> AgentPerformance {
        AgentPerformance {
            total_tasks: successful + failed + partial,
            successful_tasks: successful,
            failed_tasks: failed,
            partial_tasks: partial,
            avg_quality: quality,
            ..AgentPerformance::default()
        }
    }

    #[test]
    fn test_counter_identity_holds_after_recording() {
        let mut perf = AgentPerformance::default();
        perf.record_outcome(TaskOutcome::Success, 0.9, 10.0, 500.0, 0.01, &[], &[]);
        perf.record_outcome(TaskOutcome::Partial, 0.6, 20.0, 800.0, 0.02, &[], &[]);
        perf.record_outcome(TaskOutcome::Failure, 0.1, 5.0, 100.0, 0.0, &[], &[]);

        assert_eq!(
            perf.total_tasks,
            perf.successful_tasks + perf.failed_tasks + perf.partial_tasks
        );
        assert_eq!(perf.total_tasks, 3);
    }

    #[test]
    fn test_overall_success_rate() {
        let perf = performance_with(8, 1, 2, 0.8);
        // (8 + 0.5 * 2) / 11
        assert!((perf.overall_success_rate() - 9.0 / 11.0).abs() < 1e-9);
        assert_eq!(AgentPerformance::default().overall_success_rate(), 0.0);
    }

    #[test]
    fn test_online_average() {
        let mut perf = AgentPerformance::default();
        perf.record_outcome(TaskOutcome::Success, 1.0, 10.0, 0.0, 0.0, &[], &[]);
        perf.record_outcome(TaskOutcome::Success, 0.5, 30.0, 0.0, 0.0, &[], &[]);
        assert!((perf.avg_quality - 0.75).abs() < 1e-9);
        assert!((perf.avg_execution_seconds - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_tier_thresholds() {
        let mut perf = performance_with(95, 5, 0, 0.95);
        perf.tier = perf.compute_tier();
        assert_eq!(perf.tier, AgentTier::Elite);

        let mut perf = performance_with(95, 5, 0, 0.5);
        perf.tier = perf.compute_tier();
        assert_eq!(perf.tier, AgentTier::Advanced);

        let mut perf = performance_with(7, 3, 0, 0.5);
        perf.tier = perf.compute_tier();
        assert_eq!(perf.tier, AgentTier::Competent);

        let mut perf = performance_with(5, 5, 0, 0.5);
        perf.tier = perf.compute_tier();
        assert_eq!(perf.tier, AgentTier::Trainee);

        let mut perf = performance_with(2, 8, 0, 0.5);
        perf.tier = perf.compute_tier();
        assert_eq!(perf.tier, AgentTier::Degraded);
    }

    #[test]
    fn test_tier_multipliers() {
        assert!((AgentTier::Elite.multiplier() - 1.10).abs() < 1e-9);
        assert_eq!(AgentTier::Degraded.multiplier(), 0.0);
    }

    #[test]
    fn test_load_levels() {
        let mut load = AgentLoad::with_capacity(10.0);
        assert_eq!(load.level(), LoadLevel::Idle);
        load.current = 3.0;
        assert_eq!(load.level(), LoadLevel::Optimal);
        load.current = 6.0;
        assert_eq!(load.level(), LoadLevel::High);
        load.current = 9.0;
        assert_eq!(load.level(), LoadLevel::Critical);
        load.current = 10.0;
        assert_eq!(load.level(), LoadLevel::Overloaded);
        assert!(load.is_overloaded());
        assert_eq!(load.headroom(), 0.0);
    }

    #[test]
    fn test_type_capability_allow_lists() {
        assert!(AgentType::Implementer
            .allowed_primary_capabilities()
            .contains(&Capability::CodeGeneration));
        assert!(!AgentType::Implementer
            .allowed_primary_capabilities()
            .contains(&Capability::SecurityAudit));
    }
}
