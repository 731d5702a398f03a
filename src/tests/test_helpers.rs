use crate::coordination::{CoordinationStore, MemoryCoordinationStore};
use crate::lock::LockConfig;
use crate::models::{
    Agent, AgentLoad, AgentPerformance, AgentTier, AgentType, Capability, ComplexityPreference,
    CreateSession, ModelConfig, Priority, RegisterAgent, SessionType, Tenant, TenantQuotas,
    TenantTier,
};
use crate::orchestrator::SessionOrchestrator;
use crate::store::MemoryEngine;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Everything a scenario needs: the orchestrator plus handles to the
/// backing engines for direct state inspection.
pub struct TestContext {
    pub orchestrator: SessionOrchestrator,
    pub coordination: Arc<MemoryCoordinationStore>,
    pub tenant_id: Uuid,
}

pub async fn context() -> TestContext {
    context_with_quotas(TenantQuotas::default()).await
}

pub async fn context_with_quotas(quotas: TenantQuotas) -> TestContext {
    let engine = Arc::new(MemoryEngine::new());
    let coordination = Arc::new(MemoryCoordinationStore::new());
    let lock_config = LockConfig {
        acquire_timeout: Duration::from_secs(5),
        lock_ttl: Duration::from_secs(10),
        retry_interval: Duration::from_millis(5),
    };
    let orchestrator = SessionOrchestrator::with_lock_config(
        engine,
        coordination.clone() as Arc<dyn CoordinationStore>,
        lock_config,
    );

    let tenant = Tenant::new("acme", quotas, TenantTier::Standard);
    let tenant_id = tenant.id;
    orchestrator.tenants().insert(tenant).await.unwrap();

    TestContext {
        orchestrator,
        coordination,
        tenant_id,
    }
}

pub fn execution_session(title: &str, prompt: &str) -> CreateSession {
    CreateSession::new(title, prompt, SessionType::Execution, Priority::High)
}

pub fn model_config() -> ModelConfig {
    ModelConfig {
        provider_model: "anthropic/claude-sonnet".into(),
        temperature: 0.7,
        max_tokens: 4096,
        system_prompt_template:
            "You are a focused software implementer. Produce minimal, tested changes.".into(),
    }
}

pub fn implementer_request(name: &str) -> RegisterAgent {
    RegisterAgent {
        name: name.to_string(),
        agent_type: AgentType::Implementer,
        description: None,
        agent_version: "1.0.0".into(),
        primary_capabilities: vec![Capability::CodeGeneration],
        secondary_capabilities: vec![],
        model_config: model_config(),
        preferred_technologies: vec![],
        avoided_technologies: vec![],
        complexity_preference: ComplexityPreference::Medium,
        preferred_session_types: vec![],
        capacity: 5.0,
        is_external: false,
        endpoint: None,
        auth_token: None,
        tags: vec![],
    }
}

/// Shape an agent's counters so its overall rate and tier land exactly
/// where a scenario needs them.
pub fn shape_performance(agent: &mut Agent, overall: f64, quality: f64, tier: AgentTier) {
    let successful = (overall * 100.0).round() as u64;
    agent.performance = AgentPerformance {
        total_tasks: 100,
        successful_tasks: successful,
        failed_tasks: 100 - successful,
        partial_tasks: 0,
        avg_quality: quality,
        ..AgentPerformance::default()
    };
    agent.performance.tier = tier;
}

pub fn shape_load(agent: &mut Agent, current: f64, capacity: f64) {
    agent.load = AgentLoad {
        current,
        ..AgentLoad::with_capacity(capacity)
    };
}
