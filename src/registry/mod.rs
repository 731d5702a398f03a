//! Agent registry
//!
//! Registration with capability/type validation, capability and tag indexes,
//! heartbeat bookkeeping, and the inactivity sweep. Routing lives in
//! [`router`], external dispatch in [`dispatch`].

pub mod dispatch;
pub mod router;

pub use dispatch::{DispatchResponse, ExternalAgentClient, TaskDispatch};
pub use router::{AgentRouter, RouteRequest, ScoredAgent};

use crate::coordination::CoordinationStore;
use crate::events::EventBroadcaster;
use crate::models::{
    Agent, AgentLoad, Capability, OrchestratorEvent, RegisterAgent, TaskOutcome,
};
use crate::store::{AgentRepository, TenantRepository};
use crate::{tenant, validation, OrchestratorError, Result};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Load figures an agent reports with its heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub queue_length: Option<u32>,
    pub cpu_utilization: Option<f64>,
    pub memory_utilization: Option<f64>,
    pub network_utilization: Option<f64>,
    pub progress: Option<serde_json::Value>,
}

type CapabilityIndex = HashMap<(Uuid, Capability), HashSet<Uuid>>;
type TagIndex = HashMap<(Uuid, String), HashSet<Uuid>>;

#[derive(Clone)]
pub struct AgentRegistry {
    agents: AgentRepository,
    tenants: TenantRepository,
    coordination: Arc<dyn CoordinationStore>,
    events: EventBroadcaster,
    by_capability: Arc<RwLock<CapabilityIndex>>,
    by_tag: Arc<RwLock<TagIndex>>,
}

impl AgentRegistry {
    pub fn new(
        agents: AgentRepository,
        tenants: TenantRepository,
        coordination: Arc<dyn CoordinationStore>,
        events: EventBroadcaster,
    ) -> Self {
        Self {
            agents,
            tenants,
            coordination,
            events,
            by_capability: Arc::new(RwLock::new(HashMap::new())),
            by_tag: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn repository(&self) -> &AgentRepository {
        &self.agents
    }

    /// Register an agent for the current tenant.
    ///
    /// Validates name, capability/type alignment, and model config; enforces
    /// the tenant's `max_agents` quota; indexes the agent by every primary
    /// and secondary capability and by every tag.
    pub async fn register(&self, request: RegisterAgent) -> Result<Agent> {
        let tenant_id = tenant::current_tenant()?;
        validation::validate_agent_registration(&request)?;

        let quota = self.tenants.get(tenant_id).await?.quotas.max_agents;
        if self.agents.count().await? >= quota as u64 {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "tenant already has {quota} agents registered"
            )));
        }

        let agent = self.agents.insert(Agent::from_request(tenant_id, request)).await?;
        self.index(&agent).await;

        info!("registered agent '{}' ({})", agent.name, agent.id);
        self.events
            .publish(OrchestratorEvent::AgentRegistered {
                tenant_id,
                agent_id: agent.id,
                name: agent.name.clone(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(agent)
    }

    pub async fn get(&self, agent_id: Uuid) -> Result<Agent> {
        self.agents.get(agent_id).await
    }

    pub async fn list(&self) -> Result<Vec<Agent>> {
        self.agents.list().await
    }

    /// Remove an agent from service and from the indexes (soft delete).
    pub async fn deregister(&self, agent_id: Uuid) -> Result<()> {
        let agent = self.agents.get(agent_id).await?;
        self.agents.soft_delete(agent_id, agent.version).await?;
        self.unindex(&agent).await;
        info!("deregistered agent '{}' ({agent_id})", agent.name);
        Ok(())
    }

    /// Record a heartbeat, refreshing liveness and reported load.
    pub async fn heartbeat(&self, agent_id: Uuid, payload: HeartbeatPayload) -> Result<Agent> {
        let mut agent = self.agents.get(agent_id).await?;
        agent.last_active_at = Utc::now();
        agent.is_active = true;

        if let Some(queue_length) = payload.queue_length {
            agent.load.queue_length = queue_length;
        }
        if let Some(cpu) = payload.cpu_utilization {
            agent.load.cpu_utilization = cpu;
        }
        if let Some(memory) = payload.memory_utilization {
            agent.load.memory_utilization = memory;
        }
        if let Some(network) = payload.network_utilization {
            agent.load.network_utilization = network;
        }

        debug!("heartbeat from agent {agent_id}");
        self.agents.update(agent).await
    }

    /// Heartbeat for external agents: the caller must present the agent's
    /// auth token, compared in constant time.
    pub async fn heartbeat_authenticated(
        &self,
        agent_id: Uuid,
        token: &str,
        payload: HeartbeatPayload,
    ) -> Result<Agent> {
        let agent = self.agents.get(agent_id).await?;
        let expected = agent.auth_token.as_deref().unwrap_or_default();
        let matches: bool = expected.as_bytes().ct_eq(token.as_bytes()).into();
        if !matches {
            return Err(OrchestratorError::Forbidden(
                "invalid agent token".to_string(),
            ));
        }
        self.heartbeat(agent_id, payload).await
    }

    /// Mark agents silent for longer than `inactive_after` as inactive,
    /// keeping them registered. Returns how many were swept.
    pub async fn sweep_inactive(&self) -> Result<usize> {
        let cutoff =
            Utc::now() - ChronoDuration::seconds(crate::constants::AGENT_INACTIVE_AFTER_SECS as i64);
        let mut swept = 0;

        for agent in self.agents.list_active().await? {
            if agent.last_active_at >= cutoff {
                continue;
            }
            let last_active_at = agent.last_active_at;
            let tenant_id = agent.tenant_id;
            let agent_id = agent.id;
            let mut stale = agent;
            stale.is_active = false;
            match self.agents.update(stale).await {
                Ok(_) => {
                    warn!("agent {agent_id} missed heartbeats, marked inactive");
                    self.events
                        .publish(OrchestratorEvent::AgentHeartbeatLost {
                            tenant_id,
                            agent_id,
                            last_active_at,
                            timestamp: Utc::now(),
                        })
                        .await;
                    swept += 1;
                }
                Err(OrchestratorError::StaleVersion { .. }) => {
                    // The agent raced us with a heartbeat; it lives.
                }
                Err(error) => return Err(error),
            }
        }
        Ok(swept)
    }

    /// Fold a finished task into the agent's performance counters and
    /// recompute its tier.
    pub async fn record_task_outcome(
        &self,
        agent_id: Uuid,
        outcome: TaskOutcome,
        quality: f64,
        execution_seconds: f64,
        tokens: f64,
        cost: f64,
        capabilities: &[Capability],
        technologies: &[String],
    ) -> Result<Agent> {
        let mut agent = self.agents.get(agent_id).await?;
        agent.performance.record_outcome(
            outcome,
            quality,
            execution_seconds,
            tokens,
            cost,
            capabilities,
            technologies,
        );
        let tier = agent.performance.tier;
        let agent = self.agents.update(agent).await?;
        debug!("agent {agent_id} now at tier {tier:?}");
        Ok(agent)
    }

    /// Refresh an agent's in-record load counter from the authoritative
    /// coordination value.
    pub async fn refreshed_load(&self, agent: &Agent) -> AgentLoad {
        let mut load = agent.load.clone();
        if let Ok(Some(value)) = self.coordination.get(&format!("agent_load:{}", agent.id)).await {
            if let Ok(current) = value.parse::<f64>() {
                load.current = current;
                load.peak = load.peak.max(current);
            }
        }
        load
    }

    pub async fn find_by_capability(&self, capability: Capability) -> Result<Vec<Uuid>> {
        let tenant_id = tenant::current_tenant()?;
        let index = self.by_capability.read().await;
        let mut ids: Vec<Uuid> = index
            .get(&(tenant_id, capability))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    pub async fn find_by_tag(&self, tag: &str) -> Result<Vec<Uuid>> {
        let tenant_id = tenant::current_tenant()?;
        let index = self.by_tag.read().await;
        let mut ids: Vec<Uuid> = index
            .get(&(tenant_id, tag.to_lowercase()))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn index(&self, agent: &Agent) {
        let mut capabilities = self.by_capability.write().await;
        for capability in agent
            .primary_capabilities
            .iter()
            .chain(agent.secondary_capabilities.iter())
        {
            capabilities
                .entry((agent.tenant_id, *capability))
                .or_default()
                .insert(agent.id);
        }
        drop(capabilities);

        let mut tags = self.by_tag.write().await;
        for tag in &agent.tags {
            tags.entry((agent.tenant_id, tag.to_lowercase()))
                .or_default()
                .insert(agent.id);
        }
    }

    async fn unindex(&self, agent: &Agent) {
        let mut capabilities = self.by_capability.write().await;
        for set in capabilities.values_mut() {
            set.remove(&agent.id);
        }
        drop(capabilities);

        let mut tags = self.by_tag.write().await;
        for set in tags.values_mut() {
            set.remove(&agent.id);
        }
    }

    /// Periodic sweep loop; spawn once per process. Rebinds the tenant
    /// context for every known tenant, since the repositories are scoped.
    pub async fn run_sweeper(self) {
        let interval =
            std::time::Duration::from_secs(crate::constants::HEARTBEAT_SWEEP_INTERVAL_SECS);
        loop {
            tokio::time::sleep(interval).await;
            let tenants = match self.tenants.list().await {
                Ok(tenants) => tenants,
                Err(error) => {
                    warn!("heartbeat sweep could not list tenants: {error}");
                    continue;
                }
            };
            for row in tenants {
                let registry = self.clone();
                if let Err(error) =
                    tenant::with_tenant(row.id, async move { registry.sweep_inactive().await })
                        .await
                {
                    warn!("heartbeat sweep failed for tenant {}: {error}", row.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinationStore;
    use crate::models::{
        AgentType, ComplexityPreference, ModelConfig, Tenant, TenantQuotas, TenantTier,
    };
    use crate::store::memory::{MemoryStore, TenantScope};
    use crate::tenant::with_tenant;

    fn registry() -> (AgentRegistry, TenantRepository) {
        let agents = AgentRepository::new(Arc::new(MemoryStore::new(TenantScope::Scoped)));
        let tenants = TenantRepository::new(Arc::new(MemoryStore::new(TenantScope::Global)));
        let coordination: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinationStore::new());
        let events = EventBroadcaster::new(coordination.clone());
        (
            AgentRegistry::new(agents, tenants.clone(), coordination, events),
            tenants,
        )
    }

    async fn provision_tenant(tenants: &TenantRepository, max_agents: u32) -> Uuid {
        let tenant = Tenant::new(
            "acme",
            TenantQuotas {
                max_agents,
                ..TenantQuotas::default()
            },
            TenantTier::Standard,
        );
        let id = tenant.id;
        tenants.insert(tenant).await.unwrap();
        id
    }

    fn request(name: &str) -> RegisterAgent {
        RegisterAgent {
            name: name.to_string(),
            agent_type: AgentType::Implementer,
            description: None,
            agent_version: "1.0.0".into(),
            primary_capabilities: vec![Capability::CodeGeneration],
            secondary_capabilities: vec![Capability::TestGeneration],
            model_config: ModelConfig {
                provider_model: "anthropic/claude-sonnet".into(),
                temperature: 0.7,
                max_tokens: 4096,
                system_prompt_template:
                    "You are a focused software implementer. Produce minimal, tested changes."
                        .into(),
            },
            preferred_technologies: vec!["rust".into()],
            avoided_technologies: vec![],
            complexity_preference: ComplexityPreference::Medium,
            preferred_session_types: vec![],
            capacity: 5.0,
            is_external: false,
            endpoint: None,
            auth_token: None,
            tags: vec!["backend".into()],
        }
    }

    #[tokio::test]
    async fn test_register_validates_and_indexes() {
        let (registry, tenants) = registry();
        let tenant_id = provision_tenant(&tenants, 10).await;

        with_tenant(tenant_id, async {
            let agent = registry.register(request("Rust Implementer")).await.unwrap();

            let by_primary = registry
                .find_by_capability(Capability::CodeGeneration)
                .await
                .unwrap();
            let by_secondary = registry
                .find_by_capability(Capability::TestGeneration)
                .await
                .unwrap();
            let by_tag = registry.find_by_tag("backend").await.unwrap();

            assert_eq!(by_primary, vec![agent.id]);
            assert_eq!(by_secondary, vec![agent.id]);
            assert_eq!(by_tag, vec![agent.id]);
        })
        .await;
    }

    #[tokio::test]
    async fn test_register_rejects_misaligned_capabilities() {
        let (registry, tenants) = registry();
        let tenant_id = provision_tenant(&tenants, 10).await;

        with_tenant(tenant_id, async {
            let mut bad = request("Rust Implementer");
            bad.primary_capabilities = vec![Capability::SecurityAudit];
            let err = registry.register(bad).await.unwrap_err();
            assert_eq!(err.code(), "VALIDATION");
        })
        .await;
    }

    #[tokio::test]
    async fn test_agent_quota_enforced() {
        let (registry, tenants) = registry();
        let tenant_id = provision_tenant(&tenants, 1).await;

        with_tenant(tenant_id, async {
            registry.register(request("Rust Implementer")).await.unwrap();
            let err = registry
                .register(request("Backup Implementer"))
                .await
                .unwrap_err();
            assert_eq!(err.code(), "QUOTA_EXCEEDED");
        })
        .await;
    }

    #[tokio::test]
    async fn test_heartbeat_updates_liveness_and_load() {
        let (registry, tenants) = registry();
        let tenant_id = provision_tenant(&tenants, 10).await;

        with_tenant(tenant_id, async {
            let agent = registry.register(request("Rust Implementer")).await.unwrap();
            let before = agent.last_active_at;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;

            let payload = HeartbeatPayload {
                queue_length: Some(2),
                cpu_utilization: Some(0.4),
                ..HeartbeatPayload::default()
            };
            let updated = registry.heartbeat(agent.id, payload).await.unwrap();
            assert!(updated.last_active_at > before);
            assert_eq!(updated.load.queue_length, 2);
        })
        .await;
    }

    #[tokio::test]
    async fn test_authenticated_heartbeat_rejects_bad_token() {
        let (registry, tenants) = registry();
        let tenant_id = provision_tenant(&tenants, 10).await;

        with_tenant(tenant_id, async {
            let mut external = request("Remote Implementer");
            external.is_external = true;
            external.endpoint = Some("https://agents.internal:8443".into());
            external.auth_token = Some("correct-token".into());
            let agent = registry.register(external).await.unwrap();

            let err = registry
                .heartbeat_authenticated(agent.id, "wrong-token", HeartbeatPayload::default())
                .await
                .unwrap_err();
            assert_eq!(err.code(), "FORBIDDEN");

            registry
                .heartbeat_authenticated(agent.id, "correct-token", HeartbeatPayload::default())
                .await
                .unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn test_sweep_marks_silent_agents_inactive() {
        let (registry, tenants) = registry();
        let tenant_id = provision_tenant(&tenants, 10).await;

        with_tenant(tenant_id, async {
            let agent = registry.register(request("Rust Implementer")).await.unwrap();

            // Backdate the last heartbeat past the inactivity window.
            let mut stale = registry.get(agent.id).await.unwrap();
            stale.last_active_at = Utc::now()
                - ChronoDuration::seconds(crate::constants::AGENT_INACTIVE_AFTER_SECS as i64 + 10);
            registry.repository().update(stale).await.unwrap();

            let swept = registry.sweep_inactive().await.unwrap();
            assert_eq!(swept, 1);

            let after = registry.get(agent.id).await.unwrap();
            assert!(!after.is_active);
            // Still registered, only out of routing.
            assert!(registry.list().await.unwrap().iter().any(|a| a.id == agent.id));
        })
        .await;
    }

    #[tokio::test]
    async fn test_outcome_recording_moves_tier() {
        let (registry, tenants) = registry();
        let tenant_id = provision_tenant(&tenants, 10).await;

        with_tenant(tenant_id, async {
            let agent = registry.register(request("Rust Implementer")).await.unwrap();

            let mut updated = agent;
            for _ in 0..20 {
                updated = registry
                    .record_task_outcome(
                        updated.id,
                        TaskOutcome::Success,
                        0.95,
                        30.0,
                        1_000.0,
                        0.05,
                        &[Capability::CodeGeneration],
                        &["rust".to_string()],
                    )
                    .await
                    .unwrap();
            }

            assert_eq!(updated.performance.total_tasks, 20);
            assert_eq!(updated.performance.tier, crate::models::AgentTier::Elite);
            assert!(updated.performance.capability_success[&Capability::CodeGeneration] > 0.5);
        })
        .await;
    }
}
