//! Capability-based routing with performance-weighted scoring
//!
//! Candidates are filtered hard (active, in service, capable, not
//! overloaded, not DEGRADED, no avoided technology), scored on a weighted
//! sum in [0, 1], multiplied by the tier multiplier, and the winner's load
//! is reserved through an atomic coordination-store increment.

use super::AgentRegistry;
use crate::coordination::CoordinationStore;
use crate::models::{
    Agent, AgentTier, Capability, ComplexityPreference, SessionType,
};
use crate::{OrchestratorError, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const WEIGHT_CAPABILITY: f64 = 0.25;
const WEIGHT_SUCCESS: f64 = 0.30;
const WEIGHT_HEADROOM: f64 = 0.15;
const WEIGHT_TECHNOLOGY: f64 = 0.15;
const WEIGHT_SESSION_TYPE: f64 = 0.05;
const WEIGHT_COMPLEXITY: f64 = 0.10;

/// What a task needs from an agent.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub required_capabilities: Vec<Capability>,
    /// Load units the task will occupy; also drives complexity alignment
    pub estimated_complexity: f64,
    pub technologies: Vec<String>,
    pub session_type: Option<SessionType>,
}

impl RouteRequest {
    pub fn new(required_capabilities: Vec<Capability>, estimated_complexity: f64) -> Self {
        Self {
            required_capabilities,
            estimated_complexity,
            technologies: Vec::new(),
            session_type: None,
        }
    }
}

/// A routing winner with its score.
#[derive(Debug, Clone)]
pub struct ScoredAgent {
    pub agent: Agent,
    pub score: f64,
}

/// Proof that load was reserved on an agent; release it on every exit path.
#[derive(Debug, Clone)]
pub struct LoadReservation {
    pub agent_id: Uuid,
    pub amount: f64,
}

#[derive(Clone)]
pub struct AgentRouter {
    registry: AgentRegistry,
    coordination: Arc<dyn CoordinationStore>,
}

impl AgentRouter {
    pub fn new(registry: AgentRegistry, coordination: Arc<dyn CoordinationStore>) -> Self {
        Self {
            registry,
            coordination,
        }
    }

    /// Pick the best-fit agent without reserving it.
    pub async fn route(&self, request: &RouteRequest) -> Result<ScoredAgent> {
        let mut candidates = Vec::new();
        for agent in self.registry.repository().list_active().await? {
            // Score against the authoritative load counter, not the
            // possibly stale persisted one.
            let mut agent = agent;
            agent.load = self.registry.refreshed_load(&agent).await;
            if let Some(score) = score_agent(&agent, request) {
                candidates.push(ScoredAgent { agent, score });
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.agent
                        .load
                        .current
                        .partial_cmp(&b.agent.load.current)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.agent.last_active_at.cmp(&b.agent.last_active_at))
        });

        let winner = candidates
            .into_iter()
            .next()
            .ok_or(OrchestratorError::NoAgentAvailable)?;
        debug!(
            "routed to agent '{}' with score {:.3}",
            winner.agent.name, winner.score
        );
        Ok(winner)
    }

    /// Route and atomically reserve the winner's load. The reservation
    /// retries the atomic check with exponential backoff before giving up
    /// with `AGENT_CONTENDED`, at which point the caller restarts routing.
    pub async fn route_and_reserve(
        &self,
        request: &RouteRequest,
    ) -> Result<(ScoredAgent, LoadReservation)> {
        let winner = self.route(request).await?;
        let reservation = self
            .reserve(&winner.agent, request.estimated_complexity)
            .await?;
        Ok((winner, reservation))
    }

    /// Atomic load reservation with bounded retries.
    pub async fn reserve(&self, agent: &Agent, complexity: f64) -> Result<LoadReservation> {
        let key = format!("agent_load:{}", agent.id);
        let mut backoff = Duration::from_millis(crate::constants::BACKOFF_BASE_MS);

        for attempt in 0..crate::constants::RESERVATION_RETRIES {
            let admitted = self
                .coordination
                .reserve_load(&key, complexity, agent.load.capacity)
                .await?;
            if admitted {
                info!(
                    "reserved {complexity} load on agent '{}' (attempt {})",
                    agent.name,
                    attempt + 1
                );
                return Ok(LoadReservation {
                    agent_id: agent.id,
                    amount: complexity,
                });
            }
            let jitter = rand::thread_rng().gen_range(0..crate::constants::BACKOFF_BASE_MS);
            tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
            backoff *= 2;
        }

        Err(OrchestratorError::AgentContended { agent_id: agent.id })
    }

    /// Release a reservation; guaranteed on completion, failure,
    /// cancellation, and eviction paths.
    pub async fn release(&self, reservation: &LoadReservation) -> Result<f64> {
        let key = format!("agent_load:{}", reservation.agent_id);
        self.coordination.release_load(&key, reservation.amount).await
    }
}

/// Score one agent for a request, or None when it fails a hard filter.
pub fn score_agent(agent: &Agent, request: &RouteRequest) -> Option<f64> {
    if !agent.is_active || agent.maintenance_mode {
        return None;
    }
    if agent.performance.tier == AgentTier::Degraded {
        return None;
    }
    if agent.load.is_overloaded() {
        return None;
    }
    if !request
        .required_capabilities
        .iter()
        .all(|capability| agent.has_capability(*capability))
    {
        return None;
    }
    let avoided = request.technologies.iter().any(|technology| {
        agent
            .avoided_technologies
            .iter()
            .any(|avoid| avoid.eq_ignore_ascii_case(technology))
    });
    if avoided {
        return None;
    }

    let capability_score = if request.required_capabilities.is_empty() {
        1.0
    } else {
        request
            .required_capabilities
            .iter()
            .map(|capability| {
                if agent.primary_capabilities.contains(capability) {
                    1.0
                } else if agent.secondary_capabilities.contains(capability) {
                    0.7
                } else {
                    0.3
                }
            })
            .sum::<f64>()
            / request.required_capabilities.len() as f64
    };

    let success_score = agent.performance.overall_success_rate();
    let headroom_score = agent.load.headroom();

    let technology_score = if request.technologies.is_empty() {
        1.0
    } else {
        let matches = request
            .technologies
            .iter()
            .filter(|technology| {
                agent
                    .preferred_technologies
                    .iter()
                    .any(|preferred| preferred.eq_ignore_ascii_case(technology))
            })
            .count();
        matches as f64 / request.technologies.len() as f64
    };

    let session_type_score = match request.session_type {
        None => 1.0,
        Some(session_type) => {
            if agent.preferred_session_types.is_empty()
                || agent.preferred_session_types.contains(&session_type)
            {
                1.0
            } else {
                0.3
            }
        }
    };

    let complexity_score = complexity_alignment(agent.complexity_preference, request.estimated_complexity);

    let base = WEIGHT_CAPABILITY * capability_score
        + WEIGHT_SUCCESS * success_score
        + WEIGHT_HEADROOM * headroom_score
        + WEIGHT_TECHNOLOGY * technology_score
        + WEIGHT_SESSION_TYPE * session_type_score
        + WEIGHT_COMPLEXITY * complexity_score;

    Some(base * agent.performance.tier.multiplier())
}

fn complexity_alignment(preference: ComplexityPreference, complexity: f64) -> f64 {
    use ComplexityPreference::*;
    if complexity >= 2.0 && matches!(preference, Complex | Expert) {
        1.0
    } else if complexity >= 1.5 && matches!(preference, Medium | Complex | Expert) {
        0.8
    } else {
        0.6
    }
}
