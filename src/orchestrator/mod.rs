//! Session orchestrator service
//!
//! Coordinates the persistence store, coordination store, lock manager,
//! lifecycle, task graph, registry, and broadcaster per use case. Every
//! mutating session operation runs inside the `session:execution:{id}` lock
//! (TTL 30 s); quota-sensitive admissions additionally hold
//! `quota:tenant:{id}`, acquired first to keep lock ordering ascending.
//! Events are emitted inside the lock, which is what makes per-session
//! ordering FIFO; the lock is released on every exit path (explicitly on
//! success, through the guard's drop on error).

pub mod quota;

pub use quota::QuotaEnforcer;

use crate::config::OrchestratorConfig;
use crate::coordination::CoordinationStore;
use crate::events::EventBroadcaster;
use crate::graph::{self, DecompositionOptions, Decomposer};
use crate::lifecycle;
use crate::lock::{AcquireOptions, LockConfig, LockGuard, LockManager};
use crate::models::{
    Capability, Checkpoint, ComplexityLevel, CreateSession, CreateTask, OrchestratorEvent,
    Priority, Session, SessionStatus, Task, TaskOutcome, TaskStatus,
};
use crate::registry::router::LoadReservation;
use crate::registry::{
    AgentRegistry, AgentRouter, DispatchResponse, ExternalAgentClient, RouteRequest, TaskDispatch,
};
use crate::store::{
    AgentRepository, MemoryEngine, Page, SessionListFilter, SessionRepository, TaskRepository,
    TenantRepository,
};
use crate::{tenant, validation, OrchestratorError, Result};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// What the downstream coding model produced for a session run.
#[derive(Debug, Clone)]
pub struct ExecutorOutcome {
    pub result: serde_json::Value,
    pub success_rate: f64,
    pub confidence: Option<f64>,
    pub tokens_used: u64,
}

/// The downstream coding-model endpoint, seen as an opaque task executor.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, session: &Session, task: Option<&Task>) -> Result<ExecutorOutcome>;
}

#[derive(Clone)]
pub struct SessionOrchestrator {
    engine: Arc<MemoryEngine>,
    sessions: SessionRepository,
    tasks: TaskRepository,
    tenants: TenantRepository,
    registry: AgentRegistry,
    router: AgentRouter,
    locks: Arc<LockManager>,
    decomposer: Arc<Decomposer>,
    events: EventBroadcaster,
    quota: QuotaEnforcer,
    defaults: OrchestratorConfig,
    reservations: Arc<RwLock<HashMap<Uuid, LoadReservation>>>,
}

impl SessionOrchestrator {
    pub fn new(engine: Arc<MemoryEngine>, coordination: Arc<dyn CoordinationStore>) -> Self {
        Self::with_config(
            engine,
            coordination,
            LockConfig::default(),
            OrchestratorConfig::default(),
        )
    }

    pub fn with_lock_config(
        engine: Arc<MemoryEngine>,
        coordination: Arc<dyn CoordinationStore>,
        lock_config: LockConfig,
    ) -> Self {
        Self::with_config(
            engine,
            coordination,
            lock_config,
            OrchestratorConfig::default(),
        )
    }

    pub fn with_config(
        engine: Arc<MemoryEngine>,
        coordination: Arc<dyn CoordinationStore>,
        lock_config: LockConfig,
        defaults: OrchestratorConfig,
    ) -> Self {
        let sessions = SessionRepository::new(Arc::new(engine.sessions.clone()));
        let tasks = TaskRepository::new(Arc::new(engine.tasks.clone()));
        let tenants = TenantRepository::new(Arc::new(engine.tenants.clone()));
        let agents = AgentRepository::new(Arc::new(engine.agents.clone()));
        let events = EventBroadcaster::new(coordination.clone());
        let registry = AgentRegistry::new(
            agents,
            tenants.clone(),
            coordination.clone(),
            events.clone(),
        );
        let router = AgentRouter::new(registry.clone(), coordination.clone());
        let locks = LockManager::new(coordination.clone(), lock_config);
        let quota = QuotaEnforcer::new(
            tenants.clone(),
            sessions.clone(),
            coordination.clone(),
            defaults.max_concurrent_sessions,
        );

        Self {
            engine,
            sessions,
            tasks,
            tenants,
            registry,
            router,
            locks,
            decomposer: Arc::new(Decomposer::with_builtins()),
            events,
            quota,
            defaults,
            reservations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn router(&self) -> &AgentRouter {
        &self.router
    }

    pub fn tenants(&self) -> &TenantRepository {
        &self.tenants
    }

    pub fn locks(&self) -> Arc<LockManager> {
        self.locks.clone()
    }

    async fn lock_session(&self, id: Uuid, priority: Priority) -> Result<LockGuard> {
        self.locks
            .acquire(
                &format!("session:execution:{id}"),
                AcquireOptions {
                    ttl: Some(Duration::from_secs(crate::constants::LOCK_TTL_SECS)),
                    priority: priority.weight(),
                    ..AcquireOptions::default()
                },
            )
            .await
    }

    async fn lock_quota(&self, tenant_id: Uuid) -> Result<LockGuard> {
        self.locks
            .acquire(
                &format!("quota:tenant:{tenant_id}"),
                AcquireOptions::default(),
            )
            .await
    }

    /// Load-mutate-update with bounded retries on optimistic conflicts.
    async fn save_session<F>(&self, id: Uuid, mut mutate: F) -> Result<Session>
    where
        F: FnMut(&mut Session) -> Result<()>,
    {
        let mut backoff = Duration::from_millis(crate::constants::BACKOFF_BASE_MS);
        let mut attempts = 0;
        loop {
            let mut session = self.sessions.get(id).await?;
            mutate(&mut session)?;
            match self.sessions.update(session).await {
                Ok(session) => return Ok(session),
                Err(error @ OrchestratorError::StaleVersion { .. }) => {
                    attempts += 1;
                    if attempts > crate::constants::STALE_VERSION_RETRIES {
                        return Err(error);
                    }
                    let jitter = rand::thread_rng().gen_range(0..crate::constants::BACKOFF_BASE_MS);
                    tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                    backoff *= 2;
                }
                Err(error) => return Err(error),
            }
        }
    }

    // ----- session use cases -------------------------------------------------

    /// Create a session in PENDING. Admission (concurrent-session and token
    /// quotas) is checked inside the tenant quota lock.
    pub async fn create_session(&self, request: CreateSession) -> Result<Session> {
        let tenant_id = tenant::current_tenant()?;
        validation::validate_session_title(&request.title)?;
        let max_duration = request
            .max_duration_seconds
            .unwrap_or(self.defaults.session_timeout_seconds);
        validation::validate_session_duration(max_duration)?;

        if let Some(parent_id) = request.parent_id {
            // The scoped repository hides other tenants' sessions, so a
            // foreign parent surfaces as NOT_FOUND rather than FORBIDDEN.
            self.sessions.get(parent_id).await.map_err(|_| {
                OrchestratorError::NotFound(format!("parent session {parent_id}"))
            })?;
        }

        let quota_guard = self.lock_quota(tenant_id).await?;
        let admitted = async {
            self.quota.check_session_admission().await?;
            self.quota.ensure_token_headroom().await?;
            let mut session = Session::from_request(tenant_id, request);
            session.max_duration_seconds = max_duration;
            session.max_retries = self.defaults.max_retry_attempts;
            self.sessions.insert(session).await
        }
        .await;
        let _ = quota_guard.release().await;
        let session = admitted?;

        info!("created session {} '{}'", session.id, session.title);
        self.events
            .publish(OrchestratorEvent::SessionCreated {
                tenant_id,
                session_id: session.id,
                title: session.title.clone(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(session)
    }

    /// Move a session into RUNNING, stamping `metrics.started_at` once.
    pub async fn start_session(&self, id: Uuid) -> Result<Session> {
        let tenant_id = tenant::current_tenant()?;
        let peek = self.sessions.get(id).await?;

        let quota_guard = self.lock_quota(tenant_id).await?;
        let session_guard = self.lock_session(id, peek.priority).await?;

        let outcome = async {
            // Admission could have tightened since creation.
            let allowed = self.quota.session_limit().await?;
            let active = self.sessions.active_count().await?;
            if active > allowed as u64 {
                return Err(OrchestratorError::QuotaExceeded(format!(
                    "tenant has {active} active sessions of {allowed} allowed"
                )));
            }
            self.quota.ensure_token_headroom().await?;

            let from = self.sessions.get(id).await?.status;
            let session = self
                .save_session(id, |session| {
                    lifecycle::transition(session, SessionStatus::Running)
                })
                .await?;

            self.events
                .publish(OrchestratorEvent::SessionStatusChanged {
                    tenant_id,
                    session_id: id,
                    from,
                    to: SessionStatus::Running,
                    timestamp: Utc::now(),
                })
                .await;
            Ok(session)
        }
        .await;

        let _ = session_guard.release().await;
        let _ = quota_guard.release().await;
        outcome
    }

    /// Append a checkpoint to an active session.
    pub async fn add_checkpoint(&self, id: Uuid, data: serde_json::Value) -> Result<u64> {
        let peek = self.sessions.get(id).await?;
        let guard = self.lock_session(id, peek.priority).await?;

        let mut sequence = 0;
        let outcome = self
            .save_session(id, |session| {
                if !matches!(
                    session.status,
                    SessionStatus::Running | SessionStatus::Paused | SessionStatus::Degraded
                ) {
                    return Err(OrchestratorError::Validation(format!(
                        "checkpoints require an active session, status is {}",
                        session.status.as_str()
                    )));
                }
                sequence = lifecycle::add_checkpoint(session, data.clone())?;
                Ok(())
            })
            .await;

        let _ = guard.release().await;
        outcome.map(|_| sequence)
    }

    /// Complete a RUNNING session; `success_rate < 1` lands in
    /// PARTIALLY_COMPLETED.
    pub async fn complete_session(
        &self,
        id: Uuid,
        result: serde_json::Value,
        success_rate: f64,
        confidence: Option<f64>,
    ) -> Result<Session> {
        let tenant_id = tenant::current_tenant()?;
        let peek = self.sessions.get(id).await?;
        let guard = self.lock_session(id, peek.priority).await?;

        let target = if success_rate >= 1.0 {
            SessionStatus::Completed
        } else {
            SessionStatus::PartiallyCompleted
        };

        let outcome = async {
            let from = self.sessions.get(id).await?.status;
            let session = self
                .save_session(id, |session| {
                    lifecycle::transition(session, target)?;
                    session.result = Some(result.clone());
                    session.metrics.success_rate = success_rate.clamp(0.0, 1.0);
                    if let Some(confidence) = confidence {
                        session.metrics.confidence = confidence.clamp(0.0, 1.0);
                    }
                    Ok(())
                })
                .await?;

            self.release_session_reservations(id).await;

            self.events
                .publish(OrchestratorEvent::SessionStatusChanged {
                    tenant_id,
                    session_id: id,
                    from,
                    to: target,
                    timestamp: Utc::now(),
                })
                .await;
            self.events
                .publish(OrchestratorEvent::SessionCompleted {
                    tenant_id,
                    session_id: id,
                    success_rate,
                    timestamp: Utc::now(),
                })
                .await;
            Ok(session)
        }
        .await;

        let _ = guard.release().await;
        outcome
    }

    /// Record a failure. Non-retryable failures close the retry gate by
    /// exhausting the retry budget.
    pub async fn fail_session(&self, id: Uuid, error: &str, retryable: bool) -> Result<Session> {
        let tenant_id = tenant::current_tenant()?;
        let peek = self.sessions.get(id).await?;
        let guard = self.lock_session(id, peek.priority).await?;

        let outcome = async {
            let session = self
                .save_session(id, |session| {
                    if session.status.is_terminal() {
                        return Err(OrchestratorError::InvalidTransition {
                            from: session.status.as_str().to_string(),
                            to: SessionStatus::Failed.as_str().to_string(),
                        });
                    }
                    lifecycle::transition(session, SessionStatus::Failed)?;
                    session.error = Some(error.to_string());
                    if retryable {
                        session.metrics.retry_count += 1;
                    } else {
                        session.metrics.retry_count = session.max_retries;
                    }
                    Ok(())
                })
                .await?;

            self.release_session_reservations(id).await;

            self.events
                .publish(OrchestratorEvent::SessionFailed {
                    tenant_id,
                    session_id: id,
                    error: error.to_string(),
                    retryable,
                    timestamp: Utc::now(),
                })
                .await;
            Ok(session)
        }
        .await;

        let _ = guard.release().await;
        outcome
    }

    /// Arm a recovery attempt: FAILED/TIMEOUT/STOPPED back to PENDING,
    /// gated on retry budget and checkpoint existence.
    pub async fn retry_session(&self, id: Uuid) -> Result<Session> {
        let tenant_id = tenant::current_tenant()?;
        let peek = self.sessions.get(id).await?;
        let guard = self.lock_session(id, peek.priority).await?;

        let outcome = async {
            let from = self.sessions.get(id).await?.status;
            let session = self
                .save_session(id, |session| {
                    lifecycle::transition(session, SessionStatus::Pending)
                })
                .await?;

            self.events
                .publish(OrchestratorEvent::SessionStatusChanged {
                    tenant_id,
                    session_id: id,
                    from,
                    to: SessionStatus::Pending,
                    timestamp: Utc::now(),
                })
                .await;
            Ok(session)
        }
        .await;

        let _ = guard.release().await;
        outcome
    }

    /// Cancel a non-terminal session, cancelling its open tasks and
    /// releasing any agent reservations.
    pub async fn cancel_session(&self, id: Uuid) -> Result<Session> {
        let tenant_id = tenant::current_tenant()?;
        let peek = self.sessions.get(id).await?;
        let guard = self.lock_session(id, peek.priority).await?;

        let outcome = async {
            let from = self.sessions.get(id).await?.status;
            let session = self
                .save_session(id, |session| lifecycle::cancel(session))
                .await?;

            for mut task in self.tasks.list_by_session(id).await? {
                if task.status.is_terminal() || task.status == TaskStatus::InProgress {
                    continue;
                }
                let task_from = task.status;
                if graph::transition_task(&mut task, TaskStatus::Cancelled).is_ok() {
                    let task = self.tasks.update(task).await?;
                    self.release_task_reservation(task.id).await;
                    self.events
                        .publish(OrchestratorEvent::TaskStatusChanged {
                            tenant_id,
                            session_id: id,
                            task_id: task.id,
                            from: task_from,
                            to: TaskStatus::Cancelled,
                            timestamp: Utc::now(),
                        })
                        .await;
                }
            }
            self.release_session_reservations(id).await;

            self.events
                .publish(OrchestratorEvent::SessionStatusChanged {
                    tenant_id,
                    session_id: id,
                    from,
                    to: SessionStatus::Cancelled,
                    timestamp: Utc::now(),
                })
                .await;
            Ok(session)
        }
        .await;

        let _ = guard.release().await;
        outcome
    }

    /// Soft-delete a session; it disappears from default reads.
    pub async fn delete_session(&self, id: Uuid) -> Result<()> {
        let session = self.sessions.get(id).await?;
        self.sessions.soft_delete(id, session.version).await
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Session> {
        self.sessions.get(id).await
    }

    pub async fn list_sessions(
        &self,
        filter: SessionListFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Page<Session>> {
        self.sessions.list(filter, page, page_size).await
    }

    pub async fn search_sessions(&self, text: &str) -> Result<Vec<Session>> {
        self.sessions.search(text).await
    }

    /// Checkpoints newer than `since`, for observer replay.
    pub async fn checkpoints_since(&self, id: Uuid, since: u64) -> Result<Vec<Checkpoint>> {
        let session = self.sessions.get(id).await?;
        Ok(lifecycle::checkpoints_since(&session, since)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Health score from the session metrics and its subtask completion.
    pub async fn session_health(&self, id: Uuid) -> Result<f64> {
        let session = self.sessions.get(id).await?;
        let tasks = self.tasks.list_by_session(id).await?;
        let completion = if tasks.is_empty() {
            0.0
        } else {
            tasks
                .iter()
                .filter(|task| task.status == TaskStatus::Completed)
                .count() as f64
                / tasks.len() as f64
        };
        Ok(lifecycle::health_score(&session, completion, Utc::now()))
    }

    /// Record tokens spent on behalf of a session, in the session metrics
    /// and in the tenant's rolling window.
    pub async fn record_token_usage(&self, id: Uuid, tokens: u64) -> Result<()> {
        self.quota.charge_tokens(tokens).await?;
        self.save_session(id, |session| {
            session.metrics.tokens_used += tokens;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Run the downstream executor for a RUNNING session, bounded by the
    /// session's `max_duration_seconds` and by the cancellation signal.
    ///
    /// A timeout moves the session to TIMEOUT (retryable); an executor
    /// error feeds `fail_session` (retryable); cancellation leaves the
    /// session exactly as it was.
    pub async fn execute_session<C>(
        &self,
        id: Uuid,
        executor: Arc<dyn TaskExecutor>,
        cancel: C,
    ) -> Result<Session>
    where
        C: Future<Output = ()> + Send,
    {
        let session = self.sessions.get(id).await?;
        if session.status != SessionStatus::Running {
            return Err(OrchestratorError::InvalidTransition {
                from: session.status.as_str().to_string(),
                to: "executor run".to_string(),
            });
        }

        let limit = Duration::from_secs(session.max_duration_seconds);
        tokio::pin!(cancel);
        let run = tokio::select! {
            _ = &mut cancel => {
                // Pre-call state preserved; nothing was committed.
                return Err(OrchestratorError::Cancelled);
            }
            run = tokio::time::timeout(limit, executor.execute(&session, None)) => run,
        };

        match run {
            Err(_elapsed) => {
                let peek = self.sessions.get(id).await?;
                let guard = self.lock_session(id, peek.priority).await?;
                let transitioned = self
                    .save_session(id, |session| {
                        lifecycle::transition(session, SessionStatus::Timeout)?;
                        session.metrics.retry_count += 1;
                        Ok(())
                    })
                    .await;
                let _ = guard.release().await;
                transitioned?;
                Err(OrchestratorError::Timeout {
                    message: format!("executor exceeded {}s", session.max_duration_seconds),
                })
            }
            Ok(Err(error)) => {
                warn!("executor failed for session {id}: {error}");
                self.fail_session(id, &error.to_string(), true).await?;
                Err(OrchestratorError::ExecutorFailed(error.to_string()))
            }
            Ok(Ok(outcome)) => {
                if outcome.tokens_used > 0 {
                    self.record_token_usage(id, outcome.tokens_used).await?;
                }
                self.complete_session(id, outcome.result, outcome.success_rate, outcome.confidence)
                    .await
            }
        }
    }

    // ----- task use cases ----------------------------------------------------

    /// Create a task under a session, keeping the DAG acyclic.
    pub async fn create_task(&self, request: CreateTask) -> Result<Task> {
        let tenant_id = tenant::current_tenant()?;
        validation::validate_task_title(&request.title)?;
        self.sessions.get(request.session_id).await?;

        let task = Task::from_request(tenant_id, request);
        let mut graph_tasks = self.tasks.list_by_session(task.session_id).await?;
        graph_tasks.push(task.clone());
        graph::detect_cycle(&graph_tasks)?;

        self.tasks.insert(task).await
    }

    /// Derive a task plan from the session's initial prompt: a root task
    /// plus its decomposition.
    pub async fn plan_session(&self, id: Uuid) -> Result<Vec<Task>> {
        let tenant_id = tenant::current_tenant()?;
        let session = self.sessions.get(id).await?;
        if session.status.is_terminal() {
            return Err(OrchestratorError::Validation(
                "cannot plan a terminal session".to_string(),
            ));
        }

        let mut root_request = CreateTask::new(
            id,
            format!("Implement session goal: {}", session.title),
            session.initial_prompt.clone(),
            crate::models::TaskType::Feature,
        );
        root_request.priority = session.priority;
        let root = Task::from_request(tenant_id, root_request);

        let subtasks = self
            .decomposer
            .decompose(&root, &DecompositionOptions::default())?;

        let inserted = self
            .engine
            .unit_of_work(|| async {
                let mut inserted = vec![self.tasks.insert(root.clone()).await?];
                for task in &subtasks {
                    inserted.push(self.tasks.insert(task.clone()).await?);
                }
                Ok(inserted)
            })
            .await?;

        self.refresh_readiness(id).await?;
        Ok(inserted)
    }

    /// Split an existing task via the decomposition engine; all subtasks
    /// land atomically.
    pub async fn decompose_task(
        &self,
        task_id: Uuid,
        mut options: DecompositionOptions,
    ) -> Result<Vec<Task>> {
        let task = self.tasks.get(task_id).await?;
        options.depth = self.task_depth(&task).await?;

        let subtasks = self.decomposer.decompose(&task, &options)?;
        let inserted = self
            .engine
            .unit_of_work(|| async {
                let mut inserted = Vec::with_capacity(subtasks.len());
                for task in &subtasks {
                    inserted.push(self.tasks.insert(task.clone()).await?);
                }
                Ok(inserted)
            })
            .await?;

        self.refresh_readiness(task.session_id).await?;
        Ok(inserted)
    }

    async fn task_depth(&self, task: &Task) -> Result<u32> {
        let mut depth = 0;
        let mut cursor = task.parent_task_id;
        while let Some(parent_id) = cursor {
            depth += 1;
            if depth > 16 {
                break;
            }
            cursor = self.tasks.get(parent_id).await?.parent_task_id;
        }
        Ok(depth)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.tasks.get(id).await
    }

    /// Add a dependency edge. Structural mutations re-run cycle detection
    /// over the whole session graph before anything is persisted.
    pub async fn add_task_dependency(
        &self,
        task_id: Uuid,
        dependency: crate::models::TaskDependency,
    ) -> Result<Task> {
        let mut task = self.tasks.get(task_id).await?;
        self.tasks.get(dependency.target_task_id).await?;
        task.dependencies.push(dependency);

        let mut graph_tasks = self.tasks.list_by_session(task.session_id).await?;
        if let Some(existing) = graph_tasks.iter_mut().find(|t| t.id == task_id) {
            *existing = task.clone();
        }
        graph::detect_cycle(&graph_tasks)?;

        self.tasks.update(task).await
    }

    /// The dependency edges of one task with their current satisfaction.
    pub async fn task_dependencies(&self, id: Uuid) -> Result<Vec<(Task, bool)>> {
        let task = self.tasks.get(id).await?;
        let mut resolved = Vec::with_capacity(task.dependencies.len());
        for dependency in &task.dependencies {
            let predecessor = self.tasks.get(dependency.target_task_id).await?;
            let satisfied = graph::start_satisfied(dependency.kind, &predecessor);
            resolved.push((predecessor, satisfied));
        }
        Ok(resolved)
    }

    fn route_complexity(task: &Task) -> f64 {
        match task.complexity_level() {
            ComplexityLevel::Trivial => 0.5,
            ComplexityLevel::Simple => 1.0,
            ComplexityLevel::Moderate => 1.5,
            ComplexityLevel::Complex => 2.0,
            ComplexityLevel::Expert => 3.0,
        }
    }

    /// Route a PENDING/READY task to the best-fit agent and reserve its
    /// load. On contention the reservation backs off and this returns
    /// `AGENT_CONTENDED`; the caller restarts routing.
    pub async fn route_task(&self, task_id: Uuid) -> Result<Task> {
        let tenant_id = tenant::current_tenant()?;
        let task = self.tasks.get(task_id).await?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
            return Err(OrchestratorError::InvalidTransition {
                from: task.status.as_str().to_string(),
                to: TaskStatus::Assigned.as_str().to_string(),
            });
        }

        let session = self.sessions.get(task.session_id).await?;
        let capabilities = task
            .estimate
            .as_ref()
            .map(|estimate| estimate.required_capabilities.clone())
            .filter(|capabilities| !capabilities.is_empty())
            .unwrap_or_else(|| vec![Capability::CodeGeneration]);

        let request = RouteRequest {
            required_capabilities: capabilities,
            estimated_complexity: Self::route_complexity(&task),
            technologies: task.tags.clone(),
            session_type: Some(session.session_type),
        };

        let (winner, reservation) = self.router.route_and_reserve(&request).await?;
        self.reservations
            .write()
            .await
            .insert(task_id, reservation);

        let from = task.status;
        let mut task = task;
        graph::transition_task(&mut task, TaskStatus::Assigned)?;
        task.assigned_agent_id = Some(winner.agent.id);
        let task = self.tasks.update(task).await?;

        self.events
            .publish(OrchestratorEvent::TaskStatusChanged {
                tenant_id,
                session_id: task.session_id,
                task_id,
                from,
                to: TaskStatus::Assigned,
                timestamp: Utc::now(),
            })
            .await;
        Ok(task)
    }

    pub async fn start_task(&self, task_id: Uuid) -> Result<Task> {
        self.transition_task_tracked(task_id, TaskStatus::InProgress)
            .await
    }

    /// Send an ASSIGNED task to its external agent's endpoint. Internal
    /// agents run in-process through the task executor instead.
    pub async fn dispatch_task(&self, task_id: Uuid) -> Result<DispatchResponse> {
        let task = self.tasks.get(task_id).await?;
        let agent_id = task.assigned_agent_id.ok_or_else(|| {
            OrchestratorError::Validation("task has no assigned agent".to_string())
        })?;
        let agent = self.registry.get(agent_id).await?;
        if !agent.is_external {
            return Err(OrchestratorError::Validation(format!(
                "agent {agent_id} is not external"
            )));
        }
        let session = self.sessions.get(task.session_id).await?;

        let dispatch = TaskDispatch {
            task_id: task.id,
            session_id: session.id,
            prompt: format!("{}\n\n{}", task.title, task.description),
            context: HashMap::from([(
                "initial_prompt".to_string(),
                serde_json::Value::String(session.initial_prompt.clone()),
            )]),
        };
        ExternalAgentClient::new()?.dispatch(&agent, &dispatch).await
    }

    /// Complete a task: finish-side dependencies must hold; the assigned
    /// agent's counters fold in the outcome and its reservation is freed.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
        quality: f64,
        execution_seconds: f64,
    ) -> Result<Task> {
        let task = self.tasks.get(task_id).await?;
        let session_tasks = self.tasks.list_by_session(task.session_id).await?;
        let by_id: HashMap<Uuid, Task> = session_tasks
            .into_iter()
            .map(|task| (task.id, task))
            .collect();
        if !graph::can_complete(&task, &by_id) {
            return Err(OrchestratorError::Validation(
                "finish dependencies are not satisfied".to_string(),
            ));
        }

        let completed = self
            .transition_task_tracked(task_id, TaskStatus::Completed)
            .await?;
        let completed = {
            let mut task = completed;
            task.result = Some(result);
            self.tasks.update(task).await?
        };

        if let Some(agent_id) = completed.assigned_agent_id {
            let outcome = if quality >= 0.5 {
                TaskOutcome::Success
            } else {
                TaskOutcome::Partial
            };
            let capabilities = completed
                .estimate
                .as_ref()
                .map(|estimate| estimate.required_capabilities.clone())
                .unwrap_or_default();
            self.registry
                .record_task_outcome(
                    agent_id,
                    outcome,
                    quality,
                    execution_seconds,
                    0.0,
                    0.0,
                    &capabilities,
                    &completed.tags,
                )
                .await?;
        }
        self.release_task_reservation(task_id).await;
        self.refresh_readiness(completed.session_id).await?;
        Ok(completed)
    }

    pub async fn fail_task(&self, task_id: Uuid, error: &str) -> Result<Task> {
        let failed = self
            .transition_task_tracked(task_id, TaskStatus::Failed)
            .await?;
        let failed = {
            let mut task = failed;
            task.error = Some(error.to_string());
            self.tasks.update(task).await?
        };

        if let Some(agent_id) = failed.assigned_agent_id {
            self.registry
                .record_task_outcome(
                    agent_id,
                    TaskOutcome::Failure,
                    0.0,
                    0.0,
                    0.0,
                    0.0,
                    &[],
                    &failed.tags,
                )
                .await?;
        }
        self.release_task_reservation(task_id).await;
        Ok(failed)
    }

    async fn transition_task_tracked(&self, task_id: Uuid, to: TaskStatus) -> Result<Task> {
        let tenant_id = tenant::current_tenant()?;
        let mut task = self.tasks.get(task_id).await?;
        let from = task.status;
        graph::transition_task(&mut task, to)?;
        let task = self.tasks.update(task).await?;

        self.events
            .publish(OrchestratorEvent::TaskStatusChanged {
                tenant_id,
                session_id: task.session_id,
                task_id,
                from,
                to,
                timestamp: Utc::now(),
            })
            .await;
        Ok(task)
    }

    /// Sweep a session's tasks: promote PENDING tasks whose dependencies
    /// now hold to READY, and skip tasks whose required predecessors ended
    /// unsatisfiably. Readiness is monotonic.
    pub async fn refresh_readiness(&self, session_id: Uuid) -> Result<Vec<Uuid>> {
        let tenant_id = tenant::current_tenant()?;
        let tasks = self.tasks.list_by_session(session_id).await?;
        let by_id: HashMap<Uuid, Task> = tasks.iter().map(|task| (task.id, task.clone())).collect();

        let mut promoted = Vec::new();
        for task in tasks {
            let target = if task.status == TaskStatus::Pending && graph::is_ready(&task, &by_id) {
                TaskStatus::Ready
            } else if matches!(task.status, TaskStatus::Pending | TaskStatus::Ready)
                && graph::unsatisfiable(&task, &by_id)
            {
                TaskStatus::Skipped
            } else {
                continue;
            };

            let from = task.status;
            let mut task = task;
            if graph::transition_task(&mut task, target).is_ok() {
                let task = self.tasks.update(task).await?;
                if target == TaskStatus::Ready {
                    promoted.push(task.id);
                }
                self.events
                    .publish(OrchestratorEvent::TaskStatusChanged {
                        tenant_id,
                        session_id,
                        task_id: task.id,
                        from,
                        to: target,
                        timestamp: Utc::now(),
                    })
                    .await;
            }
        }
        promoted.sort();
        Ok(promoted)
    }

    async fn release_task_reservation(&self, task_id: Uuid) {
        let reservation = self.reservations.write().await.remove(&task_id);
        if let Some(reservation) = reservation {
            if let Err(error) = self.router.release(&reservation).await {
                warn!(
                    "failed to release reservation for task {task_id}: {error}"
                );
            }
        }
    }

    async fn release_session_reservations(&self, session_id: Uuid) {
        let tasks = match self.tasks.list_by_session(session_id).await {
            Ok(tasks) => tasks,
            Err(_) => return,
        };
        for task in tasks {
            self.release_task_reservation(task.id).await;
        }
    }
}
