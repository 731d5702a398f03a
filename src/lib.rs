//! # Conductor Core
//!
//! Conductor Core is an orchestration control plane for autonomous coding
//! sessions. It persists a user-described coding task as a long-lived
//! session, decomposes it into a dependency graph of subtasks, routes each
//! subtask to a best-fit agent from a registry of specialized workers,
//! serializes concurrent mutations through a distributed lock, checkpoints
//! progress for recovery, and streams state changes to observers.
//!
//! ## Architecture
//!
//! The kernel is built from small layers:
//! - **Tenant context**: call-scoped tenant binding read by every store
//! - **Persistence store**: ordered, versioned record store behind a trait
//! - **Coordination store**: ephemeral KV with atomic scripts (memory/redis)
//! - **Distributed lock**: fair, renewable, owner-verified mutexes
//! - **Session lifecycle**: the 12-state machine with checkpoints
//! - **Task graph**: DAG, PERT estimation, rule-driven decomposition
//! - **Agent registry & router**: capability-weighted routing with load
//!   reservation
//! - **Session orchestrator**: the use cases, quota-gated and lock-serialized
//! - **Event broadcast**: per-tenant fan-out, in-process and cross-node
//!
//! Transport (HTTP/WebSocket), dashboards, and deployment live outside this
//! crate; the orchestrator's methods and typed errors are the contract they
//! build on.

/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Coordination store: ephemeral KV, scripts, pub/sub
pub mod coordination;
/// Error types and machine codes
pub mod error;
/// Event broadcast to observers
pub mod events;
/// Task DAG, estimation, and decomposition
pub mod graph;
/// Session lifecycle state machine
pub mod lifecycle;
/// Distributed locking
pub mod lock;
/// Core data models
pub mod models;
/// Session orchestrator service
pub mod orchestrator;
/// Agent registry, router, and external dispatch
pub mod registry;
/// Persistence store and repositories
pub mod store;
/// Call-scoped tenant context
pub mod tenant;
/// Field validators
pub mod validation;

#[cfg(test)]
mod tests;

pub use error::{OrchestratorError, Result};
