//! System-wide constants for the orchestration core.

/// Default TTL for a distributed lock. Must exceed the expected suspension
/// across persistence and coordination calls by more than one renewal interval.
pub const LOCK_TTL_SECS: u64 = 30;

/// Default timeout for a blocking lock acquisition.
pub const LOCK_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Interval between lock acquisition attempts while queued.
pub const LOCK_RETRY_INTERVAL_MS: u64 = 100;

/// Maximum depth of the wait-for graph walk during deadlock detection.
pub const DEADLOCK_SCAN_DEPTH: usize = 16;

/// Agents must heartbeat at least this often to be considered healthy.
pub const AGENT_HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// An agent silent for longer than this is marked inactive (not deregistered).
pub const AGENT_INACTIVE_AFTER_SECS: u64 = 120;

/// Timeout for a task dispatch call to an external agent.
pub const EXTERNAL_AGENT_TIMEOUT_SECS: u64 = 60;

/// Checkpoints retained per session unless the session overrides it.
pub const DEFAULT_CHECKPOINT_RETENTION: u32 = 100;

/// Sessions may be retried from FAILED/TIMEOUT/STOPPED at most this many times.
pub const MAX_SESSION_RETRIES: u32 = 3;

/// Optimistic-lock conflicts are retried this many times before surfacing.
pub const STALE_VERSION_RETRIES: u32 = 3;

/// Base delay for jittered exponential backoff on retryable conflicts.
pub const BACKOFF_BASE_MS: u64 = 50;

/// Agent load reservations retry the atomic check this many times.
pub const RESERVATION_RETRIES: u32 = 3;

/// Bounds for `session.max_duration_seconds`.
pub const MIN_SESSION_DURATION_SECS: u64 = 60;
pub const MAX_SESSION_DURATION_SECS: u64 = 86_400;

/// Duration applied when a create request does not set one and no
/// configured default overrides it.
pub const DEFAULT_SESSION_DURATION_SECS: u64 = 3_600;

/// Capacity of each in-process event broadcast channel. Delivery is
/// best-effort; lagging subscribers drop the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Rolling window for the per-tenant token quota.
pub const TOKEN_QUOTA_WINDOW_SECS: u64 = 86_400;

/// Interval for the registry heartbeat sweep.
pub const HEARTBEAT_SWEEP_INTERVAL_SECS: u64 = 15;

/// Minimum length for an agent system prompt template.
pub const MIN_SYSTEM_PROMPT_LEN: usize = 50;
