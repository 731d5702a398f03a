//! Session lifecycle state machine
//!
//! Owns every status change a session can make: the transition map, the
//! once-only metric stamps, the retry gate out of FAILED/TIMEOUT/STOPPED,
//! checkpoint append/eviction, and the health score. Callers never assign
//! `Session::status` directly.

use crate::models::{Checkpoint, Session, SessionStatus};
use crate::{OrchestratorError, Result};
use chrono::{DateTime, Utc};

/// States reachable from `from` in a single step, not counting the
/// checkpoint-gated retry edges.
pub fn allowed_transitions(from: SessionStatus) -> &'static [SessionStatus] {
    use SessionStatus::*;
    match from {
        Pending => &[Queued, Running, Cancelled],
        Queued => &[Running, Cancelled],
        Running => &[
            Paused,
            Completed,
            PartiallyCompleted,
            Failed,
            Timeout,
            Stopped,
            Degraded,
        ],
        Paused => &[Running, Cancelled, Stopped],
        Degraded => &[Running, Failed, Stopped],
        // Only the retry edge leads out of these; `transition` gates it.
        Failed | Timeout | Stopped => &[Pending],
        Completed | PartiallyCompleted | Cancelled | Orphaned => &[],
    }
}

/// Whether the retry edge back to PENDING is currently open: fewer than
/// `max_retries` attempts so far and at least one checkpoint to resume from.
pub fn can_retry(session: &Session) -> bool {
    session.status.is_resumable()
        && session.metrics.retry_count < session.max_retries
        && !session.checkpoints.is_empty()
}

/// Apply a status transition, stamping the derived metric timestamps.
///
/// `started_at`, `completed_at`, and `failed_at` are each written exactly
/// once, on the first entry into the corresponding state.
pub fn transition(session: &mut Session, to: SessionStatus) -> Result<()> {
    let from = session.status;

    let permitted = match (from, to) {
        (SessionStatus::Failed, SessionStatus::Pending)
        | (SessionStatus::Timeout, SessionStatus::Pending)
        | (SessionStatus::Stopped, SessionStatus::Pending) => can_retry(session),
        _ => allowed_transitions(from).contains(&to),
    };

    if !permitted {
        return Err(OrchestratorError::InvalidTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }

    let now = Utc::now();
    session.status = to;
    session.status_updated_at = now;

    match to {
        SessionStatus::Running => {
            if session.metrics.started_at.is_none() {
                session.metrics.started_at = Some(now);
            }
        }
        SessionStatus::Completed => {
            if session.metrics.completed_at.is_none() {
                session.metrics.completed_at = Some(now);
            }
            stamp_duration(session, now);
        }
        SessionStatus::PartiallyCompleted => {
            stamp_duration(session, now);
        }
        SessionStatus::Failed => {
            if session.metrics.failed_at.is_none() {
                session.metrics.failed_at = Some(now);
            }
            stamp_duration(session, now);
        }
        _ => {}
    }

    Ok(())
}

/// Cancel from any non-terminal state.
///
/// The routine map only reaches CANCELLED from PENDING/QUEUED/PAUSED; the
/// cancel operation is privileged and short-circuits the intermediate hops
/// for in-flight sessions.
pub fn cancel(session: &mut Session) -> Result<()> {
    let from = session.status;
    if from.is_terminal() {
        return Err(OrchestratorError::InvalidTransition {
            from: from.as_str().to_string(),
            to: SessionStatus::Cancelled.as_str().to_string(),
        });
    }
    let now = Utc::now();
    session.status = SessionStatus::Cancelled;
    session.status_updated_at = now;
    stamp_duration(session, now);
    Ok(())
}

fn stamp_duration(session: &mut Session, now: DateTime<Utc>) {
    if let Some(started) = session.metrics.started_at {
        session.metrics.total_duration_seconds =
            (now - started).num_milliseconds() as f64 / 1000.0;
    }
}

/// Append a checkpoint: sequence = max(existing) + 1, counter and
/// `last_checkpoint_at` kept in sync, oldest evicted past the retention cap.
pub fn add_checkpoint(session: &mut Session, data: serde_json::Value) -> Result<u64> {
    let sequence = session.last_checkpoint_sequence() + 1;
    let now = Utc::now();
    session.checkpoints.push(Checkpoint {
        sequence,
        data,
        created_at: now,
    });

    let retention = session.checkpoint_retention.max(1) as usize;
    if session.checkpoints.len() > retention {
        let excess = session.checkpoints.len() - retention;
        session.checkpoints.drain(..excess);
    }

    session.metrics.checkpoint_count = session.checkpoints.len() as u32;
    session.metrics.last_checkpoint_at = Some(now);
    Ok(sequence)
}

/// Checkpoints with a sequence greater than `since`, for replay.
pub fn checkpoints_since(session: &Session, since: u64) -> Vec<&Checkpoint> {
    session
        .checkpoints
        .iter()
        .filter(|checkpoint| checkpoint.sequence > since)
        .collect()
}

/// Composite health score in [0, 1].
///
/// Weights: subtask completion 0.4, API error rate 0.2, retry rate 0.2,
/// elapsed/max_duration 0.2; the error-rate, retry, and elapsed components
/// score their inverse.
pub fn health_score(session: &Session, subtask_completion: f64, now: DateTime<Utc>) -> f64 {
    let completion = subtask_completion.clamp(0.0, 1.0);

    let error_rate = if session.metrics.api_calls == 0 {
        0.0
    } else {
        session.metrics.api_errors as f64 / session.metrics.api_calls as f64
    };

    let retry_rate = session.metrics.retry_count as f64 / session.max_retries.max(1) as f64;

    let elapsed_ratio = if session.max_duration_seconds == 0 {
        1.0
    } else {
        (session.elapsed_seconds(now) / session.max_duration_seconds as f64).clamp(0.0, 1.0)
    };

    0.4 * completion
        + 0.2 * (1.0 - error_rate.clamp(0.0, 1.0))
        + 0.2 * (1.0 - retry_rate.clamp(0.0, 1.0))
        + 0.2 * (1.0 - elapsed_ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateSession, Priority, SessionType};
    use serde_json::json;
    use uuid::Uuid;

    fn session() -> Session {
        Session::from_request(
            Uuid::new_v4(),
            CreateSession::new(
                "Implement OAuth token refresh",
                "Add rotating refresh tokens",
                SessionType::Execution,
                Priority::High,
            ),
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut s = session();
        transition(&mut s, SessionStatus::Queued).unwrap();
        transition(&mut s, SessionStatus::Running).unwrap();
        assert!(s.metrics.started_at.is_some());
        transition(&mut s, SessionStatus::Completed).unwrap();
        assert!(s.metrics.completed_at.is_some());
        assert!(s.status.is_terminal());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut s = session();
        let err = transition(&mut s, SessionStatus::Completed).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(s.status, SessionStatus::Pending);

        transition(&mut s, SessionStatus::Running).unwrap();
        assert!(transition(&mut s, SessionStatus::Queued).is_err());
    }

    #[test]
    fn test_terminal_states_admit_nothing() {
        let mut s = session();
        transition(&mut s, SessionStatus::Running).unwrap();
        transition(&mut s, SessionStatus::Completed).unwrap();
        for target in [
            SessionStatus::Pending,
            SessionStatus::Running,
            SessionStatus::Failed,
            SessionStatus::Cancelled,
        ] {
            assert!(transition(&mut s, target).is_err());
        }
    }

    #[test]
    fn test_started_at_is_stamped_once() {
        let mut s = session();
        transition(&mut s, SessionStatus::Running).unwrap();
        let first = s.metrics.started_at.unwrap();
        transition(&mut s, SessionStatus::Paused).unwrap();
        transition(&mut s, SessionStatus::Running).unwrap();
        assert_eq!(s.metrics.started_at.unwrap(), first);
    }

    #[test]
    fn test_retry_requires_checkpoint() {
        let mut s = session();
        transition(&mut s, SessionStatus::Running).unwrap();
        transition(&mut s, SessionStatus::Failed).unwrap();

        // No checkpoint yet: the retry edge is closed.
        let err = transition(&mut s, SessionStatus::Pending).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");

        add_checkpoint(&mut s, json!({"progress": 0.4})).unwrap();
        transition(&mut s, SessionStatus::Pending).unwrap();
        assert_eq!(s.status, SessionStatus::Pending);
    }

    #[test]
    fn test_retry_gate_closes_at_budget() {
        let mut s = session();
        transition(&mut s, SessionStatus::Running).unwrap();
        add_checkpoint(&mut s, json!({"progress": 0.1})).unwrap();

        // The fail path counts attempts; the gate closes at the budget.
        transition(&mut s, SessionStatus::Failed).unwrap();
        s.metrics.retry_count = 2;
        assert!(can_retry(&s));
        transition(&mut s, SessionStatus::Pending).unwrap();
        transition(&mut s, SessionStatus::Running).unwrap();

        transition(&mut s, SessionStatus::Failed).unwrap();
        s.metrics.retry_count = 3;
        assert!(!can_retry(&s));
        assert!(transition(&mut s, SessionStatus::Pending).is_err());
    }

    #[test]
    fn test_timeout_and_stopped_share_retry_edge() {
        for interim in [SessionStatus::Timeout, SessionStatus::Stopped] {
            let mut s = session();
            transition(&mut s, SessionStatus::Running).unwrap();
            add_checkpoint(&mut s, json!({})).unwrap();
            transition(&mut s, interim).unwrap();
            transition(&mut s, SessionStatus::Pending).unwrap();
            assert_eq!(s.status, SessionStatus::Pending);
        }
    }

    #[test]
    fn test_degraded_paths() {
        let mut s = session();
        transition(&mut s, SessionStatus::Running).unwrap();
        transition(&mut s, SessionStatus::Degraded).unwrap();
        transition(&mut s, SessionStatus::Running).unwrap();
        transition(&mut s, SessionStatus::Degraded).unwrap();
        transition(&mut s, SessionStatus::Failed).unwrap();
        assert!(s.metrics.failed_at.is_some());
    }

    #[test]
    fn test_checkpoint_sequences_increase() {
        let mut s = session();
        assert_eq!(add_checkpoint(&mut s, json!({"n": 1})).unwrap(), 1);
        assert_eq!(add_checkpoint(&mut s, json!({"n": 2})).unwrap(), 2);
        assert_eq!(add_checkpoint(&mut s, json!({"n": 3})).unwrap(), 3);
        assert_eq!(s.metrics.checkpoint_count, 3);
        assert!(s.metrics.last_checkpoint_at.is_some());
    }

    #[test]
    fn test_checkpoint_retention_evicts_oldest() {
        let mut s = session();
        s.checkpoint_retention = 3;
        for n in 1..=4 {
            add_checkpoint(&mut s, json!({ "n": n })).unwrap();
        }
        assert_eq!(s.metrics.checkpoint_count, 3);
        let sequences: Vec<u64> = s.checkpoints.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![2, 3, 4]);

        // Sequences keep increasing from the max even after eviction.
        assert_eq!(add_checkpoint(&mut s, json!({"n": 5})).unwrap(), 5);
    }

    #[test]
    fn test_checkpoints_since_filters() {
        let mut s = session();
        for n in 1..=5 {
            add_checkpoint(&mut s, json!({ "n": n })).unwrap();
        }
        let replay = checkpoints_since(&s, 3);
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].sequence, 4);
    }

    #[test]
    fn test_health_score_fresh_session() {
        let s = session();
        // Nothing done, nothing failed, no time burned: 0.2 + 0.2 + 0.2.
        let score = health_score(&s, 0.0, Utc::now());
        assert!((score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_health_score_penalizes_errors_and_retries() {
        let mut s = session();
        s.metrics.api_calls = 10;
        s.metrics.api_errors = 5;
        s.metrics.retry_count = 3;
        let score = health_score(&s, 1.0, Utc::now());
        // 0.4 + 0.2*0.5 + 0.2*0 + 0.2*1.0
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_health_score_caps_elapsed_ratio() {
        let mut s = session();
        s.max_duration_seconds = 60;
        s.metrics.started_at = Some(Utc::now() - chrono::Duration::hours(2));
        let score = health_score(&s, 1.0, Utc::now());
        // Elapsed component fully burned, everything else perfect.
        assert!((score - 0.8).abs() < 1e-9);
    }
}
