use crate::{validation, OrchestratorError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub coordination: CoordinationConfig,
    pub orchestrator: OrchestratorConfig,
}

/// Connection settings for the coordination store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    pub host: String,
    pub port: u16,
}

impl CoordinationConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

/// Orchestration defaults stamped onto every session the service creates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Process-wide ceiling on concurrent sessions, applied on top of the
    /// per-tenant quota
    pub max_concurrent_sessions: u32,
    /// Default `max_duration_seconds` for create requests that omit one
    pub session_timeout_seconds: u64,
    /// Retry budget for new sessions
    pub max_retry_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 100,
            session_timeout_seconds: crate::constants::DEFAULT_SESSION_DURATION_SECS,
            max_retry_attempts: crate::constants::MAX_SESSION_RETRIES,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found, using process environment"),
        }

        let coordination = CoordinationConfig {
            host: env_or("REDIS_HOST", "127.0.0.1"),
            port: parse_env("REDIS_PORT", 6379),
        };

        let orchestrator = OrchestratorConfig {
            max_concurrent_sessions: parse_env("MAX_CONCURRENT_SESSIONS", 100),
            session_timeout_seconds: parse_env(
                "SESSION_TIMEOUT_SECONDS",
                crate::constants::DEFAULT_SESSION_DURATION_SECS,
            ),
            max_retry_attempts: parse_env(
                "MAX_RETRY_ATTEMPTS",
                crate::constants::MAX_SESSION_RETRIES,
            ),
        };

        if orchestrator.max_concurrent_sessions == 0 {
            return Err(OrchestratorError::Configuration(
                "MAX_CONCURRENT_SESSIONS must be positive".to_string(),
            ));
        }
        // The default has to be a valid session duration itself.
        validation::validate_session_duration(orchestrator.session_timeout_seconds).map_err(
            |_| {
                OrchestratorError::Configuration(format!(
                    "SESSION_TIMEOUT_SECONDS must be within [{}, {}]",
                    crate::constants::MIN_SESSION_DURATION_SECS,
                    crate::constants::MAX_SESSION_DURATION_SECS
                ))
            },
        )?;

        Ok(Config {
            coordination,
            orchestrator,
        })
    }
}
