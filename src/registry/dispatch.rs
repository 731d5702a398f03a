//! External agent dispatch
//!
//! External agents live in a remote process; task dispatch is a signed HTTP
//! call `POST {endpoint}/task` with the agent's token in `X-Agent-Token`.
//! The agent answers synchronously or reports progress through authenticated
//! heartbeats.

use crate::models::Agent;
use crate::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Body of an outbound task dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDispatch {
    pub task_id: Uuid,
    pub session_id: Uuid,
    pub prompt: String,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

/// Synchronous answer from an external agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub accepted: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct ExternalAgentClient {
    http: reqwest::Client,
}

impl ExternalAgentClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(
            crate::constants::EXTERNAL_AGENT_TIMEOUT_SECS,
        ))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestratorError::Configuration(format!("http client: {e}")))?;
        Ok(Self { http })
    }

    /// Send a task to an external agent's endpoint.
    pub async fn dispatch(&self, agent: &Agent, dispatch: &TaskDispatch) -> Result<DispatchResponse> {
        let endpoint = agent.endpoint.as_deref().ok_or_else(|| {
            OrchestratorError::Validation(format!("agent {} has no endpoint", agent.id))
        })?;
        let token = agent.auth_token.as_deref().ok_or_else(|| {
            OrchestratorError::Validation(format!("agent {} has no auth token", agent.id))
        })?;
        let url = format!("{}/task", endpoint.trim_end_matches('/'));

        debug!("dispatching task {} to {}", dispatch.task_id, url);
        let response = self
            .http
            .post(&url)
            .header("X-Agent-Token", token)
            .json(dispatch)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(
                "agent {} rejected task {} with {status}",
                agent.id, dispatch.task_id
            );
            return Err(OrchestratorError::ExecutorFailed(format!(
                "agent endpoint returned {status}"
            )));
        }

        Ok(response.json::<DispatchResponse>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AgentType, Capability, ComplexityPreference, ModelConfig, RegisterAgent,
    };
    use serde_json::json;

    fn external_agent(endpoint: &str, token: &str) -> Agent {
        let request = RegisterAgent {
            name: "Remote Implementer".into(),
            agent_type: AgentType::Implementer,
            description: None,
            agent_version: "1.0.0".into(),
            primary_capabilities: vec![Capability::CodeGeneration],
            secondary_capabilities: vec![],
            model_config: ModelConfig {
                provider_model: "anthropic/claude-sonnet".into(),
                temperature: 0.7,
                max_tokens: 4096,
                system_prompt_template:
                    "You are a focused software implementer. Produce minimal, tested changes."
                        .into(),
            },
            preferred_technologies: vec![],
            avoided_technologies: vec![],
            complexity_preference: ComplexityPreference::Medium,
            preferred_session_types: vec![],
            capacity: 5.0,
            is_external: true,
            endpoint: Some(endpoint.to_string()),
            auth_token: Some(token.to_string()),
            tags: vec![],
        };
        Agent::from_request(Uuid::new_v4(), request)
    }

    fn task_dispatch() -> TaskDispatch {
        TaskDispatch {
            task_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            prompt: "Implement the token refresh path".into(),
            context: HashMap::from([("language".to_string(), json!("rust"))]),
        }
    }

    #[tokio::test]
    async fn test_dispatch_sends_token_and_parses_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/task")
            .match_header("x-agent-token", "s3cr3t")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"accepted": true, "result": {"files": ["lib.rs"]}}"#)
            .create_async()
            .await;

        let client = ExternalAgentClient::with_timeout(Duration::from_secs(2)).unwrap();
        let agent = external_agent(&server.url(), "s3cr3t");
        let response = client.dispatch(&agent, &task_dispatch()).await.unwrap();

        assert!(response.accepted);
        assert_eq!(response.result.unwrap()["files"][0], "lib.rs");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_dispatch_maps_5xx_to_executor_failed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/task")
            .with_status(502)
            .create_async()
            .await;

        let client = ExternalAgentClient::with_timeout(Duration::from_secs(2)).unwrap();
        let agent = external_agent(&server.url(), "s3cr3t");
        let err = client.dispatch(&agent, &task_dispatch()).await.unwrap_err();
        assert_eq!(err.code(), "EXECUTOR_FAILED");
    }

    #[tokio::test]
    async fn test_dispatch_requires_endpoint_and_token() {
        let client = ExternalAgentClient::with_timeout(Duration::from_secs(2)).unwrap();

        let mut no_endpoint = external_agent("https://unused.example", "token");
        no_endpoint.endpoint = None;
        assert!(client
            .dispatch(&no_endpoint, &task_dispatch())
            .await
            .is_err());

        let mut no_token = external_agent("https://unused.example", "token");
        no_token.auth_token = None;
        assert!(client.dispatch(&no_token, &task_dispatch()).await.is_err());
    }
}
