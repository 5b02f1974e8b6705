use crate::{entities::server, errors::ServiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Failure of one remote provisioning call. Every variant is retryable:
/// the state machine records the message and leaves the task eligible for
/// retry, regardless of which one occurred.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent unreachable: {0}")]
    Unreachable(String),

    #[error("agent call timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent rejected {action}: {detail}")]
    Rejected { action: String, detail: String },

    #[error("no server assigned to task")]
    NoServerAssigned,
}

impl From<AgentError> for ServiceError {
    fn from(err: AgentError) -> Self {
        ServiceError::AgentError(err.to_string())
    }
}

/// Wire format of one agent command.
#[derive(Debug, Serialize)]
struct AgentCommand<'a> {
    action: &'a str,
    payload: &'a Value,
}

/// Agent reply: success flag plus optional human-readable detail.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Seam for the remote call so the state machine can be exercised with an
/// in-memory double in tests.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        target: &server::Model,
        action: &str,
        payload: &Value,
    ) -> Result<AgentResponse, AgentError>;
}

/// Production gateway: authenticated HTTPS call to the server-local
/// management agent, bounded by a single configured timeout. Certificate
/// validation stays on; a host with a bad certificate is an unreachable
/// host, not a special case.
pub struct HttpAgentClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("failed to build agent client: {}", e)))?;

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl AgentInvoker for HttpAgentClient {
    async fn invoke(
        &self,
        target: &server::Model,
        action: &str,
        payload: &Value,
    ) -> Result<AgentResponse, AgentError> {
        let url = format!("{}/commands", target.agent_url.trim_end_matches('/'));
        debug!(server = %target.hostname, action = %action, "invoking agent");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&target.agent_token)
            .json(&AgentCommand { action, payload })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout(self.timeout)
                } else {
                    AgentError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(server = %target.hostname, action = %action, status = %status, "agent returned non-success status");
            return Err(AgentError::Rejected {
                action: action.to_string(),
                detail: format!("status {}: {}", status, detail),
            });
        }

        let body: AgentResponse = response.json().await.map_err(|e| AgentError::Rejected {
            action: action.to_string(),
            detail: format!("unparseable agent response: {}", e),
        })?;

        if !body.success {
            return Err(AgentError::Rejected {
                action: action.to_string(),
                detail: body
                    .detail
                    .clone()
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            });
        }

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_agent_errors_map_to_the_retryable_service_variant() {
        let errors: Vec<AgentError> = vec![
            AgentError::Unreachable("connection refused".into()),
            AgentError::Timeout(Duration::from_secs(15)),
            AgentError::Rejected {
                action: "create_account".into(),
                detail: "disk full".into(),
            },
            AgentError::NoServerAssigned,
        ];

        for err in errors {
            match ServiceError::from(err) {
                ServiceError::AgentError(msg) => assert!(!msg.is_empty()),
                other => panic!("expected AgentError, got {:?}", other),
            }
        }
    }
}
