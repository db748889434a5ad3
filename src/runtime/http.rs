//! HTTP client for the hosted agent runtime

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{AgentRecord, RuntimeClient};
use crate::definitions::AgentSpec;
use crate::error::ConclaveError;
use crate::protocol::{AgentId, OutboundMessage};

/// `reqwest`-backed `RuntimeClient`
#[derive(Debug, Clone)]
pub struct HttpRuntimeClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct BlockBody {
    value: String,
}

impl HttpRuntimeClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ConclaveError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn block_url(&self, agent_id: &AgentId, label: &str) -> String {
        self.url(&format!("/v1/agents/{agent_id}/core-memory/blocks/{label}"))
    }
}

#[async_trait]
impl RuntimeClient for HttpRuntimeClient {
    async fn health(&self) -> Result<(), ConclaveError> {
        self.http
            .get(self.url("/v1/health"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create_agent(&self, spec: &AgentSpec) -> Result<AgentRecord, ConclaveError> {
        let record = self
            .http
            .post(self.url("/v1/agents"))
            .json(spec)
            .send()
            .await?
            .error_for_status()?
            .json::<AgentRecord>()
            .await?;
        debug!(agent_id = %record.id, "Runtime created agent");
        Ok(record)
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, ConclaveError> {
        Ok(self
            .http
            .get(self.url("/v1/agents"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    #[instrument(skip(self, message), fields(delivery_id = %message.delivery_id))]
    async fn send_message(
        &self,
        agent_id: &AgentId,
        message: &OutboundMessage,
    ) -> Result<(), ConclaveError> {
        let body = json!({
            "messages": [{
                "role": message.sender,
                "content": [{"type": "text", "text": message.text}],
            }],
        });
        self.http
            .post(self.url(&format!("/v1/agents/{agent_id}/messages/async")))
            .header("Idempotency-Key", message.delivery_id.to_string())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_block(&self, agent_id: &AgentId, label: &str) -> Result<String, ConclaveError> {
        let response = self.http.get(self.block_url(agent_id, label)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ConclaveError::BlockNotFound(label.to_string()));
        }
        let body: BlockBody = response.error_for_status()?.json().await?;
        Ok(body.value)
    }

    async fn update_block_value(
        &self,
        agent_id: &AgentId,
        label: &str,
        value: &str,
    ) -> Result<(), ConclaveError> {
        self.http
            .patch(self.block_url(agent_id, label))
            .json(&json!({ "value": value }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = HttpRuntimeClient::new("http://localhost:8283/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8283");
        assert_eq!(
            client.block_url(&AgentId::new("agent-1"), "user_tasks"),
            "http://localhost:8283/v1/agents/agent-1/core-memory/blocks/user_tasks"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        // port 9 (discard) is essentially never serving HTTP
        let client = HttpRuntimeClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = client.health().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
