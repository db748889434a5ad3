//! Boundary to the hosted agent runtime
//!
//! The conclave only depends on this trait. `HttpRuntimeClient` talks to a
//! real server; `LocalRuntime` keeps everything in-process.

mod http;
mod local;

pub use http::HttpRuntimeClient;
pub use local::{Delivered, LocalRuntime};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::definitions::AgentSpec;
use crate::error::ConclaveError;
use crate::protocol::{AgentId, OutboundMessage};

/// An agent as known to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
}

/// Operations the conclave needs from the hosted runtime
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Succeeds if the runtime is reachable and healthy
    async fn health(&self) -> Result<(), ConclaveError>;

    async fn create_agent(&self, spec: &AgentSpec) -> Result<AgentRecord, ConclaveError>;

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, ConclaveError>;

    /// Enqueue a message on an agent; returns once enqueued
    async fn send_message(
        &self,
        agent_id: &AgentId,
        message: &OutboundMessage,
    ) -> Result<(), ConclaveError>;

    async fn get_block(&self, agent_id: &AgentId, label: &str) -> Result<String, ConclaveError>;

    async fn update_block_value(
        &self,
        agent_id: &AgentId,
        label: &str,
        value: &str,
    ) -> Result<(), ConclaveError>;
}

/// Poll the runtime until it lists agents, returning the attempt that succeeded
pub async fn wait_until_ready(
    client: &dyn RuntimeClient,
    max_retries: u32,
    delay: Duration,
) -> Result<u32, ConclaveError> {
    let max_retries = max_retries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.list_agents().await {
            Ok(_) => {
                info!(attempt, "Runtime ready");
                return Ok(attempt);
            }
            Err(e) if attempt < max_retries => {
                warn!(attempt, max_retries, error = %e, "Runtime not ready, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(ConclaveError::Transport(format!(
                    "runtime not available after {max_retries} attempts: {e}"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_until_ready_retries() {
        let runtime = LocalRuntime::new();
        runtime.fail_next_calls(2);
        let attempt = wait_until_ready(&runtime, 5, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(attempt, 3);
    }

    #[tokio::test]
    async fn test_wait_until_ready_gives_up() {
        let runtime = LocalRuntime::new();
        runtime.fail_next_calls(10);
        let err = wait_until_ready(&runtime, 3, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
