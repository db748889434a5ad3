//! In-process runtime with per-agent mailboxes

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::{AgentRecord, RuntimeClient};
use crate::definitions::AgentSpec;
use crate::error::ConclaveError;
use crate::protocol::{AgentId, DeliveryId, OutboundMessage, Sender};

/// A message sitting in an agent's mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivered {
    pub delivery_id: DeliveryId,
    pub sender: Sender,
    pub text: String,
}

struct LocalAgent {
    record: AgentRecord,
    blocks: BTreeMap<String, String>,
    mailbox: Vec<Delivered>,
}

#[derive(Default)]
struct LocalState {
    agents: BTreeMap<AgentId, LocalAgent>,
    seen: HashSet<DeliveryId>,
    failures: u32,
}

/// `RuntimeClient` that keeps agents, blocks and queued messages in memory
///
/// Sends are idempotent on `DeliveryId`. `fail_next_calls` injects
/// transport failures.
#[derive(Default)]
pub struct LocalRuntime {
    state: Mutex<LocalState>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` runtime calls fail with a transport error
    pub fn fail_next_calls(&self, n: u32) {
        self.state.lock().failures = n;
    }

    /// Messages queued on an agent, oldest first
    pub fn mailbox(&self, agent_id: &AgentId) -> Vec<Delivered> {
        self.state
            .lock()
            .agents
            .get(agent_id)
            .map(|a| a.mailbox.clone())
            .unwrap_or_default()
    }

    /// Drain an agent's mailbox
    pub fn take_mailbox(&self, agent_id: &AgentId) -> Vec<Delivered> {
        self.state
            .lock()
            .agents
            .get_mut(agent_id)
            .map(|a| std::mem::take(&mut a.mailbox))
            .unwrap_or_default()
    }

    pub fn block(&self, agent_id: &AgentId, label: &str) -> Option<String> {
        self.state
            .lock()
            .agents
            .get(agent_id)
            .and_then(|a| a.blocks.get(label).cloned())
    }

    fn inject_failure(state: &mut LocalState) -> Result<(), ConclaveError> {
        if state.failures > 0 {
            state.failures -= 1;
            return Err(ConclaveError::Transport("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for LocalRuntime {
    async fn health(&self) -> Result<(), ConclaveError> {
        Self::inject_failure(&mut self.state.lock())
    }

    async fn create_agent(&self, spec: &AgentSpec) -> Result<AgentRecord, ConclaveError> {
        let mut state = self.state.lock();
        Self::inject_failure(&mut state)?;

        let record = AgentRecord {
            id: AgentId::new(format!("agent-{}", Uuid::new_v4())),
            name: spec.name.clone(),
        };
        let blocks = spec
            .memory_blocks
            .iter()
            .map(|b| (b.label.clone(), b.value.clone()))
            .collect();
        state.agents.insert(
            record.id.clone(),
            LocalAgent {
                record: record.clone(),
                blocks,
                mailbox: Vec::new(),
            },
        );
        debug!(agent_id = %record.id, name = %record.name, "Local agent created");
        Ok(record)
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, ConclaveError> {
        let mut state = self.state.lock();
        Self::inject_failure(&mut state)?;
        Ok(state.agents.values().map(|a| a.record.clone()).collect())
    }

    async fn send_message(
        &self,
        agent_id: &AgentId,
        message: &OutboundMessage,
    ) -> Result<(), ConclaveError> {
        let mut state = self.state.lock();
        Self::inject_failure(&mut state)?;

        if !state.agents.contains_key(agent_id) {
            return Err(ConclaveError::Transport(format!("no agent {agent_id}")));
        }
        if !state.seen.insert(message.delivery_id) {
            debug!(delivery_id = %message.delivery_id, "Duplicate delivery acknowledged");
            return Ok(());
        }
        if let Some(agent) = state.agents.get_mut(agent_id) {
            agent.mailbox.push(Delivered {
                delivery_id: message.delivery_id,
                sender: message.sender,
                text: message.text.clone(),
            });
        }
        Ok(())
    }

    async fn get_block(&self, agent_id: &AgentId, label: &str) -> Result<String, ConclaveError> {
        let mut state = self.state.lock();
        Self::inject_failure(&mut state)?;
        state
            .agents
            .get(agent_id)
            .and_then(|a| a.blocks.get(label).cloned())
            .ok_or_else(|| ConclaveError::BlockNotFound(label.to_string()))
    }

    async fn update_block_value(
        &self,
        agent_id: &AgentId,
        label: &str,
        value: &str,
    ) -> Result<(), ConclaveError> {
        let mut state = self.state.lock();
        Self::inject_failure(&mut state)?;
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ConclaveError::Transport(format!("no agent {agent_id}")))?;
        agent.blocks.insert(label.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::AgentDefinition;
    use crate::protocol::Role;

    async fn tasks_agent(runtime: &LocalRuntime) -> AgentId {
        let spec = AgentDefinition::for_role(Role::Tasks).spec();
        runtime.create_agent(&spec).await.unwrap().id
    }

    fn message(text: &str) -> OutboundMessage {
        OutboundMessage {
            delivery_id: DeliveryId::new(),
            sender: Sender::System,
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let runtime = LocalRuntime::new();
        let id = tasks_agent(&runtime).await;
        let agents = runtime.list_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, id);
        assert_eq!(runtime.get_block(&id, "tasks_changelog").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_send_is_idempotent() {
        let runtime = LocalRuntime::new();
        let id = tasks_agent(&runtime).await;
        let msg = message("Add a task");

        runtime.send_message(&id, &msg).await.unwrap();
        runtime.send_message(&id, &msg).await.unwrap();
        assert_eq!(runtime.mailbox(&id).len(), 1);

        assert_eq!(runtime.take_mailbox(&id).len(), 1);
        assert!(runtime.mailbox(&id).is_empty());
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent_fails() {
        let runtime = LocalRuntime::new();
        let err = runtime
            .send_message(&AgentId::new("ghost"), &message("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::Transport(_)));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let runtime = LocalRuntime::new();
        runtime.fail_next_calls(1);
        assert!(runtime.health().await.is_err());
        assert!(runtime.health().await.is_ok());
    }

    #[tokio::test]
    async fn test_update_block() {
        let runtime = LocalRuntime::new();
        let id = tasks_agent(&runtime).await;
        runtime.update_block_value(&id, "user_tasks", "- a").await.unwrap();
        assert_eq!(runtime.block(&id, "user_tasks").as_deref(), Some("- a"));
    }
}
