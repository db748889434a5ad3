//! Delegation router - role name to agent, with at-least-once delivery

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::directory::AgentDirectory;
use crate::error::ConclaveError;
use crate::protocol::{DeliveryId, DeliveryReceipt, OutboundMessage, Role, Sender};
use crate::runtime::RuntimeClient;

/// Retry policy for cross-agent sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    /// Attempts per message, including the first
    pub max_attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Forwards requests to role agents through the runtime
pub struct DelegationRouter {
    /// Role to runtime agent id
    directory: AgentDirectory,
    /// Runtime the messages are enqueued on
    client: Arc<dyn RuntimeClient>,
    /// Retry budget for transport failures
    policy: DeliveryPolicy,
    /// Stamps delivery receipts
    clock: Arc<dyn Clock>,
}

impl DelegationRouter {
    pub fn new(
        directory: AgentDirectory,
        client: Arc<dyn RuntimeClient>,
        policy: DeliveryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            directory,
            client,
            policy,
            clock,
        }
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.directory
    }

    /// Map a delegation target name ("Tasks") to its role
    ///
    /// Only the exact display names of the delegation targets are accepted.
    pub fn resolve(&self, name: &str) -> Result<Role, ConclaveError> {
        Role::DELEGATION_TARGETS
            .iter()
            .copied()
            .find(|role| role.name() == name)
            .ok_or_else(|| ConclaveError::UnknownRole {
                name: name.to_string(),
                valid: Role::DELEGATION_TARGETS
                    .iter()
                    .map(|r| r.name().to_string())
                    .collect(),
            })
    }

    /// Enqueue `description` on the agent serving `role_name`
    #[instrument(skip(self, description), fields(role = %role_name))]
    pub async fn delegate(
        &self,
        role_name: &str,
        description: &str,
    ) -> Result<DeliveryReceipt, ConclaveError> {
        let role = self.resolve(role_name)?;
        let receipt = self.deliver(role, Sender::System, description).await?;
        info!(
            role = %role,
            agent_id = %receipt.agent_id,
            delivery_id = %receipt.delivery_id,
            "Request delegated"
        );
        Ok(receipt)
    }

    /// Enqueue a message on any role, delegation target or not
    pub async fn notify(&self, role: Role, text: &str) -> Result<DeliveryReceipt, ConclaveError> {
        self.deliver(role, Sender::System, text).await
    }

    /// Send with a fresh delivery id, retrying transport failures with the
    /// same id so the runtime can drop duplicates
    async fn deliver(
        &self,
        role: Role,
        sender: Sender,
        text: &str,
    ) -> Result<DeliveryReceipt, ConclaveError> {
        let agent_id = self.directory.require(role)?.clone();
        let message = OutboundMessage {
            delivery_id: DeliveryId::new(),
            sender,
            text: text.to_string(),
        };
        let max_attempts = self.policy.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.send_message(&agent_id, &message).await {
                Ok(()) => {
                    debug!(%role, attempt, delivery_id = %message.delivery_id, "Message enqueued");
                    return Ok(DeliveryReceipt {
                        delivery_id: message.delivery_id,
                        role,
                        agent_id,
                        attempts: attempt,
                        enqueued_at: self.clock.now(),
                    });
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        %role,
                        attempt,
                        max_attempts,
                        delivery_id = %message.delivery_id,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    tokio::time::sleep(self.policy.backoff).await;
                }
                Err(e) => {
                    warn!(%role, attempt, delivery_id = %message.delivery_id, error = %e, "Delivery failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::protocol::AgentId;
    use crate::runtime::LocalRuntime;
    use chrono::{TimeZone, Utc};

    async fn setup(policy: DeliveryPolicy) -> (DelegationRouter, Arc<LocalRuntime>) {
        let runtime = Arc::new(LocalRuntime::new());
        let mut directory = AgentDirectory::new();
        for role in Role::ALL {
            let spec = crate::definitions::AgentDefinition::for_role(role).spec();
            let record = runtime.create_agent(&spec).await.unwrap();
            directory.insert(role, record.id);
        }
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap()));
        let router = DelegationRouter::new(directory, runtime.clone(), policy, clock);
        (router, runtime)
    }

    fn fast() -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    fn tasks_id(router: &DelegationRouter) -> AgentId {
        router.directory().get(Role::Tasks).unwrap().clone()
    }

    #[tokio::test]
    async fn test_delegate_enqueues_on_target() {
        let (router, runtime) = setup(fast()).await;
        let receipt = router.delegate("Tasks", "Add 'buy milk'").await.unwrap();

        assert_eq!(receipt.role, Role::Tasks);
        assert_eq!(receipt.attempts, 1);
        let mailbox = runtime.mailbox(&tasks_id(&router));
        assert_eq!(mailbox.len(), 1);
        assert_eq!(mailbox[0].text, "Add 'buy milk'");
        assert_eq!(mailbox[0].sender, Sender::System);
    }

    #[tokio::test]
    async fn test_unknown_role_lists_targets() {
        let (router, runtime) = setup(fast()).await;
        let err = router.delegate("Calendar", "whatever").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown agent type 'Calendar'. Please use one of: \
             Conversational, Tasks, Projects, Reminders, Preferences"
        );
        assert!(runtime.mailbox(&tasks_id(&router)).is_empty());
    }

    #[tokio::test]
    async fn test_orchestrator_is_not_a_target() {
        let (router, _runtime) = setup(fast()).await;
        assert!(router.resolve("Orchestrator").is_err());
        assert!(router.resolve("tasks").is_err());
    }

    #[tokio::test]
    async fn test_retries_transport_failures() {
        let (router, runtime) = setup(fast()).await;
        runtime.fail_next_calls(2);
        let receipt = router.delegate("Tasks", "Remove 'buy milk'").await.unwrap();
        assert_eq!(receipt.attempts, 3);
        assert_eq!(runtime.mailbox(&tasks_id(&router)).len(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (router, runtime) = setup(fast()).await;
        runtime.fail_next_calls(3);
        let err = router.delegate("Tasks", "Remove 'buy milk'").await.unwrap_err();
        assert!(matches!(err, ConclaveError::Transport(_)));
        assert!(runtime.mailbox(&tasks_id(&router)).is_empty());
    }

    #[tokio::test]
    async fn test_notify_reaches_orchestrator() {
        let (router, runtime) = setup(fast()).await;
        let receipt = router.notify(Role::Orchestrator, "done").await.unwrap();
        assert_eq!(receipt.role, Role::Orchestrator);
        assert_eq!(runtime.mailbox(&receipt.agent_id).len(), 1);
    }
}
