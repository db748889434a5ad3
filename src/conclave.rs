//! The conclave host - provisions the role agents and runs the op loop

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{Agent, AgentHandle, Services};
use crate::channel::{ChannelPair, ConclaveChannel};
use crate::clock::Clock;
use crate::config::ConclaveConfig;
use crate::definitions::AgentDefinition;
use crate::directory::AgentDirectory;
use crate::error::ConclaveError;
use crate::protocol::{Event, Op, Role, SessionId, ToolCall, ToolOutcome};
use crate::router::DelegationRouter;
use crate::runtime::RuntimeClient;

/// Create one runtime agent per role, orchestrator first
#[instrument(skip(client))]
pub async fn provision_agents(client: &dyn RuntimeClient) -> Result<AgentDirectory, ConclaveError> {
    let mut directory = AgentDirectory::new();
    for role in Role::ALL {
        let definition = AgentDefinition::for_role(role);
        let record = client.create_agent(&definition.spec()).await?;
        info!(%role, agent_id = %record.id, name = %record.name, "Provisioned agent");
        directory.insert(role, record.id);
    }
    Ok(directory)
}

/// The host
///
/// Owns one `Agent` per role and dispatches operations to them. Block writes
/// are mirrored into the agents that hold the same label read-only.
pub struct Conclave {
    agents: BTreeMap<Role, AgentHandle>,
    directory: AgentDirectory,
    op_rx: mpsc::UnboundedReceiver<Op>,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl Conclave {
    /// Build the host over an existing directory
    pub fn new(
        directory: AgentDirectory,
        client: Arc<dyn RuntimeClient>,
        clock: Arc<dyn Clock>,
        config: &ConclaveConfig,
        channels: ChannelPair,
    ) -> Result<Self, ConclaveError> {
        if let Some(missing) = Role::ALL.into_iter().find(|r| directory.get(*r).is_none()) {
            return Err(ConclaveError::AgentNotFound(missing));
        }

        let router = DelegationRouter::new(
            directory.clone(),
            Arc::clone(&client),
            config.delivery.policy(),
            Arc::clone(&clock),
        );
        let services = Arc::new(Services {
            router: Arc::new(router),
            runtime: client,
            clock,
        });

        let mut agents = BTreeMap::new();
        for (role, id) in directory.iter() {
            let agent = Agent::new(
                id.clone(),
                AgentDefinition::for_role(role),
                config.memory.limit_policy,
                config.tasks.active_limit,
                Arc::clone(&services),
                channels.event_tx.clone(),
            )?;
            agents.insert(role, AgentHandle::new(agent));
        }

        info!(agents = agents.len(), "Conclave assembled");
        Ok(Self {
            agents,
            directory,
            op_rx: channels.op_rx,
            event_tx: channels.event_tx,
        })
    }

    /// Provision fresh agents on the runtime, then build the host
    pub async fn provision(
        client: Arc<dyn RuntimeClient>,
        clock: Arc<dyn Clock>,
        config: &ConclaveConfig,
        channels: ChannelPair,
    ) -> Result<Self, ConclaveError> {
        let directory = provision_agents(client.as_ref()).await?;
        Self::new(directory, client, clock, config, channels)
    }

    /// Build the host and return a channel for driving it
    pub fn with_channel(
        directory: AgentDirectory,
        client: Arc<dyn RuntimeClient>,
        clock: Arc<dyn Clock>,
        config: &ConclaveConfig,
    ) -> Result<(Self, ConclaveChannel), ConclaveError> {
        let (channel, pair) = ConclaveChannel::new();
        Ok((Self::new(directory, client, clock, config, pair)?, channel))
    }

    /// Run the op loop until `Op::Shutdown` or every client is gone
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<(), ConclaveError> {
        info!("Starting conclave");

        while let Some(op) = self.op_rx.recv().await {
            if matches!(op, Op::Shutdown) {
                self.shutdown();
                break;
            }
            if let Err(e) = self.handle_op(op).await {
                error!(error = %e, "Error handling operation");
            }
        }

        info!("Conclave stopped");
        Ok(())
    }

    async fn handle_op(&self, op: Op) -> Result<(), ConclaveError> {
        match op {
            Op::BeginTurn { role, message } => self.begin_turn(role, &message).await,
            Op::ToolCall { role, call } => self.call_tool(role, call).await.map(|_| ()),
            Op::Cancel { reason } => self.cancel(&reason).await.map(|_| ()),
            Op::Shutdown => {
                self.shutdown();
                Ok(())
            }
        }
    }

    pub fn agent(&self, role: Role) -> Result<&AgentHandle, ConclaveError> {
        self.agents.get(&role).ok_or(ConclaveError::AgentNotFound(role))
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.directory
    }

    /// Open a turn on `role` for an inbound message
    pub async fn begin_turn(&self, role: Role, message: &str) -> Result<(), ConclaveError> {
        debug!(%role, len = message.len(), "Inbound message");
        self.agent(role)?.begin_turn().await
    }

    /// Dispatch one tool call and propagate any block writes to mirrors
    #[instrument(skip(self, call), fields(role = %role, tool = %call.name))]
    pub async fn call_tool(&self, role: Role, call: ToolCall) -> Result<ToolOutcome, ConclaveError> {
        let agent = self.agent(role)?;
        let result = agent.invoke(call).await;

        for (label, value) in agent.take_updated().await {
            self.mirror(role, &label, &value).await;
        }
        result
    }

    async fn mirror(&self, from: Role, label: &str, value: &str) {
        for (role, agent) in &self.agents {
            if *role == from || !agent.definition.mirrored_labels().any(|l| l == label) {
                continue;
            }
            match agent.mirror_block(label, value).await {
                Ok(()) => {
                    let _ = self.event_tx.send(Event::BlockUpdated {
                        role: *role,
                        label: label.to_string(),
                        value: value.to_string(),
                    });
                }
                Err(e) => {
                    warn!(%from, to = %role, label, error = %e, "Mirror failed");
                    let _ = self.event_tx.send(Event::MirrorFailed {
                        role: *role,
                        label: label.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Cancel the orchestrator's open session
    pub async fn cancel(&self, reason: &str) -> Result<SessionId, ConclaveError> {
        self.agent(Role::Orchestrator)?.cancel_session(reason).await
    }

    pub fn shutdown(&self) {
        for agent in self.agents.values() {
            agent.terminate();
        }
    }
}
