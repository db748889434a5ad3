//! Agent implementation - one role agent with its gate, memory and tools

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::changelog::Changelog;
use crate::clock::Clock;
use crate::definitions::AgentDefinition;
use crate::error::ConclaveError;
use crate::gate::{ToolGate, Transition};
use crate::memory::{LimitPolicy, MemoryBlockStore};
use crate::protocol::{AgentId, AgentStatus, Event, Role, SessionId, ToolCall, ToolOutcome};
use crate::router::DelegationRouter;
use crate::runtime::RuntimeClient;
use crate::session::{OrchestrationSession, SessionState};
use crate::tasks::{ActiveTaskWarning, TaskSet};
use crate::tools::{ToolContext, ToolRegistry};

/// Shared services every agent's tools use
pub struct Services {
    /// Delivers delegations and notifications to other roles
    pub router: Arc<DelegationRouter>,
    /// Hosted runtime that block writes are synced to
    pub runtime: Arc<dyn RuntimeClient>,
    /// Source of changelog and task timestamps
    pub clock: Arc<dyn Clock>,
}

/// Mutable state an agent's tools work on
#[derive(Debug)]
pub struct AgentState {
    pub memory: MemoryBlockStore,
    pub changelog: Changelog,
    /// Present on the Tasks role only
    pub tasks: Option<TaskSet>,
    /// Present on the orchestrator once a plan was created
    pub session: Option<OrchestrationSession>,
    /// Warning raised by a task update, not yet sent to the orchestrator
    pub pending_warning: Option<ActiveTaskWarning>,
    /// Blocks written since the host last collected them
    pub(crate) updated: Vec<(String, String)>,
}

impl AgentState {
    fn for_definition(definition: &AgentDefinition, policy: LimitPolicy, task_limit: usize) -> Self {
        Self {
            memory: definition.memory(policy),
            changelog: Changelog::new(),
            tasks: (definition.role == Role::Tasks).then(|| TaskSet::new(task_limit)),
            session: None,
            pending_warning: None,
            updated: Vec::new(),
        }
    }
}

struct Inner {
    gate: ToolGate,
    state: AgentState,
}

/// A single role agent
pub struct Agent {
    /// Identifier assigned by the runtime
    pub id: AgentId,
    /// Role this agent serves
    pub role: Role,
    /// Blocks, tools and rules it was created from
    pub definition: AgentDefinition,
    /// Current status
    status: RwLock<AgentStatus>,
    /// Tool gate and memory, locked for the length of a tool call
    inner: Mutex<Inner>,
    /// Tools this role may call
    tools: ToolRegistry,
    /// Router, runtime and clock shared with the other agents
    services: Arc<Services>,
    /// Event sender for reporting back
    event_tx: mpsc::UnboundedSender<Event>,
}

impl Agent {
    pub fn new(
        id: AgentId,
        definition: AgentDefinition,
        policy: LimitPolicy,
        task_limit: usize,
        services: Arc<Services>,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> Result<Self, ConclaveError> {
        let gate = definition.gate()?;
        let tools = ToolRegistry::for_role(definition.role);
        let state = AgentState::for_definition(&definition, policy, task_limit);

        info!(agent_id = %id, role = %definition.role, tools = tools.len(), "Creating agent");

        Ok(Self {
            id,
            role: definition.role,
            definition,
            status: RwLock::new(AgentStatus::Idle),
            inner: Mutex::new(Inner { gate, state }),
            tools,
            services,
            event_tx,
        })
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.read()
    }

    fn set_status(&self, status: AgentStatus) {
        *self.status.write() = status;
    }

    fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    fn ensure_alive(&self) -> Result<(), ConclaveError> {
        if self.status() == AgentStatus::Terminated {
            return Err(ConclaveError::InvalidTransition {
                state: "terminated".into(),
                action: "use agent",
            });
        }
        Ok(())
    }

    /// Reset the gate for an inbound message
    pub async fn begin_turn(&self) -> Result<(), ConclaveError> {
        self.ensure_alive()?;
        self.inner.lock().await.gate.begin_turn();
        self.set_status(AgentStatus::InTurn);
        self.emit(Event::TurnStarted {
            role: self.role,
            agent_id: self.id.clone(),
        });
        debug!(agent_id = %self.id, "Turn started");
        Ok(())
    }

    /// Dispatch one tool call through the gate
    ///
    /// A call the gate rejects is reported and leaves the gate where it was.
    /// A declined or failed tool does not advance the gate either.
    #[instrument(skip(self, call), fields(agent_id = %self.id, role = %self.role, tool = %call.name))]
    pub async fn invoke(&self, call: ToolCall) -> Result<ToolOutcome, ConclaveError> {
        self.ensure_alive()?;
        let mut inner = self.inner.lock().await;

        if let Err(e) = inner.gate.check(&call.name) {
            warn!(error = %e, "Tool call rejected by gate");
            self.emit(match &e {
                ConclaveError::GateViolation { tool, allowed } => Event::GateViolation {
                    role: self.role,
                    tool: tool.clone(),
                    allowed: allowed.clone(),
                },
                other => Event::ToolFailed {
                    role: self.role,
                    tool: call.name.clone(),
                    error: other.to_string(),
                },
            });
            return Err(e);
        }
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ConclaveError::UnknownTool(call.name.clone()))?;

        let Inner { gate, state } = &mut *inner;
        let mut ctx = ToolContext::new(&self.id, self.role, state, &self.services, &self.event_tx);

        match tool.call(&mut ctx, call.arguments).await {
            Ok(ToolOutcome::Completed(output)) => {
                self.emit(Event::ToolCompleted {
                    role: self.role,
                    tool: call.name.clone(),
                    output: output.clone(),
                });
                match gate.record(&call.name, &output) {
                    Transition::ExitLoop => {
                        self.set_status(AgentStatus::Idle);
                        info!("Turn ended");
                        self.emit(Event::TurnEnded {
                            role: self.role,
                            agent_id: self.id.clone(),
                        });
                    }
                    Transition::Continue { allowed } => {
                        debug!(allowed = ?allowed, "Tool completed");
                    }
                }
                Ok(ToolOutcome::Completed(output))
            }
            Ok(ToolOutcome::Declined(message)) => {
                info!(%message, "Tool declined");
                self.emit(Event::ToolDeclined {
                    role: self.role,
                    tool: call.name.clone(),
                    message: message.clone(),
                });
                Ok(ToolOutcome::Declined(message))
            }
            Err(e) => {
                warn!(error = %e, "Tool failed");
                self.emit(Event::ToolFailed {
                    role: self.role,
                    tool: call.name.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Tools the gate permits next
    pub async fn allowed_tools(&self) -> Vec<String> {
        self.inner.lock().await.gate.allowed()
    }

    pub async fn is_turn_over(&self) -> bool {
        self.inner.lock().await.gate.is_exited()
    }

    /// Current value of a block
    pub async fn block(&self, label: &str) -> Result<String, ConclaveError> {
        Ok(self.inner.lock().await.state.memory.get(label)?.to_string())
    }

    /// Copy a value owned by another agent into a read-only block here
    ///
    /// If the runtime rejects the value, the local copy is restored.
    pub async fn mirror_block(&self, label: &str, value: &str) -> Result<(), ConclaveError> {
        let mut inner = self.inner.lock().await;
        let previous = inner.state.memory.get(label)?.to_string();
        inner.state.memory.mirror(label, value)?;

        if let Err(e) = self
            .services
            .runtime
            .update_block_value(&self.id, label, value)
            .await
        {
            warn!(agent_id = %self.id, label, error = %e, "Mirror sync failed, restoring");
            inner.state.memory.mirror(label, previous)?;
            return Err(e);
        }
        debug!(agent_id = %self.id, label, "Mirrored block");
        Ok(())
    }

    /// Drain the blocks written since the last call
    pub async fn take_updated(&self) -> Vec<(String, String)> {
        std::mem::take(&mut self.inner.lock().await.state.updated)
    }

    pub async fn session_state(&self) -> Option<SessionState> {
        self.inner.lock().await.state.session.as_ref().map(|s| s.state())
    }

    /// Read the agent's state without changing it
    pub async fn inspect<R>(&self, f: impl FnOnce(&AgentState) -> R) -> R {
        f(&self.inner.lock().await.state)
    }

    /// Cancel the open orchestration session
    pub async fn cancel_session(&self, reason: &str) -> Result<SessionId, ConclaveError> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .state
            .session
            .as_mut()
            .filter(|s| !s.is_finished())
            .ok_or(ConclaveError::NoActiveSession)?;
        session.cancel(reason)?;
        let session_id = session.id;
        self.emit(Event::SessionCancelled {
            session_id,
            reason: reason.to_string(),
        });
        Ok(session_id)
    }

    pub fn terminate(&self) {
        self.set_status(AgentStatus::Terminated);
        info!(agent_id = %self.id, role = %self.role, "Agent terminated");
    }
}

/// Handle to an agent for external interaction
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<Agent>,
}

impl AgentHandle {
    pub fn new(agent: Agent) -> Self {
        Self {
            inner: Arc::new(agent),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }
}

impl std::ops::Deref for AgentHandle {
    type Target = Agent;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::definitions::{DEFAULT_BLOCK_LIMIT, ORCHESTRATOR_PLAN};
    use crate::directory::AgentDirectory;
    use crate::router::DeliveryPolicy;
    use crate::runtime::LocalRuntime;
    use crate::tasks::DEFAULT_ACTIVE_TASK_LIMIT;
    use crate::tools::names;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    async fn create_test_agent(
        role: Role,
    ) -> (AgentHandle, Arc<LocalRuntime>, mpsc::UnboundedReceiver<Event>) {
        let runtime = Arc::new(LocalRuntime::new());
        let mut directory = AgentDirectory::new();
        for r in Role::ALL {
            let record = runtime
                .create_agent(&AgentDefinition::for_role(r).spec())
                .await
                .unwrap();
            directory.insert(r, record.id);
        }
        let clock: Arc<dyn Clock> =
            Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap()));
        let id = directory.get(role).unwrap().clone();
        let router = DelegationRouter::new(directory, runtime.clone(), DeliveryPolicy::default(), clock.clone());
        let services = Arc::new(Services {
            router: Arc::new(router),
            runtime: runtime.clone(),
            clock,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = Agent::new(
            id,
            AgentDefinition::for_role(role),
            LimitPolicy::Reject,
            DEFAULT_ACTIVE_TASK_LIMIT,
            services,
            tx,
        )
        .unwrap();
        (AgentHandle::new(agent), runtime, rx)
    }

    #[tokio::test]
    async fn test_agent_creation() {
        let (agent, _runtime, _rx) = create_test_agent(Role::Tasks).await;
        assert_eq!(agent.status(), AgentStatus::Idle);
        assert!(agent.inspect(|s| s.tasks.is_some()).await);
        assert_eq!(agent.block("user_tasks").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_gate_violation_is_reported_and_retryable() {
        let (agent, _runtime, mut rx) = create_test_agent(Role::Tasks).await;
        agent.begin_turn().await.unwrap();

        let err = agent
            .invoke(ToolCall::new(names::SEND_ORCHESTRATOR_MESSAGE, json!({"status": "done"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::GateViolation { .. }));
        assert_eq!(
            agent.allowed_tools().await,
            vec![names::HANDLE_ORCHESTRATOR_REQUEST.to_string(), "update_user_tasks".to_string()]
        );

        agent
            .invoke(ToolCall::new(
                "update_user_tasks",
                json!({"operation": "add", "description": "buy milk"}),
            ))
            .await
            .unwrap();
        let err = agent
            .invoke(ToolCall::new(names::SEND_ORCHESTRATOR_MESSAGE, json!({"status": "done"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::GateViolation { .. }));
        assert_eq!(agent.allowed_tools().await, vec!["update_tasks_changelog".to_string()]);

        let mut saw_violation = false;
        while let Ok(event) = rx.try_recv() {
            saw_violation |= matches!(event, Event::GateViolation { .. });
        }
        assert!(saw_violation);
    }

    #[tokio::test]
    async fn test_block_writes_sync_to_runtime() {
        let (agent, runtime, _rx) = create_test_agent(Role::Projects).await;
        agent.begin_turn().await.unwrap();
        agent
            .invoke(ToolCall::new(
                "update_user_projects",
                json!({"old_str": "", "new_str": "- Garden"}),
            ))
            .await
            .unwrap();

        assert_eq!(agent.block("user_projects").await.unwrap(), "- Garden");
        assert_eq!(runtime.block(&agent.id, "user_projects").as_deref(), Some("- Garden"));
        assert_eq!(
            agent.take_updated().await,
            vec![("user_projects".to_string(), "- Garden".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failed_sync_restores_block() {
        let (agent, runtime, _rx) = create_test_agent(Role::Projects).await;
        agent.begin_turn().await.unwrap();
        runtime.fail_next_calls(1);
        let err = agent
            .invoke(ToolCall::new(
                "update_user_projects",
                json!({"old_str": "", "new_str": "- Garden"}),
            ))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(agent.block("user_projects").await.unwrap(), "");
        // the failed call did not advance the gate
        assert!(agent.allowed_tools().await.contains(&"update_user_projects".to_string()));
    }

    #[tokio::test]
    async fn test_failed_mirror_restores_block() {
        let (agent, runtime, _rx) = create_test_agent(Role::Conversational).await;
        agent.mirror_block("user_tasks", "- buy milk").await.unwrap();

        runtime.fail_next_calls(1);
        let err = agent
            .mirror_block("user_tasks", "- buy milk\n- call dentist")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(agent.block("user_tasks").await.unwrap(), "- buy milk");
        assert_eq!(runtime.block(&agent.id, "user_tasks").as_deref(), Some("- buy milk"));
    }

    #[tokio::test]
    async fn test_oversized_plan_keeps_previous_plan() {
        let (agent, _runtime, _rx) = create_test_agent(Role::Orchestrator).await;
        agent.begin_turn().await.unwrap();
        agent
            .invoke(ToolCall::new(
                names::CREATE_ORCHESTRATOR_PLAN,
                json!({
                    "original_request": "Start a garden",
                    "orchestrator_plan": "1. Projects: Create project 'Garden'",
                }),
            ))
            .await
            .unwrap();

        agent.begin_turn().await.unwrap();
        let oversized = format!("1. Tasks: {}", "x".repeat(16_000));
        let err = agent
            .invoke(ToolCall::new(
                names::CREATE_ORCHESTRATOR_PLAN,
                json!({"original_request": "Something else", "orchestrator_plan": oversized}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::LimitExceeded { .. }));

        assert!(agent
            .block(ORCHESTRATOR_PLAN)
            .await
            .unwrap()
            .starts_with("Original Request: Start a garden"));
        assert_eq!(agent.session_state().await, Some(SessionState::Delegating));
        assert!(agent.take_updated().await.iter().all(|(_, v)| !v.contains("Something else")));
    }

    #[tokio::test]
    async fn test_full_changelog_evicts_oldest_and_turn_completes() {
        let (agent, runtime, _rx) = create_test_agent(Role::Tasks).await;
        let orchestrator = agent
            .services
            .router
            .directory()
            .require(Role::Orchestrator)
            .unwrap()
            .clone();

        for i in 0..120 {
            agent.begin_turn().await.unwrap();
            agent
                .invoke(ToolCall::new(
                    "update_user_tasks",
                    json!({"operation": "add", "description": format!("task number {i}")}),
                ))
                .await
                .unwrap();
            agent
                .invoke(ToolCall::new(
                    "update_tasks_changelog",
                    json!({"entry": format!("Added task 'task number {i}' to the user's active task list")}),
                ))
                .await
                .unwrap();
            agent
                .invoke(ToolCall::new(
                    names::SEND_ORCHESTRATOR_MESSAGE,
                    json!({"status": format!("Added task {i}")}),
                ))
                .await
                .unwrap();
            assert!(agent.is_turn_over().await, "turn {i} did not finish");
        }

        let block = agent.block("tasks_changelog").await.unwrap();
        assert!(block.chars().count() <= DEFAULT_BLOCK_LIMIT);
        assert!(block.ends_with("Added task 'task number 119' to the user's active task list"));
        assert!(!block.contains("'task number 0'"));
        assert_eq!(runtime.mailbox(&orchestrator).len(), 120);
    }

    #[tokio::test]
    async fn test_changelog_entry_can_be_deleted() {
        let (agent, _runtime, _rx) = create_test_agent(Role::Tasks).await;
        agent.begin_turn().await.unwrap();
        agent
            .invoke(ToolCall::new("update_user_tasks", json!({"operation": "add", "description": "a"})))
            .await
            .unwrap();
        agent
            .invoke(ToolCall::new("update_tasks_changelog", json!({"entry": "Added task 'a'"})))
            .await
            .unwrap();

        agent.begin_turn().await.unwrap();
        agent
            .invoke(ToolCall::new("update_user_tasks", json!({"operation": "remove", "description": "a"})))
            .await
            .unwrap();
        agent
            .invoke(ToolCall::new(
                "update_tasks_changelog",
                json!({"entry": "", "replaces": "Added task 'a'"}),
            ))
            .await
            .unwrap();

        assert_eq!(agent.block("tasks_changelog").await.unwrap(), "");
        assert!(agent.inspect(|s| s.changelog.is_empty()).await);
        assert_eq!(agent.allowed_tools().await, vec![names::SEND_ORCHESTRATOR_MESSAGE.to_string()]);
    }

    #[tokio::test]
    async fn test_terminated_agent_rejects_calls() {
        let (agent, _runtime, _rx) = create_test_agent(Role::Conversational).await;
        agent.terminate();
        assert!(agent.begin_turn().await.is_err());
    }
}
