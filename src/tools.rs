//! Tools the role agents can call, and the registry that holds them
//!
//! Every tool runs against a `ToolContext`: the calling agent's state plus
//! the shared router, runtime and clock. Block writes go through
//! `ToolContext::write_block`, which pushes the new value to the runtime
//! and restores the old one if that fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::{AgentState, Services};
use crate::changelog::ChangelogEntry;
use crate::definitions::{changelog_label, records_label, ORCHESTRATOR_PLAN};
use crate::error::ConclaveError;
use crate::memory::MemoryBlockStore;
use crate::protocol::{AgentId, DeliveryReceipt, Event, Role, ToolOutcome};
use crate::session::{OrchestrationSession, SessionState};
use crate::tasks::{TaskChange, TaskSet};

/// Tool names
pub mod names {
    use crate::protocol::Role;

    pub const CREATE_ORCHESTRATOR_PLAN: &str = "create_orchestrator_plan";
    pub const DELEGATE_AGENT_REQUEST: &str = "delegate_agent_request";
    pub const UPDATE_REQUESTS_CHANGELOG: &str = "update_requests_changelog";
    pub const EVALUATE_PROGRESS: &str = "evaluate_progress";
    pub const SEND_STATUS_UPDATE: &str = "send_status_update";

    pub const HANDLE_ORCHESTRATOR_REQUEST: &str = "handle_orchestrator_request";
    pub const SEND_ORCHESTRATOR_MESSAGE: &str = "send_orchestrator_message";

    pub const ESCALATE_USER_REQUEST: &str = "escalate_user_request";
    pub const CLARIFY_USER_REQUEST: &str = "clarify_user_request";
    pub const HANDLE_ORCHESTRATOR_MESSAGE: &str = "handle_orchestrator_message";
    pub const SEND_MESSAGE: &str = "send_message";

    /// `update_user_tasks`, `update_user_projects`, ...
    pub fn update_records(role: Role) -> String {
        format!("update_user_{}", role.key())
    }

    /// `update_requests_changelog` for the orchestrator, `update_<role>_changelog` otherwise
    pub fn update_changelog(role: Role) -> String {
        match role {
            Role::Orchestrator => UPDATE_REQUESTS_CHANGELOG.to_string(),
            other => format!("update_{}_changelog", other.key()),
        }
    }
}

const ESCALATED: &str = "You have escalated the user's request to the Orchestrator agent. \
    Next step: let the user know that you have escalated their request to the Orchestrator \
    agent by using your send_message tool.";

/// Everything a tool may touch while it runs
pub struct ToolContext<'a> {
    pub agent_id: &'a AgentId,
    pub role: Role,
    pub state: &'a mut AgentState,
    pub services: &'a Services,
    events: &'a mpsc::UnboundedSender<Event>,
}

impl<'a> ToolContext<'a> {
    pub fn new(
        agent_id: &'a AgentId,
        role: Role,
        state: &'a mut AgentState,
        services: &'a Services,
        events: &'a mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            agent_id,
            role,
            state,
            services,
            events,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    pub fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Apply `write` to the agent's memory and push the result to the runtime
    ///
    /// If `write` fails part way, or the runtime rejects the value, the block
    /// is restored to its previous value.
    pub async fn write_block<F>(&mut self, label: &str, write: F) -> Result<String, ConclaveError>
    where
        F: FnOnce(&mut MemoryBlockStore) -> Result<String, ConclaveError> + Send,
    {
        let previous = self.state.memory.get(label)?.to_string();
        let value = match write(&mut self.state.memory) {
            Ok(value) => value,
            Err(e) => {
                self.state.memory.mirror(label, previous)?;
                return Err(e);
            }
        };

        if let Err(e) = self
            .services
            .runtime
            .update_block_value(self.agent_id, label, &value)
            .await
        {
            warn!(agent_id = %self.agent_id, label, error = %e, "Block sync failed, restoring");
            self.state.memory.mirror(label, previous)?;
            return Err(e);
        }

        debug!(agent_id = %self.agent_id, label, len = value.chars().count(), "Block written");
        self.state.updated.push((label.to_string(), value.clone()));
        self.emit(Event::BlockUpdated {
            role: self.role,
            label: label.to_string(),
            value: value.clone(),
        });
        Ok(value)
    }

    /// Enqueue `text` on another role's agent
    pub async fn deliver(&self, to: Role, text: &str) -> Result<DeliveryReceipt, ConclaveError> {
        let receipt = self.services.router.notify(to, text).await?;
        self.emit(Event::Delivered {
            from: self.role,
            receipt: receipt.clone(),
        });
        Ok(receipt)
    }

    fn open_session(&mut self) -> Result<&mut OrchestrationSession, ConclaveError> {
        self.state
            .session
            .as_mut()
            .filter(|s| !s.is_finished())
            .ok_or(ConclaveError::NoActiveSession)
    }
}

/// A callable tool
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutcome, ConclaveError>;
}

fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ConclaveError> {
    serde_json::from_value(args).map_err(|e| ConclaveError::invalid_arguments(tool, e))
}

fn text(value: impl Into<String>) -> ToolOutcome {
    ToolOutcome::Completed(Value::String(value.into()))
}

/// Tools registered to one agent
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// The built-in tool set for `role`
    pub fn for_role(role: Role) -> Self {
        let mut registry = Self::new();
        let tools: Vec<Arc<dyn Tool>> = match role {
            Role::Orchestrator => vec![
                Arc::new(CreateOrchestratorPlan),
                Arc::new(DelegateAgentRequest),
                Arc::new(UpdateChangelog::new(role)),
                Arc::new(EvaluateProgress),
                Arc::new(SendStatusUpdate),
            ],
            Role::Conversational => vec![
                Arc::new(EscalateUserRequest),
                Arc::new(ClarifyUserRequest),
                Arc::new(Echo {
                    name: names::HANDLE_ORCHESTRATOR_MESSAGE,
                }),
                Arc::new(SendMessage),
            ],
            Role::Tasks => vec![
                Arc::new(Echo {
                    name: names::HANDLE_ORCHESTRATOR_REQUEST,
                }),
                Arc::new(UpdateUserTasks),
                Arc::new(UpdateChangelog::new(role)),
                Arc::new(SendOrchestratorMessage),
            ],
            keeper => vec![
                Arc::new(Echo {
                    name: names::HANDLE_ORCHESTRATOR_REQUEST,
                }),
                Arc::new(UpdateUserRecords::new(keeper)),
                Arc::new(UpdateChangelog::new(keeper)),
                Arc::new(SendOrchestratorMessage),
            ],
        };
        for tool in tools {
            registry.register(tool);
        }
        registry
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct CreateOrchestratorPlan;

#[derive(Deserialize)]
struct PlanArgs {
    original_request: String,
    orchestrator_plan: String,
}

#[async_trait]
impl Tool for CreateOrchestratorPlan {
    fn name(&self) -> &str {
        names::CREATE_ORCHESTRATOR_PLAN
    }

    async fn call(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutcome, ConclaveError> {
        let args: PlanArgs = parse_args(self.name(), args)?;

        let mut session = OrchestrationSession::new(ctx.now());
        let rendered = session.plan(&args.original_request, &args.orchestrator_plan)?;
        let steps = session.current_plan().map_or(0, |p| p.steps.len());

        ctx.write_block(ORCHESTRATOR_PLAN, |memory| {
            memory.clear(ORCHESTRATOR_PLAN)?;
            memory.set(ORCHESTRATOR_PLAN, rendered).map(str::to_string)
        })
        .await?;

        if let Some(mut previous) = ctx.state.session.take().filter(|s| !s.is_finished()) {
            let reason = "superseded by a new plan";
            previous.cancel(reason)?;
            ctx.emit(Event::SessionCancelled {
                session_id: previous.id,
                reason: reason.to_string(),
            });
        }

        ctx.emit(Event::SessionStarted {
            session_id: session.id,
            steps,
        });
        let plan_text = ctx.state.memory.get(ORCHESTRATOR_PLAN)?.to_string();
        ctx.state.session = Some(session);
        Ok(text(plan_text))
    }
}

struct DelegateAgentRequest;

#[derive(Deserialize)]
struct DelegateArgs {
    agent_type: String,
    request_description: String,
}

#[async_trait]
impl Tool for DelegateAgentRequest {
    fn name(&self) -> &str {
        names::DELEGATE_AGENT_REQUEST
    }

    async fn call(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutcome, ConclaveError> {
        let args: DelegateArgs = parse_args(self.name(), args)?;

        let role = match ctx.services.router.resolve(&args.agent_type) {
            Ok(role) => role,
            Err(e @ ConclaveError::UnknownRole { .. }) => {
                return Ok(ToolOutcome::Declined(format!("Error: {e}")));
            }
            Err(e) => return Err(e),
        };
        ctx.open_session()?.ensure_next(role)?;

        let receipt = ctx
            .services
            .router
            .delegate(&args.agent_type, &args.request_description)
            .await?;
        ctx.emit(Event::Delivered {
            from: ctx.role,
            receipt: receipt.clone(),
        });
        ctx.open_session()?.delegated(receipt)?;

        Ok(text(format!(
            "Request has been delegated to the {} Agent: {}",
            args.agent_type, args.request_description
        )))
    }
}

struct EvaluateProgress;

#[derive(Debug, Deserialize)]
struct EvaluateArgs {
    complete_orchestration: bool,
}

#[async_trait]
impl Tool for EvaluateProgress {
    fn name(&self) -> &str {
        names::EVALUATE_PROGRESS
    }

    async fn call(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutcome, ConclaveError> {
        let args: EvaluateArgs = parse_args(self.name(), args)?;
        let decision = ctx.open_session()?.evaluate(args.complete_orchestration)?;
        Ok(ToolOutcome::Completed(Value::Bool(decision)))
    }
}

struct SendStatusUpdate;

#[derive(Deserialize)]
struct StatusArgs {
    status: String,
}

#[async_trait]
impl Tool for SendStatusUpdate {
    fn name(&self) -> &str {
        names::SEND_STATUS_UPDATE
    }

    async fn call(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutcome, ConclaveError> {
        let args: StatusArgs = parse_args(self.name(), args)?;
        ctx.open_session()?
            .require_state(SessionState::Completing, "send a status update")?;

        ctx.deliver(Role::Conversational, &args.status).await?;

        let session = ctx.open_session()?;
        let delegations = session.complete()?;
        let session_id = session.id;
        ctx.emit(Event::SessionCompleted {
            session_id,
            delegations,
        });
        Ok(ToolOutcome::Completed(Value::Null))
    }
}

// ---------------------------------------------------------------------------
// Record keepers
// ---------------------------------------------------------------------------

/// Appends to, amends or deletes from the agent's changelog and re-renders its block
///
/// When the rendered log would overflow the block, the oldest entries are
/// evicted. An empty `entry` with `replaces` deletes that entry; the
/// requests changelog only grows or is amended.
struct UpdateChangelog {
    name: String,
    label: String,
}

impl UpdateChangelog {
    fn new(role: Role) -> Self {
        Self {
            name: names::update_changelog(role),
            label: changelog_label(role),
        }
    }
}

#[derive(Deserialize)]
struct ChangelogArgs {
    #[serde(default)]
    entry: String,
    #[serde(default)]
    replaces: Option<String>,
}

enum ChangelogEdit {
    Push(ChangelogEntry),
    Amend(String, ChangelogEntry),
    Remove(String),
}

#[async_trait]
impl Tool for UpdateChangelog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutcome, ConclaveError> {
        let args: ChangelogArgs = parse_args(self.name(), args)?;
        let orchestrating = ctx.role == Role::Orchestrator;

        let edit = match args.replaces {
            Some(old) if args.entry.trim().is_empty() => {
                if orchestrating {
                    return Err(ConclaveError::invalid_arguments(
                        self.name(),
                        "requests changelog entries can be amended but not deleted",
                    ));
                }
                ChangelogEdit::Remove(old)
            }
            Some(old) => ChangelogEdit::Amend(old, ChangelogEntry::new(ctx.now(), args.entry)?),
            None => ChangelogEdit::Push(ChangelogEntry::new(ctx.now(), args.entry)?),
        };

        if orchestrating {
            ctx.open_session()?
                .require_state(SessionState::Logging, "log")?;
        }

        let mut changelog = ctx.state.changelog.clone();
        let (summary, logged) = match edit {
            ChangelogEdit::Push(entry) => {
                changelog.push(entry.clone());
                (entry.render(), Some(entry))
            }
            ChangelogEdit::Amend(old, entry) => {
                changelog.amend(&old, entry.clone())?;
                (entry.render(), Some(entry))
            }
            ChangelogEdit::Remove(old) => {
                let removed = changelog.remove(&old)?;
                (format!("Removed: {}", removed.render()), None)
            }
        };

        let label = self.label.as_str();
        let limit = ctx.state.memory.block(label)?.limit;
        changelog.fit(limit);
        let rendered = changelog.render();
        ctx.write_block(label, |memory| memory.set(label, rendered).map(str::to_string))
            .await?;
        ctx.state.changelog = changelog;

        if let (true, Some(entry)) = (orchestrating, logged) {
            ctx.open_session()?.logged(entry)?;
        }
        Ok(text(summary))
    }
}

struct UpdateUserTasks;

#[async_trait]
impl Tool for UpdateUserTasks {
    fn name(&self) -> &str {
        "update_user_tasks"
    }

    async fn call(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutcome, ConclaveError> {
        let change: TaskChange = parse_args(self.name(), args)?;

        let mut tasks = ctx.state.tasks.clone().unwrap_or_else(TaskSet::default);
        let update = tasks.apply(change, ctx.now())?;
        let rendered = tasks.render();
        let label = "user_tasks";
        ctx.write_block(label, |memory| memory.set(label, rendered).map(str::to_string))
            .await?;
        ctx.state.tasks = Some(tasks);

        if let Some(warning) = update.warning {
            ctx.emit(Event::TaskLimitReached {
                active: warning.active,
                limit: warning.limit,
            });
        }
        ctx.state.pending_warning = update.warning;

        Ok(ToolOutcome::Completed(json!({
            "active": update.active,
            "warning": update.warning.map(|w| w.message()),
        })))
    }
}

/// Literal replace on a record block (`user_projects`, ...)
struct UpdateUserRecords {
    name: String,
    label: String,
}

impl UpdateUserRecords {
    fn new(role: Role) -> Self {
        Self {
            name: names::update_records(role),
            label: records_label(role).unwrap_or_else(|| format!("user_{}", role.key())),
        }
    }
}

#[derive(Deserialize)]
struct ReplaceArgs {
    old_str: String,
    new_str: String,
}

#[async_trait]
impl Tool for UpdateUserRecords {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutcome, ConclaveError> {
        let args: ReplaceArgs = parse_args(self.name(), args)?;
        let label = self.label.as_str();
        ctx.write_block(label, |memory| {
            memory
                .replace(label, &args.old_str, &args.new_str)
                .map(str::to_string)
        })
        .await?;
        Ok(ToolOutcome::Completed(Value::Null))
    }
}

struct SendOrchestratorMessage;

#[async_trait]
impl Tool for SendOrchestratorMessage {
    fn name(&self) -> &str {
        names::SEND_ORCHESTRATOR_MESSAGE
    }

    async fn call(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutcome, ConclaveError> {
        let args: StatusArgs = parse_args(self.name(), args)?;
        let message = match &ctx.state.pending_warning {
            Some(warning) => format!("{}\n\n{}", args.status, warning.message()),
            None => args.status,
        };

        ctx.deliver(Role::Orchestrator, &message).await?;
        if ctx.state.pending_warning.take().is_some() {
            info!(agent_id = %ctx.agent_id, "Active task warning forwarded");
        }
        Ok(ToolOutcome::Completed(Value::Null))
    }
}

/// Returns its single text argument
struct Echo {
    name: &'static str,
}

#[async_trait]
impl Tool for Echo {
    fn name(&self) -> &str {
        self.name
    }

    async fn call(&self, _ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutcome, ConclaveError> {
        match args {
            Value::String(s) => Ok(text(s)),
            Value::Object(map) if map.len() == 1 => match map.into_iter().next() {
                Some((_, Value::String(s))) => Ok(text(s)),
                _ => Err(ConclaveError::invalid_arguments(self.name, "expected a text argument")),
            },
            _ => Err(ConclaveError::invalid_arguments(self.name, "expected a single text argument")),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversational
// ---------------------------------------------------------------------------

struct EscalateUserRequest;

#[derive(Deserialize)]
struct EscalateArgs {
    user_request: String,
}

#[async_trait]
impl Tool for EscalateUserRequest {
    fn name(&self) -> &str {
        names::ESCALATE_USER_REQUEST
    }

    async fn call(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutcome, ConclaveError> {
        let args: EscalateArgs = parse_args(self.name(), args)?;
        ctx.deliver(Role::Orchestrator, &args.user_request).await?;
        Ok(text(ESCALATED))
    }
}

struct ClarifyUserRequest;

#[derive(Deserialize)]
struct ClarifyArgs {
    question: String,
    follow_up: Vec<String>,
}

#[async_trait]
impl Tool for ClarifyUserRequest {
    fn name(&self) -> &str {
        names::CLARIFY_USER_REQUEST
    }

    async fn call(&self, _ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutcome, ConclaveError> {
        let args: ClarifyArgs = parse_args(self.name(), args)?;
        if !(2..=4).contains(&args.follow_up.len()) {
            return Err(ConclaveError::invalid_arguments(
                self.name(),
                format!("expected 2-4 suggestions, got {}", args.follow_up.len()),
            ));
        }

        let options = args
            .follow_up
            .iter()
            .enumerate()
            .map(|(i, suggestion)| format!("- Option {}: {}.", i + 1, suggestion))
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(text(format!("{}\n\n{}", args.question, options)))
    }
}

struct SendMessage;

#[derive(Deserialize)]
struct MessageArgs {
    message: String,
}

#[async_trait]
impl Tool for SendMessage {
    fn name(&self) -> &str {
        names::SEND_MESSAGE
    }

    async fn call(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutcome, ConclaveError> {
        let args: MessageArgs = parse_args(self.name(), args)?;
        ctx.emit(Event::UserMessage { text: args.message });
        Ok(ToolOutcome::Completed(Value::Null))
    }
}
