//! Protocol types shared by the host, its agents and the runtime boundary

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ConclaveError;

/// Identifier assigned to an agent by the hosted runtime
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one orchestration session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Idempotency key carried by every cross-agent send
///
/// Retries of one send reuse the same key so the runtime can drop duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(Uuid);

impl DeliveryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of an agent in the conclave
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Orchestrator,
    Tasks,
    Projects,
    Reminders,
    Preferences,
    Conversational,
}

impl Role {
    /// Every role, in provisioning order (the orchestrator first)
    pub const ALL: [Role; 6] = [
        Role::Orchestrator,
        Role::Tasks,
        Role::Projects,
        Role::Reminders,
        Role::Preferences,
        Role::Conversational,
    ];

    /// Roles the orchestrator may delegate to
    pub const DELEGATION_TARGETS: [Role; 5] = [
        Role::Conversational,
        Role::Tasks,
        Role::Projects,
        Role::Reminders,
        Role::Preferences,
    ];

    /// Display name, as used in delegation requests
    pub fn name(&self) -> &'static str {
        match self {
            Role::Orchestrator => "Orchestrator",
            Role::Tasks => "Tasks",
            Role::Projects => "Projects",
            Role::Reminders => "Reminders",
            Role::Preferences => "Preferences",
            Role::Conversational => "Conversational",
        }
    }

    /// Lowercase key used in persisted state
    pub fn key(&self) -> &'static str {
        match self {
            Role::Orchestrator => "orchestrator",
            Role::Tasks => "tasks",
            Role::Projects => "projects",
            Role::Reminders => "reminders",
            Role::Preferences => "preferences",
            Role::Conversational => "conversational",
        }
    }

    /// `ROLE_AGENT_ID` variable name
    pub fn env_key(&self) -> String {
        format!("{}_AGENT_ID", self.key().to_uppercase())
    }

    /// Roles that keep a record block and a changelog
    pub fn is_record_keeper(&self) -> bool {
        matches!(
            self,
            Role::Tasks | Role::Projects | Role::Reminders | Role::Preferences
        )
    }

    pub fn is_delegation_target(&self) -> bool {
        Self::DELEGATION_TARGETS.contains(self)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Role {
    type Err = ConclaveError;

    /// Case-insensitive; accepts a trailing "agent" ("Tasks Agent")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let lowered = trimmed.to_ascii_lowercase();
        let name = lowered.strip_suffix(" agent").unwrap_or(&lowered).trim();

        Role::ALL
            .iter()
            .copied()
            .find(|role| role.key() == name)
            .ok_or_else(|| ConclaveError::UnknownRole {
                name: trimmed.to_string(),
                valid: Role::ALL.iter().map(|r| r.name().to_string()).collect(),
            })
    }
}

/// Author of a message enqueued on an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    System,
    User,
}

/// A message to enqueue on a target agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub delivery_id: DeliveryId,
    pub sender: Sender,
    pub text: String,
}

/// Confirmation that a message was enqueued on its target
///
/// Says nothing about whether the target has processed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub delivery_id: DeliveryId,
    pub role: Role,
    pub agent_id: AgentId,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// A single tool invocation issued for an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Result of a tool that ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum ToolOutcome {
    /// The tool ran; the value feeds conditional routing
    Completed(Value),
    /// The tool refused with a descriptive message the caller can act on;
    /// the gate does not advance
    Declined(String),
}

impl ToolOutcome {
    pub fn value(&self) -> Option<&Value> {
        match self {
            ToolOutcome::Completed(value) => Some(value),
            ToolOutcome::Declined(_) => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ToolOutcome::Completed(_))
    }
}

/// Agent lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    InTurn,
    Terminated,
}

/// Operations submitted to the host
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Deliver an inbound message and open a new turn
    BeginTurn { role: Role, message: String },
    /// Dispatch one tool call on the role's agent
    ToolCall { role: Role, call: ToolCall },
    /// Cancel the orchestrator's open session
    Cancel { reason: String },
    /// Stop the host loop
    Shutdown,
}

/// Events emitted by the host and its agents
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TurnStarted {
        role: Role,
        agent_id: AgentId,
    },
    ToolCompleted {
        role: Role,
        tool: String,
        output: Value,
    },
    ToolDeclined {
        role: Role,
        tool: String,
        message: String,
    },
    ToolFailed {
        role: Role,
        tool: String,
        error: String,
    },
    GateViolation {
        role: Role,
        tool: String,
        allowed: Vec<String>,
    },
    Delivered {
        from: Role,
        receipt: DeliveryReceipt,
    },
    UserMessage {
        text: String,
    },
    BlockUpdated {
        role: Role,
        label: String,
        value: String,
    },
    /// A read-only copy could not be updated and still holds its old value
    MirrorFailed {
        role: Role,
        label: String,
        error: String,
    },
    TaskLimitReached {
        active: usize,
        limit: usize,
    },
    SessionStarted {
        session_id: SessionId,
        steps: usize,
    },
    SessionCompleted {
        session_id: SessionId,
        delegations: usize,
    },
    SessionCancelled {
        session_id: SessionId,
        reason: String,
    },
    TurnEnded {
        role: Role,
        agent_id: AgentId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_is_lenient() {
        assert_eq!("tasks".parse::<Role>().unwrap(), Role::Tasks);
        assert_eq!("Projects Agent".parse::<Role>().unwrap(), Role::Projects);
        assert_eq!(" Orchestrator ".parse::<Role>().unwrap(), Role::Orchestrator);
    }

    #[test]
    fn test_role_parse_unknown() {
        let err = "Calendar".parse::<Role>().unwrap_err();
        assert!(matches!(err, ConclaveError::UnknownRole { ref name, .. } if name == "Calendar"));
    }

    #[test]
    fn test_role_env_key() {
        assert_eq!(Role::Conversational.env_key(), "CONVERSATIONAL_AGENT_ID");
    }

    #[test]
    fn test_delegation_targets_exclude_orchestrator() {
        assert!(!Role::Orchestrator.is_delegation_target());
        assert_eq!(Role::DELEGATION_TARGETS.len(), 5);
    }

    #[test]
    fn test_tool_call_defaults_arguments() {
        let call: ToolCall = serde_json::from_str(r#"{"name": "send_message"}"#).unwrap();
        assert_eq!(call.arguments, Value::Null);
    }
}
