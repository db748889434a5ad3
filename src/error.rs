//! Conclave error types

use thiserror::Error;

use crate::protocol::Role;

/// Errors that can occur in the conclave
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// Replace target is not a literal substring of the block
    #[error("Old content '{old}' not found in memory block '{label}'")]
    NotFound { label: String, old: String },

    /// No block with that label on this agent
    #[error("Memory block not found: {0}")]
    BlockNotFound(String),

    /// Block is mirrored from another agent and cannot be written by tools
    #[error("Memory block '{0}' is read-only")]
    ReadOnlyBlock(String),

    /// Write would exceed the block's character limit
    #[error("Memory block '{label}' limit exceeded: {len} > {limit} characters")]
    LimitExceeded {
        label: String,
        len: usize,
        limit: usize,
    },

    /// Delegation to a role that is not routable
    #[error("Unknown agent type '{name}'. Please use one of: {}", .valid.join(", "))]
    UnknownRole { name: String, valid: Vec<String> },

    /// Tool is not registered to the agent
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Tool is registered but not permitted after the previous call
    #[error("Tool '{tool}' is not permitted here; allowed: {}", .allowed.join(", "))]
    GateViolation { tool: String, allowed: Vec<String> },

    /// A tool was called after an exit-loop tool ended the turn
    #[error("Turn has ended; '{0}' cannot be called until the next turn")]
    TurnEnded(String),

    /// Tool rules reference unregistered tools or conflict
    #[error("Invalid tool rule set: {0}")]
    InvalidRuleSet(String),

    /// Session operation not valid in the current state
    #[error("Cannot {action} while session is {state}")]
    InvalidTransition { state: String, action: &'static str },

    /// Plan could not be parsed into delegations
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Delegation does not match the next planned step
    #[error("Plan expects a delegation to {expected}, got {actual}")]
    PlanMismatch { expected: Role, actual: Role },

    /// Changelog text used a relative time expression
    #[error("Changelog entry uses relative time reference '{0}'; use an explicit date and time")]
    RelativeTimeReference(String),

    /// Task change rejected
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Tool arguments failed to parse or validate
    #[error("Invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// No orchestration session is open
    #[error("No active orchestration session")]
    NoActiveSession,

    /// Directory has no agent for the role
    #[error("No agent registered for role {0}")]
    AgentNotFound(Role),

    /// Runtime call failed (network, auth, non-success status)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Channel error
    #[error("Channel is closed")]
    ChannelClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ConclaveError {
    /// Whether retrying the same call could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConclaveError::Transport(_))
    }

    pub(crate) fn invalid_arguments(tool: &str, reason: impl ToString) -> Self {
        ConclaveError::InvalidArguments {
            tool: tool.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for ConclaveError {
    fn from(err: reqwest::Error) -> Self {
        ConclaveError::Transport(err.to_string())
    }
}

impl From<config::ConfigError> for ConclaveError {
    fn from(err: config::ConfigError) -> Self {
        ConclaveError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_role_lists_valid_roles() {
        let err = ConclaveError::UnknownRole {
            name: "Calendar".into(),
            valid: vec!["Tasks".into(), "Projects".into()],
        };
        assert_eq!(
            err.to_string(),
            "Unknown agent type 'Calendar'. Please use one of: Tasks, Projects"
        );
    }

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(ConclaveError::Transport("reset".into()).is_retryable());
        assert!(!ConclaveError::ChannelClosed.is_retryable());
        assert!(!ConclaveError::BlockNotFound("x".into()).is_retryable());
    }
}
