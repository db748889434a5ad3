//! Orchestration session - one top-level request from plan to status update
//!
//! ```text
//!   Planning ──plan──► Delegating ──delegated──► Logging ──logged──► Evaluating
//!                          ▲                                             │
//!                          └──────────────── evaluate(false) ◄───────────┤
//!                                                                        ▼
//!                                 Completed ◄──complete── Completing ◄── evaluate(true)
//!
//!   any non-terminal state ──cancel──► Cancelled
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::changelog::ChangelogEntry;
use crate::error::ConclaveError;
use crate::protocol::{DeliveryReceipt, Role, SessionId};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Planning,
    Delegating,
    Logging,
    Evaluating,
    Completing,
    Completed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Planning => "planning",
            SessionState::Delegating => "delegating",
            SessionState::Logging => "logging",
            SessionState::Evaluating => "evaluating",
            SessionState::Completing => "completing",
            SessionState::Completed => "completed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One planned delegation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub role: Role,
    pub description: String,
}

/// A request broken into planned delegations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorPlan {
    pub original_request: String,
    pub body: String,
    pub steps: Vec<PlanStep>,
}

impl OrchestratorPlan {
    /// Parse list lines of the form `1. Tasks: ...` or `- Projects Agent: ...`
    ///
    /// Lines without a list marker, and list lines whose head is not a role
    /// (detail bullets such as `- Deadline: ...`), are free text and skipped.
    /// A list line naming a role that cannot be delegated to is an error.
    pub fn parse(original_request: &str, body: &str) -> Result<Self, ConclaveError> {
        let mut steps = Vec::new();

        for line in body.lines() {
            let Some(item) = strip_list_marker(line.trim()) else {
                continue;
            };
            let Some((head, description)) = item.split_once(':') else {
                continue;
            };
            let head = head.trim().trim_matches('*').trim();
            let Ok(role) = head.parse::<Role>() else {
                debug!(line, "Plan line is not a delegation step");
                continue;
            };
            if !role.is_delegation_target() {
                return Err(ConclaveError::InvalidPlan(format!(
                    "{role} cannot be delegated to"
                )));
            }
            let description = description.trim();
            if description.is_empty() {
                return Err(ConclaveError::InvalidPlan(format!(
                    "step for {role} has no description"
                )));
            }
            steps.push(PlanStep {
                role,
                description: description.to_string(),
            });
        }

        if steps.is_empty() {
            return Err(ConclaveError::InvalidPlan(
                "plan has no delegation steps".into(),
            ));
        }

        Ok(Self {
            original_request: original_request.trim().to_string(),
            body: body.trim().to_string(),
            steps,
        })
    }

    /// Text written to the plan block
    pub fn render(&self) -> String {
        format!(
            "Original Request: {}\n\nOrchestrator Plan:\n{}",
            self.original_request, self.body
        )
    }
}

fn strip_list_marker(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix(['-', '*', '•']) {
        return Some(rest.trim_start());
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    line[digits..]
        .strip_prefix(['.', ')'])
        .map(str::trim_start)
}

/// Tracks one request through its planned delegations
#[derive(Debug, Clone)]
pub struct OrchestrationSession {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    state: SessionState,
    plan: Option<OrchestratorPlan>,
    delegations: Vec<DeliveryReceipt>,
    log: Vec<ChangelogEntry>,
}

impl OrchestrationSession {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        let id = SessionId::new();
        info!(session_id = %id, "Creating new orchestration session");
        Self {
            id,
            started_at,
            state: SessionState::Planning,
            plan: None,
            delegations: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn current_plan(&self) -> Option<&OrchestratorPlan> {
        self.plan.as_ref()
    }

    pub fn delegations(&self) -> &[DeliveryReceipt] {
        &self.delegations
    }

    pub fn log(&self) -> &[ChangelogEntry] {
        &self.log
    }

    /// Fail with `InvalidTransition` unless the session is in `state`
    pub fn require_state(&self, state: SessionState, action: &'static str) -> Result<(), ConclaveError> {
        if self.state == state {
            Ok(())
        } else {
            Err(ConclaveError::InvalidTransition {
                state: self.state.to_string(),
                action,
            })
        }
    }

    fn transition(&mut self, to: SessionState) {
        debug!(session_id = %self.id, from = %self.state, %to, "Session transition");
        self.state = to;
    }

    /// Parse and store the plan; returns the rendered plan text
    pub fn plan(&mut self, original_request: &str, body: &str) -> Result<String, ConclaveError> {
        self.require_state(SessionState::Planning, "plan")?;
        let plan = OrchestratorPlan::parse(original_request, body)?;
        let rendered = plan.render();
        info!(session_id = %self.id, steps = plan.steps.len(), "Plan created");
        self.plan = Some(plan);
        self.transition(SessionState::Delegating);
        Ok(rendered)
    }

    /// Next planned step not yet delegated
    pub fn next_step(&self) -> Option<&PlanStep> {
        self.plan
            .as_ref()
            .and_then(|p| p.steps.get(self.delegations.len()))
    }

    pub fn remaining(&self) -> usize {
        self.plan
            .as_ref()
            .map_or(0, |p| p.steps.len().saturating_sub(self.delegations.len()))
    }

    /// Check that delegating to `role` now is valid, before anything is sent
    pub fn ensure_next(&self, role: Role) -> Result<(), ConclaveError> {
        self.require_state(SessionState::Delegating, "delegate")?;
        let step = self.next_step().ok_or_else(|| {
            ConclaveError::InvalidPlan("every planned step is already delegated".into())
        })?;
        if step.role != role {
            return Err(ConclaveError::PlanMismatch {
                expected: step.role,
                actual: role,
            });
        }
        Ok(())
    }

    /// Record a delivered delegation
    pub fn delegated(&mut self, receipt: DeliveryReceipt) -> Result<(), ConclaveError> {
        self.ensure_next(receipt.role)?;
        info!(
            session_id = %self.id,
            role = %receipt.role,
            step = self.delegations.len() + 1,
            "Delegation recorded"
        );
        self.delegations.push(receipt);
        self.transition(SessionState::Logging);
        Ok(())
    }

    /// Record the changelog entry for the last delegation
    pub fn logged(&mut self, entry: ChangelogEntry) -> Result<(), ConclaveError> {
        self.require_state(SessionState::Logging, "log")?;
        self.log.push(entry);
        self.transition(SessionState::Evaluating);
        Ok(())
    }

    /// Decide whether every planned step has been delegated
    ///
    /// The decision is computed from the plan; a `claimed` value that
    /// disagrees is overridden.
    pub fn evaluate(&mut self, claimed: bool) -> Result<bool, ConclaveError> {
        self.require_state(SessionState::Evaluating, "evaluate")?;
        let decision = self.remaining() == 0;
        if claimed != decision {
            warn!(
                session_id = %self.id,
                claimed,
                decision,
                remaining = self.remaining(),
                "Progress claim overridden"
            );
        }
        self.transition(if decision {
            SessionState::Completing
        } else {
            SessionState::Delegating
        });
        Ok(decision)
    }

    /// Finish after the status update went out
    pub fn complete(&mut self) -> Result<usize, ConclaveError> {
        self.require_state(SessionState::Completing, "complete")?;
        self.transition(SessionState::Completed);
        info!(session_id = %self.id, delegations = self.delegations.len(), "Session completed");
        Ok(self.delegations.len())
    }

    pub fn cancel(&mut self, reason: &str) -> Result<(), ConclaveError> {
        if self.state.is_terminal() {
            return Err(ConclaveError::InvalidTransition {
                state: self.state.to_string(),
                action: "cancel",
            });
        }
        info!(session_id = %self.id, reason, "Session cancelled");
        self.transition(SessionState::Cancelled);
        Ok(())
    }
}
