//! Active task set kept by the Tasks role

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConclaveError;

/// At this many active tasks the orchestrator is asked to warn the user
pub const DEFAULT_ACTIVE_TASK_LIMIT: usize = 7;

/// Labels that would smuggle a priority or status into a description
const FORBIDDEN_LABELS: &[&str] = &["priority:", "status:"];

/// An active task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A change requested against the task set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum TaskChange {
    Add {
        description: String,
    },
    Remove {
        description: String,
    },
    Rename {
        description: String,
        new_description: String,
    },
}

/// Advisory raised when the active count reaches the limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTaskWarning {
    pub active: usize,
    pub limit: usize,
}

impl ActiveTaskWarning {
    /// Text appended to the Tasks role's report to the orchestrator
    pub fn message(&self) -> String {
        format!(
            "Active task limit reached: the user has {} active tasks (limit is fewer than {}). \
             Let the user know they should consider focusing on their highest priority tasks.",
            self.active, self.limit
        )
    }
}

/// Result of applying a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSetUpdate {
    pub active: usize,
    pub warning: Option<ActiveTaskWarning>,
}

/// Ordered collection of active tasks
///
/// The limit is advisory: changes are never refused for reaching it, but
/// every change that leaves `active >= limit` carries a warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSet {
    tasks: Vec<Task>,
    limit: usize,
}

impl TaskSet {
    pub fn new(limit: usize) -> Self {
        Self {
            tasks: Vec::new(),
            limit,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Apply a change stamped with `now`
    pub fn apply(&mut self, change: TaskChange, now: DateTime<Utc>) -> Result<TaskSetUpdate, ConclaveError> {
        match change {
            TaskChange::Add { description } => {
                let description = validate(&description)?;
                if self.position(&description).is_some() {
                    return Err(ConclaveError::InvalidTask(format!(
                        "'{description}' is already an active task"
                    )));
                }
                info!(%description, "Adding task");
                self.tasks.push(Task {
                    description,
                    created_at: now,
                });
            }
            TaskChange::Remove { description } => {
                let pos = self.require(&description)?;
                let removed = self.tasks.remove(pos);
                info!(description = %removed.description, "Removed task");
            }
            TaskChange::Rename {
                description,
                new_description,
            } => {
                let pos = self.require(&description)?;
                let new_description = validate(&new_description)?;
                if self
                    .position(&new_description)
                    .is_some_and(|other| other != pos)
                {
                    return Err(ConclaveError::InvalidTask(format!(
                        "'{new_description}' is already an active task"
                    )));
                }
                self.tasks[pos].description = new_description;
            }
        }

        let active = self.tasks.len();
        let warning = (active >= self.limit).then_some(ActiveTaskWarning {
            active,
            limit: self.limit,
        });
        if warning.is_some() {
            warn!(active, limit = self.limit, "Active task limit reached");
        }

        Ok(TaskSetUpdate { active, warning })
    }

    /// Block text: one task per line with its creation datetime
    pub fn render(&self) -> String {
        self.tasks
            .iter()
            .map(|t| {
                format!(
                    "- {} (created {})",
                    t.description,
                    t.created_at.format("%Y-%m-%d %H:%M UTC")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn position(&self, description: &str) -> Option<usize> {
        let wanted = description.trim();
        self.tasks
            .iter()
            .position(|t| t.description.eq_ignore_ascii_case(wanted))
    }

    fn require(&self, description: &str) -> Result<usize, ConclaveError> {
        self.position(description).ok_or_else(|| {
            ConclaveError::InvalidTask(format!("no active task matches '{}'", description.trim()))
        })
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVE_TASK_LIMIT)
    }
}

fn validate(description: &str) -> Result<String, ConclaveError> {
    let description = description.trim();
    if description.is_empty() {
        return Err(ConclaveError::InvalidTask("description is empty".into()));
    }
    let lowered = description.to_lowercase();
    if let Some(label) = FORBIDDEN_LABELS.iter().find(|l| lowered.contains(*l)) {
        return Err(ConclaveError::InvalidTask(format!(
            "descriptions carry no priority or status (found '{label}')"
        )));
    }
    Ok(description.to_string())
}
