//! Tool call gate - enforces which tool may follow which
//!
//! Each agent carries a set of declarative tool rules. The gate compiles
//! them into a transition table and is consulted before every dispatch:
//!
//! ```text
//!   Start ──(tool allowed at start)──► After(T)
//!   After(T) ──constrain_child_tools──► only children of T
//!   After(T) ──conditional──────────► child chosen by T's output
//!   After(T) ──exit_loop────────────► Exited (no more calls this turn)
//!   After(T) ──(no rule)────────────► any registered tool
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ConclaveError;

/// A declarative ordering rule, in the hosted runtime's wire format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolRule {
    /// After `tool_name`, only `children` may run
    #[serde(rename = "constrain_child_tools")]
    ConstrainChildren {
        tool_name: String,
        children: Vec<String>,
    },
    /// After `tool_name`, the turn ends
    ExitLoop { tool_name: String },
    /// After `tool_name`, route on its output
    Conditional {
        tool_name: String,
        child_output_mapping: BTreeMap<String, String>,
        default_child: String,
    },
    /// `tool_name` may open a turn even if it is some tool's child
    #[serde(rename = "run_first")]
    InitialTool { tool_name: String },
}

impl ToolRule {
    pub fn constrain<I, S>(tool: &str, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ToolRule::ConstrainChildren {
            tool_name: tool.to_string(),
            children: children.into_iter().map(Into::into).collect(),
        }
    }

    pub fn exit_loop(tool: &str) -> Self {
        ToolRule::ExitLoop {
            tool_name: tool.to_string(),
        }
    }

    pub fn conditional<I, K, V>(tool: &str, mapping: I, default: &str) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        ToolRule::Conditional {
            tool_name: tool.to_string(),
            child_output_mapping: mapping
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            default_child: default.to_string(),
        }
    }

    pub fn initial(tool: &str) -> Self {
        ToolRule::InitialTool {
            tool_name: tool.to_string(),
        }
    }

    pub fn tool_name(&self) -> &str {
        match self {
            ToolRule::ConstrainChildren { tool_name, .. }
            | ToolRule::ExitLoop { tool_name }
            | ToolRule::Conditional { tool_name, .. }
            | ToolRule::InitialTool { tool_name } => tool_name,
        }
    }

    /// Tools this rule can route to
    fn targets(&self) -> Vec<&str> {
        match self {
            ToolRule::ConstrainChildren { children, .. } => {
                children.iter().map(String::as_str).collect()
            }
            ToolRule::Conditional {
                child_output_mapping,
                default_child,
                ..
            } => child_output_mapping
                .values()
                .map(String::as_str)
                .chain(std::iter::once(default_child.as_str()))
                .collect(),
            ToolRule::ExitLoop { .. } | ToolRule::InitialTool { .. } => Vec::new(),
        }
    }
}

/// Where the gate is within the current turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Start,
    After(String),
    Exited(String),
}

/// Effect of a recorded call on the rest of the turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Continue { allowed: Vec<String> },
    ExitLoop,
}

#[derive(Debug, Clone)]
enum Outgoing {
    Children(BTreeSet<String>),
    Exit,
    Conditional {
        mapping: BTreeMap<String, String>,
        default: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Allowed {
    Any,
    Only(BTreeSet<String>),
    Nothing,
}

/// Per-agent tool ordering state machine
#[derive(Debug, Clone)]
pub struct ToolGate {
    tools: BTreeSet<String>,
    outgoing: HashMap<String, Outgoing>,
    start: BTreeSet<String>,
    state: GateState,
    allowed: Allowed,
}

impl ToolGate {
    /// Compile `rules` against the registered `tools`
    ///
    /// Fails if a rule names an unregistered tool or if one tool carries
    /// more than one routing rule.
    pub fn new<I, S>(tools: I, rules: &[ToolRule]) -> Result<Self, ConclaveError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tools: BTreeSet<String> = tools.into_iter().map(Into::into).collect();
        let registered = |name: &str| -> Result<(), ConclaveError> {
            if tools.contains(name) {
                Ok(())
            } else {
                Err(ConclaveError::InvalidRuleSet(format!(
                    "rule references unregistered tool '{name}'"
                )))
            }
        };

        let mut outgoing = HashMap::new();
        let mut constrained = BTreeSet::new();
        let mut initial = BTreeSet::new();

        for rule in rules {
            registered(rule.tool_name())?;
            for target in rule.targets() {
                registered(target)?;
                constrained.insert(target.to_string());
            }

            let edge = match rule {
                ToolRule::ConstrainChildren { children, .. } => {
                    Outgoing::Children(children.iter().cloned().collect())
                }
                ToolRule::ExitLoop { .. } => Outgoing::Exit,
                ToolRule::Conditional {
                    child_output_mapping,
                    default_child,
                    ..
                } => Outgoing::Conditional {
                    mapping: child_output_mapping.clone(),
                    default: default_child.clone(),
                },
                ToolRule::InitialTool { tool_name } => {
                    initial.insert(tool_name.clone());
                    continue;
                }
            };

            if outgoing.insert(rule.tool_name().to_string(), edge).is_some() {
                return Err(ConclaveError::InvalidRuleSet(format!(
                    "tool '{}' has more than one routing rule",
                    rule.tool_name()
                )));
            }
        }

        let start: BTreeSet<String> = tools
            .iter()
            .filter(|t| !constrained.contains(*t) || initial.contains(*t))
            .cloned()
            .collect();
        if start.is_empty() && !tools.is_empty() {
            return Err(ConclaveError::InvalidRuleSet(
                "no tool can open a turn".into(),
            ));
        }

        Ok(Self {
            tools,
            outgoing,
            allowed: Allowed::Only(start.clone()),
            start,
            state: GateState::Start,
        })
    }

    /// Reset for a new turn
    pub fn begin_turn(&mut self) {
        self.state = GateState::Start;
        self.allowed = Allowed::Only(self.start.clone());
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn is_exited(&self) -> bool {
        matches!(self.state, GateState::Exited(_))
    }

    /// Tools that may open a turn
    pub fn start_tools(&self) -> Vec<String> {
        self.start.iter().cloned().collect()
    }

    /// Tools permitted as the next call
    pub fn allowed(&self) -> Vec<String> {
        match &self.allowed {
            Allowed::Any => self.tools.iter().cloned().collect(),
            Allowed::Only(set) => set.iter().cloned().collect(),
            Allowed::Nothing => Vec::new(),
        }
    }

    pub fn permits(&self, tool: &str) -> bool {
        self.check(tool).is_ok()
    }

    /// Validate `tool` as the next call without changing state
    pub fn check(&self, tool: &str) -> Result<(), ConclaveError> {
        if !self.tools.contains(tool) {
            return Err(ConclaveError::UnknownTool(tool.to_string()));
        }
        let permitted = match &self.allowed {
            Allowed::Any => true,
            Allowed::Only(set) => set.contains(tool),
            Allowed::Nothing => return Err(ConclaveError::TurnEnded(tool.to_string())),
        };
        if permitted {
            Ok(())
        } else {
            Err(ConclaveError::GateViolation {
                tool: tool.to_string(),
                allowed: self.allowed(),
            })
        }
    }

    /// Record that `tool` ran and produced `output`
    ///
    /// Callers must `check` first; recording an unchecked call moves the
    /// gate as if it had been permitted.
    pub fn record(&mut self, tool: &str, output: &Value) -> Transition {
        let transition = match self.outgoing.get(tool) {
            Some(Outgoing::Exit) => {
                self.state = GateState::Exited(tool.to_string());
                self.allowed = Allowed::Nothing;
                return Transition::ExitLoop;
            }
            Some(Outgoing::Children(children)) => Allowed::Only(children.clone()),
            Some(Outgoing::Conditional { mapping, default }) => {
                let child = route_key(output)
                    .and_then(|key| {
                        mapping
                            .iter()
                            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
                            .map(|(_, child)| child.clone())
                    })
                    .unwrap_or_else(|| default.clone());
                debug!(tool, %child, "Conditional route");
                Allowed::Only(BTreeSet::from([child]))
            }
            None => Allowed::Any,
        };

        self.state = GateState::After(tool.to_string());
        self.allowed = transition;
        Transition::Continue {
            allowed: self.allowed(),
        }
    }
}

/// Key used to look up a conditional route
fn route_key(output: &Value) -> Option<String> {
    match output {
        Value::Bool(b) => Some(b.to_string()),
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
