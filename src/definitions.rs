//! Static definitions of the six conclave agents

use serde::{Deserialize, Serialize};

use crate::error::ConclaveError;
use crate::gate::{ToolGate, ToolRule};
use crate::memory::{LimitPolicy, MemoryBlock, MemoryBlockStore};
use crate::protocol::Role;
use crate::tools::names;

pub const ORCHESTRATOR_PLAN: &str = "orchestrator_plan";
pub const REQUESTS_CHANGELOG: &str = "requests_changelog";

const ORCHESTRATOR_BLOCK_LIMIT: usize = 15_000;
pub const DEFAULT_BLOCK_LIMIT: usize = 8_000;

/// Label of the record block a role keeps (`user_tasks`, ...)
pub fn records_label(role: Role) -> Option<String> {
    role.is_record_keeper().then(|| format!("user_{}", role.key()))
}

/// Label of a role's changelog block
pub fn changelog_label(role: Role) -> String {
    match role {
        Role::Orchestrator => REQUESTS_CHANGELOG.to_string(),
        other => format!("{}_changelog", other.key()),
    }
}

/// A memory block an agent is provisioned with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDefinition {
    pub label: String,
    pub limit: usize,
    pub read_only: bool,
}

impl BlockDefinition {
    fn writable(label: impl Into<String>, limit: usize) -> Self {
        Self {
            label: label.into(),
            limit,
            read_only: false,
        }
    }

    fn mirrored(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            limit: DEFAULT_BLOCK_LIMIT,
            read_only: true,
        }
    }
}

/// Memory block in a create-agent request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub label: String,
    pub value: String,
    pub limit: usize,
}

/// Create-agent request sent to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub description: String,
    pub memory_blocks: Vec<BlockSpec>,
    pub tools: Vec<String>,
    pub tool_rules: Vec<ToolRule>,
    pub include_base_tools: bool,
    pub message_buffer_autoclear: bool,
}

/// Everything needed to provision and run one role's agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDefinition {
    pub role: Role,
    pub name: String,
    pub description: String,
    pub blocks: Vec<BlockDefinition>,
    pub tools: Vec<String>,
    pub rules: Vec<ToolRule>,
}

impl AgentDefinition {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Orchestrator => Self::orchestrator(),
            Role::Conversational => Self::conversational(),
            keeper => Self::record_keeper(keeper),
        }
    }

    fn orchestrator() -> Self {
        Self {
            role: Role::Orchestrator,
            name: "orchestrator_agent".into(),
            description: "Coordinates requests by delegating them to the specialized agents.".into(),
            blocks: vec![
                BlockDefinition::writable(ORCHESTRATOR_PLAN, ORCHESTRATOR_BLOCK_LIMIT),
                BlockDefinition::writable(REQUESTS_CHANGELOG, ORCHESTRATOR_BLOCK_LIMIT),
                BlockDefinition::mirrored("user_preferences"),
            ],
            tools: [
                names::CREATE_ORCHESTRATOR_PLAN,
                names::DELEGATE_AGENT_REQUEST,
                names::UPDATE_REQUESTS_CHANGELOG,
                names::EVALUATE_PROGRESS,
                names::SEND_STATUS_UPDATE,
            ]
            .map(String::from)
            .to_vec(),
            rules: vec![
                ToolRule::constrain(names::CREATE_ORCHESTRATOR_PLAN, [names::DELEGATE_AGENT_REQUEST]),
                ToolRule::constrain(names::DELEGATE_AGENT_REQUEST, [names::UPDATE_REQUESTS_CHANGELOG]),
                ToolRule::constrain(names::UPDATE_REQUESTS_CHANGELOG, [names::EVALUATE_PROGRESS]),
                ToolRule::conditional(
                    names::EVALUATE_PROGRESS,
                    [("True", names::SEND_STATUS_UPDATE)],
                    names::DELEGATE_AGENT_REQUEST,
                ),
                ToolRule::exit_loop(names::SEND_STATUS_UPDATE),
            ],
        }
    }

    fn conversational() -> Self {
        let mirrored = [Role::Tasks, Role::Projects, Role::Reminders, Role::Preferences]
            .into_iter()
            .filter_map(records_label)
            .map(BlockDefinition::mirrored)
            .collect();

        Self {
            role: Role::Conversational,
            name: "conversational_agent".into(),
            description: "Answers questions about the user's records and relays requests to the orchestrator.".into(),
            blocks: mirrored,
            tools: [
                names::ESCALATE_USER_REQUEST,
                names::CLARIFY_USER_REQUEST,
                names::HANDLE_ORCHESTRATOR_MESSAGE,
                names::SEND_MESSAGE,
            ]
            .map(String::from)
            .to_vec(),
            rules: vec![
                ToolRule::constrain(names::CLARIFY_USER_REQUEST, [names::SEND_MESSAGE]),
                ToolRule::exit_loop(names::SEND_MESSAGE),
                ToolRule::initial(names::SEND_MESSAGE),
            ],
        }
    }

    fn record_keeper(role: Role) -> Self {
        let noun = role.key();
        let update = names::update_records(role);
        let changelog = names::update_changelog(role);

        let mut blocks = vec![BlockDefinition::writable(changelog_label(role), DEFAULT_BLOCK_LIMIT)];
        if let Some(label) = records_label(role) {
            blocks.push(BlockDefinition::writable(label, DEFAULT_BLOCK_LIMIT));
        }
        if role == Role::Tasks {
            blocks.push(BlockDefinition::mirrored("user_projects"));
        }

        Self {
            role,
            name: format!("{noun}_agent"),
            description: format!("A specialized agent who manages the user's {noun}."),
            blocks,
            tools: vec![
                names::HANDLE_ORCHESTRATOR_REQUEST.to_string(),
                update.clone(),
                changelog.clone(),
                names::SEND_ORCHESTRATOR_MESSAGE.to_string(),
            ],
            rules: vec![
                ToolRule::constrain(&update, [changelog.as_str()]),
                ToolRule::constrain(&changelog, [names::SEND_ORCHESTRATOR_MESSAGE]),
                ToolRule::exit_loop(names::SEND_ORCHESTRATOR_MESSAGE),
            ],
        }
    }

    /// Compile the tool rules
    pub fn gate(&self) -> Result<ToolGate, ConclaveError> {
        ToolGate::new(self.tools.iter().cloned(), &self.rules)
    }

    /// Fresh, empty memory for this agent
    pub fn memory(&self, policy: LimitPolicy) -> MemoryBlockStore {
        MemoryBlockStore::with_blocks(
            self.blocks.iter().map(|b| {
                let block = MemoryBlock::new(b.label.clone(), b.limit);
                if b.read_only {
                    block.read_only()
                } else {
                    block
                }
            }),
            policy,
        )
    }

    /// Labels this agent holds as read-only mirrors
    pub fn mirrored_labels(&self) -> impl Iterator<Item = &str> {
        self.blocks
            .iter()
            .filter(|b| b.read_only)
            .map(|b| b.label.as_str())
    }

    /// Create-agent request for the runtime
    pub fn spec(&self) -> AgentSpec {
        AgentSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            memory_blocks: self
                .blocks
                .iter()
                .map(|b| BlockSpec {
                    label: b.label.clone(),
                    value: String::new(),
                    limit: b.limit,
                })
                .collect(),
            tools: self.tools.clone(),
            tool_rules: self.rules.clone(),
            include_base_tools: false,
            message_buffer_autoclear: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_definition_compiles() {
        for role in Role::ALL {
            let def = AgentDefinition::for_role(role);
            assert_eq!(def.role, role);
            def.gate().unwrap_or_else(|e| panic!("{role}: {e}"));
        }
    }

    #[test]
    fn test_orchestrator_starts_with_plan() {
        let gate = AgentDefinition::for_role(Role::Orchestrator).gate().unwrap();
        assert_eq!(gate.start_tools(), vec![names::CREATE_ORCHESTRATOR_PLAN.to_string()]);
    }

    #[test]
    fn test_record_keeper_labels() {
        let def = AgentDefinition::for_role(Role::Reminders);
        let labels: Vec<_> = def.blocks.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, ["reminders_changelog", "user_reminders"]);
        assert!(def.tools.contains(&"update_user_reminders".to_string()));
        assert!(def.tools.contains(&"update_reminders_changelog".to_string()));
    }

    #[test]
    fn test_block_limits() {
        let memory = AgentDefinition::for_role(Role::Orchestrator).memory(LimitPolicy::Reject);
        assert_eq!(memory.block(ORCHESTRATOR_PLAN).unwrap().limit, 15_000);
        assert!(memory.block("user_preferences").unwrap().read_only);

        let memory = AgentDefinition::for_role(Role::Tasks).memory(LimitPolicy::Reject);
        assert_eq!(memory.block("user_tasks").unwrap().limit, 8_000);
    }

    #[test]
    fn test_conversational_mirrors_all_records() {
        let def = AgentDefinition::for_role(Role::Conversational);
        let mirrored: Vec<_> = def.mirrored_labels().collect();
        assert_eq!(
            mirrored,
            ["user_tasks", "user_projects", "user_reminders", "user_preferences"]
        );
    }

    #[test]
    fn test_spec_serializes_rules_in_wire_format() {
        let spec = AgentDefinition::for_role(Role::Tasks).spec();
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["tool_rules"][2]["type"], "exit_loop");
        assert_eq!(value["memory_blocks"][0]["label"], "tasks_changelog");
    }
}
