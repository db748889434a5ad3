//! Role to agent-id directory and its persisted forms

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConclaveError;
use crate::protocol::{AgentId, Role};

/// File holding the JSON form
pub const JSON_FILE: &str = "agent_ids.json";
/// File holding the `ROLE_AGENT_ID=value` form
pub const ENV_FILE: &str = "agent_ids.env";

/// Stable mapping from role to the runtime's agent identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentDirectory {
    ids: BTreeMap<Role, AgentId>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, role: Role, id: AgentId) -> Option<AgentId> {
        self.ids.insert(role, id)
    }

    pub fn get(&self, role: Role) -> Option<&AgentId> {
        self.ids.get(&role)
    }

    pub fn require(&self, role: Role) -> Result<&AgentId, ConclaveError> {
        self.get(role).ok_or(ConclaveError::AgentNotFound(role))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Role, &AgentId)> {
        self.ids.iter().map(|(role, id)| (*role, id))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Every role has an agent
    pub fn is_complete(&self) -> bool {
        Role::ALL.iter().all(|role| self.ids.contains_key(role))
    }

    /// `ROLE_AGENT_ID=value` lines
    pub fn to_env(&self) -> String {
        self.ids
            .iter()
            .map(|(role, id)| format!("{}={}\n", role.env_key(), id))
            .collect()
    }

    /// Write both persisted forms into `dir`, creating it if needed
    pub fn save(&self, dir: &Path) -> Result<(PathBuf, PathBuf), ConclaveError> {
        fs::create_dir_all(dir)?;

        let json_path = dir.join(JSON_FILE);
        fs::write(&json_path, serde_json::to_string_pretty(self)?)?;

        let env_path = dir.join(ENV_FILE);
        fs::write(&env_path, self.to_env())?;

        info!(
            json = %json_path.display(),
            env = %env_path.display(),
            agents = self.len(),
            "Saved agent directory"
        );
        Ok((json_path, env_path))
    }

    /// Read the JSON form
    pub fn load(path: &Path) -> Result<Self, ConclaveError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl FromIterator<(Role, AgentId)> for AgentDirectory {
    fn from_iter<T: IntoIterator<Item = (Role, AgentId)>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> AgentDirectory {
        Role::ALL
            .iter()
            .map(|role| (*role, AgentId::new(format!("agent-{}", role.key()))))
            .collect()
    }

    #[test]
    fn test_lookup() {
        let dir = directory();
        assert!(dir.is_complete());
        assert_eq!(dir.get(Role::Tasks).unwrap().as_str(), "agent-tasks");
        assert!(matches!(
            AgentDirectory::new().require(Role::Tasks),
            Err(ConclaveError::AgentNotFound(Role::Tasks))
        ));
    }

    #[test]
    fn test_env_form() {
        let env = directory().to_env();
        assert!(env.starts_with("ORCHESTRATOR_AGENT_ID=agent-orchestrator\n"));
        assert_eq!(env.lines().count(), 6);
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("config");

        let (json_path, env_path) = directory().save(&dir).unwrap();
        assert!(env_path.exists());

        let raw = std::fs::read_to_string(&json_path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["conversational"], "agent-conversational");

        assert_eq!(AgentDirectory::load(&json_path).unwrap(), directory());
    }
}
