//! Conclave configuration: config/default.toml, then environment overrides
//!
//! Load order: the first `config/default.toml` found, then an explicit file
//! if given, then `CONCLAVE__*` variables (double underscore nests, e.g.
//! `CONCLAVE__DELIVERY__MAX_ATTEMPTS=5`). `LETTA_SERVER_URL` wins over
//! `runtime.base_url`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConclaveError;
use crate::memory::LimitPolicy;
use crate::router::DeliveryPolicy;
use crate::tasks::DEFAULT_ACTIVE_TASK_LIMIT;

/// Root of the configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConclaveConfig {
    pub runtime: RuntimeSection,
    pub delivery: DeliverySection,
    pub memory: MemorySection,
    pub tasks: TasksSection,
    pub wait: WaitSection,
    pub paths: PathsSection,
}

/// [runtime]: where the hosted agent runtime lives
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8283".into(),
            request_timeout_secs: 30,
        }
    }
}

impl RuntimeSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// [delivery]: retries for cross-agent sends
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliverySection {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl DeliverySection {
    pub fn policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

/// [memory]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub limit_policy: LimitPolicy,
}

/// [tasks]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TasksSection {
    /// Active count at which the user is warned
    pub active_limit: usize,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            active_limit: DEFAULT_ACTIVE_TASK_LIMIT,
        }
    }
}

/// [wait]: how long `init` waits for the runtime
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WaitSection {
    pub max_retries: u32,
    pub delay_secs: u64,
}

impl Default for WaitSection {
    fn default() -> Self {
        Self {
            max_retries: 30,
            delay_secs: 2,
        }
    }
}

impl WaitSection {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// [paths]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    /// Directory holding agent_ids.json and agent_ids.env
    pub config_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("config"),
        }
    }
}

/// Load configuration from files and the environment
pub fn load_config(config_path: Option<&Path>) -> Result<ConclaveConfig, ConclaveError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConclaveError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(config::File::from(path.to_path_buf()));
    }

    builder = builder
        .add_source(
            config::Environment::with_prefix("CONCLAVE")
                .separator("__")
                .try_parsing(true),
        )
        .set_override_option("runtime.base_url", std::env::var("LETTA_SERVER_URL").ok())?;

    Ok(builder.build()?.try_deserialize()?)
}
