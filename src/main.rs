//! conclave - provision and check the role agents on the hosted runtime

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use conclave::directory::JSON_FILE;
use conclave::runtime::wait_until_ready;
use conclave::{load_config, provision_agents, ConclaveConfig, HttpRuntimeClient, Role, RuntimeClient};

const REQUIRED_ENV: [&str; 3] = ["ANTHROPIC_API_KEY", "OPENAI_API_KEY", "LETTA_SERVER_URL"];

#[derive(Parser)]
#[command(name = "conclave", version, about = "Multi-agent delegation core")]
struct Cli {
    /// Extra configuration file layered over config/default.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for the runtime, create every role agent and save their ids
    Init {
        /// Overwrite an existing agent_ids.json
        #[arg(long)]
        force: bool,
    },
    /// Check environment, runtime health and provisioned agents
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("conclave=info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let result = match load_config(cli.config.as_deref()).context("Failed to load configuration") {
        Ok(config) => match cli.command {
            Command::Init { force } => init(&config, force).await,
            Command::Health => health(&config).await,
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("conclave failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn client(config: &ConclaveConfig) -> anyhow::Result<HttpRuntimeClient> {
    HttpRuntimeClient::new(&config.runtime.base_url, config.runtime.request_timeout())
        .context("Failed to build runtime client")
}

async fn init(config: &ConclaveConfig, force: bool) -> anyhow::Result<()> {
    let json_path = config.paths.config_dir.join(JSON_FILE);
    if json_path.exists() && !force {
        bail!(
            "{} already exists; pass --force to provision new agents",
            json_path.display()
        );
    }

    let client = client(config)?;
    info!(url = %client.base_url(), "Waiting for runtime");
    wait_until_ready(&client, config.wait.max_retries, config.wait.delay()).await?;

    let directory = provision_agents(&client).await.context("Provisioning failed")?;
    let (json, env) = directory.save(&config.paths.config_dir)?;

    info!(json = %json.display(), env = %env.display(), "Initialization complete");
    if let Some(id) = directory.get(Role::Conversational) {
        info!(
            "Talk to the conclave through the conversational agent: {}={}",
            Role::Conversational.env_key(),
            id
        );
    }
    Ok(())
}

async fn health(config: &ConclaveConfig) -> anyhow::Result<()> {
    let mut healthy = true;

    for var in REQUIRED_ENV {
        if std::env::var(var).is_ok_and(|v| !v.is_empty()) {
            info!(var, "Environment: set");
        } else {
            warn!(var, "Environment: not set");
            healthy = false;
        }
    }

    let client = client(config)?;
    match client.health().await {
        Ok(()) => info!(url = %client.base_url(), "Runtime: healthy"),
        Err(e) => {
            warn!(url = %client.base_url(), error = %e, "Runtime: unreachable or unhealthy");
            healthy = false;
        }
    }

    match client.list_agents().await {
        Ok(agents) if agents.is_empty() => {
            warn!("Agents: none found; run `conclave init`");
            healthy = false;
        }
        Ok(agents) => {
            info!(count = agents.len(), "Agents: found");
            for agent in &agents {
                info!(name = %agent.name, id = %agent.id, "Agent");
            }
        }
        Err(e) => {
            warn!(error = %e, "Agents: check failed");
            healthy = false;
        }
    }

    if !healthy {
        bail!("health check failed");
    }
    info!("All checks passed");
    Ok(())
}
