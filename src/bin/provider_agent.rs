use anyhow::Context;
use clap::Parser;
use provider_agent::{config::AgentConfig, logging, ProviderAgent};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "provider-agent")]
#[command(about = "Provider agent answering marketplace demands with signed offers")]
struct Args {
    /// Path to the agent configuration (TOML, or JSON with a .json extension)
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AgentConfig::load_with_env_overrides(&args.config)
        .with_context(|| format!("loading {}", args.config))?;
    logging::init(&config.logging)?;

    let agent = Arc::new(ProviderAgent::from_config(config).context("starting agent")?);
    tracing::info!(address = %agent.address(), "Provider agent started");

    tokio::select! {
        result = Arc::clone(&agent).run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }

    Ok(())
}
