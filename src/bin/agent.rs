//! Agent process entry point: connects out to the gateway and executes
//! tasks locally via the Claude Code CLI.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use taskmesh::agent::cli_invoker::ClaudeCliInvoker;
use taskmesh::agent::Agent;
use taskmesh::config::AgentConfig;
use tracing::{error, info, warn};

/// Agent-side worker process: dials out to a gateway and runs tasks locally.
#[derive(Parser, Debug)]
#[command(name = "taskmesh-agent")]
struct Args {
    /// Overrides RUST_LOG / the default "info" level.
    #[arg(long)]
    log_level: Option<String>,

    /// Permission mode passed through to the CLI invocation (e.g. "acceptEdits").
    #[arg(long, default_value = "acceptEdits")]
    permission_mode: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = args
        .log_level
        .unwrap_or_else(|| std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    info!("starting taskmesh agent");

    let config = AgentConfig::load()?;

    let llm: Arc<dyn taskmesh::agent::llm::LlmInvoker> =
        match ClaudeCliInvoker::discover(args.permission_mode).await {
            Ok(invoker) => Arc::new(invoker),
            Err(e) => {
                error!(error = %e, "claude CLI not available, refusing to start");
                return Err(e.into());
            }
        };

    let (agent, outbound_rx) = Agent::new(config, llm);
    warn!("agent running, connecting to gateway");
    Arc::new(agent).run(outbound_rx).await;

    Ok(())
}
