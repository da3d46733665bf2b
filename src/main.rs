//! pulse-agent - agent process entry point.
//!
//! Connects to the kernel, starts the runtime and feeds it the tasks the
//! kernel pushes until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use pulse_agent::agent::{AgentHealth, AgentRuntime, HeartbeatSink, register_memory_handlers};
use pulse_agent::config::Config;
use pulse_agent::kernel::{KernelClient, forward_task_requests};
use pulse_agent::memory::MemoryStore;
use pulse_agent::tools::{TOOL_TASK, ToolGateway, ToolTaskHandler};

#[derive(Parser)]
#[command(name = "pulse-agent", version, about = "Pulse agent runtime")]
struct Cli {
    /// TOML configuration file. PULSE_* variables override it.
    #[arg(short, long, global = true, env = "PULSE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the kernel and process tasks until interrupted (default)
    Run,
    /// List the tools available on this machine
    Tools,
    /// Query the kernel's status
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::from_env().context("loading configuration from environment")?,
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Tools => {
            let gateway = ToolGateway::with_default_tools(&config.tools).await;
            println!("{}", serde_json::to_string_pretty(&gateway.list_tools().await)?);
            Ok(())
        }
        Commands::Ping => {
            let client = KernelClient::from_config(&config.kernel);
            client
                .connect()
                .await
                .with_context(|| format!("connecting to kernel at {}", config.kernel.ws_url))?;
            let status = client.status().await;
            client.disconnect().await;
            println!("{}", serde_json::to_string_pretty(&status?)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pulse_agent=info"));
    let json = std::env::var("PULSE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let client = Arc::new(KernelClient::from_config(&config.kernel));
    // Not being able to reach the kernel is fatal; failed tasks never are.
    client
        .connect()
        .await
        .with_context(|| format!("connecting to kernel at {}", config.kernel.ws_url))?;

    let runtime = start_agent(&config, Arc::clone(&client))
        .await
        .context("starting agent")?;

    let mut intake = {
        let client = Arc::clone(&client);
        let runtime = runtime.clone();
        tokio::spawn(async move { forward_task_requests(&client, &runtime).await })
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Could not listen for interrupt");
            }
            info!("Interrupted, shutting down");
            intake.abort();
        }
        outcome = &mut intake => {
            match outcome {
                Ok(Ok(submitted)) => info!(submitted, "Kernel closed the task feed"),
                Ok(Err(e)) => {
                    error!(error = %e, "Task feed failed");
                    runtime.set_health(AgentHealth::Unhealthy).await;
                }
                Err(e) => {
                    error!(error = %e, "Task intake stopped");
                    runtime.set_health(AgentHealth::Unhealthy).await;
                }
            }
        }
    }

    runtime.stop().await;
    client.disconnect().await;

    let state = runtime.state().await;
    info!(
        tasks = state.task_count,
        succeeded = state.success_count,
        failed = state.failure_count,
        health = ?state.health,
        "Agent stopped"
    );
    Ok(())
}

/// Build the runtime with memory and tool handlers registered, and start it.
async fn start_agent(
    config: &Config,
    client: Arc<KernelClient>,
) -> pulse_agent::Result<AgentRuntime> {
    let sink: Arc<dyn HeartbeatSink> = client;
    let runtime = AgentRuntime::with_heartbeat_sink(config.agent.clone(), sink);
    info!(agent_id = %runtime.id(), name = %runtime.name(), "Agent created");

    let memory = Arc::new(MemoryStore::from_config(config.memory.clone()));
    if memory.load_from_storage().await? > 0 {
        memory.rebuild_index().await?;
    }
    register_memory_handlers(&runtime, Arc::clone(&memory)).await;

    let gateway = Arc::new(ToolGateway::with_default_tools(&config.tools).await);
    runtime
        .register_handler(TOOL_TASK, Arc::new(ToolTaskHandler::new(gateway)))
        .await;

    runtime.start().await?;
    Ok(runtime)
}
