//! Subcommand handlers.

use crate::{Commands, ConfigAction};
use arbiter_core::gateway::run_gateway;
use arbiter_core::{ArbiterConfig, ChannelSink, GatewayServer, Pipeline, SessionChannel};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Serve { host, port } => {
            let mut config = load(workspace, config_path)?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            handle_serve(config).await
        }
        Commands::Ask { prompt } => handle_ask(load(workspace, config_path)?, &prompt).await,
        Commands::Config { action } => handle_config(action, workspace, config_path),
    }
}

fn load(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<ArbiterConfig> {
    arbiter_core::config::load_config(Some(workspace), config_path)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

/// Cancel `token` on Ctrl+C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            token.cancel();
        }
    });
}

async fn handle_serve(config: ArbiterConfig) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(&config).await?;
    let gw = GatewayServer::new(config.gateway.clone(), Arc::new(pipeline)).shared();

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    println!(
        "Arbiter gateway on http://{}:{} (websocket at /ws)",
        config.gateway.host, config.gateway.port
    );
    run_gateway(gw, shutdown).await?;
    Ok(())
}

async fn handle_ask(config: ArbiterConfig, prompt: &str) -> anyhow::Result<()> {
    let pipeline = Arc::new(Pipeline::from_config(&config).await?);
    let (sink, mut events) = ChannelSink::pair(pipeline.pool().len() + 1);
    let mut session = SessionChannel::new(pipeline, Arc::new(sink));

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event.to_json() {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("Failed to encode event: {}", e),
            }
        }
    });

    let state = session.handle_prompt(prompt, &cancel).await;
    // Dropping the session closes the sink so the printer drains and exits.
    drop(session);
    printer.await?;
    info!(state = ?state, "Prompt finished");
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".arbiter");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&ArbiterConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_path)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
