use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use plugin_registry_proxy::commands;
use plugin_registry_proxy::config::{self, Config, LogFormat};
use plugin_registry_proxy::state::AppState;
use plugin_registry_proxy::web;

#[derive(Parser, Debug)]
#[command(name = "plugin-registry-proxy")]
#[command(about = "Caching plugin registry with optional asset proxying", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the registry server (default)
    Run,
    /// Validate configuration, registry and counter store
    Check {
        /// Also fetch every plugin manifest once
        #[arg(long)]
        fetch: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load_from_path(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => config::load_from_env_or_file().context("Failed to load configuration")?,
    };

    init_tracing(config.logging.format, args.debug)?;
    match &args.config {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("Configuration loaded from default locations"),
    }

    match args.command.unwrap_or(Command::Run) {
        Command::Check { fetch } => {
            commands::run_config_check(config, fetch).await?;
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

fn init_tracing(format: LogFormat, debug: bool) -> anyhow::Result<()> {
    let log_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("plugin_registry_proxy={log_level}").parse()?);

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting plugin registry proxy");
    info!(
        "Listening on {}:{}, serving proxied links from {}",
        config.server.host,
        config.server.port,
        config.server.base_address()
    );

    let (state, _shutdown_rx) = AppState::from_config(config)
        .await
        .context("Failed to initialize application state")?;

    let warmer_handle = state.spawn_warmer();
    if warmer_handle.is_some() {
        info!("Background refresh enabled");
    }

    let web_state = state.clone();
    let mut web_handle = tokio::spawn(async move {
        if let Err(e) = web::start_server(web_state).await {
            error!("Web server error: {}", e);
        }
    });

    let web_exited = tokio::select! {
        _ = shutdown_signal() => false,
        _ = &mut web_handle => true,
    };
    info!("Shutting down plugin registry proxy");

    let _ = state.shutdown_tx.send(());

    let shutdown = tokio::time::timeout(tokio::time::Duration::from_secs(30), async {
        if !web_exited {
            let _ = web_handle.await;
        }
        if let Some(handle) = warmer_handle {
            let _ = handle.await;
        }
    })
    .await;

    match shutdown {
        Ok(_) => info!("Graceful shutdown completed"),
        Err(_) => {
            error!("Shutdown timeout exceeded, forcing exit");
            std::process::exit(1);
        }
    }

    if web_exited {
        anyhow::bail!("Web server exited unexpectedly");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
