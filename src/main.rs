use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use mcp_proxy::commands::{CommandContext, CommandServer};
use mcp_proxy::proxy::{GitInstaller, McpJsonConfig, ProxyCore};
use mcp_proxy::settings::ProxySettings;

/// MCP server that loads, reloads, and calls other MCP servers at runtime.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to `.mcp.json` (overrides the settings file)
    #[arg(short, long, env = "MCP_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the settings file (YAML)
    #[arg(short, long, env = "MCP_PROXY_SETTINGS")]
    settings: Option<PathBuf>,

    /// Directory for servers installed from git (overrides the settings file)
    #[arg(long, env = "MCP_PROXY_INSTALL_DIR")]
    install_dir: Option<PathBuf>,

    /// Load a configured server on its first tool call
    #[arg(long, env = "MCP_PROXY_AUTO_LOAD")]
    auto_load: bool,

    /// Log to stderr instead of the log file
    #[arg(long)]
    log_stderr: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    mcp_proxy::init_tracing(args.log_stderr);

    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    let mut settings = ProxySettings::discover(args.settings.as_deref(), &cwd)
        .context("failed to load settings")?;

    // CLI overrides
    if let Some(config) = args.config {
        settings.config_file = Some(config);
    }
    if let Some(install_dir) = args.install_dir {
        settings.install_dir = Some(install_dir);
    }
    if args.auto_load {
        settings.auto_load_on_call = true;
    }

    let mcp_json = McpJsonConfig::new(settings.config_path());
    let mut installer = GitInstaller::new(settings.install_path(), mcp_json.clone());
    if let Some(python) = &settings.python {
        installer = installer.with_python(python.clone());
    }

    tracing::info!(
        config = %mcp_json.path().display(),
        install_dir = %installer.install_dir().display(),
        call_timeout_ms = settings.call_timeout_ms,
        auto_load_on_call = settings.auto_load_on_call,
        "proxy configured"
    );

    let core = Arc::new(
        ProxyCore::new(Arc::new(mcp_json), settings.core_options())
            .with_installer(Arc::new(installer)),
    );
    let server = CommandServer::new(CommandContext {
        core: Arc::clone(&core),
        search_max_results: settings.search_max_results,
    });

    tokio::select! {
        result = server.serve(tokio::io::stdin(), tokio::io::stdout()) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "client stream failed");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    core.shutdown().await;
    tracing::info!("=== mcp-proxy stopped ===");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
