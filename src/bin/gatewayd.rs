//! `gatewayd` — the MCP gateway's standalone server binary.
//!
//! Grounded on `src/bin/mcp_server.rs`'s clap-driven arg parsing and
//! verbosity counting, and `tests/mcp_streamable_http_test.rs`'s
//! `TcpListener` + `axum::serve` bootstrap idiom.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use mcp_gateway::config::GatewayConfig;
use mcp_gateway::{build_router, observability, GatewayState};

#[derive(Parser, Debug)]
#[command(name = "gatewayd", version, about = "MCP JSON-RPC reverse proxy and capture gateway")]
struct Cli {
    /// Configuration file path (TOML). Missing file falls back to defaults.
    #[arg(short, long, value_name = "FILE", env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen host.
    #[arg(long, value_name = "HOST", env = "GATEWAY_HOST")]
    host: Option<String>,

    /// Override the listen port.
    #[arg(short, long, value_name = "PORT", env = "GATEWAY_PORT")]
    port: Option<u16>,

    /// Override the registry storage directory.
    #[arg(long, value_name = "DIR", env = "GATEWAY_REGISTRY_ROOT")]
    registry_root: Option<PathBuf>,

    /// Override the capture storage directory.
    #[arg(long, value_name = "DIR", env = "GATEWAY_CAPTURE_ROOT")]
    capture_root: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all but error-level logging; wins over --verbose and RUST_LOG.
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(err) = observability::init_logging_with_level(cli.verbose > 0, cli.quiet) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(1);
    }

    let mut config = match GatewayConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            std::process::exit(2);
        }
    };

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(registry_root) = cli.registry_root {
        config.storage.registry_root = registry_root;
    }
    if let Some(capture_root) = cli.capture_root {
        config.storage.capture_root = capture_root;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(config));

    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::error!(error = %err, "gatewayd exited with an error");
            std::process::exit(1);
        }
    }
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        registry_root = %config.storage.registry_root.display(),
        capture_root = %config.storage.capture_root.display(),
        "starting gateway"
    );

    let state = GatewayState::bootstrap(&config).await?;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received sigterm, shutting down"),
    }
}
