//! Centralized logging initialization for the gateway.
//!
//! Mirrors the teacher's layered-subscriber approach: an `EnvFilter` derived
//! from verbosity flags, with `--quiet` always winning over `RUST_LOG`.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with default (non-verbose, non-quiet) settings.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity.
///
/// `quiet` always takes precedence over both `verbose` and `RUST_LOG`: once a
/// caller asks for quiet, nothing should second-guess them by re-enabling
/// noisy dependency logs through the environment.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let filter_level = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("mcp_gateway=debug,info")
    } else {
        EnvFilter::new("mcp_gateway=info,warn")
    };

    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_thread_ids(!quiet)
        .with_file(!quiet)
        .with_line_number(!quiet)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                tracing::info!("gateway observability initialized");
            }
            Ok(())
        }
        Err(_) => {
            // A global subscriber is already installed; harmless in tests
            // that spin up multiple server instances in one process.
            Ok(())
        }
    }
}
