//! LINSTOR Core
//!
//! Runs the controller metadata core standalone: loads the configuration,
//! builds the object registry and the transaction manager, and logs every
//! committed entity event until interrupted.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use linstor_core::{ControllerConfig, CoreEvent, CoreObjects, MemoryDriver, TransactionMgr};

// =============================================================================
// CLI Arguments
// =============================================================================

/// LINSTOR Core - metadata core of a replicated block storage controller
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; built-in defaults when omitted
    #[arg(long, env = "LINSTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting LINSTOR core");
    info!("  Version: {}", linstor_core::VERSION);

    let config = match &args.config {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => {
            let config = ControllerConfig::default();
            config.validate().context("validating default configuration")?;
            config
        }
    };
    info!(
        "  Minor numbers: {}..={}",
        config.minor_range.start, config.minor_range.end
    );
    info!(
        "  TCP ports: {}..={}",
        config.tcp_port_range.start, config.tcp_port_range.end
    );

    let driver = Arc::new(MemoryDriver::new());
    let mgr = TransactionMgr::new(driver, config.event_channel_capacity);
    let objs = CoreObjects::new(config).context("building object registry")?;
    info!(
        nodes = objs.node_count(),
        resource_definitions = objs.resource_definition_count(),
        "Object registry initialized"
    );

    let mut events = mgr.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("event logger stopped");
    });

    info!("LINSTOR core ready");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for shutdown signal: {}", e);
    }

    info!("LINSTOR core shutdown complete");
    Ok(())
}

fn log_event(event: &CoreEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(
            node = event.node().unwrap_or("-"),
            rsc = event.resource().unwrap_or("-"),
            event = %json,
            "entity event"
        ),
        Err(e) => warn!("Failed to encode event {:?}: {}", event, e),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
