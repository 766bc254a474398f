//! apigate-mcp - MCP server for quota-aware Instagram access
//!
//! Reads configuration from flags and environment, then serves MCP over
//! stdio.

use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use apigate_mcp::server::{SERVER_NAME, SERVER_VERSION};
use apigate_mcp::{Config, McpServer, ToolRegistry};

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Never stdout: it carries the protocol.
    let writer = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            fmt::writer::BoxMakeWriter::new(Arc::new(file))
        }
        None => fmt::writer::BoxMakeWriter::new(std::io::stderr),
    };

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(writer))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(config.log_file.is_none()).with_writer(writer))
            .try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    if let Err(e) = init_logging(&config) {
        eprintln!("failed to initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    tracing::info!("Starting {} v{}", SERVER_NAME, SERVER_VERSION);

    let client = match config.build_client() {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let status = client.auth_status();
    let quota = client.rate_limit_status();
    tracing::info!(
        preferred = %status.preferred_scheme,
        rate_limiting = quota.enabled,
        "Client ready"
    );
    tracing::debug!("{}", quota);

    let server = McpServer::new(ToolRegistry::new(Arc::new(client)));

    match server.run_stdio().await {
        Ok(()) => {
            tracing::info!("Server exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
