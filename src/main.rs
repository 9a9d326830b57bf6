//! MCP gateway auth & discovery plane — entry point.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use mcpgw::{cli::Cli, config::Config, http::AppContext, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("failed to set up tracing: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }

    if cli.validate_config {
        info!("configuration is valid");
        return ExitCode::SUCCESS;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        providers = config.providers.len(),
        "starting MCP gateway"
    );

    let ctx = match AppContext::build(config) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!("failed to build application context: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = ctx.serve().await {
        error!("server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("gateway shutdown complete");
    ExitCode::SUCCESS
}
