//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// MCP gateway auth & discovery plane.
#[derive(Parser, Debug)]
#[command(name = "mcp-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "MCPGW_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Port to listen on, overriding the config file.
    #[arg(short, long, env = "MCPGW_SERVER__PORT")]
    pub port: Option<u16>,

    /// Host to bind to, overriding the config file.
    #[arg(long, env = "MCPGW_SERVER__HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MCPGW_LOG__LEVEL")]
    pub log_level: String,

    /// Log format (text, json).
    #[arg(long, env = "MCPGW_LOG__FORMAT")]
    pub log_format: Option<String>,

    /// Load and validate configuration, then exit without starting the
    /// server.
    #[arg(long)]
    pub validate_config: bool,
}
