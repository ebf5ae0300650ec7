//! CLI argument parsing.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "causeway",
    version,
    about = "JSON API gateway with correlated request logging and idempotent-request control"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.yaml", env = "CAUSEWAY_CONFIG")]
    pub config: String,

    /// Listen host (overrides config)
    #[arg(long, env = "CAUSEWAY_HOST")]
    pub host: Option<String>,

    /// Listen port (overrides config)
    #[arg(long, env = "CAUSEWAY_PORT")]
    pub port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info", env = "CAUSEWAY_LOG_LEVEL")]
    pub log_level: String,
}
