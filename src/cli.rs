//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// SPA Gateway - session-terminating reverse proxy with on-behalf-of token
/// exchange
#[derive(Parser, Debug)]
#[command(name = "spa-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (JSON)
    #[arg(short, long, env = "SPA_GATEWAY_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "SPA_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "SPA_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SPA_GATEWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "SPA_GATEWAY_LOG_FORMAT")]
    pub log_format: Option<String>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
