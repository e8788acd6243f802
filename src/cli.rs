//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Multi-tenant OpenID Connect gateway
#[derive(Parser, Debug)]
#[command(name = "oidc-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OIDC_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "OIDC_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "OIDC_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "OIDC_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OIDC_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Validate the configuration and list the providers it defines
    Check {
        /// Also run discovery and build every provider
        #[arg(long)]
        resolve: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::try_parse_from(["oidc-gateway"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn check_accepts_global_config() {
        let cli = Cli::try_parse_from(["oidc-gateway", "check", "--resolve", "-c", "gw.yaml"]).unwrap();
        assert_eq!(cli.command, Some(Command::Check { resolve: true }));
        assert_eq!(cli.config, Some(PathBuf::from("gw.yaml")));
    }
}
