use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

mod config;
mod debug;
mod server;
mod telemetry;

use config::{Config, DEFAULT_CONFIG_PATH};

/// jackal XMPP server
#[derive(Debug, Parser)]
#[command(name = "jackal", version, disable_version_flag = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print version information
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    version: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Required before any TLS config is built
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    let config = Config::load(&cli.config)?;
    let _log_guard = telemetry::init(&config.logger)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "jackal starting"
    );

    server::run(config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_config_flag() {
        let cli = Cli::try_parse_from(["jackal", "-c", "/tmp/jackal.yml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/jackal.yml"));

        let cli = Cli::try_parse_from(["jackal"]).unwrap();
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_cli_version_flag() {
        let err = Cli::try_parse_from(["jackal", "-v"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
