//! Command-line interface.

use crate::core::config::ConfigBuilder;
use crate::core::{Config, GrepWiseError, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

/// Log analysis platform core: ingest, index, search, alarm.
#[derive(Parser, Debug)]
#[command(name = "grepwise")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Bind address for all listeners
    #[arg(long, env = "GW_HOST")]
    pub host: Option<IpAddr>,

    /// HTTP port for the API and intake
    #[arg(long, env = "GW_HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Override the port of every configured syslog source
    #[arg(long, env = "GW_SYSLOG_PORT")]
    pub syslog_port: Option<u16>,

    /// Root directory for partition storage
    #[arg(long)]
    pub index_root: Option<PathBuf>,

    /// Directory for archived partitions
    #[arg(long)]
    pub archive_dir: Option<PathBuf>,

    /// Configuration file path (default: ~/.GrepWise/config/config.yaml)
    #[arg(short, long, env = "GW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Validate configuration and exit
    #[arg(long)]
    pub check_config: bool,

    /// Enable debug logging
    #[arg(short, long, env = "GW_DEBUG")]
    pub debug: bool,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Load configuration with precedence: CLI over env over file over
    /// defaults.
    pub async fn load_config(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::new();

        let config_path = if let Some(path) = &self.config {
            Some(path.clone())
        } else {
            let default_path = dirs::home_dir()
                .map(|h| h.join(".GrepWise").join("config").join("config.yaml"))
                .unwrap_or_else(|| PathBuf::from(".GrepWise/config/config.yaml"));
            default_path.exists().then_some(default_path)
        };

        if let Some(path) = config_path {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    builder = builder.from_yaml(&content)?;
                    tracing::info!("loaded configuration from {:?}", path);
                },
                Err(e) if self.config.is_some() => {
                    return Err(GrepWiseError::config(format!(
                        "failed to read config file {:?}: {}",
                        path, e
                    )));
                },
                Err(_) => {
                    tracing::debug!("no config file at {:?}, using defaults", path);
                },
            }
        }

        builder = builder.from_env()?;

        if let Some(host) = self.host {
            builder = builder.host(host);
        }
        if let Some(port) = self.http_port {
            builder = builder.http_port(port);
        }
        if let Some(path) = &self.index_root {
            builder = builder.index_root(path.clone());
        }
        if let Some(path) = &self.archive_dir {
            builder = builder.archive_dir(path.clone());
        }
        builder = builder.debug(self.debug);

        let mut config = builder.build()?;
        if let Some(port) = self.syslog_port {
            for source in &mut config.syslog_sources {
                source.syslog_port = port;
            }
        }
        Ok(config)
    }

    /// Initialize tracing based on flags and environment.
    pub fn init_logging(&self, structured: bool) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let env_level = std::env::var("GW_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let level = if self.debug { "debug" } else { env_level.as_str() };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        if structured {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from([
            "grepwise",
            "--http-port",
            "9999",
            "--index-root",
            "/tmp/gw",
            "--check-config",
        ]);
        assert_eq!(cli.http_port, Some(9999));
        assert_eq!(cli.index_root, Some(PathBuf::from("/tmp/gw")));
        assert!(cli.check_config);
    }

    #[tokio::test]
    async fn test_cli_overrides_win() {
        let cli = Cli::parse_from(["grepwise", "--http-port", "7171"]);
        let config = cli.load_config().await.unwrap();
        assert_eq!(config.server.http_port, 7171);
    }
}
