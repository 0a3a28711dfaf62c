//! Command-line interface definition.

use clap::{Parser, ValueEnum};
use rolegate::config::{GateConfig, LogFormat};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Payment-gated, time-limited role grants.
#[derive(Parser, Debug)]
#[command(name = "rolegate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(long, short, env = "ROLEGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Root directory for gateway data.
    #[arg(long, env = "ROLEGATE_ROOT_DIR")]
    pub root_dir: Option<PathBuf>,

    /// Address the HTTP server listens on.
    #[arg(long, short, env = "ROLEGATE_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Public base URL used in payment requirements.
    #[arg(long, env = "ROLEGATE_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Bearer key for the administrative routes.
    #[arg(long, env = "ROLEGATE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Discord bot token.
    #[arg(long, env = "ROLEGATE_BOT_TOKEN", hide_env_values = true)]
    pub bot_token: Option<String>,

    /// Facilitator base URL.
    #[arg(long, env = "ROLEGATE_FACILITATOR_URL")]
    pub facilitator_url: Option<String>,

    /// Keep all state in memory.
    #[arg(long)]
    pub ephemeral: bool,

    /// Disable the expiry sweeper.
    #[arg(long)]
    pub no_sweeper: bool,

    /// Log level.
    #[arg(long, env = "ROLEGATE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, env = "ROLEGATE_LOG_FORMAT")]
    pub log_format: Option<CliLogFormat>,
}

/// Log format CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Convert CLI arguments into a `GateConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn into_config(self) -> color_eyre::Result<GateConfig> {
        // Start with default config or load from file
        let mut config = if let Some(ref path) = self.config {
            GateConfig::from_file(path)?
        } else {
            GateConfig::default()
        };

        // Override with CLI arguments
        if let Some(root_dir) = self.root_dir {
            config.root_dir = root_dir;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(public_url) = self.public_url {
            config.public_url = public_url;
        }
        if self.api_key.is_some() {
            config.api_key = self.api_key;
        }
        if self.bot_token.is_some() {
            config.authority.bot_token = self.bot_token;
        }
        if let Some(url) = self.facilitator_url {
            config.facilitator.url = url;
        }
        if self.ephemeral {
            config.storage.persist = false;
        }
        if self.no_sweeper {
            config.sweeper.enabled = false;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format.into();
        }

        Ok(config)
    }
}

impl From<CliLogFormat> for LogFormat {
    fn from(f: CliLogFormat) -> Self {
        match f {
            CliLogFormat::Text => Self::Text,
            CliLogFormat::Json => Self::Json,
        }
    }
}
