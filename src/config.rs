//! Configuration module for the handler simulator.
//!
//! The TOML configuration file is mandatory: it carries the IP allowlist
//! and the lot definition. A few values may be overridden on the command
//! line; CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the handler simulator
#[derive(Parser, Debug)]
#[command(name = "handler-sim")]
#[command(version = "0.1.0")]
#[command(about = "A test-handler equipment-interface simulator", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "handler.toml")]
    pub config: PathBuf,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of DUTs in the lot
    #[arg(short, long)]
    pub units: Option<usize>,

    /// Lot identifier
    #[arg(long)]
    pub lot_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub lot: LotConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
    pub deploy: Option<DeployConfig>,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Peers allowed to connect; everyone else is dropped on accept
    #[serde(default)]
    pub allow_list: Vec<IpAddr>,
    /// Working directory handed to the deployment script
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allow_list: Vec::new(),
            work_dir: default_work_dir(),
        }
    }
}

/// Lot-related configuration
#[derive(Debug, Deserialize)]
pub struct LotConfig {
    #[serde(default = "default_lot_id")]
    pub lot_id: String,
    /// DUT pool size
    #[serde(default = "default_units")]
    pub units: usize,
}

impl Default for LotConfig {
    fn default() -> Self {
        Self {
            lot_id: default_lot_id(),
            units: default_units(),
        }
    }
}

/// Summary file configuration
#[derive(Debug, Deserialize)]
pub struct SummaryConfig {
    #[serde(default = "default_summary_dir")]
    pub dir: PathBuf,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            dir: default_summary_dir(),
        }
    }
}

/// Deployment script invoked once at startup
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DeployConfig {
    pub script: PathBuf,
    pub checksum: PathBuf,
    pub archive: PathBuf,
    /// `host:port` SSH targets
    #[serde(default)]
    pub targets: Vec<String>,
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    5000
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_lot_id() -> String {
    "LOT0001".to_string()
}

fn default_units() -> usize {
    100
}

fn default_summary_dir() -> PathBuf {
    PathBuf::from("summary")
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub allow_list: Vec<IpAddr>,
    pub work_dir: PathBuf,
    pub lot_id: String,
    pub units: usize,
    pub summary_dir: PathBuf,
    pub deploy: Option<DeployConfig>,
}

impl Config {
    /// Load the configuration file named by the CLI args and merge the
    /// CLI overrides on top of it.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(&cli.config)
            .map_err(|e| ConfigError::FileRead(cli.config.clone(), e))?;
        let toml_config: TomlConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::TomlParse(cli.config.clone(), e))?;

        Self::merge(cli, toml_config)
    }

    fn merge(cli: &CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Config {
            host: toml_config.server.host,
            port: cli.port.unwrap_or(toml_config.server.port),
            allow_list: toml_config.server.allow_list,
            work_dir: toml_config.server.work_dir,
            lot_id: cli.lot_id.clone().unwrap_or(toml_config.lot.lot_id),
            units: cli.units.unwrap_or(toml_config.lot.units),
            summary_dir: toml_config.summary.dir,
            deploy: toml_config.deploy,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.units == 0 {
            return Err(ConfigError::Invalid("lot.units must be at least 1".to_string()));
        }
        if self.lot_id.trim().is_empty() {
            return Err(ConfigError::Invalid("lot.lot_id must not be empty".to_string()));
        }
        Ok(())
    }

    /// Socket address the acceptor binds to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
