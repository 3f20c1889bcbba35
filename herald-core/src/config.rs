//! Configuration management for herald.
//!
//! Handles CLI argument parsing, config file loading, and defaults.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::publisher::PublisherKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "herald")]
#[command(about = "Index provider node", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the provider daemon
    Start(StartCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct StartCommand {
    /// Data directory for node configuration and state
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Optional TOML config file; CLI flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// TCP port for the dtsync P2P transport
    #[arg(long, default_value_t = 3103)]
    pub listen_port: u16,

    /// Listen address for the HTTP publisher
    #[arg(long, default_value = "0.0.0.0:3104")]
    pub http_listen_addr: String,

    /// Which transport serves the ad chain (dtsync or http)
    #[arg(long, default_value = "dtsync")]
    pub publisher_kind: String,

    /// Indexer base URLs to announce new heads to
    #[arg(long)]
    pub direct_announce: Vec<String>,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Advertisement ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Multihashes per entries chunk.
    #[serde(default = "default_linked_chunk_size")]
    pub linked_chunk_size: usize,

    /// Capacity of the context → entries-root cache.
    #[serde(default = "default_link_cache_size")]
    pub link_cache_size: usize,

    #[serde(default = "default_pubsub_topic")]
    pub pubsub_topic: String,

    #[serde(default = "default_publisher_kind")]
    pub publisher_kind: PublisherKind,

    #[serde(default = "default_http_listen_addr")]
    pub http_listen_addr: String,

    #[serde(default)]
    pub sync_policy: SyncPolicyConfig,
}

/// Which peers may pull the ad chain over dtsync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPolicyConfig {
    #[serde(default = "default_true")]
    pub allow: bool,

    /// Peer ID strings exempted from the base rule.
    #[serde(default)]
    pub except: Vec<String>,
}

impl Default for SyncPolicyConfig {
    fn default() -> Self {
        Self {
            allow: true,
            except: Vec::new(),
        }
    }
}

/// Reframe listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReframeConfig {
    /// Seconds a provided CID stays advertised without a refresh.
    #[serde(default = "default_cid_ttl_secs")]
    pub cid_ttl_secs: u64,

    /// CIDs per reframe chunk.
    #[serde(default = "default_reframe_chunk_size")]
    pub chunk_size: usize,

    /// Persisted chunk count that triggers a snapshot.
    #[serde(default = "default_snapshot_size")]
    pub snapshot_size: usize,

    /// Provider identity announced for reframe ads; defaults to the node key.
    #[serde(default)]
    pub provider_id: Option<String>,

    /// Retrieval multiaddrs announced for reframe ads.
    #[serde(default)]
    pub addrs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            linked_chunk_size: default_linked_chunk_size(),
            link_cache_size: default_link_cache_size(),
            pubsub_topic: default_pubsub_topic(),
            publisher_kind: default_publisher_kind(),
            http_listen_addr: default_http_listen_addr(),
            sync_policy: SyncPolicyConfig::default(),
        }
    }
}

impl Default for ReframeConfig {
    fn default() -> Self {
        Self {
            cid_ttl_secs: default_cid_ttl_secs(),
            chunk_size: default_reframe_chunk_size(),
            snapshot_size: default_snapshot_size(),
            provider_id: None,
            addrs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub listen_port: u16,
    pub log_level: String,

    #[serde(default)]
    pub direct_announce_urls: Vec<String>,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub reframe: ReframeConfig,
}

impl Config {
    /// Create config from CLI arguments, loading the TOML file first when
    /// one is given.
    pub fn from_cli() -> Result<Self, ConfigError> {
        let cli = Cli::parse();
        match cli.command {
            Commands::Start(cmd) => Self::from_start_command(cmd),
        }
    }

    pub fn from_start_command(cmd: StartCommand) -> Result<Self, ConfigError> {
        let mut config = match &cmd.config {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        config.data_dir = cmd.data_dir;
        config.listen_port = cmd.listen_port;
        config.log_level = cmd.log_level;
        config.ingest.http_listen_addr = cmd.http_listen_addr;
        config.ingest.publisher_kind = cmd
            .publisher_kind
            .parse()
            .map_err(ConfigError::Invalid)?;
        if !cmd.direct_announce.is_empty() {
            config.direct_announce_urls = cmd.direct_announce;
        }
        Ok(config)
    }

    /// Load config from a TOML file.
    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            listen_port: 3103,
            log_level: "info".to_string(),
            direct_announce_urls: Vec::new(),
            ingest: IngestConfig::default(),
            reframe: ReframeConfig::default(),
        }
    }
}

fn default_linked_chunk_size() -> usize {
    crate::entries::DEFAULT_CHUNK_SIZE
}

fn default_link_cache_size() -> usize {
    1024
}

fn default_pubsub_topic() -> String {
    "/indexer/ingest/mainnet".to_string()
}

fn default_publisher_kind() -> PublisherKind {
    PublisherKind::DtSync
}

fn default_http_listen_addr() -> String {
    "0.0.0.0:3104".to_string()
}

fn default_cid_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_reframe_chunk_size() -> usize {
    1000
}

fn default_snapshot_size() -> usize {
    8000
}

fn default_true() -> bool {
    true
}
