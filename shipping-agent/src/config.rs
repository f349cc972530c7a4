//! Configuration management for the shipping agent.
//!
//! Loads configuration from a TOML file; every field has a default.

use crate::pipeline::PipelineOptions;
use crate::store::backup::DEFAULT_LISTING_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub shipping: ShippingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name recorded in manifests
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Cluster id recorded in manifests
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingConfig {
    /// Compressor appended to the send command
    #[serde(default = "default_compress_cmd")]
    pub compress_cmd: String,

    /// Decompressor prepended to the receive command
    #[serde(default = "default_decompress_cmd")]
    pub decompress_cmd: String,

    /// Delay after a restore stream is closed (ms)
    #[serde(default = "default_restore_settle_ms")]
    pub restore_settle_ms: u64,

    /// How long shutdown waits for a shipment's workers (s)
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,

    /// Bound on a full bucket listing (s)
    #[serde(default = "default_listing_timeout_secs")]
    pub listing_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory used as the local object store
    #[serde(default = "default_store_root")]
    pub root: PathBuf,

    /// Remote name the local store is known as
    #[serde(default = "default_remote_name")]
    pub remote_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "satellite-01".to_string())
}

fn default_cluster_id() -> String {
    "local".to_string()
}

fn default_compress_cmd() -> String {
    "zstd".to_string()
}

fn default_decompress_cmd() -> String {
    "zstd -d".to_string()
}

fn default_restore_settle_ms() -> u64 {
    500
}

fn default_join_timeout_secs() -> u64 {
    10
}

fn default_listing_timeout_secs() -> u64 {
    DEFAULT_LISTING_TIMEOUT.as_secs()
}

fn default_store_root() -> PathBuf {
    PathBuf::from("/var/lib/shipping-agent/store")
}

fn default_remote_name() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            cluster_id: default_cluster_id(),
        }
    }
}

impl Default for ShippingConfig {
    fn default() -> Self {
        Self {
            compress_cmd: default_compress_cmd(),
            decompress_cmd: default_decompress_cmd(),
            restore_settle_ms: default_restore_settle_ms(),
            join_timeout_secs: default_join_timeout_secs(),
            listing_timeout_secs: default_listing_timeout_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            remote_name: default_remote_name(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            compress_cmd: self.shipping.compress_cmd.clone(),
            decompress_cmd: self.shipping.decompress_cmd.clone(),
            restore_settle: Duration::from_millis(self.shipping.restore_settle_ms),
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.shipping.join_timeout_secs)
    }

    pub fn listing_timeout(&self) -> Duration {
        Duration::from_secs(self.shipping.listing_timeout_secs)
    }
}
