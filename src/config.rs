//! Configuration loading and validation.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_chunk_size() -> u64 {
    8 * 1024 * 1024
}

fn default_max_cache_size() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_readahead_trigger() -> u64 {
    1024 * 1024
}

fn default_max_downloads() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    60
}

fn default_blocked_extensions() -> Vec<String> {
    [".lnk", ".exe", ".bat", ".cmd", ".scr", ".zipx"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_keep_active_hours() -> u64 {
    72
}

fn default_dormant_batch() -> usize {
    5
}

fn default_stall_minutes() -> u64 {
    30
}

fn default_stall_speed() -> u64 {
    1024
}

fn default_poll_interval() -> u64 {
    30
}

fn default_stall_check_interval() -> u64 {
    10
}

fn default_dormancy_interval() -> u64 {
    4
}

fn default_provider_api_base() -> String {
    "https://api.real-debrid.com/rest/1.0".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_provider_api_base")]
    pub provider_api_base: String,
    /// Bearer token for the debrid API; required to start the daemon.
    #[serde(default)]
    pub provider_api_token: Option<String>,

    /// Chunk store root.
    pub cache_dir: PathBuf,
    /// Persisted container descriptors root (Active/, Deleted/, Problematic/).
    pub data_dir: PathBuf,
    /// Writable local directory overlaid on the virtual namespace.
    pub local_dir: PathBuf,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,
    /// Distance from the chunk end at which readahead is scheduled.
    #[serde(default = "default_readahead_trigger")]
    pub readahead_trigger_position: u64,
    #[serde(default = "default_max_downloads")]
    pub max_total_concurrent_downloads: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    #[serde(default = "default_blocked_extensions")]
    pub blocked_file_extensions: Vec<String>,

    #[serde(default)]
    pub enable_dormant: bool,
    #[serde(default = "default_keep_active_hours")]
    pub keep_active_hours: u64,
    #[serde(default = "default_dormant_batch")]
    pub dormant_verification_batch: usize,

    #[serde(default = "default_stall_minutes")]
    pub stall_detection_minutes: u64,
    #[serde(default = "default_stall_speed")]
    pub stall_speed_bytes_per_sec: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_stall_check_interval")]
    pub stall_check_interval_minutes: u64,
    #[serde(default = "default_dormancy_interval")]
    pub dormancy_interval_hours: u64,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be positive");
        }
        if self.max_cache_size < self.chunk_size {
            bail!("max_cache_size must hold at least one chunk");
        }
        if self.readahead_trigger_position > self.chunk_size {
            bail!("readahead_trigger_position must not exceed chunk_size");
        }
        if self.max_total_concurrent_downloads == 0 {
            bail!("max_total_concurrent_downloads must be positive");
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "cache_dir: /tmp/c\ndata_dir: /tmp/d\nlocal_dir: /tmp/l\n"
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.chunk_size, 8 * 1024 * 1024);
        assert_eq!(cfg.max_total_concurrent_downloads, 8);
        assert_eq!(cfg.listen_addr, "127.0.0.1:8080");
        assert!(!cfg.enable_dormant);
        assert!(cfg.blocked_file_extensions.contains(&".exe".to_string()));
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let yaml = format!("{}chunk_size: 0\n", minimal_yaml());
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_cache_smaller_than_chunk() {
        let yaml = format!("{}chunk_size: 1024\nmax_cache_size: 512\n", minimal_yaml());
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(cfg.validate().is_err());
    }
}
