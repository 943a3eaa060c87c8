//! Configuration for the Quay server and engine
//!
//! Loaded from `quay.toml`. Every field has a default, so a missing file or
//! a partial file still yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::{QuayError, Result};

/// Top-level configuration, one `[server]` and one `[engine]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind
    #[serde(default = "default_addr")]
    pub addr: String,
}

/// Deployment engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root under which per-job working directories are created
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,

    /// Root under which published artifacts land
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Base of the public URL returned for published artifacts
    #[serde(default = "default_public_base")]
    pub public_base: String,

    /// Hosts a `git-reference` source may point at
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,

    /// Branch names tried, in order, when resolving a `git-reference`
    #[serde(default = "default_branch_candidates")]
    pub branch_candidates: Vec<String>,

    /// Upper bound on a fetched or uploaded archive
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,

    /// Seconds a terminal job record is retained before eviction
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

// Default value providers

fn default_addr() -> String {
    "127.0.0.1:8370".to_string()
}

fn default_work_root() -> PathBuf {
    std::env::temp_dir().join("quay").join("work")
}

fn default_output_root() -> PathBuf {
    std::env::temp_dir().join("quay").join("sites")
}

fn default_public_base() -> String {
    "http://localhost:8370/sites".to_string()
}

fn default_allowed_hosts() -> Vec<String> {
    vec!["github.com".to_string()]
}

fn default_branch_candidates() -> Vec<String> {
    vec!["main".to_string(), "master".to_string()]
}

fn default_max_archive_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_retention_secs() -> u64 {
    3600
}

impl QuayConfig {
    /// Load configuration from `path`, or fall back to defaults when the
    /// file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load configuration from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| QuayError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Write the default configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| QuayError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl Default for QuayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_root: default_work_root(),
            output_root: default_output_root(),
            public_base: default_public_base(),
            allowed_hosts: default_allowed_hosts(),
            branch_candidates: default_branch_candidates(),
            max_archive_bytes: default_max_archive_bytes(),
            retention_secs: default_retention_secs(),
        }
    }
}
