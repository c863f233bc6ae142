use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::{
    DEFAULT_BODY_CHUNK_SIZE, DEFAULT_CACHE_DIR, DEFAULT_LOG_LEVEL, DEFAULT_MAX_QUERY_SIZE_BYTES,
    DEFAULT_QUOTA_BYTES,
};

fn default_cache_dir() -> String {
    DEFAULT_CACHE_DIR.to_string()
}

fn default_max_query_size_bytes() -> u64 {
    DEFAULT_MAX_QUERY_SIZE_BYTES
}

fn default_body_chunk_size() -> usize {
    DEFAULT_BODY_CHUNK_SIZE
}

fn default_quota_bytes() -> u64 {
    DEFAULT_QUOTA_BYTES
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

/// Cache storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStorageConfig {
    /// Keep entries in memory instead of under `cache_dir`
    #[serde(default)]
    pub memory_only: bool,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    /// Upper bound on the estimated size of one query's results (default: 10 MB)
    #[serde(default = "default_max_query_size_bytes")]
    pub max_query_size_bytes: u64,
    /// Chunk size when copying a body into an entry (default: 64 KB)
    #[serde(default = "default_body_chunk_size")]
    pub body_chunk_size: usize,
    /// Per-origin quota of the built-in quota manager (default: 100 MB)
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of plain text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for CacheStorageConfig {
    fn default() -> Self {
        Self {
            memory_only: false,
            cache_dir: default_cache_dir(),
            max_query_size_bytes: default_max_query_size_bytes(),
            body_chunk_size: default_body_chunk_size(),
            quota_bytes: default_quota_bytes(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CacheStorageConfig {
    pub fn from_yaml_with_env(yaml: &str) -> Result<Self, String> {
        // Replace ${VAR_NAME} with environment variable values
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").map_err(|e| e.to_string())?;

        for caps in re.captures_iter(yaml) {
            let var_name = &caps[1];
            std::env::var(var_name).map_err(|_| {
                format!(
                    "Environment variable '{}' is referenced but not set",
                    var_name
                )
            })?;
        }

        let substituted = re.replace_all(yaml, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        });

        serde_yaml::from_str(&substituted).map_err(|e| e.to_string())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        Self::from_yaml_with_env(&yaml)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.memory_only && self.cache_dir.trim().is_empty() {
            return Err("cache_dir cannot be empty unless memory_only is set".to_string());
        }
        if self.max_query_size_bytes == 0 {
            return Err("max_query_size_bytes must be greater than 0".to_string());
        }
        if self.body_chunk_size == 0 {
            return Err("body_chunk_size must be greater than 0".to_string());
        }
        if self.logging.level.trim().is_empty() {
            return Err("logging.level cannot be empty".to_string());
        }
        Ok(())
    }
}
