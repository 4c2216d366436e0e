use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cache::StreamCacheConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: StreamCacheConfig,

    #[serde(default)]
    pub thumbnails: ThumbnailConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_poster_timeout")]
    pub poster_timeout_ms: u64,

    #[serde(default = "default_poster_cache_capacity")]
    pub poster_cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            info!("No config file found, using defaults");
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let contents = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        config.validate()?;
        info!("Config loaded successfully");
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        debug!("Config saved to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate().context("Invalid [cache] section")?;

        if self.thumbnails.poster_timeout_ms == 0 {
            anyhow::bail!("thumbnails.poster_timeout_ms must be greater than 0");
        }
        if self.thumbnails.poster_cache_capacity == 0 {
            anyhow::bail!("thumbnails.poster_cache_capacity must be greater than 0");
        }
        if self.network.connect_timeout_secs == 0 {
            anyhow::bail!("network.connect_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Failed to get config directory")?;
        Ok(config_dir.join("reelstream").join("config.toml"))
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            poster_timeout_ms: default_poster_timeout(),
            poster_cache_capacity: default_poster_cache_capacity(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            pool_max_idle_per_host: default_pool_max_idle(),
            user_agent: default_user_agent(),
        }
    }
}

// Default value functions
fn default_poster_timeout() -> u64 { 3000 }
fn default_poster_cache_capacity() -> usize { 64 }
fn default_connect_timeout() -> u64 { 10 }
fn default_pool_max_idle() -> usize { 8 }
fn default_user_agent() -> String { format!("reelstream/{}", env!("CARGO_PKG_VERSION")) }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.cache.max_cache_mb = 42;
        config.thumbnails.poster_timeout_ms = 1500;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.cache.max_cache_mb, 42);
        assert_eq!(loaded.thumbnails.poster_timeout_ms, 1500);
        assert_eq!(loaded.network.connect_timeout_secs, 10);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[cache]\nmax_cache_mb = 8\n").unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.cache.max_cache_mb, 8);
        assert_eq!(loaded.cache.segment_duration_secs, 3.0);
        assert_eq!(loaded.cache.first_segment_health, 25);
        assert_eq!(loaded.thumbnails.poster_cache_capacity, 64);
        assert!(loaded.network.user_agent.starts_with("reelstream/"));
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[cache]\nmax_concurrent_fetches = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());

        fs::write(&path, "this is not toml = = =").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
