// src/config.rs

//! Configuration loading utilities.
//!
//! The CLI reads `config.toml` from disk; the Lambda runtime reads it from
//! the `config` section of its bucket. Both fall back to defaults and then apply
//! environment overrides.

use std::path::Path;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::Config;
use crate::storage::ArtifactStore;

/// Default artifact key of the remote configuration.
pub const DEFAULT_CONFIG_KEY: &str = "config.toml";

/// Loads configuration from an object store.
pub struct RemoteConfigLoader {
    store: Arc<dyn ArtifactStore>,
    key: String,
}

impl RemoteConfigLoader {
    pub fn new(store: Arc<dyn ArtifactStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Key from `CONFIG_S3_KEY`, or [`DEFAULT_CONFIG_KEY`].
    pub fn from_env(store: Arc<dyn ArtifactStore>) -> Self {
        let key = std::env::var("CONFIG_S3_KEY").unwrap_or_else(|_| DEFAULT_CONFIG_KEY.to_string());
        Self::new(store, key)
    }

    /// The stored configuration, or `None` when nothing is stored.
    pub async fn load_optional(&self) -> Result<Option<Config>> {
        let Some(bytes) = self.store.get(&self.key).await? else {
            return Ok(None);
        };
        let text = String::from_utf8(bytes).map_err(|e| {
            AppError::Config(format!("Config file {} is not valid UTF-8: {}", self.key, e))
        })?;
        Config::from_toml(&text).map(Some)
    }

    /// Stored configuration with environment overrides, falling back to
    /// defaults when none is stored. A stored but invalid file is an error.
    pub async fn load_config(&self) -> Result<Config> {
        let mut config = match self.load_optional().await? {
            Some(config) => {
                log::info!("Loaded config from {}", self.key);
                config
            }
            None => {
                log::info!("No config at {}, using defaults", self.key);
                Config::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

/// Load `config.toml` from disk with environment overrides.
///
/// Falls back to defaults if the file is missing; a broken file is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        Config::load(path)?
    } else {
        log::warn!("No config at {}, using defaults", path.display());
        Config::default()
    };
    config.apply_env_overrides();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryArtifactStore;

    #[tokio::test]
    async fn test_missing_remote_config_uses_defaults() {
        let store = Arc::new(MemoryArtifactStore::new());
        let loader = RemoteConfigLoader::new(store, "config/config.toml");
        assert!(loader.load_optional().await.unwrap().is_none());
        let config = loader.load_config().await.unwrap();
        assert_eq!(config.views.feed_max_len, Config::default().views.feed_max_len);
    }

    #[tokio::test]
    async fn test_remote_config_is_parsed() {
        let store = Arc::new(MemoryArtifactStore::new());
        store
            .put(
                "config/config.toml",
                b"[views]\nfeed_max_len = 7\n".to_vec(),
                "application/toml",
            )
            .await
            .unwrap();
        let loader = RemoteConfigLoader::new(store, "config/config.toml");
        let config = loader.load_optional().await.unwrap().unwrap();
        assert_eq!(config.views.feed_max_len, 7);
    }

    #[tokio::test]
    async fn test_invalid_remote_config_is_an_error() {
        let store = Arc::new(MemoryArtifactStore::new());
        store
            .put("cfg.toml", b"[views\n".to_vec(), "application/toml")
            .await
            .unwrap();
        let loader = RemoteConfigLoader::new(store, "cfg.toml");
        assert!(loader.load_config().await.is_err());
    }

    #[test]
    fn test_local_config_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.toml")).unwrap();
        assert!(config.validate().is_ok());
    }
}
