use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads, so request handlers can consult the
/// camera list without contention.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Open the configuration file, creating it with defaults if missing
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let config = Self::load_config(path).await?;
        config.validate()?;
        let cache = Arc::new(ArcSwap::from_pointee(config));

        Ok(Self {
            path: path.to_path_buf(),
            cache,
        })
    }

    /// Load configuration from disk
    async fn load_config(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::save_config_to_file(path, &config).await?;
                tracing::info!("Created default configuration at {}", path.display());
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write configuration through a temp file so readers never see a partial file
    async fn save_config_to_file(path: &Path, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Set entire configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        Self::save_config_to_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));
        Ok(())
    }
}
