// Durable tunnel configuration storage

//! Persistence of tunnel configurations
//!
//! [`ConfigStore`] is the narrow interface the tunnel manager persists
//! through. [`FileConfigStore`] keeps one wg-quick file per tunnel,
//! `<dir>/<name>.conf`, readable only by its owner.

use crate::wg_config::Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// File name suffix of stored configurations
pub const CONFIGURATION_FILE_SUFFIX: &str = ".conf";

/// Durable per-tunnel configuration storage
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Store a new configuration; fails if `name` already exists
    async fn create(&self, name: &str, config: &Config) -> Result<Config>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Names of every stored configuration
    async fn enumerate(&self) -> Result<BTreeSet<String>>;

    async fn load(&self, name: &str) -> Result<Config>;

    /// Move a configuration; fails if `replacement` already exists
    async fn rename(&self, name: &str, replacement: &str) -> Result<()>;

    /// Overwrite an existing configuration; fails if `name` does not exist
    async fn save(&self, name: &str, config: &Config) -> Result<Config>;
}

/// Stores configurations as `<name>.conf` files in one directory
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, CONFIGURATION_FILE_SUFFIX))
    }

    /// Create `path` exclusively with mode 0600
    async fn create_new(&self, path: &Path) -> Result<fs::File> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .await
            .with_context(|| format!("Configuration file {} already exists", path.display()))
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn create(&self, name: &str, config: &Config) -> Result<Config> {
        log::debug!("Creating configuration for tunnel {}", name);
        let path = self.file_for(name);
        let mut file = self.create_new(&path).await?;
        file.write_all(config.to_wg_quick_string().as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        file.flush().await?;
        Ok(config.clone())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        log::debug!("Deleting configuration for tunnel {}", name);
        let path = self.file_for(name);
        fs::remove_file(&path)
            .await
            .with_context(|| format!("Cannot delete configuration file {}", path.display()))
    }

    async fn enumerate(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", self.dir.display()))
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = file_name.strip_suffix(CONFIGURATION_FILE_SUFFIX) {
                if !name.is_empty() {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names)
    }

    async fn load(&self, name: &str) -> Result<Config> {
        let path = self.file_for(name);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Config::parse(&text).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    async fn rename(&self, name: &str, replacement: &str) -> Result<()> {
        log::debug!("Renaming configuration for tunnel {} to {}", name, replacement);
        let file = self.file_for(name);
        let replacement_file = self.file_for(replacement);

        // Reserve the new name so a concurrent create cannot take it
        drop(self.create_new(&replacement_file).await?);

        if let Err(e) = fs::rename(&file, &replacement_file).await {
            if let Err(cleanup) = fs::remove_file(&replacement_file).await {
                log::warn!(
                    "Couldn't delete marker file for new name {}: {}",
                    replacement,
                    cleanup
                );
            }
            return Err(e)
                .with_context(|| format!("Cannot rename configuration file {}", file.display()));
        }
        Ok(())
    }

    async fn save(&self, name: &str, config: &Config) -> Result<Config> {
        log::debug!("Saving configuration for tunnel {}", name);
        let path = self.file_for(name);
        let is_file = fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            anyhow::bail!("Configuration file {} not found", path.display());
        }
        fs::write(&path, config.to_wg_quick_string())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(config.clone())
    }
}
