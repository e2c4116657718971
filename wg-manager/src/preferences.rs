// Restart-safe preferences

//! Small key/value state that must survive a restart
//!
//! Holds the running set (`enabled_configs`), the last used tunnel and the
//! restore-on-boot switch. The file store writes a TOML file atomically so a
//! crash mid-write never leaves a truncated file behind.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Persisted preferences
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_tunnel: Option<String>,
    /// Tunnels that were up at the last save
    pub enabled_configs: BTreeSet<String>,
    pub restore_on_boot: bool,
}

/// Load and save [`Preferences`]
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn load(&self) -> Result<Preferences>;

    async fn save(&self, preferences: &Preferences) -> Result<()>;

    /// Load, apply `f`, save
    async fn update(
        &self,
        f: &mut (dyn for<'p> FnMut(&'p mut Preferences) + Send),
    ) -> Result<Preferences> {
        let mut preferences = self.load().await?;
        f(&mut preferences);
        self.save(&preferences).await?;
        Ok(preferences)
    }
}

/// Preferences kept in a TOML file
///
/// File access runs on the blocking pool. Updates from one process are
/// serialised; a save from another process replaces the file whole.
pub struct TomlPreferenceStore {
    path: PathBuf,
    update_lock: tokio::sync::Mutex<()>,
}

impl TomlPreferenceStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            update_lock: tokio::sync::Mutex::new(()),
        }
    }
}

fn read_preferences(path: &Path) -> Result<Preferences> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Preferences::default()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Write through a uniquely named temp file in the same directory, then
/// rename it over `path`
fn write_preferences(path: &Path, preferences: &Preferences) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).context("Failed to create state directory")?;

    let contents = toml::to_string(preferences).context("Failed to serialize preferences")?;
    let mut tmp = NamedTempFile::new_in(dir).context("Failed to create temporary state file")?;
    tmp.write_all(contents.as_bytes())
        .context("Failed to write state file")?;
    tmp.as_file().sync_all().context("Failed to sync state file")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .context("Failed to replace state file")?;
    Ok(())
}

#[async_trait]
impl PreferenceStore for TomlPreferenceStore {
    async fn load(&self) -> Result<Preferences> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_preferences(&path))
            .await
            .context("Preferences reader panicked")?
    }

    async fn save(&self, preferences: &Preferences) -> Result<()> {
        let path = self.path.clone();
        let preferences = preferences.clone();
        tokio::task::spawn_blocking(move || write_preferences(&path, &preferences))
            .await
            .context("Preferences writer panicked")?
    }

    async fn update(
        &self,
        f: &mut (dyn for<'p> FnMut(&'p mut Preferences) + Send),
    ) -> Result<Preferences> {
        let _guard = self.update_lock.lock().await;
        let mut preferences = self.load().await?;
        f(&mut preferences);
        self.save(&preferences).await?;
        Ok(preferences)
    }
}

/// Preferences held in memory only
///
/// Clones share the same preferences, which stands in for a file that
/// outlives one manager instance.
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferenceStore {
    inner: Arc<Mutex<Preferences>>,
}

impl MemoryPreferenceStore {
    pub fn new(preferences: Preferences) -> Self {
        Self {
            inner: Arc::new(Mutex::new(preferences)),
        }
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn load(&self) -> Result<Preferences> {
        Ok(self.inner.lock().clone())
    }

    async fn save(&self, preferences: &Preferences) -> Result<()> {
        *self.inner.lock() = preferences.clone();
        Ok(())
    }

    async fn update(
        &self,
        f: &mut (dyn for<'p> FnMut(&'p mut Preferences) + Send),
    ) -> Result<Preferences> {
        let mut inner = self.inner.lock();
        f(&mut *inner);
        Ok(inner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Preferences {
        Preferences {
            last_used_tunnel: Some("home".to_string()),
            enabled_configs: ["home", "work"].iter().map(|s| s.to_string()).collect(),
            restore_on_boot: true,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let store = TomlPreferenceStore::new(dir.path().join("state.toml"));
        assert_eq!(store.load().await.unwrap(), Preferences::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/state.toml");
        let store = TomlPreferenceStore::new(&path);

        store.save(&sample()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), sample());
        // Only the state file is left behind
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);

        // A second store on the same file sees the same data
        assert_eq!(TomlPreferenceStore::new(&path).load().await.unwrap(), sample());
    }

    #[tokio::test]
    async fn test_no_last_used_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = TomlPreferenceStore::new(dir.path().join("state.toml"));
        let prefs = Preferences {
            last_used_tunnel: None,
            ..sample()
        };
        store.save(&prefs).await.unwrap();
        assert_eq!(store.load().await.unwrap(), prefs);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.toml");
        fs::write(&path, "restore_on_boot = true\n").unwrap();

        let prefs = TomlPreferenceStore::new(&path).load().await.unwrap();
        assert!(prefs.restore_on_boot);
        assert!(prefs.enabled_configs.is_empty());
        assert_eq!(prefs.last_used_tunnel, None);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.toml");
        fs::write(&path, "enabled_configs = 12 [").unwrap();
        assert!(TomlPreferenceStore::new(&path).load().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_updates_keep_every_change() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TomlPreferenceStore::new(dir.path().join("state.toml")));

        let updates = (0..8).map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .update(&mut |p| {
                        p.enabled_configs.insert(format!("wg{}", i));
                    })
                    .await
            })
        });
        for update in futures::future::join_all(updates).await {
            update.unwrap().unwrap();
        }
        assert_eq!(store.load().await.unwrap().enabled_configs.len(), 8);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_shared_between_clones() {
        let store = MemoryPreferenceStore::default();
        let other = store.clone();
        store.save(&sample()).await.unwrap();
        assert_eq!(other.load().await.unwrap(), sample());
    }

    #[tokio::test]
    async fn test_update() {
        let store = MemoryPreferenceStore::new(sample());
        let updated = store
            .update(&mut |p| {
                p.enabled_configs.remove("work");
            })
            .await
            .unwrap();
        assert_eq!(updated.enabled_configs.len(), 1);
        assert_eq!(store.load().await.unwrap(), updated);
    }
}
