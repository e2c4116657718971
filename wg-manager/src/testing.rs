// In-memory backend and config store for manager tests

use crate::backend::Backend;
use crate::config_store::ConfigStore;
use crate::error::BackendError;
use crate::keys::Key;
use crate::statistics::Statistics;
use crate::tunnel::Tunnel;
use crate::types::TunnelState;
use crate::wg_config::Config;
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Ordered record of calls shared by the fakes
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, call: String) {
        self.0.lock().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Calls starting with `prefix`
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Backend that only tracks a set of running names
pub struct FakeBackend {
    log: CallLog,
    running: Mutex<BTreeSet<String>>,
    failing: Mutex<BTreeSet<String>>,
}

impl FakeBackend {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            running: Mutex::new(BTreeSet::new()),
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_running(self, names: &[&str]) -> Self {
        self.running
            .lock()
            .extend(names.iter().map(|name| name.to_string()));
        self
    }

    /// Make bringing `name` up fail from now on
    pub fn fail_on(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.lock().contains(name)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn apply_config(&self, tunnel: &Tunnel, config: &Config) -> Result<Config> {
        self.log
            .push(format!("backend.apply_config {}", tunnel.name()));
        Ok(config.clone())
    }

    async fn enumerate(&self) -> BTreeSet<String> {
        self.running.lock().clone()
    }

    async fn get_state(&self, tunnel: &Tunnel) -> Result<TunnelState> {
        Ok(TunnelState::of(self.is_running(&tunnel.name())))
    }

    async fn get_statistics(&self, tunnel: &Tunnel) -> Statistics {
        self.log
            .push(format!("backend.get_statistics {}", tunnel.name()));
        let mut stats = Statistics::new();
        if self.is_running(&tunnel.name()) {
            stats.add(Key::from_bytes([1; 32]), 10, 20);
        }
        stats
    }

    async fn set_state(&self, tunnel: &Tunnel, state: TunnelState) -> Result<TunnelState> {
        let name = tunnel.name();
        self.log.push(format!("backend.set_state {} {}", name, state));

        let current = TunnelState::of(self.is_running(&name));
        let target = state.resolve(current);
        if target == TunnelState::Up && self.failing.lock().contains(&name) {
            return Err(BackendError::CommandFailed {
                command: format!("fake up {}", name),
                stderr: "refused".to_string(),
            }
            .into());
        }

        let mut running = self.running.lock();
        if target == TunnelState::Up {
            running.insert(name);
        } else {
            running.remove(&name);
        }
        Ok(target)
    }

    async fn version(&self) -> Result<String> {
        Ok("fake".to_string())
    }

    fn type_pretty_name(&self) -> &'static str {
        "Fake"
    }
}

/// Config store keeping everything in a map
pub struct FakeStore {
    log: CallLog,
    configs: Mutex<BTreeMap<String, Config>>,
    failing: Mutex<BTreeSet<&'static str>>,
}

impl FakeStore {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            configs: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_tunnels(self, names: &[&str]) -> Self {
        self.configs.lock().extend(
            names
                .iter()
                .map(|name| (name.to_string(), Config::default())),
        );
        self
    }

    /// Make the named operation ("delete", "rename", ...) fail from now on
    pub fn fail_on(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.configs.lock().contains_key(name)
    }

    fn record(&self, operation: &'static str, detail: String) -> Result<()> {
        self.log.push(format!("store.{} {}", operation, detail));
        if self.failing.lock().contains(operation) {
            bail!("store {} failed", operation);
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for FakeStore {
    async fn create(&self, name: &str, config: &Config) -> Result<Config> {
        self.record("create", name.to_string())?;
        let mut configs = self.configs.lock();
        if configs.contains_key(name) {
            bail!("{} already exists", name);
        }
        configs.insert(name.to_string(), config.clone());
        Ok(config.clone())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.record("delete", name.to_string())?;
        match self.configs.lock().remove(name) {
            Some(_) => Ok(()),
            None => bail!("{} does not exist", name),
        }
    }

    async fn enumerate(&self) -> Result<BTreeSet<String>> {
        Ok(self.configs.lock().keys().cloned().collect())
    }

    async fn load(&self, name: &str) -> Result<Config> {
        self.record("load", name.to_string())?;
        match self.configs.lock().get(name) {
            Some(config) => Ok(config.clone()),
            None => bail!("{} does not exist", name),
        }
    }

    async fn rename(&self, name: &str, replacement: &str) -> Result<()> {
        self.record("rename", format!("{} {}", name, replacement))?;
        let mut configs = self.configs.lock();
        if configs.contains_key(replacement) {
            bail!("{} already exists", replacement);
        }
        match configs.remove(name) {
            Some(config) => {
                configs.insert(replacement.to_string(), config);
                Ok(())
            }
            None => bail!("{} does not exist", name),
        }
    }

    async fn save(&self, name: &str, config: &Config) -> Result<Config> {
        self.record("save", name.to_string())?;
        let mut configs = self.configs.lock();
        match configs.get_mut(name) {
            Some(stored) => {
                *stored = config.clone();
                Ok(config.clone())
            }
            None => bail!("{} does not exist", name),
        }
    }
}
