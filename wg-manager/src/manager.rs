// Tunnel lifecycle orchestration

//! The tunnel manager
//!
//! [`TunnelManager`] owns the catalog of known tunnels and is the only
//! writer of their cached fields. Every operation that touches the backend
//! or the config store is async; the catalog itself sits behind a short
//! lock that is never held across an await. State-changing operations on
//! one tunnel are serialised by that tunnel's own async mutex.
//!
//! The catalog is built from the stored tunnel names, with the state of each
//! seeded from what the backend reports as running, and is re-synced by
//! [`TunnelManager::refresh_tunnel_states`]. Restores requested before the
//! first load are queued and served by a single restore once loading
//! completes. The saved running set is left untouched until that initial
//! restore is over.

use crate::backend::Backend;
use crate::catalog::Catalog;
use crate::config_store::ConfigStore;
use crate::error::TunnelError;
use crate::preferences::{PreferenceStore, Preferences};
use crate::statistics::Statistics;
use crate::tunnel::{validate_name, Tunnel};
use crate::types::{TunnelEvent, TunnelState};
use crate::wg_config::Config;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};

/// Capacity of the event channel; slow subscribers lag rather than block
const EVENT_CHANNEL_SIZE: usize = 64;

/// Outcome of a restore shared with every queued requester: the names that
/// failed to come up
type RestoreOutcome = Result<(), Vec<String>>;

#[derive(Default)]
struct RestoreQueue {
    loaded: bool,
    waiters: Vec<oneshot::Sender<RestoreOutcome>>,
}

pub struct TunnelManager {
    backend: Arc<dyn Backend>,
    store: Arc<dyn ConfigStore>,
    preferences: Arc<dyn PreferenceStore>,
    catalog: Mutex<Catalog>,
    last_used: Mutex<Option<Arc<Tunnel>>>,
    events: broadcast::Sender<TunnelEvent>,
    loaded: watch::Sender<bool>,
    restore_queue: Mutex<RestoreQueue>,
    /// Set once the initial restore is over; gates [`TunnelManager::save_state`]
    settled: AtomicBool,
    /// Held by operations that add or remove catalog entries
    structure: tokio::sync::Mutex<()>,
}

impl TunnelManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        store: Arc<dyn ConfigStore>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (loaded, _) = watch::channel(false);
        Self {
            backend,
            store,
            preferences,
            catalog: Mutex::new(Catalog::new()),
            last_used: Mutex::new(None),
            events,
            loaded,
            restore_queue: Mutex::new(RestoreQueue::default()),
            settled: AtomicBool::new(false),
            structure: tokio::sync::Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Receive every [`TunnelEvent`] published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Build the catalog and bring the saved running set back up
    ///
    /// This restore is always forced; restore-on-boot only gates unforced
    /// [`restore_state`](Self::restore_state) calls. Restores queued before
    /// loading share its outcome.
    pub async fn on_create(&self) -> Result<(), TunnelError> {
        let outcome = self.load_catalog(true).await;
        self.settle();
        match outcome {
            Some(Err(failed)) => Err(TunnelError::Restore(failed)),
            _ => Ok(()),
        }
    }

    /// Build the catalog without restoring anything
    pub async fn load(&self) {
        self.load_catalog(false).await;
        self.settle();
    }

    /// Build the catalog, keeping the saved running set untouched until the
    /// next [`restore_state`](Self::restore_state) call is over
    pub async fn load_deferred(&self) {
        self.load_catalog(false).await;
    }

    fn settle(&self) {
        self.settled.store(true, Ordering::Release);
    }

    /// Returns the outcome of the restore run at the end of loading, if any
    async fn load_catalog(&self, initial_restore: bool) -> Option<RestoreOutcome> {
        let (present, running) = tokio::join!(self.store.enumerate(), self.backend.enumerate());
        let present = present.unwrap_or_else(|e| {
            log::error!("Failed to enumerate stored tunnels: {:#}", e);
            BTreeSet::new()
        });

        let mut added = Vec::new();
        {
            let mut catalog = self.catalog.lock();
            for name in &present {
                if let Err(e) = validate_name(name) {
                    log::warn!("Skipping stored tunnel: {}", e);
                    continue;
                }
                let state = TunnelState::of(running.contains(name));
                let tunnel = Arc::new(Tunnel::new(
                    name.clone(),
                    None,
                    state,
                    self.events.clone(),
                ));
                if catalog.insert(tunnel) {
                    added.push(name.clone());
                }
            }
        }
        for name in running.difference(&present) {
            log::debug!("Ignoring running interface {} with no stored configuration", name);
        }
        log::info!(
            "Loaded {} tunnel(s), {} running",
            added.len(),
            running.intersection(&present).count()
        );
        for name in added {
            self.publish(TunnelEvent::Added(name));
        }

        let preferences = self.load_preferences().await;
        if let Some(name) = &preferences.last_used_tunnel {
            if let Some(tunnel) = self.tunnel(name) {
                *self.last_used.lock() = Some(tunnel);
                self.publish(TunnelEvent::LastUsedChanged(Some(name.clone())));
            }
        }

        let waiters = {
            let mut queue = self.restore_queue.lock();
            queue.loaded = true;
            std::mem::take(&mut queue.waiters)
        };
        self.loaded.send_replace(true);

        if !initial_restore && waiters.is_empty() {
            return None;
        }
        if !waiters.is_empty() {
            log::info!("Serving {} queued restore request(s)", waiters.len());
        }
        let outcome = self.restore_running_set(&preferences.enabled_configs).await;
        for waiter in waiters {
            // The requester may have given up
            let _ = waiter.send(outcome.clone());
        }
        Some(outcome)
    }

    async fn load_preferences(&self) -> Preferences {
        self.preferences.load().await.unwrap_or_else(|e| {
            log::warn!("Failed to load preferences, using defaults: {:#}", e);
            Preferences::default()
        })
    }

    async fn wait_loaded(&self) {
        let mut loaded = self.loaded.subscribe();
        // The sender lives as long as self
        let _ = loaded.wait_for(|loaded| *loaded).await;
    }

    /// Every tunnel in name order, once the catalog has loaded
    pub async fn tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.wait_loaded().await;
        self.catalog.lock().to_vec()
    }

    pub fn tunnel(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.catalog.lock().get(name)
    }

    pub fn last_used_tunnel(&self) -> Option<Arc<Tunnel>> {
        self.last_used.lock().clone()
    }

    async fn set_last_used(&self, tunnel: Option<Arc<Tunnel>>) {
        {
            let mut last_used = self.last_used.lock();
            let unchanged = match (last_used.as_ref(), tunnel.as_ref()) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                return;
            }
            *last_used = tunnel.clone();
        }

        let name = tunnel.map(|t| t.name());
        self.publish(TunnelEvent::LastUsedChanged(name.clone()));
        if let Err(e) = self
            .preferences
            .update(&mut |p: &mut Preferences| p.last_used_tunnel = name.clone())
            .await
        {
            log::warn!("Failed to persist last used tunnel: {:#}", e);
        }
    }

    fn is_last_used(&self, tunnel: &Arc<Tunnel>) -> bool {
        self.last_used
            .lock()
            .as_ref()
            .is_some_and(|last| Arc::ptr_eq(last, tunnel))
    }

    fn publish(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    /// Store a new tunnel and add it to the catalog, DOWN
    pub async fn create(&self, name: &str, config: Config) -> Result<Arc<Tunnel>, TunnelError> {
        validate_name(name)?;
        let _structure = self.structure.lock().await;
        if self.catalog.lock().contains(name) {
            return Err(TunnelError::AlreadyExists(name.to_string()));
        }

        let saved = self
            .store
            .create(name, &config)
            .await
            .map_err(|e| TunnelError::store(name, e))?;

        let tunnel = Arc::new(Tunnel::new(
            name.to_string(),
            Some(saved),
            TunnelState::Down,
            self.events.clone(),
        ));
        if !self.catalog.lock().insert(tunnel.clone()) {
            return Err(TunnelError::AlreadyExists(name.to_string()));
        }
        log::info!("Created tunnel {}", name);
        self.publish(TunnelEvent::Added(name.to_string()));
        Ok(tunnel)
    }

    /// Remove a tunnel, bringing it down first
    ///
    /// The tunnel leaves the catalog immediately. If deleting the stored
    /// configuration fails, it is put back, brought back up if it was up,
    /// and the error is returned.
    pub async fn delete(&self, tunnel: &Arc<Tunnel>) -> Result<(), TunnelError> {
        let _structure = self.structure.lock().await;
        let name = tunnel.name();
        let original_state = tunnel.state();
        if !self.catalog.lock().contains(&name) {
            return Err(TunnelError::NotFound(name));
        }
        let was_last_used = self.is_last_used(tunnel);
        if was_last_used {
            self.set_last_used(None).await;
        }
        self.catalog.lock().remove(&name);
        self.publish(TunnelEvent::Removed(name.clone()));

        let _guard = tunnel.lock().await;
        let result = self.delete_internal(tunnel, &name, original_state).await;

        match result {
            Ok(()) => {
                tunnel.on_state_changed(TunnelState::Down);
                log::info!("Deleted tunnel {}", name);
                if let Err(e) = self.save_state().await {
                    log::warn!("Failed to save running set: {}", e);
                }
                Ok(())
            }
            Err(e) => {
                log::warn!("Deleting {} failed, restoring it: {}", name, e);
                if original_state == TunnelState::Up {
                    if let Err(up) = self.backend.set_state(tunnel, TunnelState::Up).await {
                        log::error!("Failed to bring {} back up: {:#}", name, up);
                    }
                }
                self.requery_state(tunnel).await;
                self.catalog.lock().insert(tunnel.clone());
                self.publish(TunnelEvent::Added(name));
                if was_last_used {
                    self.set_last_used(Some(tunnel.clone())).await;
                }
                Err(e)
            }
        }
    }

    async fn delete_internal(
        &self,
        tunnel: &Arc<Tunnel>,
        name: &str,
        original_state: TunnelState,
    ) -> Result<(), TunnelError> {
        if original_state == TunnelState::Up {
            self.ensure_config(tunnel).await?;
            self.backend
                .set_state(tunnel, TunnelState::Down)
                .await
                .map_err(|e| TunnelError::backend(name, e))?;
        }
        self.store
            .delete(name)
            .await
            .map_err(|e| TunnelError::store(name, e))
    }

    /// Rename a tunnel, restarting it under the new name if it was up
    ///
    /// The tunnel is always put back into the catalog, under whatever name
    /// it ends up with.
    pub async fn set_tunnel_name(
        &self,
        tunnel: &Arc<Tunnel>,
        name: &str,
    ) -> Result<String, TunnelError> {
        validate_name(name)?;
        let _structure = self.structure.lock().await;
        let old_name = tunnel.name();
        if old_name == name {
            return Ok(old_name);
        }
        if self.catalog.lock().contains(name) {
            return Err(TunnelError::AlreadyExists(name.to_string()));
        }

        let _guard = tunnel.lock().await;
        let original_state = tunnel.state();
        let was_last_used = self.is_last_used(tunnel);
        if was_last_used {
            self.set_last_used(None).await;
        }
        self.catalog.lock().remove(&old_name);

        let result = self
            .rename_internal(tunnel, &old_name, name, original_state)
            .await;

        if let Err(e) = &result {
            log::warn!("Renaming {} to {} failed: {}", old_name, name, e);
            if original_state == TunnelState::Up && tunnel.state() != TunnelState::Up {
                if let Err(up) = self.backend.set_state(tunnel, TunnelState::Up).await {
                    log::error!("Failed to bring {} back up: {:#}", tunnel.name(), up);
                }
            }
            self.requery_state(tunnel).await;
        }
        self.catalog.lock().insert(tunnel.clone());
        if was_last_used {
            self.set_last_used(Some(tunnel.clone())).await;
        }
        if let Err(e) = self.save_state().await {
            log::warn!("Failed to save running set: {}", e);
        }
        result
    }

    async fn rename_internal(
        &self,
        tunnel: &Arc<Tunnel>,
        old_name: &str,
        name: &str,
        original_state: TunnelState,
    ) -> Result<String, TunnelError> {
        if original_state == TunnelState::Up {
            self.ensure_config(tunnel).await?;
            let state = self
                .backend
                .set_state(tunnel, TunnelState::Down)
                .await
                .map_err(|e| TunnelError::backend(old_name, e))?;
            tunnel.on_state_changed(state);
        }

        self.store
            .rename(old_name, name)
            .await
            .map_err(|e| TunnelError::store(old_name, e))?;
        tunnel.on_name_changed(name);
        log::info!("Renamed tunnel {} to {}", old_name, name);

        if original_state == TunnelState::Up {
            let state = self
                .backend
                .set_state(tunnel, TunnelState::Up)
                .await
                .map_err(|e| TunnelError::backend(name, e))?;
            tunnel.on_state_changed(state);
        }
        Ok(name.to_string())
    }

    /// Apply a new configuration through the backend, then store it
    pub async fn set_tunnel_config(
        &self,
        tunnel: &Arc<Tunnel>,
        config: Config,
    ) -> Result<Config, TunnelError> {
        let _guard = tunnel.lock().await;
        let name = tunnel.name();
        // The backend rolls back to the cached config on failure
        self.ensure_config(tunnel).await?;

        let applied = self
            .backend
            .apply_config(tunnel, &config)
            .await
            .map_err(|e| TunnelError::backend(&name, e))?;
        let saved = self
            .store
            .save(&name, &applied)
            .await
            .map_err(|e| TunnelError::store(&name, e))?;
        log::info!("Updated configuration of {}", name);
        Ok(tunnel.on_config_changed(saved))
    }

    /// Bring a tunnel up, down or toggle it
    ///
    /// Requesting the cached state is answered without asking the backend.
    /// Otherwise the cached state always ends up as what the backend reports
    /// afterwards, even on failure, and the running set is saved.
    pub async fn set_tunnel_state(
        &self,
        tunnel: &Arc<Tunnel>,
        state: TunnelState,
    ) -> Result<TunnelState, TunnelError> {
        if state != TunnelState::Toggle && state == tunnel.state() {
            return Ok(state);
        }

        let _guard = tunnel.lock().await;
        let name = tunnel.name();
        let result = match self.ensure_config(tunnel).await {
            Ok(_) => self
                .backend
                .set_state(tunnel, state)
                .await
                .map_err(|e| TunnelError::backend(&name, e)),
            Err(e) => Err(e),
        };

        match &result {
            Ok(new_state) => {
                tunnel.on_state_changed(*new_state);
            }
            Err(e) => {
                log::warn!("Failed to set {} {}: {}", name, state, e);
                self.requery_state(tunnel).await;
            }
        }
        if matches!(result, Ok(TunnelState::Up)) {
            self.set_last_used(Some(tunnel.clone())).await;
        }
        if let Err(e) = self.save_state().await {
            log::warn!("Failed to save running set: {}", e);
        }
        result
    }

    /// Update the cached state from the backend, keeping the old one if the
    /// backend cannot tell
    async fn requery_state(&self, tunnel: &Tunnel) {
        match self.backend.get_state(tunnel).await {
            Ok(state) => {
                tunnel.on_state_changed(state);
            }
            Err(e) => log::warn!("Failed to query state of {}: {:#}", tunnel.name(), e),
        }
    }

    async fn ensure_config(&self, tunnel: &Tunnel) -> Result<Config, TunnelError> {
        if let Some(config) = tunnel.config() {
            return Ok(config);
        }
        let name = tunnel.name();
        let config = self
            .store
            .load(&name)
            .await
            .map_err(|e| TunnelError::store(&name, e))?;
        Ok(tunnel.on_config_changed(config))
    }

    /// The tunnel's configuration, loaded from the store on first use
    pub async fn tunnel_config(&self, tunnel: &Tunnel) -> Result<Config, TunnelError> {
        self.ensure_config(tunnel).await
    }

    /// Ask the backend for the tunnel's actual state
    pub async fn tunnel_state(&self, tunnel: &Tunnel) -> Result<TunnelState, TunnelError> {
        let state = self
            .backend
            .get_state(tunnel)
            .await
            .map_err(|e| TunnelError::backend(&tunnel.name(), e))?;
        Ok(tunnel.on_state_changed(state))
    }

    /// Traffic counters, refreshed when the cached ones are stale
    pub async fn tunnel_statistics(&self, tunnel: &Tunnel) -> Statistics {
        if let Some(statistics) = tunnel.statistics() {
            if !statistics.is_stale() {
                return statistics;
            }
        }
        let statistics = self.backend.get_statistics(tunnel).await;
        tunnel.on_statistics_changed(Some(statistics.clone()));
        statistics
    }

    /// Re-sync the catalog with the store and every cached state with the
    /// backend
    ///
    /// Tunnels created or deleted by another process are added or removed
    /// here. If the store cannot be listed only states are refreshed.
    pub async fn refresh_tunnel_states(&self) {
        let _structure = self.structure.lock().await;
        let (present, running) = tokio::join!(self.store.enumerate(), self.backend.enumerate());

        let mut added = Vec::new();
        let mut removed = Vec::new();
        match present {
            Ok(present) => {
                let mut catalog = self.catalog.lock();
                for name in catalog.names() {
                    if !present.contains(&name) {
                        removed.extend(catalog.remove(&name));
                    }
                }
                for name in &present {
                    if catalog.contains(name) || validate_name(name).is_err() {
                        continue;
                    }
                    let tunnel = Arc::new(Tunnel::new(
                        name.clone(),
                        None,
                        TunnelState::of(running.contains(name)),
                        self.events.clone(),
                    ));
                    if catalog.insert(tunnel) {
                        added.push(name.clone());
                    }
                }
            }
            Err(e) => log::warn!("Failed to enumerate stored tunnels: {:#}", e),
        }

        for tunnel in removed {
            let name = tunnel.name();
            log::info!("Tunnel {} is no longer stored, dropping it", name);
            if self.is_last_used(&tunnel) {
                self.set_last_used(None).await;
            }
            self.publish(TunnelEvent::Removed(name));
        }
        for name in added {
            log::info!("Found new stored tunnel {}", name);
            self.publish(TunnelEvent::Added(name));
        }

        let tunnels = self.catalog.lock().to_vec();
        for tunnel in tunnels {
            tunnel.on_state_changed(TunnelState::of(running.contains(&tunnel.name())));
        }
    }

    /// Bring the saved running set back up
    ///
    /// Unless forced, nothing happens when restore-on-boot is disabled.
    /// Before the catalog has loaded the request is queued; all queued
    /// requests share one restore run. Once this returns the running set is
    /// saved again on every change.
    pub async fn restore_state(&self, force: bool) -> Result<(), TunnelError> {
        let result = self.restore_state_internal(force).await;
        self.settle();
        result
    }

    async fn restore_state_internal(&self, force: bool) -> Result<(), TunnelError> {
        let preferences = self
            .preferences
            .load()
            .await
            .map_err(TunnelError::Preferences)?;
        if !force && !preferences.restore_on_boot {
            log::debug!("Restore on boot disabled");
            return Ok(());
        }

        let queued = {
            let mut queue = self.restore_queue.lock();
            if queue.loaded {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                queue.waiters.push(tx);
                Some(rx)
            }
        };
        if let Some(rx) = queued {
            log::debug!("Tunnels not loaded yet, queueing restore");
            return match rx.await {
                Ok(outcome) => outcome.map_err(TunnelError::Restore),
                Err(_) => {
                    log::warn!("Queued restore was dropped");
                    Ok(())
                }
            };
        }

        self.restore_running_set(&preferences.enabled_configs)
            .await
            .map_err(TunnelError::Restore)
    }

    async fn restore_running_set(&self, names: &BTreeSet<String>) -> RestoreOutcome {
        let tunnels: Vec<Arc<Tunnel>> = {
            let catalog = self.catalog.lock();
            names
                .iter()
                .filter_map(|name| {
                    let tunnel = catalog.get(name);
                    if tunnel.is_none() {
                        log::debug!("Not restoring unknown tunnel {}", name);
                    }
                    tunnel
                })
                .collect()
        };
        if tunnels.is_empty() {
            return Ok(());
        }
        log::info!("Restoring {} tunnel(s)", tunnels.len());

        let results = join_all(
            tunnels
                .iter()
                .map(|tunnel| self.set_tunnel_state(tunnel, TunnelState::Up)),
        )
        .await;

        let failed: Vec<String> = tunnels
            .iter()
            .zip(results)
            .filter_map(|(tunnel, result)| match result {
                Ok(_) => None,
                Err(e) => {
                    log::warn!("Failed to restore {}: {}", tunnel.name(), e);
                    Some(tunnel.name())
                }
            })
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(failed)
        }
    }

    /// Persist the names of every tunnel that is currently up
    ///
    /// Does nothing until the catalog has loaded and the initial restore is
    /// over, so an early shutdown keeps the previous running set.
    pub async fn save_state(&self) -> Result<(), TunnelError> {
        if !self.settled.load(Ordering::Acquire) {
            log::debug!("Initial restore not finished, keeping the saved running set");
            return Ok(());
        }
        let running: BTreeSet<String> = self
            .catalog
            .lock()
            .to_vec()
            .iter()
            .filter(|tunnel| tunnel.state() == TunnelState::Up)
            .map(|tunnel| tunnel.name())
            .collect();

        log::debug!("Saving running set {:?}", running);
        self.preferences
            .update(&mut |p: &mut Preferences| p.enabled_configs = running.clone())
            .await
            .map_err(TunnelError::Preferences)?;
        Ok(())
    }

    pub async fn set_restore_on_boot(&self, enabled: bool) -> Result<(), TunnelError> {
        self.preferences
            .update(&mut |p: &mut Preferences| p.restore_on_boot = enabled)
            .await
            .map_err(TunnelError::Preferences)?;
        log::info!("Restore on boot {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }
}
