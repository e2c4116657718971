// Named tunnel handle

//! A named tunnel and its cached configuration, state and statistics
//!
//! [`Tunnel`] values are created and mutated only by the
//! [`TunnelManager`](crate::manager::TunnelManager). Reads are cheap and
//! never touch the backend or the config store; every change is published as
//! a [`TunnelEvent`].

use crate::error::TunnelError;
use crate::statistics::Statistics;
use crate::types::{TunnelEvent, TunnelState};
use crate::wg_config::Config;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::fmt;
use tokio::sync::{broadcast, Mutex, MutexGuard};

/// Longest name a Linux network interface can have
pub const NAME_MAX_LENGTH: usize = 15;

/// Check that a tunnel name is usable as an interface and file name
///
/// Only `[a-zA-Z0-9_=+.-]` is allowed, 1 to 15 characters long, which also
/// keeps names safe to pass to shell tools.
pub fn validate_name(name: &str) -> Result<(), TunnelError> {
    let valid = !name.is_empty()
        && name.len() <= NAME_MAX_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-'));

    if valid {
        Ok(())
    } else {
        Err(TunnelError::InvalidName(name.to_string()))
    }
}

/// Catalog ordering: case-insensitive first, exact spelling breaks ties
pub fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_ascii_lowercase()
        .cmp(&b.to_ascii_lowercase())
        .then_with(|| a.cmp(b))
}

pub struct Tunnel {
    name: RwLock<String>,
    config: RwLock<Option<Config>>,
    state: RwLock<TunnelState>,
    statistics: RwLock<Option<Statistics>>,
    events: broadcast::Sender<TunnelEvent>,
    op_lock: Mutex<()>,
}

impl Tunnel {
    pub(crate) fn new(
        name: String,
        config: Option<Config>,
        state: TunnelState,
        events: broadcast::Sender<TunnelEvent>,
    ) -> Self {
        Self {
            name: RwLock::new(name),
            config: RwLock::new(config),
            state: RwLock::new(state),
            statistics: RwLock::new(None),
            events,
            op_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Cached configuration, `None` until it has been loaded
    pub fn config(&self) -> Option<Config> {
        self.config.read().clone()
    }

    /// Last state observed through the backend
    pub fn state(&self) -> TunnelState {
        *self.state.read()
    }

    pub fn statistics(&self) -> Option<Statistics> {
        self.statistics.read().clone()
    }

    /// Serialise state-changing operations on this tunnel
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    pub(crate) fn on_name_changed(&self, name: &str) {
        let from = std::mem::replace(&mut *self.name.write(), name.to_string());
        self.publish(TunnelEvent::Renamed {
            from,
            to: name.to_string(),
        });
    }

    pub(crate) fn on_config_changed(&self, config: Config) -> Config {
        *self.config.write() = Some(config.clone());
        self.publish(TunnelEvent::ConfigChanged(self.name()));
        config
    }

    pub(crate) fn on_state_changed(&self, state: TunnelState) -> TunnelState {
        if state != TunnelState::Up {
            self.on_statistics_changed(None);
        }
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            self.publish(TunnelEvent::StateChanged {
                name: self.name(),
                state,
            });
        }
        state
    }

    pub(crate) fn on_statistics_changed(&self, statistics: Option<Statistics>) {
        let changed = statistics.is_some() || self.statistics.read().is_some();
        *self.statistics.write() = statistics;
        if changed {
            self.publish(TunnelEvent::StatisticsChanged(self.name()));
        }
    }

    fn publish(&self, event: TunnelEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("config_loaded", &self.config.read().is_some())
            .finish()
    }
}
