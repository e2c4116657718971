// Shared types between the manager, backends and the daemon

//! Shared data structures
//!
//! This module defines the tunnel state type, the events broadcast by the
//! tunnel manager, and the daemon settings structures.

use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// Operational state of a tunnel
///
/// `Toggle` is only ever a request; backends resolve it to `Up` or `Down`
/// and never report it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    Down,
    Up,
    Toggle,
}

impl TunnelState {
    /// `Up` for true, `Down` for false
    pub fn of(running: bool) -> Self {
        if running {
            TunnelState::Up
        } else {
            TunnelState::Down
        }
    }

    /// Resolve a request against the current state
    pub fn resolve(self, current: TunnelState) -> TunnelState {
        match self {
            TunnelState::Toggle => match current {
                TunnelState::Up => TunnelState::Down,
                _ => TunnelState::Up,
            },
            other => other,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TunnelState::Down => "DOWN",
            TunnelState::Up => "UP",
            TunnelState::Toggle => "TOGGLE",
        })
    }
}

/// Change notifications published by the tunnel manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Added(String),
    Removed(String),
    Renamed { from: String, to: String },
    ConfigChanged(String),
    StateChanged { name: String, state: TunnelState },
    StatisticsChanged(String),
    LastUsedChanged(Option<String>),
}

/// Which backend the daemon drives tunnels with
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Kernel module driven through `wg-quick`
    WgQuick,
    /// A userspace WireGuard implementation such as wireguard-go
    Userspace,
}

/// Main settings structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub wg_quick: WgQuickSettings,
    #[serde(default)]
    pub userspace: UserspaceSettings,
}

/// General settings
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralSettings {
    /// Directory holding one `<name>.conf` per tunnel
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Restart-safe preferences (running set, last used tunnel)
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Settings for the kernel module backend
#[derive(Debug, Deserialize, Clone)]
pub struct WgQuickSettings {
    /// Scratch directory for the files handed to wg-quick
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default = "default_true")]
    pub notifications: bool,
}

/// Settings for the userspace backend
#[derive(Debug, Deserialize, Clone)]
pub struct UserspaceSettings {
    #[serde(default = "default_userspace_binary")]
    pub binary: String,
    #[serde(default = "default_userspace_args")]
    pub args: Vec<String>,
    /// Where the implementation creates its `<name>.sock` control sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Firewall mark on the tunnel's own UDP packets
    #[serde(default = "default_fwmark")]
    pub fwmark: u32,
    /// Routing table for allowed-IP routes
    #[serde(default = "default_fwmark")]
    pub table: u32,
    #[serde(default = "default_mtu")]
    pub default_mtu: u16,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            state_file: default_state_file(),
            backend: default_backend(),
            log_level: default_log_level(),
        }
    }
}

impl Default for WgQuickSettings {
    fn default() -> Self {
        Self {
            tmp_dir: default_tmp_dir(),
            notifications: default_true(),
        }
    }
}

impl Default for UserspaceSettings {
    fn default() -> Self {
        Self {
            binary: default_userspace_binary(),
            args: default_userspace_args(),
            socket_dir: default_socket_dir(),
            fwmark: default_fwmark(),
            table: default_fwmark(),
            default_mtu: default_mtu(),
        }
    }
}

// Default values for settings
fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/wg-manager/tunnels")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/wg-manager/state.toml")
}

fn default_backend() -> BackendKind {
    BackendKind::WgQuick
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/run/wg-manager")
}

fn default_true() -> bool {
    true
}

fn default_userspace_binary() -> String {
    "wireguard-go".to_string()
}

fn default_userspace_args() -> Vec<String> {
    vec!["-f".to_string()]
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/var/run/wireguard")
}

fn default_fwmark() -> u32 {
    51820
}

fn default_mtu() -> u16 {
    1280
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_resolves_to_opposite() {
        assert_eq!(TunnelState::Toggle.resolve(TunnelState::Up), TunnelState::Down);
        assert_eq!(TunnelState::Toggle.resolve(TunnelState::Down), TunnelState::Up);
        assert_eq!(TunnelState::Up.resolve(TunnelState::Up), TunnelState::Up);
        assert_eq!(TunnelState::Down.resolve(TunnelState::Up), TunnelState::Down);
    }

    #[test]
    fn test_state_of_and_display() {
        assert_eq!(TunnelState::of(true), TunnelState::Up);
        assert_eq!(TunnelState::of(false), TunnelState::Down);
        assert_eq!(TunnelState::Up.to_string(), "UP");
        assert_eq!(TunnelState::Toggle.to_string(), "TOGGLE");
    }

    #[test]
    fn test_settings_defaults_from_empty_toml() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.general.backend, BackendKind::WgQuick);
        assert_eq!(settings.general.config_dir, PathBuf::from("/etc/wg-manager/tunnels"));
        assert!(settings.wg_quick.notifications);
        assert_eq!(settings.userspace.binary, "wireguard-go");
        assert_eq!(settings.userspace.args, vec!["-f"]);
        assert_eq!(settings.userspace.fwmark, 51820);
        assert_eq!(settings.userspace.table, 51820);
        assert_eq!(settings.userspace.default_mtu, 1280);
    }

    #[test]
    fn test_backend_kind_names() {
        let settings: Settings = toml::from_str("[general]\nbackend = \"userspace\"\n").unwrap();
        assert_eq!(settings.general.backend, BackendKind::Userspace);
        let settings: Settings = toml::from_str("[general]\nbackend = \"wg-quick\"\n").unwrap();
        assert_eq!(settings.general.backend, BackendKind::WgQuick);
        assert!(toml::from_str::<Settings>("[general]\nbackend = \"kernel\"\n").is_err());
    }
}
