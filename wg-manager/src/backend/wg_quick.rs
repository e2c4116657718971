// Kernel module backend via wg-quick

//! Tunnels run by the WireGuard kernel module
//!
//! Each transition writes the tunnel's configuration to a private scratch
//! file and hands it to `wg-quick`. Running interfaces are listed with
//! `wg show interfaces`; traffic counters come from the kernel over netlink.

use super::{
    find_in_path, key_from_control, restart_with_config, run_command, Backend, InterfaceControl,
};
use crate::error::BackendError;
use crate::notifier::Notifier;
use crate::statistics::Statistics;
use crate::tunnel::Tunnel;
use crate::types::{TunnelState, WgQuickSettings};
use crate::wg_config::Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use wireguard_control::{Backend as ControlBackend, Device, InterfaceName};

const MODULE_DIR: &str = "/sys/module/wireguard";
const REQUIRED_TOOLS: [&str; 2] = ["wg", "wg-quick"];

/// Parse `wg show interfaces` output (names separated by whitespace)
pub fn parse_interface_list(output: &str) -> BTreeSet<String> {
    output.split_whitespace().map(str::to_string).collect()
}

pub struct WgQuickBackend {
    tmp_dir: PathBuf,
    module_dir: PathBuf,
    notifier: Box<dyn Notifier>,
}

impl WgQuickBackend {
    pub fn new(settings: &WgQuickSettings, notifier: Box<dyn Notifier>) -> Self {
        Self {
            tmp_dir: settings.tmp_dir.clone(),
            module_dir: PathBuf::from(MODULE_DIR),
            notifier,
        }
    }

    fn check_module(&self) -> Result<()> {
        if self.module_dir.is_dir() {
            Ok(())
        } else {
            Err(BackendError::ModuleNotLoaded.into())
        }
    }

    fn check_tools() -> Result<()> {
        let search_path = std::env::var_os("PATH");
        for tool in REQUIRED_TOOLS {
            if find_in_path(tool, search_path.as_deref()).is_none() {
                return Err(BackendError::ToolMissing(tool.to_string()).into());
            }
        }
        Ok(())
    }

    /// Write `config` to `<tmp_dir>/<name>.conf`, readable only by us
    async fn write_temp_config(&self, name: &str, config: &Config) -> Result<PathBuf> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.tmp_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.tmp_dir.display()))?;

        let path = self.tmp_dir.join(format!("{}.conf", name));
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        file.write_all(config.to_wg_quick_string().as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        file.flush().await?;
        Ok(path)
    }

    async fn set_state_internal(
        &self,
        name: &str,
        config: Option<&Config>,
        state: TunnelState,
    ) -> Result<()> {
        log::info!("Bringing tunnel {} {}", name, state);

        if state == TunnelState::Up {
            self.check_module()?;
        }
        Self::check_tools()?;
        let config = config.ok_or_else(|| BackendError::MissingConfig(name.to_string()))?;

        let path = self.write_temp_config(name, config).await?;
        let verb = if state == TunnelState::Up { "up" } else { "down" };
        let result = run_wg_quick(verb, &path).await;
        if let Err(e) = fs::remove_file(&path).await {
            log::warn!("Failed to remove {}: {}", path.display(), e);
        }
        result?;

        if state == TunnelState::Up {
            self.notifier.tunnel_up(name).await;
        } else {
            self.notifier.tunnel_down(name).await;
        }
        log::info!("Tunnel {} is {}", name, state);
        Ok(())
    }
}

async fn run_wg_quick(verb: &str, path: &Path) -> Result<()> {
    let path = path
        .to_str()
        .with_context(|| format!("Non UTF-8 path {}", path.display()))?;
    let output = run_command("wg-quick", &[verb, path]).await?;
    if !output.trim().is_empty() {
        log::debug!("wg-quick {}: {}", verb, output.trim());
    }
    Ok(())
}

#[async_trait]
impl InterfaceControl for WgQuickBackend {
    async fn set_interface_state(
        &self,
        name: &str,
        config: Option<&Config>,
        state: TunnelState,
    ) -> Result<()> {
        self.set_state_internal(name, config, state).await
    }
}

#[async_trait]
impl Backend for WgQuickBackend {
    async fn apply_config(&self, tunnel: &Tunnel, config: &Config) -> Result<Config> {
        let running = self.get_state(tunnel).await? == TunnelState::Up;
        restart_with_config(self, tunnel, running, config).await
    }

    async fn enumerate(&self) -> BTreeSet<String> {
        match run_command("wg", &["show", "interfaces"]).await {
            Ok(output) => parse_interface_list(&output),
            Err(e) => {
                log::debug!("Unable to enumerate running tunnels: {:#}", e);
                BTreeSet::new()
            }
        }
    }

    async fn get_state(&self, tunnel: &Tunnel) -> Result<TunnelState> {
        Ok(TunnelState::of(self.enumerate().await.contains(&tunnel.name())))
    }

    async fn get_statistics(&self, tunnel: &Tunnel) -> Statistics {
        let name = tunnel.name();
        let iface: InterfaceName = match name.parse() {
            Ok(iface) => iface,
            Err(_) => return Statistics::new(),
        };

        // Netlink calls are blocking
        let result = tokio::task::spawn_blocking(move || {
            Device::get(&iface, ControlBackend::Kernel).context("Failed to get WireGuard device info")
        })
        .await;

        let mut stats = Statistics::new();
        match result {
            Ok(Ok(device)) => {
                for peer in device.peers {
                    if let Some(key) = key_from_control(&peer.config.public_key) {
                        stats.add(key, peer.stats.rx_bytes, peer.stats.tx_bytes);
                    }
                }
            }
            Ok(Err(e)) => log::debug!("No statistics for {}: {:#}", name, e),
            Err(e) => log::warn!("Netlink task failed: {}", e),
        }
        stats
    }

    async fn set_state(&self, tunnel: &Tunnel, state: TunnelState) -> Result<TunnelState> {
        let name = tunnel.name();
        let original = self.get_state(tunnel).await?;
        let target = state.resolve(original);
        if target == original {
            log::debug!("Tunnel {} already {}", name, original);
            return Ok(original);
        }

        self.set_state_internal(&name, tunnel.config().as_ref(), target)
            .await?;
        self.get_state(tunnel).await
    }

    async fn version(&self) -> Result<String> {
        if let Ok(version) = fs::read_to_string(self.module_dir.join("version")).await {
            return Ok(version.trim().to_string());
        }
        let output = run_command("wg", &["--version"]).await?;
        Ok(output.trim().to_string())
    }

    fn type_pretty_name(&self) -> &'static str {
        "Kernel module"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::LogNotifier;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    fn backend(tmp: &Path) -> WgQuickBackend {
        let settings = WgQuickSettings {
            tmp_dir: tmp.to_path_buf(),
            notifications: false,
        };
        WgQuickBackend::new(&settings, Box::new(LogNotifier))
    }

    #[test]
    fn test_parse_interface_list() {
        let names = parse_interface_list("wg0 home\twork\n");
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["home", "wg0", "work"]);
        assert!(parse_interface_list("").is_empty());
        assert!(parse_interface_list("\n").is_empty());
    }

    #[tokio::test]
    async fn test_temp_config_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let backend = backend(&dir.path().join("scratch"));
        let path = backend
            .write_temp_config("wg0", &Config::default())
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("scratch/wg0.conf"));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[Interface]\n");
    }

    #[test]
    fn test_missing_module_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend(dir.path());
        backend.module_dir = dir.path().join("no-such-module");

        let err = backend.check_module().unwrap_err();
        assert_eq!(
            err.downcast_ref::<BackendError>(),
            Some(&BackendError::ModuleNotLoaded)
        );
    }

    #[tokio::test]
    async fn test_statistics_for_absent_tunnel_are_empty() {
        let dir = TempDir::new().unwrap();
        let backend = backend(dir.path());
        let (tx, _) = broadcast::channel(4);
        let tunnel = Tunnel::new("wgm-absent0".to_string(), None, TunnelState::Down, tx);

        assert!(backend.get_statistics(&tunnel).await.is_empty());
    }

    #[test]
    fn test_pretty_name() {
        let dir = TempDir::new().unwrap();
        assert_eq!(backend(dir.path()).type_pretty_name(), "Kernel module");
    }
}
