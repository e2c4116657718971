// Tunnel activation backends

//! Backends apply tunnel configurations to the system
//!
//! Two implementations share the [`Backend`] trait:
//!
//! - [`WgQuickBackend`]: the kernel module driven through `wg-quick` and `wg`.
//!   Any number of tunnels may be up at once.
//! - [`UserspaceBackend`]: a userspace WireGuard process per tunnel,
//!   configured over its control socket. One tunnel at a time.
//!
//! Backend calls may take seconds (processes, sockets, DNS). The tunnel
//! manager is responsible for loading configurations and for serialising
//! calls per tunnel.

mod userspace;
mod wg_quick;

pub use userspace::UserspaceBackend;
pub use wg_quick::WgQuickBackend;

use crate::notifier::create_notifier;
use crate::statistics::Statistics;
use crate::tunnel::Tunnel;
use crate::types::{BackendKind, Settings, TunnelState};
use crate::wg_config::Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::process::Command;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Apply `config` to a tunnel
    ///
    /// A running tunnel is restarted with the new configuration. If that
    /// fails it is brought back up with its previous configuration and the
    /// original error is returned. A stopped tunnel is left alone and the
    /// configuration is returned unchanged.
    async fn apply_config(&self, tunnel: &Tunnel, config: &Config) -> Result<Config>;

    /// Names of the interfaces this backend currently has up
    async fn enumerate(&self) -> BTreeSet<String>;

    /// Actual state of the tunnel, ignoring anything cached on it
    async fn get_state(&self, tunnel: &Tunnel) -> Result<TunnelState>;

    /// Traffic counters; empty if the tunnel is down or cannot be inspected
    async fn get_statistics(&self, tunnel: &Tunnel) -> Statistics;

    /// Move the tunnel to `state` and return the state afterwards
    ///
    /// `Toggle` flips the current state. Requesting the current state is a
    /// no-op.
    async fn set_state(&self, tunnel: &Tunnel, state: TunnelState) -> Result<TunnelState>;

    /// Version of the underlying WireGuard implementation
    async fn version(&self) -> Result<String>;

    /// Human readable backend name
    fn type_pretty_name(&self) -> &'static str;
}

/// The raw interface up/down step of a backend, with an explicit
/// configuration
#[async_trait]
pub(crate) trait InterfaceControl: Send + Sync {
    async fn set_interface_state(
        &self,
        name: &str,
        config: Option<&Config>,
        state: TunnelState,
    ) -> Result<()>;
}

/// Restart a running tunnel with `config`
///
/// If the new configuration cannot be brought up, the tunnel is started
/// again with the one cached on it and the first error is returned.
pub(crate) async fn restart_with_config<C>(
    control: &C,
    tunnel: &Tunnel,
    running: bool,
    config: &Config,
) -> Result<Config>
where
    C: InterfaceControl + ?Sized,
{
    if !running {
        return Ok(config.clone());
    }

    let name = tunnel.name();
    let previous = tunnel.config();
    control
        .set_interface_state(&name, previous.as_ref(), TunnelState::Down)
        .await?;
    if let Err(e) = control
        .set_interface_state(&name, Some(config), TunnelState::Up)
        .await
    {
        log::warn!("New configuration for {} failed, restoring the old one", name);
        if let Err(rollback) = control
            .set_interface_state(&name, previous.as_ref(), TunnelState::Up)
            .await
        {
            log::error!("Failed to restore {}: {:#}", name, rollback);
        }
        return Err(e);
    }
    Ok(config.clone())
}

/// Build the backend selected in the settings
pub async fn create_backend(settings: &Settings) -> Box<dyn Backend> {
    match settings.general.backend {
        BackendKind::WgQuick => {
            let notifier = create_notifier(settings.wg_quick.notifications).await;
            Box::new(WgQuickBackend::new(&settings.wg_quick, notifier))
        }
        BackendKind::Userspace => Box::new(UserspaceBackend::new(&settings.userspace)),
    }
}

/// Run a command and return its stdout, failing with
/// [`BackendError::CommandFailed`](crate::error::BackendError::CommandFailed)
/// on a non-zero exit
pub(crate) async fn run_command(program: &str, args: &[&str]) -> Result<String> {
    let display = format!("{} {}", program, args.join(" "));
    log::debug!("Running {}", display);

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", display))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(crate::error::BackendError::CommandFailed {
            command: display,
            stderr,
        }
        .into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Locate an executable in a `PATH`-style search list
pub(crate) fn find_in_path(tool: &str, search_path: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    if tool.contains('/') {
        let path = Path::new(tool);
        return path.is_file().then(|| path.to_path_buf());
    }
    std::env::split_paths(search_path?)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

/// Convert a key reported by wireguard-control
pub(crate) fn key_from_control(key: &wireguard_control::Key) -> Option<crate::keys::Key> {
    crate::keys::Key::from_base64(&key.to_base64()).ok()
}
