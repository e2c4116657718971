// Userspace WireGuard backend

//! Tunnels run by a userspace WireGuard implementation
//!
//! The implementation (wireguard-go by default) is started in the foreground
//! for one interface and configured over its UAPI control socket,
//! `<socket_dir>/<name>.sock`. Only one tunnel runs at a time. Addresses,
//! routes and DNS are set up by a [`RouteManager`]; the process carries a
//! firewall mark so its own packets bypass the tunnel routes.

use super::{restart_with_config, run_command, Backend, InterfaceControl};
use crate::error::BackendError;
use crate::keys::Key;
use crate::route_manager::RouteManager;
use crate::statistics::Statistics;
use crate::tunnel::Tunnel;
use crate::types::{TunnelState, UserspaceSettings};
use crate::wg_config::Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// How long the control socket may take to appear after spawning
const ATTACH_TIMEOUT: Duration = Duration::from_secs(2);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Running {
    name: String,
    child: Child,
    socket: PathBuf,
    routes: RouteManager,
}

pub struct UserspaceBackend {
    binary: String,
    args: Vec<String>,
    socket_dir: PathBuf,
    fwmark: u32,
    table: u32,
    default_mtu: u16,
    attach_timeout: Duration,
    current: Mutex<Option<Running>>,
}

impl UserspaceBackend {
    pub fn new(settings: &UserspaceSettings) -> Self {
        Self {
            binary: settings.binary.clone(),
            args: settings.args.clone(),
            socket_dir: settings.socket_dir.clone(),
            fwmark: settings.fwmark,
            table: settings.table,
            default_mtu: settings.default_mtu,
            attach_timeout: ATTACH_TIMEOUT,
            current: Mutex::new(None),
        }
    }

    fn socket_for(&self, name: &str) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", name))
    }

    /// Name of the running tunnel, if its process is still alive
    async fn running_name(&self) -> Option<String> {
        let mut current = self.current.lock().await;
        let running = current.as_mut()?;
        match running.child.try_wait() {
            Ok(None) => Some(running.name.clone()),
            Ok(Some(status)) => {
                log::warn!("Userspace tunnel {} exited with {}", running.name, status);
                None
            }
            Err(e) => {
                log::warn!("Failed to check userspace tunnel {}: {}", running.name, e);
                None
            }
        }
    }

    async fn set_state_internal(
        &self,
        name: &str,
        config: Option<&Config>,
        state: TunnelState,
    ) -> Result<()> {
        log::info!("Bringing tunnel {} {}", name, state);
        let mut current = self.current.lock().await;

        if state == TunnelState::Down {
            match current.take() {
                Some(running) if running.name == name => self.stop(running).await,
                other => *current = other,
            }
            log::info!("Tunnel {} is DOWN", name);
            return Ok(());
        }

        if let Some(running) = current.as_mut() {
            let alive = matches!(running.child.try_wait(), Ok(None));
            if alive && running.name != name {
                return Err(BackendError::MultipleTunnels {
                    running: running.name.clone(),
                }
                .into());
            }
            if alive {
                return Ok(());
            }
        }
        if let Some(stale) = current.take() {
            self.stop(stale).await;
        }

        let config = config.ok_or_else(|| BackendError::MissingConfig(name.to_string()))?;
        if config.interface.key_pair.is_none() {
            return Err(BackendError::MissingPrivateKey(name.to_string()).into());
        }
        if !config.interface.excluded_applications.is_empty() {
            log::warn!(
                "Tunnel {}: excluded applications are not supported here and are ignored",
                name
            );
        }

        let socket = self.socket_for(name);
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .arg(name)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.binary))?;

        let mut routes = RouteManager::new(name.to_string(), self.table, self.fwmark);
        if let Err(e) = self
            .bring_up(name, config, &socket, &mut child, &mut routes)
            .await
        {
            self.stop(Running {
                name: name.to_string(),
                child,
                socket,
                routes,
            })
            .await;
            return Err(e);
        }

        *current = Some(Running {
            name: name.to_string(),
            child,
            socket,
            routes,
        });
        log::info!("Tunnel {} is UP", name);
        Ok(())
    }

    async fn bring_up(
        &self,
        name: &str,
        config: &Config,
        socket: &Path,
        child: &mut Child,
        routes: &mut RouteManager,
    ) -> Result<()> {
        self.wait_for_socket(name, socket, child).await?;

        // Endpoint names are resolved while serializing
        let payload = {
            let config = config.clone();
            let fwmark = self.fwmark;
            tokio::task::spawn_blocking(move || {
                format!("set=1\nfwmark={}\n{}\n", fwmark, config.to_wg_userspace_string())
            })
            .await
            .context("Serialization task failed")?
        };
        uapi_set(socket, &payload).await?;

        let mtu = config.interface.mtu.unwrap_or(self.default_mtu);
        routes
            .configure_link(mtu, &config.interface.addresses)
            .await?;

        let allowed_ips: Vec<IpNet> = config
            .peers
            .iter()
            .flat_map(|peer| peer.allowed_ips.iter().copied())
            .collect();
        routes.add_routes(&allowed_ips).await?;
        routes.set_dns(&config.interface.dns_servers).await;
        Ok(())
    }

    /// Wait for the control socket, failing fast if the process dies
    async fn wait_for_socket(&self, name: &str, socket: &Path, child: &mut Child) -> Result<()> {
        let poll = self.poll_socket(socket, child);
        match tokio::time::timeout(self.attach_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::TransportTimeout {
                name: name.to_string(),
                waited: self.attach_timeout,
            }
            .into()),
        }
    }

    async fn poll_socket(&self, socket: &Path, child: &mut Child) -> Result<()> {
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(BackendError::CommandFailed {
                    command: self.binary.clone(),
                    stderr: format!("exited with {} before creating its socket", status),
                }
                .into());
            }
            if fs::try_exists(socket).await.unwrap_or(false) {
                return Ok(());
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    async fn stop(&self, mut running: Running) {
        running.routes.teardown().await;
        if let Err(e) = running.child.kill().await {
            log::debug!("Userspace process for {} already gone: {}", running.name, e);
        }
        if let Err(e) = fs::remove_file(&running.socket).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", running.socket.display(), e);
            }
        }
    }
}

/// Send a `set=1` request and check the reply
async fn uapi_set(socket: &Path, payload: &str) -> Result<()> {
    let response = uapi_request(socket, payload).await?;
    check_errno(&response)
}

/// Send a `get=1` request and return the device dump
async fn uapi_get(socket: &Path) -> Result<String> {
    let response = uapi_request(socket, "get=1\n\n").await?;
    check_errno(&response)?;
    Ok(response)
}

async fn uapi_request(socket: &Path, request: &str) -> Result<String> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("Failed to connect to {}", socket.display()))?;
    let (read, mut write) = stream.into_split();
    write
        .write_all(request.as_bytes())
        .await
        .context("Failed to send UAPI request")?;
    read_response(BufReader::new(read)).await
}

/// Read lines up to the blank line ending a UAPI response
async fn read_response<R: AsyncBufRead + Unpin>(reader: R) -> Result<String> {
    let mut lines = reader.lines();
    let mut response = String::new();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            break;
        }
        response.push_str(&line);
        response.push('\n');
    }
    Ok(response)
}

fn check_errno(response: &str) -> Result<()> {
    let errno = response
        .lines()
        .find_map(|line| line.strip_prefix("errno="))
        .context("UAPI response has no errno")?;
    let errno: i32 = errno
        .trim()
        .parse()
        .with_context(|| format!("Bad UAPI errno '{}'", errno))?;
    if errno != 0 {
        return Err(BackendError::Uapi(errno).into());
    }
    Ok(())
}

/// Collect per-peer counters from a `get=1` dump
fn parse_statistics(dump: &str) -> Statistics {
    let mut stats = Statistics::new();
    let mut peer: Option<(Key, u64, u64)> = None;

    for line in dump.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "public_key" => {
                if let Some((key, rx, tx)) = peer.take() {
                    stats.add(key, rx, tx);
                }
                peer = Key::from_hex(value).ok().map(|key| (key, 0, 0));
            }
            "rx_bytes" => {
                if let Some((_, rx, _)) = peer.as_mut() {
                    *rx = value.parse().unwrap_or(0);
                }
            }
            "tx_bytes" => {
                if let Some((_, _, tx)) = peer.as_mut() {
                    *tx = value.parse().unwrap_or(0);
                }
            }
            _ => {}
        }
    }
    if let Some((key, rx, tx)) = peer {
        stats.add(key, rx, tx);
    }
    stats
}

#[async_trait]
impl InterfaceControl for UserspaceBackend {
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
impl Backend for UserspaceBackend {
    async fn apply_config(&self, tunnel: &Tunnel, config: &Config) -> Result<Config> {
        let running = self.get_state(tunnel).await? == TunnelState::Up;
        restart_with_config(self, tunnel, running, config).await
    }

    async fn enumerate(&self) -> BTreeSet<String> {
        self.running_name().await.into_iter().collect()
    }

    async fn get_state(&self, tunnel: &Tunnel) -> Result<TunnelState> {
        let name = tunnel.name();
        Ok(TunnelState::of(
            self.running_name().await.as_deref() == Some(name.as_str()),
        ))
    }

    async fn get_statistics(&self, tunnel: &Tunnel) -> Statistics {
        let name = tunnel.name();
        if self.running_name().await.as_deref() != Some(name.as_str()) {
            return Statistics::new();
        }
        match uapi_get(&self.socket_for(&name)).await {
            Ok(dump) => parse_statistics(&dump),
            Err(e) => {
                log::debug!("No statistics for {}: {:#}", name, e);
                Statistics::new()
            }
        }
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
        let output = run_command(&self.binary, &["--version"]).await?;
        Ok(output.lines().next().unwrap_or_default().trim().to_string())
    }

    fn type_pretty_name(&self) -> &'static str {
        "Userspace"
    }
}
