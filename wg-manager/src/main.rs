// WireGuard tunnel manager command line and daemon

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::interval;
use wg_manager::{
    backend::{create_backend, Backend},
    boot,
    config::load_settings,
    config_store::FileConfigStore,
    error::TunnelError,
    import_export,
    keys::{Key, KeyPair},
    manager::TunnelManager,
    preferences::TomlPreferenceStore,
    tunnel::Tunnel,
    types::{BackendKind, TunnelState},
    wg_config::Config,
};

/// Interval for re-syncing cached tunnel states with the backend (seconds)
const REFRESH_INTERVAL_SECS: u64 = 30;

#[derive(Parser)]
#[command(name = "wg-manager")]
#[command(about = "Manage WireGuard tunnels", long_about = None)]
struct Args {
    /// Path to settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List tunnels and their state
    List,
    /// Print a tunnel's configuration
    Show { name: String },
    /// Create a tunnel from a configuration read on stdin
    Add { name: String },
    /// Create tunnels from a <name>.conf file or a .zip of them
    Import { file: PathBuf },
    /// Write every tunnel as <name>.conf into a directory, or into a .zip
    /// archive if the path ends in .zip
    Export { path: PathBuf },
    /// Delete a tunnel
    Remove { name: String },
    /// Rename a tunnel
    Rename { name: String, new_name: String },
    /// Bring a tunnel up
    Up { name: String },
    /// Bring a tunnel down
    Down { name: String },
    /// Flip a tunnel's state
    Toggle { name: String },
    /// Show per-peer traffic counters
    Stats { name: String },
    /// Print a new private key
    Genkey,
    /// Read a private key on stdin and print its public key
    Pubkey,
    /// Remember which tunnels are up
    SaveState,
    /// Bring the remembered tunnels back up
    Restore {
        /// Restore even if restore-on-boot is disabled
        #[arg(long)]
        force: bool,
    },
    /// Enable or disable restoring tunnels at startup
    RestoreOnBoot {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
    /// Print the backend and its version
    Version,
    /// Run until SIGTERM/SIGINT, restoring tunnels at startup
    Daemon {
        /// Wait for a boot-time firewall to open before restoring
        #[arg(long)]
        boot: bool,
    },
}

fn main() -> Result<()> {
    // Build custom Tokio runtime with limited thread pool
    // Most work is waiting on child processes and sockets
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wg-manager")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    // Key helpers need neither settings nor privileges
    match args.command {
        Command::Genkey => {
            println!("{}", KeyPair::generate().private_key().to_base64());
            return Ok(());
        }
        Command::Pubkey => {
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("Failed to read private key")?;
            let key: Key = line.trim().parse().context("Invalid private key")?;
            println!("{}", KeyPair::new(key).public_key().to_base64());
            return Ok(());
        }
        _ => {}
    }

    let settings = load_settings(args.config.as_deref()).context("Failed to load settings")?;

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&settings.general.log_level),
    )
    .init();

    let backend: Arc<dyn Backend> = Arc::from(create_backend(&settings).await);
    let manager = TunnelManager::new(
        backend,
        Arc::new(FileConfigStore::new(settings.general.config_dir.clone())),
        Arc::new(TomlPreferenceStore::new(settings.general.state_file.clone())),
    );
    let kind = settings.general.backend;

    if let Command::Daemon { boot } = args.command {
        return run_daemon(&manager, boot).await;
    }

    manager.load().await;
    run_command(&manager, kind, args.command).await
}

fn find(manager: &TunnelManager, name: &str) -> Result<Arc<Tunnel>> {
    manager
        .tunnel(name)
        .ok_or_else(|| TunnelError::NotFound(name.to_string()).into())
}

async fn run_command(manager: &TunnelManager, kind: BackendKind, command: Command) -> Result<()> {
    match command {
        Command::List => {
            let last_used = manager.last_used_tunnel().map(|t| t.name());
            for tunnel in manager.tunnels().await {
                let name = tunnel.name();
                let marker = if last_used.as_deref() == Some(name.as_str()) {
                    " (last used)"
                } else {
                    ""
                };
                println!("{}\t{}{}", name, tunnel.state(), marker);
            }
        }
        Command::Show { name } => {
            let tunnel = find(manager, &name)?;
            print!("{}", manager.tunnel_config(&tunnel).await?.to_wg_quick_string());
        }
        Command::Add { name } => {
            let config = tokio::task::spawn_blocking(|| Config::from_reader(std::io::stdin().lock()))
                .await
                .context("Failed to read configuration")??;
            manager.create(&name, config).await?;
            println!("Created {}", name);
        }
        Command::Import { file } => {
            let report = import_export::import_file(manager, &file).await?;
            for tunnel in &report.imported {
                println!("Imported {}", tunnel.name());
            }
            for (name, e) in &report.failures {
                eprintln!("{}: {:#}", name, e);
            }
            if !report.failures.is_empty() {
                bail!(
                    "Imported {} of {} tunnel(s)",
                    report.imported.len(),
                    report.imported.len() + report.failures.len()
                );
            }
        }
        Command::Export { path } => {
            let is_zip = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
            if is_zip {
                let archive = import_export::export_zip(manager, &path).await?;
                println!("{}", archive.display());
            } else {
                for file in import_export::export_configs(manager, &path).await? {
                    println!("{}", file.display());
                }
            }
        }
        Command::Remove { name } => {
            let tunnel = find(manager, &name)?;
            manager.delete(&tunnel).await?;
            println!("Removed {}", name);
        }
        Command::Rename { name, new_name } => {
            let tunnel = find(manager, &name)?;
            let renamed = manager.set_tunnel_name(&tunnel, &new_name).await?;
            println!("Renamed {} to {}", name, renamed);
        }
        Command::Up { name } => set_state(manager, kind, &name, TunnelState::Up).await?,
        Command::Down { name } => set_state(manager, kind, &name, TunnelState::Down).await?,
        Command::Toggle { name } => set_state(manager, kind, &name, TunnelState::Toggle).await?,
        Command::Stats { name } => {
            let tunnel = find(manager, &name)?;
            let stats = manager.tunnel_statistics(&tunnel).await;
            for (key, peer) in stats.peers() {
                println!("{}\trx {}\ttx {}", key, peer.rx_bytes, peer.tx_bytes);
            }
            println!("total\trx {}\ttx {}", stats.total_rx(), stats.total_tx());
        }
        Command::SaveState => manager.save_state().await?,
        Command::Restore { force } => {
            manager.restore_state(force).await?;
            hold_userspace_tunnels(manager, kind).await?;
        }
        Command::RestoreOnBoot { enabled } => manager.set_restore_on_boot(enabled).await?,
        Command::Version => {
            let backend = manager.backend();
            println!("{}: {}", backend.type_pretty_name(), backend.version().await?);
        }
        Command::Genkey | Command::Pubkey | Command::Daemon { .. } => {
            unreachable!("handled before loading tunnels")
        }
    }
    Ok(())
}

async fn set_state(
    manager: &TunnelManager,
    kind: BackendKind,
    name: &str,
    state: TunnelState,
) -> Result<()> {
    let tunnel = find(manager, name)?;
    let state = manager.set_tunnel_state(&tunnel, state).await?;
    println!("{} is {}", name, state);
    hold_userspace_tunnels(manager, kind).await
}

/// Userspace tunnels live as long as this process; keep it in the
/// foreground until asked to stop
async fn hold_userspace_tunnels(manager: &TunnelManager, kind: BackendKind) -> Result<()> {
    if kind != BackendKind::Userspace {
        return Ok(());
    }
    let running: Vec<Arc<Tunnel>> = manager
        .tunnels()
        .await
        .into_iter()
        .filter(|t| t.state() == TunnelState::Up)
        .collect();
    if running.is_empty() {
        return Ok(());
    }

    log::info!("Userspace tunnel running, press Ctrl-C to stop");
    wait_for_shutdown().await?;
    manager.save_state().await?;
    for tunnel in running {
        if let Err(e) = manager.set_tunnel_state(&tunnel, TunnelState::Down).await {
            log::error!("Failed to bring down {}: {}", tunnel.name(), e);
        }
    }
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => log::info!("Received SIGTERM"),
        _ = sigint.recv() => log::info!("Received SIGINT"),
    }
    Ok(())
}

async fn run_daemon(manager: &TunnelManager, boot: bool) -> Result<()> {
    log::info!(
        "Starting wg-manager daemon ({} backend)",
        manager.backend().type_pretty_name()
    );

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;
    let mut events = manager.subscribe();

    let startup = async {
        if boot {
            manager.load_deferred().await;
            boot::restore_after_boot(manager).await
        } else {
            manager.on_create().await.map_err(anyhow::Error::from)
        }
    };

    tokio::select! {
        result = startup => {
            if let Err(e) = result {
                log::error!("Failed to restore tunnels: {:#}", e);
            }
        }
        _ = sigterm.recv() => {
            log::info!("Received SIGTERM during startup");
            return shutdown(manager).await;
        }
        _ = sigint.recv() => {
            log::info!("Received SIGINT during startup");
            return shutdown(manager).await;
        }
    }

    let mut refresh_timer = interval(Duration::from_secs(REFRESH_INTERVAL_SECS));
    log::info!("Daemon started successfully");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT");
                break;
            }
            _ = refresh_timer.tick() => {
                manager.refresh_tunnel_states().await;
            }
            event = events.recv() => match event {
                Ok(event) => log::debug!("Tunnel event: {:?}", event),
                Err(RecvError::Lagged(missed)) => log::debug!("Missed {} tunnel events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    }

    shutdown(manager).await
}

/// Remember the running set; tunnels themselves are left as they are
async fn shutdown(manager: &TunnelManager) -> Result<()> {
    log::info!("Shutting down gracefully...");
    manager.save_state().await?;
    log::info!("Shutdown complete");
    Ok(())
}
