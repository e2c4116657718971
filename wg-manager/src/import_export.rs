// Import and export of tunnels as .conf files and .zip archives

use crate::config_store::CONFIGURATION_FILE_SUFFIX;
use crate::manager::TunnelManager;
use crate::tunnel::{validate_name, Tunnel};
use crate::wg_config::Config;
use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const ZIP_FILE_SUFFIX: &str = ".zip";

/// Outcome of importing a file that may hold several tunnels
#[derive(Default)]
pub struct ImportReport {
    pub imported: Vec<Arc<Tunnel>>,
    /// Tunnel name and the reason it was not imported
    pub failures: Vec<(String, anyhow::Error)>,
}

/// Tunnel name for an imported file: its name without `.conf`
pub fn tunnel_name_for(path: &Path) -> Result<String> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;
    let Some(name) = file_name.strip_suffix(CONFIGURATION_FILE_SUFFIX) else {
        bail!("{} is not a {} file", path.display(), CONFIGURATION_FILE_SUFFIX);
    };
    validate_name(name)?;
    Ok(name.to_string())
}

/// Tunnel name for a zip entry: the last path component without `.conf`,
/// matched case-insensitively. Directories and other files yield nothing.
fn tunnel_name_for_entry(entry: &str) -> Option<String> {
    let base = entry.rsplit('/').next()?;
    let stem_len = base.len().checked_sub(CONFIGURATION_FILE_SUFFIX.len())?;
    let suffix = base.get(stem_len..)?;
    if !suffix.eq_ignore_ascii_case(CONFIGURATION_FILE_SUFFIX) {
        return None;
    }
    Some(base[..stem_len].to_string())
}

/// Import a `.conf` file, or every `.conf` entry of a `.zip` archive
pub async fn import_file(manager: &TunnelManager, path: &Path) -> Result<ImportReport> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if file_name.ends_with(ZIP_FILE_SUFFIX) {
        return import_zip(manager, path).await;
    }
    if !file_name.ends_with(CONFIGURATION_FILE_SUFFIX) {
        bail!("File must be .conf or .zip");
    }
    let tunnel = import_config(manager, path).await?;
    Ok(ImportReport {
        imported: vec![tunnel],
        failures: Vec::new(),
    })
}

/// Create a tunnel from a wg-quick file
///
/// A parse failure keeps its [`BadConfigError`](crate::wg_config::BadConfigError)
/// reachable through `downcast_ref`.
pub async fn import_config(manager: &TunnelManager, path: &Path) -> Result<Arc<Tunnel>> {
    let name = tunnel_name_for(path)?;
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = Config::parse(&text)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    let tunnel = manager.create(&name, config).await?;
    log::info!("Imported {} from {}", name, path.display());
    Ok(tunnel)
}

/// Create one tunnel per `.conf` entry of a zip archive
///
/// An entry that cannot be read, parsed or created is reported and the rest
/// are still imported.
pub async fn import_zip(manager: &TunnelManager, path: &Path) -> Result<ImportReport> {
    let archive = path.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || read_zip_entries(&archive))
        .await
        .context("Zip reader panicked")??;
    if entries.is_empty() {
        bail!("{} contains no {} entries", path.display(), CONFIGURATION_FILE_SUFFIX);
    }

    let mut report = ImportReport::default();
    for (name, contents) in entries {
        let config = contents.and_then(|text| {
            Config::parse(&text).with_context(|| format!("Invalid configuration for {}", name))
        });
        let created = match config {
            Ok(config) => manager.create(&name, config).await.map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };
        match created {
            Ok(tunnel) => report.imported.push(tunnel),
            Err(e) => {
                log::warn!("Skipping {} from {}: {:#}", name, path.display(), e);
                report.failures.push((name, e));
            }
        }
    }

    log::info!(
        "Imported {} tunnel(s) from {}, {} failed",
        report.imported.len(),
        path.display(),
        report.failures.len()
    );
    Ok(report)
}

/// Tunnel names and entry contents of every `.conf` entry, in archive order
fn read_zip_entries(path: &Path) -> Result<Vec<(String, Result<String>)>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("{} is not a zip archive", path.display()))?;

    let mut entries = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("Failed to read entry {} of {}", index, path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let entry_name = entry.name().to_string();
        let Some(name) = tunnel_name_for_entry(&entry_name) else {
            log::debug!("Ignoring zip entry {}", entry_name);
            continue;
        };
        let mut text = String::new();
        let contents = entry
            .read_to_string(&mut text)
            .map(|_| text)
            .with_context(|| format!("Failed to read {}", entry_name));
        entries.push((name, contents));
    }
    Ok(entries)
}

/// Every tunnel with its configuration, loaded up front so a bad config
/// leaves nothing half-written
async fn load_all_configs(manager: &TunnelManager) -> Result<Vec<(String, Config)>> {
    let tunnels = manager.tunnels().await;
    if tunnels.is_empty() {
        bail!("No tunnels exist");
    }
    let mut configs = Vec::with_capacity(tunnels.len());
    for tunnel in &tunnels {
        configs.push((tunnel.name(), manager.tunnel_config(tunnel).await?));
    }
    Ok(configs)
}

/// Write every tunnel as `<dir>/<name>.conf`, returning the files written
pub async fn export_configs(manager: &TunnelManager, dir: &Path) -> Result<Vec<PathBuf>> {
    let configs = load_all_configs(manager).await?;

    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Cannot create output directory {}", dir.display()))?;

    let mut written = Vec::with_capacity(configs.len());
    for (name, config) in configs {
        let path = dir.join(format!("{}{}", name, CONFIGURATION_FILE_SUFFIX));
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
        written.push(path);
    }

    log::info!("Exported {} tunnel(s) to {}", written.len(), dir.display());
    Ok(written)
}

/// Write every tunnel as a `<name>.conf` entry of one zip archive
///
/// A partially written archive is removed.
pub async fn export_zip(manager: &TunnelManager, path: &Path) -> Result<PathBuf> {
    let configs = load_all_configs(manager).await?;
    let count = configs.len();

    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Cannot create output directory {}", dir.display()))?;
    }

    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_zip(&target, &configs))
        .await
        .context("Zip writer panicked")??;

    log::info!("Exported {} tunnel(s) to {}", count, path.display());
    Ok(path.to_path_buf())
}

fn write_zip(path: &Path, configs: &[(String, Config)]) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    if let Err(e) = write_zip_entries(file, configs) {
        if let Err(remove) = std::fs::remove_file(path) {
            log::warn!("Failed to remove {}: {}", path.display(), remove);
        }
        return Err(e).with_context(|| format!("Failed to write {}", path.display()));
    }
    Ok(())
}

fn write_zip_entries(file: std::fs::File, configs: &[(String, Config)]) -> Result<()> {
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o600);
    for (name, config) in configs {
        zip.start_file(format!("{}{}", name, CONFIGURATION_FILE_SUFFIX), options)?;
        zip.write_all(config.to_wg_quick_string().as_bytes())?;
    }
    zip.finish()?.sync_all()?;
    Ok(())
}
