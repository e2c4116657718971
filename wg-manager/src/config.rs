// Settings file parser

//! Settings file parsing and validation
//!
//! This module handles loading the daemon's TOML settings file and
//! validating its contents. Tunnel configurations are a separate format,
//! see [`crate::wg_config`].

use crate::types::{BackendKind, Settings};
use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Settings file used when none is given on the command line
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/wg-manager/config.toml";

/// Load settings from a TOML file
///
/// If `path` is `None` the default location is tried and a missing file
/// there yields the built-in defaults. An explicitly named file must exist.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let (path, explicit) = match path {
        Some(path) => (path, true),
        None => (Path::new(DEFAULT_SETTINGS_PATH), false),
    };

    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound && !explicit => {
            log::debug!("No settings file at {}, using defaults", path.display());
            String::new()
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read settings file {}", path.display()))
        }
    };

    let settings: Settings = toml::from_str(&contents).context("Failed to parse settings file")?;

    validate_settings(&settings)?;
    Ok(settings)
}

/// Validate settings values
fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.general.config_dir.as_os_str().is_empty() {
        anyhow::bail!("general.config_dir cannot be empty");
    }

    if settings.general.state_file.as_os_str().is_empty() {
        anyhow::bail!("general.state_file cannot be empty");
    }

    if settings.general.log_level.parse::<log::LevelFilter>().is_err() {
        anyhow::bail!("Invalid general.log_level: {}", settings.general.log_level);
    }

    if settings.wg_quick.tmp_dir.as_os_str().is_empty() {
        anyhow::bail!("wg_quick.tmp_dir cannot be empty");
    }

    let userspace = &settings.userspace;
    if settings.general.backend == BackendKind::Userspace && userspace.binary.is_empty() {
        anyhow::bail!("userspace.binary cannot be empty");
    }

    if userspace.socket_dir.as_os_str().is_empty() {
        anyhow::bail!("userspace.socket_dir cannot be empty");
    }

    if userspace.fwmark == 0 {
        anyhow::bail!("userspace.fwmark must be > 0");
    }

    if userspace.table == 0 {
        anyhow::bail!("userspace.table must be > 0");
    }

    // 576 is the smallest MTU every IPv4 host must accept
    if userspace.default_mtu < 576 {
        anyhow::bail!(
            "userspace.default_mtu must be between 576 and 65535, got {}",
            userspace.default_mtu
        );
    }

    Ok(())
}
