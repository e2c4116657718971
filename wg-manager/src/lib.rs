// WireGuard tunnel manager library
// Shared modules for the CLI, the daemon and tests

//! WireGuard tunnel management
//!
//! This library keeps a catalog of named WireGuard tunnels, stores their
//! wg-quick configurations, and brings them up and down through either the
//! kernel module or a userspace implementation.
//!
//! # Main Components
//!
//! - [`wg_config`]: wg-quick configuration model, parser and serializers
//! - [`keys`]: Curve25519 keys in base64, hex and binary form
//! - [`backend`]: the [`Backend`](backend::Backend) trait and its wg-quick and
//!   userspace implementations
//! - [`config_store`]: durable per-tunnel configuration storage
//! - [`manager`]: [`TunnelManager`](manager::TunnelManager), the orchestrator
//! - [`preferences`]: restart-safe running set and last used tunnel
//! - [`boot`]: deferred restore after boot
//! - [`config`]: daemon settings file

pub mod backend;
pub mod boot;
pub mod catalog;
pub mod config;
pub mod config_store;
pub mod error;
pub mod import_export;
pub mod keys;
pub mod manager;
pub mod notifier;
pub mod preferences;
pub mod route_manager;
pub mod statistics;
pub mod tunnel;
pub mod types;
pub mod wg_config;

#[cfg(test)]
mod testing;
