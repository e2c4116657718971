// Restore tunnels after boot

//! Boot-time restore of the running set
//!
//! Some firewalls set every chain to DROP while the system boots so nothing
//! leaks before they load their rules. Starting a tunnel in that window
//! fails, so the restore is deferred with exponential backoff until no chain
//! policy is DROP any more.

use crate::backend::run_command;
use crate::manager::TunnelManager;
use anyhow::{bail, Result};
use std::future::Future;
use std::time::Duration;

/// How many times the firewall is checked before giving up
pub const MAX_RESTORE_ATTEMPTS: u8 = 6;

/// Delay before the first re-check; doubled after every attempt
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

const FIREWALL_TOOLS: [&str; 2] = ["iptables", "ip6tables"];

/// Check `iptables -L` output for a chain whose policy is DROP
pub fn chains_are_dropping(listing: &str) -> bool {
    listing
        .lines()
        .filter(|line| line.starts_with("Chain "))
        .any(|line| line.contains("DROP"))
}

/// Whether either firewall currently drops everything by default
///
/// A missing tool or a failed listing counts as not dropping.
pub async fn firewall_is_dropping() -> bool {
    for tool in FIREWALL_TOOLS {
        match run_command(tool, &["-L", "-n"]).await {
            Ok(listing) if chains_are_dropping(&listing) => {
                log::debug!("{} reports a DROP policy", tool);
                return true;
            }
            Ok(_) => {}
            Err(e) => log::debug!("Unable to list {} chains: {:#}", tool, e),
        }
    }
    false
}

/// Restore the running set once the firewall lets packets through
pub async fn restore_after_boot(manager: &TunnelManager) -> Result<()> {
    restore_when_ready(
        manager,
        firewall_is_dropping,
        INITIAL_RETRY_DELAY,
        MAX_RESTORE_ATTEMPTS,
    )
    .await
}

async fn restore_when_ready<F, Fut>(
    manager: &TunnelManager,
    mut is_dropping: F,
    initial_delay: Duration,
    attempts: u8,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let mut delay = initial_delay;

    for attempt in 1..=attempts {
        if !is_dropping().await {
            log::info!("Restoring tunnel state");
            manager.restore_state(false).await?;
            return Ok(());
        }

        if attempt < attempts {
            log::info!(
                "Packets are being dropped, deferring restore (attempt {}/{}, next in {}s)",
                attempt,
                attempts,
                delay.as_secs_f32()
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    log::error!(
        "Firewall still drops packets after {} checks, tunnels were not restored",
        attempts
    );
    bail!("firewall still dropping packets, restore abandoned")
}
