//! Link, route and DNS setup for userspace tunnels
//!
//! A userspace WireGuard process only creates the interface; everything
//! `wg-quick` would normally do afterwards happens here. Allowed-IP routes
//! go into a dedicated table which is consulted for every packet that does
//! not carry the tunnel's firewall mark, so the encrypted UDP traffic itself
//! never loops back into the tunnel.

use crate::backend::run_command;
use anyhow::Result;
use ipnet::IpNet;
use std::net::IpAddr;

/// Address family flag for `ip`
fn family_flag(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => "-4",
        IpNet::V6(_) => "-6",
    }
}

/// Arguments for the policy rule sending unmarked traffic to `table`
fn fwmark_rule_args(family: &'static str, action: &'static str, fwmark: u32, table: u32) -> Vec<String> {
    vec![
        family.to_string(),
        "rule".to_string(),
        action.to_string(),
        "not".to_string(),
        "fwmark".to_string(),
        fwmark.to_string(),
        "table".to_string(),
        table.to_string(),
    ]
}

/// Arguments for the rule keeping more specific main-table routes reachable
fn suppress_rule_args(family: &'static str, action: &'static str) -> Vec<String> {
    vec![
        family.to_string(),
        "rule".to_string(),
        action.to_string(),
        "table".to_string(),
        "main".to_string(),
        "suppress_prefixlength".to_string(),
        "0".to_string(),
    ]
}

fn route_args(net: &IpNet, interface: &str, table: u32) -> Vec<String> {
    vec![
        family_flag(net).to_string(),
        "route".to_string(),
        "replace".to_string(),
        net.to_string(),
        "dev".to_string(),
        interface.to_string(),
        "table".to_string(),
        table.to_string(),
    ]
}

async fn ip(args: &[String]) -> Result<()> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    run_command("ip", &args).await.map(|_| ())
}

/// Manages the network setup of one userspace tunnel interface
pub struct RouteManager {
    interface: String,
    table: u32,
    fwmark: u32,
    active_routes: Vec<IpNet>,
    /// Installed rules, as the argument lists that added them
    active_rules: Vec<Vec<String>>,
    dns_set: bool,
}

impl RouteManager {
    /// Create a new route manager for the given interface
    pub fn new(interface: String, table: u32, fwmark: u32) -> Self {
        Self {
            interface,
            table,
            fwmark,
            active_routes: Vec::new(),
            active_rules: Vec::new(),
            dns_set: false,
        }
    }

    /// Set the MTU, assign addresses and bring the link up
    pub async fn configure_link(&mut self, mtu: u16, addresses: &[IpNet]) -> Result<()> {
        for address in addresses {
            ip(&[
                family_flag(address).to_string(),
                "address".to_string(),
                "add".to_string(),
                address.to_string(),
                "dev".to_string(),
                self.interface.clone(),
            ])
            .await?;
        }

        ip(&[
            "link".to_string(),
            "set".to_string(),
            "mtu".to_string(),
            mtu.to_string(),
            "up".to_string(),
            "dev".to_string(),
            self.interface.clone(),
        ])
        .await?;

        log::info!(
            "Link {} up with mtu {} and {} address(es)",
            self.interface,
            mtu,
            addresses.len()
        );
        Ok(())
    }

    /// Route `allowed_ips` through the tunnel
    pub async fn add_routes(&mut self, allowed_ips: &[IpNet]) -> Result<()> {
        for net in allowed_ips {
            if self.active_routes.contains(net) {
                continue;
            }
            ip(&route_args(net, &self.interface, self.table)).await?;
            log::info!("Route active: {} dev {} table {}", net, self.interface, self.table);
            self.active_routes.push(*net);
        }

        for family in ["-4", "-6"] {
            let routes: Vec<&IpNet> = self
                .active_routes
                .iter()
                .filter(|net| family_flag(net) == family)
                .collect();
            if routes.is_empty() {
                continue;
            }

            let rule = fwmark_rule_args(family, "add", self.fwmark, self.table);
            if !self.active_rules.contains(&rule) {
                ip(&rule).await?;
                self.active_rules.push(rule);
            }

            if routes.iter().any(|net| net.prefix_len() == 0) {
                let rule = suppress_rule_args(family, "add");
                if !self.active_rules.contains(&rule) {
                    ip(&rule).await?;
                    self.active_rules.push(rule);
                }
            }
        }
        Ok(())
    }

    /// Point the interface's DNS at `servers`; failures are only logged
    pub async fn set_dns(&mut self, servers: &[IpAddr]) {
        if servers.is_empty() {
            return;
        }

        let mut args = vec!["dns".to_string(), self.interface.clone()];
        args.extend(servers.iter().map(ToString::to_string));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        match run_command("resolvectl", &args).await {
            Ok(_) => self.dns_set = true,
            Err(e) => log::warn!("Failed to set DNS for {}: {:#}", self.interface, e),
        }
    }

    /// Remove everything this manager installed
    pub async fn teardown(&mut self) {
        if self.dns_set {
            let _ = run_command("resolvectl", &["revert", &self.interface]).await;
            self.dns_set = false;
        }

        for rule in self.active_rules.drain(..).rev() {
            let del = delete_args(&rule);
            if let Err(e) = ip(&del).await {
                log::warn!("Failed to remove rule {}: {:#}", del.join(" "), e);
            }
        }

        for net in self.active_routes.drain(..) {
            // Routes vanish with the link; this only matters if it outlives us
            let _ = ip(&[
                family_flag(&net).to_string(),
                "route".to_string(),
                "del".to_string(),
                net.to_string(),
                "table".to_string(),
                self.table.to_string(),
            ])
            .await;
            log::info!("Removed route: {}", net);
        }
    }

    /// Check if any routes or rules are currently installed
    pub fn has_active_routes(&self) -> bool {
        !self.active_routes.is_empty() || !self.active_rules.is_empty()
    }
}

/// Turn an `ip ... rule add ...` argument list into the matching delete
fn delete_args(add: &[String]) -> Vec<String> {
    add.iter()
        .map(|arg| if arg == "add" { "del".to_string() } else { arg.clone() })
        .collect()
}

impl Drop for RouteManager {
    fn drop(&mut self) {
        if self.active_rules.is_empty() {
            return;
        }

        // Policy rules outlive the interface, so they must not leak
        for rule in self.active_rules.drain(..) {
            let _ = std::process::Command::new("ip")
                .args(delete_args(&rule))
                .status();
        }
    }
}
