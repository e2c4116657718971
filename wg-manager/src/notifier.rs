// Desktop notifications via D-Bus

//! "Tunnel active" notifications
//!
//! While a tunnel brought up by the kernel module backend is running, a
//! resident desktop notification is shown through the freedesktop
//! notification service on the session bus. Hosts without a session bus get
//! a notifier that only logs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use zbus::zvariant::Value;
use zbus::{proxy, Connection};

/// D-Bus proxy for the desktop notification service
#[proxy(
    interface = "org.freedesktop.Notifications",
    default_service = "org.freedesktop.Notifications",
    default_path = "/org/freedesktop/Notifications"
)]
trait Notifications {
    /// Show or replace a notification, returning its id
    fn notify(
        &self,
        app_name: &str,
        replaces_id: u32,
        app_icon: &str,
        summary: &str,
        body: &str,
        actions: &[&str],
        hints: HashMap<&str, &Value<'_>>,
        expire_timeout: i32,
    ) -> zbus::Result<u32>;

    /// Withdraw a notification
    fn close_notification(&self, id: u32) -> zbus::Result<()>;
}

/// Announces tunnels going up and down
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn tunnel_up(&self, name: &str);
    async fn tunnel_down(&self, name: &str);
}

/// Logs instead of showing anything
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn tunnel_up(&self, name: &str) {
        log::info!("Tunnel {} is active", name);
    }

    async fn tunnel_down(&self, name: &str) {
        log::info!("Tunnel {} is no longer active", name);
    }
}

/// Posts a resident notification per running tunnel
pub struct DbusNotifier {
    connection: Connection,
    ids: Mutex<HashMap<String, u32>>,
}

impl DbusNotifier {
    /// Connect to the session bus
    pub async fn connect() -> Result<Self> {
        let connection = Connection::session()
            .await
            .context("Failed to connect to session D-Bus")?;

        Ok(Self {
            connection,
            ids: Mutex::new(HashMap::new()),
        })
    }

    async fn post(&self, name: &str) -> Result<()> {
        let proxy = NotificationsProxy::new(&self.connection)
            .await
            .context("Failed to create Notifications proxy")?;

        let replaces = self.ids.lock().get(name).copied().unwrap_or(0);
        let resident = Value::from(true);
        let mut hints = HashMap::new();
        hints.insert("resident", &resident);

        let id = proxy
            .notify(
                "wg-manager",
                replaces,
                "network-vpn",
                &format!("WireGuard tunnel {} is active", name),
                "Traffic is routed through the tunnel.",
                &[],
                hints,
                // Never expire
                0,
            )
            .await
            .context("Failed to post notification")?;

        self.ids.lock().insert(name.to_string(), id);
        Ok(())
    }

    async fn withdraw(&self, name: &str) -> Result<()> {
        let Some(id) = self.ids.lock().remove(name) else {
            return Ok(());
        };

        let proxy = NotificationsProxy::new(&self.connection)
            .await
            .context("Failed to create Notifications proxy")?;
        proxy
            .close_notification(id)
            .await
            .context("Failed to close notification")
    }
}

#[async_trait]
impl Notifier for DbusNotifier {
    async fn tunnel_up(&self, name: &str) {
        if let Err(e) = self.post(name).await {
            log::warn!("Failed to show notification for {}: {:#}", name, e);
        }
    }

    async fn tunnel_down(&self, name: &str) {
        if let Err(e) = self.withdraw(name).await {
            log::warn!("Failed to withdraw notification for {}: {:#}", name, e);
        }
    }
}

/// The D-Bus notifier if enabled and a session bus is reachable, otherwise
/// the log notifier
pub async fn create_notifier(enabled: bool) -> Box<dyn Notifier> {
    if !enabled {
        return Box::new(LogNotifier);
    }

    match DbusNotifier::connect().await {
        Ok(notifier) => Box::new(notifier),
        Err(e) => {
            log::info!("Desktop notifications unavailable ({:#}), logging instead", e);
            Box::new(LogNotifier)
        }
    }
}
