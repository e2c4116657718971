//! Sorted, name-keyed collection of tunnels

use crate::tunnel::{compare_names, Tunnel};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Catalog {
    tunnels: Vec<Arc<Tunnel>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert in name order; returns false if the name is already taken
    pub fn insert(&mut self, tunnel: Arc<Tunnel>) -> bool {
        let name = tunnel.name();
        match self
            .tunnels
            .binary_search_by(|t| compare_names(&t.name(), &name))
        {
            Ok(_) => false,
            Err(index) => {
                self.tunnels.insert(index, tunnel);
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.iter().find(|t| t.name() == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tunnels.iter().any(|t| t.name() == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<Tunnel>> {
        let index = self.tunnels.iter().position(|t| t.name() == name)?;
        Some(self.tunnels.remove(index))
    }

    pub fn names(&self) -> Vec<String> {
        self.tunnels.iter().map(|t| t.name()).collect()
    }

    /// Snapshot of the tunnels in order
    pub fn to_vec(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.clone()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TunnelState;
    use tokio::sync::broadcast;

    fn tunnel(name: &str) -> Arc<Tunnel> {
        let (tx, _) = broadcast::channel(4);
        Arc::new(Tunnel::new(name.to_string(), None, TunnelState::Down, tx))
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut catalog = Catalog::new();
        for name in ["work", "Home", "alpha", "home"] {
            assert!(catalog.insert(tunnel(name)));
        }
        assert_eq!(catalog.names(), vec!["alpha", "Home", "home", "work"]);
        assert_eq!(catalog.len(), 4);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut catalog = Catalog::new();
        assert!(catalog.insert(tunnel("wg0")));
        assert!(!catalog.insert(tunnel("wg0")));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_get_and_remove() {
        let mut catalog = Catalog::new();
        catalog.insert(tunnel("wg0"));
        catalog.insert(tunnel("wg1"));

        assert!(catalog.contains("wg1"));
        assert_eq!(catalog.get("wg0").unwrap().name(), "wg0");
        assert!(catalog.get("wg2").is_none());

        let removed = catalog.remove("wg0").unwrap();
        assert_eq!(removed.name(), "wg0");
        assert!(!catalog.contains("wg0"));
        assert!(catalog.remove("wg0").is_none());
        assert!(!catalog.is_empty());
    }
}
