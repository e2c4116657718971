//! Per-peer traffic counters for a tunnel

use crate::keys::Key;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Counters older than this are refreshed on the next request
pub const STALE_AFTER: Duration = Duration::from_millis(900);

/// Byte counters of one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// A snapshot of every peer's counters
#[derive(Debug, Clone)]
pub struct Statistics {
    peers: BTreeMap<Key, PeerStats>,
    taken_at: Instant,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    /// An empty snapshot taken now
    pub fn new() -> Self {
        Self {
            peers: BTreeMap::new(),
            taken_at: Instant::now(),
        }
    }

    pub fn add(&mut self, public_key: Key, rx_bytes: u64, tx_bytes: u64) {
        self.peers.insert(public_key, PeerStats { rx_bytes, tx_bytes });
    }

    pub fn peer(&self, public_key: &Key) -> Option<PeerStats> {
        self.peers.get(public_key).copied()
    }

    pub fn peers(&self) -> impl Iterator<Item = (&Key, &PeerStats)> {
        self.peers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn total_rx(&self) -> u64 {
        self.peers.values().map(|p| p.rx_bytes).sum()
    }

    pub fn total_tx(&self) -> u64 {
        self.peers.values().map(|p| p.tx_bytes).sum()
    }

    pub fn is_stale(&self) -> bool {
        self.taken_at.elapsed() > STALE_AFTER
    }
}
