//! Registry of recently-announced nodes.
//!
//! The registry only sizes discovery barriers. It is never the source of
//! truth for which nodes exist: a node that stops announcing is forgotten
//! after the TTL, and a node that never announced can still answer discover.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use fleet_id::NodeId;

/// Tracks the last announcement time of each node.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: HashMap<NodeId, Instant>,
    ttl: Duration,
}

impl NodeRegistry {
    /// Create an empty registry with the given liveness TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            nodes: HashMap::new(),
            ttl,
        }
    }

    /// Record an announcement received at `now`. Returns `true` for a node
    /// not previously live.
    pub fn on_announce(&mut self, node_id: NodeId, now: Instant) -> bool {
        self.nodes.insert(node_id, now).is_none()
    }

    /// Remove nodes whose last announcement is more than the TTL before
    /// `now`. Returns the removed ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<NodeId> {
        let ttl = self.ttl;
        let mut expired = Vec::new();
        self.nodes.retain(|node_id, last_seen| {
            let keep = now.saturating_duration_since(*last_seen) <= ttl;
            if !keep {
                expired.push(*node_id);
            }
            keep
        });
        expired
    }

    /// Number of nodes currently considered live.
    pub fn live_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn last_seen(&self, node_id: &NodeId) -> Option<Instant> {
        self.nodes.get(node_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn test_announce_counts_each_node_once() {
        let mut registry = NodeRegistry::new(TTL);
        let now = Instant::now();
        let node = NodeId::new();

        assert!(registry.on_announce(node, now));
        assert!(!registry.on_announce(node, now + Duration::from_secs(30)));
        registry.on_announce(NodeId::new(), now);

        assert_eq!(registry.live_count(), 2);
        assert_eq!(registry.last_seen(&node), Some(now + Duration::from_secs(30)));
    }

    #[test]
    fn test_node_live_until_ttl_then_swept() {
        let mut registry = NodeRegistry::new(TTL);
        let t = Instant::now();
        let node = NodeId::new();
        registry.on_announce(node, t);

        assert!(registry.sweep(t + Duration::from_secs(300)).is_empty());
        assert_eq!(registry.live_count(), 1);

        assert_eq!(registry.sweep(t + Duration::from_secs(301)), vec![node]);
        assert_eq!(registry.live_count(), 0);
        assert!(!registry.contains(&node));
    }

    #[test]
    fn test_reannounce_refreshes_liveness() {
        let mut registry = NodeRegistry::new(TTL);
        let t = Instant::now();
        let node = NodeId::new();
        registry.on_announce(node, t);
        registry.on_announce(node, t + Duration::from_secs(200));

        assert!(registry.sweep(t + Duration::from_secs(450)).is_empty());
        assert!(registry.contains(&node));
    }

    #[test]
    fn test_sweep_keeps_fresh_nodes() {
        let mut registry = NodeRegistry::new(TTL);
        let t = Instant::now();
        let stale = NodeId::new();
        let fresh = NodeId::new();
        registry.on_announce(stale, t);
        registry.on_announce(fresh, t + Duration::from_secs(100));

        let removed = registry.sweep(t + Duration::from_secs(350));
        assert_eq!(removed, vec![stale]);
        assert!(registry.contains(&fresh));
    }
}
