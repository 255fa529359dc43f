//! Managed-node registry and lifecycle state machine.
//!
//! States move `starting → running | error` through the start probe and end
//! in `stopped` through an explicit stop or the remote channel's close
//! event. `error` and `stopped` are terminal here; entries leave the
//! registry only through an explicit stop.
//!
//! Every entry carries a generation stamp. Probe and close callbacks hold
//! the `(name, generation)` pair they were launched with and are discarded
//! when the entry has since been stopped and restarted under the same name.
//!
//! Wrap in `Arc<Mutex<NodeRegistry>>`; critical sections are point lookups
//! and status flips, never I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use beamctl_core::error::CoreError;
use beamctl_core::schema::{NodeKind, NodeStatus};
use tracing::debug;

use crate::ssh::NodeChannel;

/// Launch parameters retained for restart.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub host_label: String,
    pub kind: NodeKind,
    pub cookie: String,
}

/// A BEAM node under management.
pub struct ManagedNode {
    pub name: String,
    pub config: NodeConfig,
    /// Snapshot of the host's short hostname at launch time.
    pub remote_short_host: String,
    /// Launch wall-clock time, epoch milliseconds.
    pub started_at: u64,
    /// Distinguishes this launch from earlier ones under the same name.
    pub generation: u64,
    pub status: NodeStatus,
    /// The long-running remote stream keeping the node alive.
    pub channel: NodeChannel,
}

impl ManagedNode {
    /// Fully-qualified `name@shortHost` identifier.
    pub fn qualified_name(&self) -> String {
        format!("{}@{}", self.name, self.remote_short_host)
    }
}

/// Read-only copy of an entry for operations that must not hold the lock.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub name: String,
    pub config: NodeConfig,
    pub qualified_name: String,
    pub started_at: u64,
    pub status: NodeStatus,
}

#[derive(Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, ManagedNode>,
    /// Names reserved by starts whose SSH spawn is still in flight.
    claims: HashSet<String>,
    next_generation: u64,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a name ahead of the SSH spawn.
    ///
    /// The claim covers the exist-check-and-insert window, so a concurrent
    /// start on the same name observes `NameTaken` without any remote I/O.
    ///
    /// # Errors
    ///
    /// [`CoreError::NameTaken`] when the name is live or already claimed.
    pub fn claim(&mut self, name: &str) -> Result<(), CoreError> {
        if self.nodes.contains_key(name) || !self.claims.insert(name.to_string()) {
            return Err(CoreError::NameTaken(name.to_string()));
        }
        Ok(())
    }

    /// Drop a claim after a failed spawn.
    pub fn release(&mut self, name: &str) {
        self.claims.remove(name);
    }

    /// Convert a claim into a live entry with `status = starting`.
    ///
    /// Returns the generation stamp the probe and close watcher must carry.
    pub fn fulfill(
        &mut self,
        name: &str,
        config: NodeConfig,
        remote_short_host: String,
        started_at: u64,
        channel: NodeChannel,
    ) -> u64 {
        self.claims.remove(name);
        self.next_generation += 1;
        let generation = self.next_generation;
        self.nodes.insert(
            name.to_string(),
            ManagedNode {
                name: name.to_string(),
                config,
                remote_short_host,
                started_at,
                generation,
                status: NodeStatus::Starting,
                channel,
            },
        );
        generation
    }

    pub fn get(&self, name: &str) -> Option<&ManagedNode> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Names of all live entries, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshots of all live entries, sorted by name.
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let mut items: Vec<NodeSnapshot> = self
            .nodes
            .values()
            .map(|node| NodeSnapshot {
                name: node.name.clone(),
                config: node.config.clone(),
                qualified_name: node.qualified_name(),
                started_at: node.started_at,
                status: node.status,
            })
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }

    /// Remove an entry (explicit stop). Pending claims are untouched.
    pub fn remove(&mut self, name: &str) -> Option<ManagedNode> {
        self.nodes.remove(name)
    }

    /// Apply a channel-close event: flip to `stopped` exactly once.
    ///
    /// Returns `false` when the entry is gone, was relaunched under a newer
    /// generation, or had already stopped.
    pub fn mark_closed(&mut self, name: &str, generation: u64) -> bool {
        match self.nodes.get_mut(name) {
            Some(node) if node.generation == generation && node.status != NodeStatus::Stopped => {
                node.status = NodeStatus::Stopped;
                true
            }
            _ => {
                debug!(node = %name, generation, "stale close event discarded");
                false
            }
        }
    }

    /// Apply a start-probe verdict: `starting → running | error`.
    ///
    /// Discarded when the entry is gone, carries a newer generation, or has
    /// already moved past `starting` (a close event beat the probe).
    pub fn resolve_probe(
        &mut self,
        name: &str,
        generation: u64,
        reachable: bool,
    ) -> Option<NodeStatus> {
        let node = self.nodes.get_mut(name)?;
        if node.generation != generation || node.status != NodeStatus::Starting {
            debug!(node = %name, generation, "stale probe result discarded");
            return None;
        }
        node.status = if reachable {
            NodeStatus::Running
        } else {
            NodeStatus::Error
        };
        Some(node.status)
    }
}

/// Shared, thread-safe node registry handle.
pub type SharedNodeRegistry = Arc<Mutex<NodeRegistry>>;

pub fn new_node_registry() -> SharedNodeRegistry {
    Arc::new(Mutex::new(NodeRegistry::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::testing::channel_pair;

    fn config() -> NodeConfig {
        NodeConfig {
            host_label: "a".to_string(),
            kind: NodeKind::Erlang,
            cookie: "secret".to_string(),
        }
    }

    fn fulfilled(registry: &mut NodeRegistry, name: &str) -> u64 {
        registry.claim(name).unwrap();
        let (channel, _tx) = channel_pair();
        registry.fulfill(name, config(), "build1".to_string(), 1_000, channel)
    }

    #[test]
    fn claim_rejects_live_name() {
        let mut registry = NodeRegistry::new();
        fulfilled(&mut registry, "w1");
        assert!(matches!(
            registry.claim("w1"),
            Err(CoreError::NameTaken(_))
        ));
    }

    #[test]
    fn claim_rejects_pending_claim() {
        let mut registry = NodeRegistry::new();
        registry.claim("w1").unwrap();
        assert!(matches!(
            registry.claim("w1"),
            Err(CoreError::NameTaken(_))
        ));
    }

    #[test]
    fn release_frees_a_failed_claim() {
        let mut registry = NodeRegistry::new();
        registry.claim("w1").unwrap();
        registry.release("w1");
        assert!(registry.claim("w1").is_ok());
    }

    #[test]
    fn fulfill_starts_in_starting_status() {
        let mut registry = NodeRegistry::new();
        fulfilled(&mut registry, "w1");
        let node = registry.get("w1").unwrap();
        assert_eq!(node.status, NodeStatus::Starting);
        assert_eq!(node.qualified_name(), "w1@build1");
    }

    #[test]
    fn remove_frees_name_immediately() {
        let mut registry = NodeRegistry::new();
        fulfilled(&mut registry, "w1");
        assert!(registry.remove("w1").is_some());
        assert!(registry.claim("w1").is_ok());
    }

    #[test]
    fn second_remove_returns_none() {
        let mut registry = NodeRegistry::new();
        fulfilled(&mut registry, "w1");
        assert!(registry.remove("w1").is_some());
        assert!(registry.remove("w1").is_none());
    }

    #[test]
    fn probe_pong_moves_starting_to_running() {
        let mut registry = NodeRegistry::new();
        let generation = fulfilled(&mut registry, "w1");
        assert_eq!(
            registry.resolve_probe("w1", generation, true),
            Some(NodeStatus::Running)
        );
        assert_eq!(registry.get("w1").unwrap().status, NodeStatus::Running);
    }

    #[test]
    fn probe_pang_moves_starting_to_error() {
        let mut registry = NodeRegistry::new();
        let generation = fulfilled(&mut registry, "w1");
        assert_eq!(
            registry.resolve_probe("w1", generation, false),
            Some(NodeStatus::Error)
        );
    }

    #[test]
    fn probe_after_remove_is_discarded() {
        let mut registry = NodeRegistry::new();
        let generation = fulfilled(&mut registry, "w1");
        registry.remove("w1");
        assert_eq!(registry.resolve_probe("w1", generation, true), None);
    }

    #[test]
    fn probe_from_previous_generation_is_discarded() {
        let mut registry = NodeRegistry::new();
        let old_generation = fulfilled(&mut registry, "w1");
        registry.remove("w1");
        let new_generation = fulfilled(&mut registry, "w1");
        assert_ne!(old_generation, new_generation);

        // The stale probe must not touch the relaunched node.
        assert_eq!(registry.resolve_probe("w1", old_generation, false), None);
        assert_eq!(registry.get("w1").unwrap().status, NodeStatus::Starting);
    }

    #[test]
    fn probe_after_close_is_discarded() {
        let mut registry = NodeRegistry::new();
        let generation = fulfilled(&mut registry, "w1");
        assert!(registry.mark_closed("w1", generation));
        assert_eq!(registry.resolve_probe("w1", generation, true), None);
        assert_eq!(registry.get("w1").unwrap().status, NodeStatus::Stopped);
    }

    #[test]
    fn close_flips_status_exactly_once() {
        let mut registry = NodeRegistry::new();
        let generation = fulfilled(&mut registry, "w1");
        assert!(registry.mark_closed("w1", generation));
        assert!(!registry.mark_closed("w1", generation));
        assert_eq!(registry.get("w1").unwrap().status, NodeStatus::Stopped);
    }

    #[test]
    fn close_overrides_running() {
        let mut registry = NodeRegistry::new();
        let generation = fulfilled(&mut registry, "w1");
        registry.resolve_probe("w1", generation, true);
        assert!(registry.mark_closed("w1", generation));
        assert_eq!(registry.get("w1").unwrap().status, NodeStatus::Stopped);
    }

    #[test]
    fn stale_close_does_not_touch_relaunched_node() {
        let mut registry = NodeRegistry::new();
        let old_generation = fulfilled(&mut registry, "w1");
        registry.remove("w1");
        let new_generation = fulfilled(&mut registry, "w1");
        registry.resolve_probe("w1", new_generation, true);

        assert!(!registry.mark_closed("w1", old_generation));
        assert_eq!(registry.get("w1").unwrap().status, NodeStatus::Running);
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let mut registry = NodeRegistry::new();
        fulfilled(&mut registry, "zeta");
        fulfilled(&mut registry, "alpha");
        let names: Vec<String> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }
}
