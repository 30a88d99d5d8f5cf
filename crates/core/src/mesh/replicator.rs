//! The replication transport seam.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

/// A black-box multi-master replicator. Two verbs only: ensure a member
/// holds a copy of a table, or stop it from holding one. Convergence and
/// conflict resolution (last-write-wins at key granularity) live behind
/// this trait, not in the daemon.
pub trait Replicator: Send + Sync {
    fn add_replica(&self, table: &str, node: &str);
    fn remove_replica(&self, table: &str, node: &str);
    /// Members currently holding (or acquiring) a copy of `table`.
    fn replicas(&self, table: &str) -> Vec<String>;
}

/// Placement book-keeping with no transport behind it. Used when the
/// daemon runs without a mesh and as the observable fake in tests.
#[derive(Default)]
pub struct PlacementMap {
    placements: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl PlacementMap {
    pub fn new() -> PlacementMap {
        PlacementMap::default()
    }
}

impl Replicator for PlacementMap {
    fn add_replica(&self, table: &str, node: &str) {
        log::debug!("placing replica of {table} on {node}");
        self.placements
            .write()
            .entry(table.to_owned())
            .or_default()
            .insert(node.to_owned());
    }

    fn remove_replica(&self, table: &str, node: &str) {
        log::debug!("removing replica of {table} from {node}");
        let mut placements = self.placements.write();
        if let Some(nodes) = placements.get_mut(table) {
            nodes.remove(node);
            if nodes.is_empty() {
                placements.remove(table);
            }
        }
    }

    fn replicas(&self, table: &str) -> Vec<String> {
        self.placements
            .read()
            .get(table)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_round_trip() {
        let map = PlacementMap::new();
        map.add_replica("1000:users", "beta");
        map.add_replica("1000:users", "gamma");
        map.add_replica("1000:users", "beta");
        assert_eq!(map.replicas("1000:users"), vec!["beta", "gamma"]);

        map.remove_replica("1000:users", "beta");
        assert_eq!(map.replicas("1000:users"), vec!["gamma"]);
        assert!(map.replicas("1000:other").is_empty());
    }
}
