//! Mesh membership state and the placement-only replication driver.
//!
//! The replication transport itself is a black box behind the
//! [`replicator::Replicator`] trait: it keeps a set of tables converged
//! across members and notifies on membership change. Everything here
//! manipulates *placement* — which member holds a copy — never data.

pub mod driver;
pub mod replicator;

use crate::config::MeshConfig;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Configured,
    Up,
    Down,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Configured => "configured",
            NodeStatus::Up => "up",
            NodeStatus::Down => "down",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
}

/// What this node knows about the mesh: its own name, the configured
/// members, and their last observed status.
pub struct MeshState {
    pub enabled: bool,
    pub node_name: String,
    members: RwLock<HashMap<String, MemberInfo>>,
}

impl MeshState {
    pub fn new(node_name: String, mesh: Option<&MeshConfig>) -> MeshState {
        let members = mesh
            .map(|m| {
                m.nodes
                    .iter()
                    .map(|n| {
                        (
                            n.name.clone(),
                            MemberInfo {
                                name: n.name.clone(),
                                host: n.host.clone(),
                                port: n.port,
                                status: NodeStatus::Configured,
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        MeshState {
            enabled: mesh.is_some(),
            node_name,
            members: RwLock::new(members),
        }
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        let mut out: Vec<_> = self.members.read().values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members().into_iter().map(|m| m.name).collect()
    }

    pub fn set_status(&self, node: &str, status: NodeStatus) {
        if let Some(member) = self.members.write().get_mut(node) {
            member.status = status;
        } else {
            log::warn!("status change for unknown mesh member {node}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshNode;

    fn mesh_config() -> MeshConfig {
        MeshConfig {
            node_name: "alpha".into(),
            tls_port: 7443,
            ca_cert: "/tmp/ca.pem".into(),
            node_cert: "/tmp/node.pem".into(),
            node_key: "/tmp/node.key".into(),
            accept_frame_metadata: false,
            nodes: vec![
                MeshNode {
                    name: "beta".into(),
                    host: "10.0.0.2".into(),
                    port: 7443,
                },
                MeshNode {
                    name: "gamma".into(),
                    host: "10.0.0.3".into(),
                    port: 7443,
                },
            ],
        }
    }

    #[test]
    fn members_track_status() {
        let state = MeshState::new("alpha".into(), Some(&mesh_config()));
        assert!(state.enabled);
        assert_eq!(state.member_names(), vec!["beta", "gamma"]);

        state.set_status("beta", NodeStatus::Up);
        let beta = state.members().into_iter().find(|m| m.name == "beta").unwrap();
        assert_eq!(beta.status, NodeStatus::Up);
    }

    #[test]
    fn no_mesh_config_disables() {
        let state = MeshState::new("host".into(), None);
        assert!(!state.enabled);
        assert!(state.members().is_empty());
    }
}
