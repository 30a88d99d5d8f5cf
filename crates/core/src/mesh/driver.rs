//! The replication driver: stateless with respect to data, it owns
//! table-to-member placement and nothing else. Inputs are catalog events
//! from the store and membership events from the transport.

use crate::mesh::replicator::Replicator;
use crate::mesh::{MeshState, NodeStatus};
use crate::store::catalog::SYSTEM_TREES;
use crate::store::{CatalogEvent, RecordStore};
use cortex_lib::scope::NodeScope;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    Join(String),
    Leave(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCommand {
    Member(MemberEvent),
    Repair { table: String },
}

/// Cheap cloneable handle for poking the driver from handlers and the
/// transport's membership callbacks.
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::UnboundedSender<DriverCommand>,
}

impl DriverHandle {
    pub fn notify_member(&self, event: MemberEvent) {
        let _ = self.tx.send(DriverCommand::Member(event));
    }

    pub fn repair(&self, table: impl Into<String>) {
        let _ = self.tx.send(DriverCommand::Repair { table: table.into() });
    }
}

pub struct ReplicationDriver {
    store: Arc<RecordStore>,
    replicator: Arc<dyn Replicator>,
    mesh: Arc<MeshState>,
}

impl ReplicationDriver {
    /// Wire the driver to the store's catalog events and start its task.
    pub fn spawn(
        store: Arc<RecordStore>,
        replicator: Arc<dyn Replicator>,
        mesh: Arc<MeshState>,
        cancel: CancellationToken,
    ) -> DriverHandle {
        let (catalog_tx, catalog_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        store.set_event_sink(catalog_tx);

        let driver = ReplicationDriver {
            store,
            replicator,
            mesh,
        };
        tokio::spawn(driver.run(catalog_rx, command_rx, cancel));

        DriverHandle { tx: command_tx }
    }

    async fn run(
        self,
        mut catalog_rx: mpsc::UnboundedReceiver<CatalogEvent>,
        mut command_rx: mpsc::UnboundedReceiver<DriverCommand>,
        cancel: CancellationToken,
    ) {
        log::info!("replication driver running for node {}", self.mesh.node_name);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = catalog_rx.recv() => match event {
                    Some(event) => self.on_catalog_event(event),
                    None => break,
                },
                command = command_rx.recv() => match command {
                    Some(DriverCommand::Member(event)) => self.on_member_event(event),
                    Some(DriverCommand::Repair { table }) => self.repair(&table),
                    None => break,
                },
            }
        }
        log::info!("replication driver stopped");
    }

    fn on_catalog_event(&self, event: CatalogEvent) {
        match event {
            CatalogEvent::TableCreated { table, scope } | CatalogEvent::ScopeChanged { table, scope } => {
                self.apply_scope(&table, &scope);
            }
            CatalogEvent::TableDropped { table } => {
                for member in self.mesh.member_names() {
                    self.replicator.remove_replica(&table, &member);
                }
            }
        }
    }

    fn on_member_event(&self, event: MemberEvent) {
        match event {
            MemberEvent::Join(member) => {
                log::info!("mesh member {member} joined");
                self.mesh.set_status(&member, NodeStatus::Up);
                // System tables go everywhere so authorization resolves
                // locally on every member.
                for tree in SYSTEM_TREES {
                    self.replicator.add_replica(tree, &member);
                }
                match self.store.meta_entries() {
                    Ok(entries) => {
                        for (table, meta) in entries {
                            if meta.node_scope.includes(&member) {
                                self.replicator.add_replica(&table, &member);
                            }
                        }
                    }
                    Err(e) => log::error!("catalog scan for join of {member} failed: {e}"),
                }
            }
            MemberEvent::Leave(member) => {
                // Placement stays; the engine reconciles when the member
                // returns.
                log::info!("mesh member {member} left");
                self.mesh.set_status(&member, NodeStatus::Down);
            }
        }
    }

    /// Converge placement of one table onto its scope.
    fn apply_scope(&self, table: &str, scope: &NodeScope) {
        for member in self.mesh.member_names() {
            if scope.includes(&member) {
                self.replicator.add_replica(table, &member);
            } else {
                self.replicator.remove_replica(table, &member);
            }
        }
    }

    /// Drop and re-add every eligible replica, forcing resynchronization.
    fn repair(&self, table: &str) {
        let scope = match self.store.table_meta(table) {
            Ok(Some(meta)) => meta.node_scope,
            Ok(None) => {
                log::warn!("repair requested for unknown table {table}");
                return;
            }
            Err(e) => {
                log::error!("repair of {table} failed reading catalog: {e}");
                return;
            }
        };
        log::info!("repairing {table}");
        for member in self.mesh.member_names() {
            if scope.includes(&member) {
                self.replicator.remove_replica(table, &member);
                self.replicator.add_replica(table, &member);
            }
        }
    }
}
