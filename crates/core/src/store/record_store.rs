//! The transactional record store: user tables plus the system catalog,
//! all inside one embedded engine.
//!
//! Internal table names are fully qualified (`{uid}:name`, `@{fed}:name`)
//! and are only ever minted through validated resolution. A user tree is
//! opened strictly after its `cortex_meta` row has been seen, so unknown
//! names can never create engine-level state.

use crate::error::StoreError;
use crate::store::catalog::{AclEntry, Catalog, IdentityRecord, TableMeta};
use cortex_lib::name::{is_attribute, is_fed_id};
use cortex_lib::permissions::Permissions;
use cortex_lib::scope::NodeScope;
use once_cell::sync::Lazy;
use regex::Regex;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::UnboundedSender;

static UID_IDENTITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^uid:[0-9]+$").unwrap());

/// Catalog mutations the replication driver reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    TableCreated { table: String, scope: NodeScope },
    TableDropped { table: String },
    ScopeChanged { table: String, scope: NodeScope },
}

/// Who owns a table being created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOwner {
    Uid(u32),
    Fed(String),
}

pub struct RecordStore {
    db: sled::Db,
    catalog: Catalog,
    node_name: String,
    events: parking_lot::Mutex<Option<UnboundedSender<CatalogEvent>>>,
}

type TxError = ConflictableTransactionError<StoreError>;

fn tx_err(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::Engine(e),
    }
}

fn abort(e: StoreError) -> TxError {
    ConflictableTransactionError::Abort(e)
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl RecordStore {
    pub fn open(data_dir: &Path, node_name: String) -> Result<RecordStore, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let db = sled::Config::default()
            .path(data_dir.join("engine"))
            .flush_every_ms(Some(50))
            .mode(sled::Mode::HighThroughput)
            .open()?;
        let catalog = Catalog::open(&db)?;
        Ok(RecordStore {
            db,
            catalog,
            node_name,
            events: parking_lot::Mutex::new(None),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Wire up the replication driver. Events emitted before this is set
    /// (or after the driver is gone) are dropped.
    pub fn set_event_sink(&self, tx: UnboundedSender<CatalogEvent>) {
        *self.events.lock() = Some(tx);
    }

    fn emit(&self, event: CatalogEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------

    pub fn table_meta(&self, table: &str) -> Result<Option<TableMeta>, StoreError> {
        self.catalog.table_meta(table)
    }

    pub fn table_count(&self) -> usize {
        self.catalog.meta.len()
    }

    pub fn meta_entries(&self) -> Result<Vec<(String, TableMeta)>, StoreError> {
        let mut out = Vec::new();
        for entry in self.catalog.meta.iter() {
            let (key, value) = entry?;
            let name = String::from_utf8_lossy(&key).into_owned();
            out.push((name, serde_json::from_slice(&value)?));
        }
        Ok(out)
    }

    /// Create a table. `internal` must already be resolved and validated;
    /// the first attribute is the declared key field.
    pub fn create_table(
        &self,
        owner: TableOwner,
        internal: &str,
        attributes: Vec<String>,
        scope: NodeScope,
    ) -> Result<(), StoreError> {
        if attributes.is_empty() {
            return Err(StoreError::InvalidAttribute(String::new()));
        }
        for attr in &attributes {
            if !is_attribute(attr) {
                return Err(StoreError::InvalidAttribute(attr.clone()));
            }
        }

        let (owner_uid, owner_fed) = match owner {
            TableOwner::Uid(uid) => (Some(uid), None),
            TableOwner::Fed(fed) => (None, Some(fed)),
        };
        let meta = TableMeta {
            owner_uid,
            owner_fed,
            key_field: attributes[0].clone(),
            attributes,
            node_scope: scope.clone(),
            created_at: now_secs(),
        };
        let bytes = serde_json::to_vec(&meta)?;

        self.catalog
            .meta
            .compare_and_swap(internal.as_bytes(), None as Option<&[u8]>, Some(bytes))?
            .map_err(|_| StoreError::TableExists(internal.to_owned()))?;

        // A crashed drop may have left record bytes behind under this
        // name; a fresh table must start empty.
        self.clear_stale_tree(internal)?;

        self.emit(CatalogEvent::TableCreated {
            table: internal.to_owned(),
            scope,
        });
        log::info!("created table {internal}");
        Ok(())
    }

    /// Drop a table: ACL rows first, then the meta row, in one catalog
    /// transaction, so no grant can land on a half-dropped table. The
    /// record bytes go last; the catalog is the source of truth.
    pub fn drop_table(&self, internal: &str) -> Result<(), StoreError> {
        let acl_keys = self.acl_keys_for_table(internal)?;

        let result = (&self.catalog.meta, &self.catalog.acls).transaction(|(meta, acls)| {
            if meta.get(internal.as_bytes())?.is_none() {
                return Err(abort(StoreError::TableNotFound(internal.to_owned())));
            }
            for key in &acl_keys {
                acls.remove(key.as_slice())?;
            }
            meta.remove(internal.as_bytes())?;
            Ok(())
        });
        result.map_err(tx_err)?;

        self.clear_stale_tree(internal)?;
        self.emit(CatalogEvent::TableDropped {
            table: internal.to_owned(),
        });
        log::info!("dropped table {internal}");
        Ok(())
    }

    fn clear_stale_tree(&self, internal: &str) -> Result<(), StoreError> {
        let exists = self
            .db
            .tree_names()
            .iter()
            .any(|name| name.as_ref() == internal.as_bytes());
        if exists {
            self.db.drop_tree(internal.as_bytes())?;
        }
        Ok(())
    }

    /// Open the record tree for a known table. The meta check is the
    /// gate that keeps unknown names from minting engine state.
    fn data_tree(&self, internal: &str) -> Result<sled::Tree, StoreError> {
        if !self.catalog.meta.contains_key(internal.as_bytes())? {
            return Err(StoreError::TableNotFound(internal.to_owned()));
        }
        Ok(self.db.open_tree(internal.as_bytes())?)
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Insert or replace a record. Returns the key it was stored under.
    pub fn put(
        &self,
        internal: &str,
        meta: &TableMeta,
        record: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, StoreError> {
        let key = record
            .get(&meta.key_field)
            .and_then(cortex_lib::value::json_key_string)
            .ok_or_else(|| StoreError::MissingKeyField(meta.key_field.clone()))?;

        let tree = self.data_tree(internal)?;
        let bytes = rmp_serde::to_vec(&serde_json::Value::Object(record))?;
        tree.insert(key.as_bytes(), bytes)?;
        Ok(key)
    }

    pub fn get(&self, internal: &str, key: &str) -> Result<serde_json::Value, StoreError> {
        let tree = self.data_tree(internal)?;
        match tree.get(key.as_bytes())? {
            Some(bytes) => Ok(rmp_serde::from_slice(&bytes)?),
            None => Err(StoreError::KeyNotFound(key.to_owned())),
        }
    }

    pub fn delete(&self, internal: &str, key: &str) -> Result<(), StoreError> {
        let tree = self.data_tree(internal)?;
        match tree.remove(key.as_bytes())? {
            Some(_) => Ok(()),
            None => Err(StoreError::KeyNotFound(key.to_owned())),
        }
    }

    /// Every record whose fields equal the pattern's. A scalar pattern
    /// value also matches membership in an array field. Linear scan; no
    /// ordering guarantee.
    pub fn match_records(
        &self,
        internal: &str,
        pattern: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<serde_json::Value>, StoreError> {
        let tree = self.data_tree(internal)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (_, bytes) = entry?;
            let record: serde_json::Value = rmp_serde::from_slice(&bytes)?;
            if let Some(fields) = record.as_object() {
                if pattern_matches(fields, pattern) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    pub fn all(&self, internal: &str) -> Result<Vec<serde_json::Value>, StoreError> {
        let tree = self.data_tree(internal)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (_, bytes) = entry?;
            out.push(rmp_serde::from_slice(&bytes)?);
        }
        Ok(out)
    }

    pub fn keys(&self, internal: &str) -> Result<Vec<String>, StoreError> {
        let tree = self.data_tree(internal)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (key, _) = entry?;
            out.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // ACLs
    // ------------------------------------------------------------------

    fn validate_acl_identity(identity: &str) -> Result<(), StoreError> {
        if identity == "*" || UID_IDENTITY.is_match(identity) || is_fed_id(identity) {
            Ok(())
        } else {
            Err(StoreError::InvalidIdentity(identity.to_owned()))
        }
    }

    /// Grant permissions, merging with any existing entry (set union).
    /// Reads the meta row inside the transaction so a grant can never
    /// race past a concurrent `drop_table`.
    pub fn acl_grant(
        &self,
        identity: &str,
        internal: &str,
        perms: Permissions,
    ) -> Result<Permissions, StoreError> {
        Self::validate_acl_identity(identity)?;
        let key = Catalog::acl_key(identity, internal);

        let result = (&self.catalog.meta, &self.catalog.acls).transaction(|(meta, acls)| {
            if meta.get(internal.as_bytes())?.is_none() {
                return Err(abort(StoreError::TableNotFound(internal.to_owned())));
            }
            let current = match acls.get(key.as_slice())? {
                Some(bytes) => {
                    let entry: AclEntry =
                        serde_json::from_slice(&bytes).map_err(|e| abort(StoreError::CatalogRow(e)))?;
                    entry.permissions
                }
                None => Permissions::empty(),
            };
            let merged = current | perms;
            let bytes = serde_json::to_vec(&AclEntry { permissions: merged })
                .map_err(|e| abort(StoreError::CatalogRow(e)))?;
            acls.insert(key.as_slice(), bytes)?;
            Ok(merged)
        });
        result.map_err(tx_err)
    }

    /// Remove permissions; an entry pruned to empty is deleted outright.
    /// Revoking from a missing entry is a no-op.
    pub fn acl_revoke(
        &self,
        identity: &str,
        internal: &str,
        perms: Permissions,
    ) -> Result<Permissions, StoreError> {
        Self::validate_acl_identity(identity)?;
        let key = Catalog::acl_key(identity, internal);

        let result = (&self.catalog.meta, &self.catalog.acls).transaction(|(meta, acls)| {
            if meta.get(internal.as_bytes())?.is_none() {
                return Err(abort(StoreError::TableNotFound(internal.to_owned())));
            }
            let current = match acls.get(key.as_slice())? {
                Some(bytes) => {
                    let entry: AclEntry =
                        serde_json::from_slice(&bytes).map_err(|e| abort(StoreError::CatalogRow(e)))?;
                    entry.permissions
                }
                None => return Ok(Permissions::empty()),
            };
            let remaining = current - perms;
            if remaining.is_empty() {
                acls.remove(key.as_slice())?;
            } else {
                let bytes = serde_json::to_vec(&AclEntry { permissions: remaining })
                    .map_err(|e| abort(StoreError::CatalogRow(e)))?;
                acls.insert(key.as_slice(), bytes)?;
            }
            Ok(remaining)
        });
        result.map_err(tx_err)
    }

    pub fn acl_check(&self, identity: &str, internal: &str, perms: Permissions) -> Result<bool, StoreError> {
        Ok(self.catalog.acl_permissions(identity, internal)?.contains(perms))
    }

    pub fn acl_entries(&self) -> Result<Vec<(String, String, Permissions)>, StoreError> {
        let mut out = Vec::new();
        for entry in self.catalog.acls.iter() {
            let (key, value) = entry?;
            let Some((identity, table)) = Catalog::split_acl_key(&key) else {
                log::warn!("skipping unparseable ACL key");
                continue;
            };
            let entry: AclEntry = serde_json::from_slice(&value)?;
            out.push((identity, table, entry.permissions));
        }
        Ok(out)
    }

    fn acl_keys_for_table(&self, internal: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut keys = Vec::new();
        for entry in self.catalog.acls.iter() {
            let (key, _) = entry?;
            if let Some((_, table)) = Catalog::split_acl_key(&key) {
                if table == internal {
                    keys.push(key.to_vec());
                }
            }
        }
        Ok(keys)
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    pub fn set_scope(&self, internal: &str, scope: NodeScope) -> Result<(), StoreError> {
        let result = self.catalog.meta.transaction(|meta| {
            let Some(bytes) = meta.get(internal.as_bytes())? else {
                return Err(abort(StoreError::TableNotFound(internal.to_owned())));
            };
            let mut row: TableMeta =
                serde_json::from_slice(&bytes).map_err(|e| abort(StoreError::CatalogRow(e)))?;
            row.node_scope = scope.clone();
            let bytes = serde_json::to_vec(&row).map_err(|e| abort(StoreError::CatalogRow(e)))?;
            meta.insert(internal.as_bytes(), bytes)?;
            Ok(())
        });
        result.map_err(tx_err)?;

        self.emit(CatalogEvent::ScopeChanged {
            table: internal.to_owned(),
            scope,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Federated identities
    // ------------------------------------------------------------------

    /// Register a new federated identity mapped to `uid` on this node.
    /// Returns the stored record; the caller issues the claim token for
    /// the embedded `claim_jti`.
    pub fn register_identity(
        &self,
        fed_id: &str,
        uid: u32,
        jti: String,
    ) -> Result<IdentityRecord, StoreError> {
        if !is_fed_id(fed_id) {
            return Err(StoreError::InvalidIdentity(fed_id.to_owned()));
        }
        let record = IdentityRecord {
            mappings: [(self.node_name.clone(), uid)].into_iter().collect(),
            created_at: now_secs(),
            created_by: format!("uid:{uid}@{}", self.node_name),
            claim_jti: Some(jti),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.catalog
            .identities
            .compare_and_swap(fed_id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
            .map_err(|_| StoreError::IdentityExists(fed_id.to_owned()))?;
        log::info!("registered federated identity {fed_id} on {}", self.node_name);
        Ok(record)
    }

    /// Consume a one-time claim: attach `uid` on this node to `fed_id`.
    pub fn claim_identity(&self, fed_id: &str, jti: &str, uid: u32) -> Result<IdentityRecord, StoreError> {
        loop {
            let Some(current_bytes) = self.catalog.identities.get(fed_id.as_bytes())? else {
                return Err(StoreError::ClaimRejected);
            };
            let current: IdentityRecord = serde_json::from_slice(&current_bytes)?;
            if current.claim_jti.as_deref() != Some(jti) {
                return Err(StoreError::ClaimRejected);
            }
            if current.mappings.contains_key(&self.node_name) {
                return Err(StoreError::MappingExists(fed_id.to_owned(), self.node_name.clone()));
            }

            let mut next = current.clone();
            next.mappings.insert(self.node_name.clone(), uid);
            next.claim_jti = None;
            let next_bytes = serde_json::to_vec(&next)?;

            let swap = self.catalog.identities.compare_and_swap(
                fed_id.as_bytes(),
                Some(&current_bytes[..]),
                Some(next_bytes),
            )?;
            if swap.is_ok() {
                log::info!("identity {fed_id} claimed by uid {uid} on {}", self.node_name);
                return Ok(next);
            }
            // Lost a race; re-read and re-validate.
        }
    }

    /// Remove the mapping for `node`; the identity itself goes away with
    /// its last mapping. Returns the surviving record, if any.
    pub fn revoke_identity(&self, fed_id: &str, node: &str) -> Result<Option<IdentityRecord>, StoreError> {
        loop {
            let Some(current_bytes) = self.catalog.identities.get(fed_id.as_bytes())? else {
                return Err(StoreError::IdentityNotFound(fed_id.to_owned()));
            };
            let current: IdentityRecord = serde_json::from_slice(&current_bytes)?;
            if !current.mappings.contains_key(node) {
                return Err(StoreError::IdentityNotFound(fed_id.to_owned()));
            }

            let mut next = current.clone();
            next.mappings.remove(node);
            let replacement = if next.mappings.is_empty() {
                None
            } else {
                Some(serde_json::to_vec(&next)?)
            };

            let swap = self.catalog.identities.compare_and_swap(
                fed_id.as_bytes(),
                Some(&current_bytes[..]),
                replacement,
            )?;
            if swap.is_ok() {
                return Ok(if next.mappings.is_empty() { None } else { Some(next) });
            }
        }
    }

    pub fn lookup_federated(&self, node: &str, uid: u32) -> Result<Option<String>, StoreError> {
        for entry in self.catalog.identities.iter() {
            let (key, value) = entry?;
            let record: IdentityRecord = serde_json::from_slice(&value)?;
            if record.mappings.get(node) == Some(&uid) {
                return Ok(Some(String::from_utf8_lossy(&key).into_owned()));
            }
        }
        Ok(None)
    }

    /// The caller's federated identity on this node, if registered.
    pub fn lookup_federated_by_local(&self, uid: u32) -> Result<Option<String>, StoreError> {
        self.lookup_federated(&self.node_name, uid)
    }

    pub fn identity(&self, fed_id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        self.catalog.identity(fed_id)
    }

    pub fn list_identities(&self) -> Result<Vec<(String, IdentityRecord)>, StoreError> {
        let mut out = Vec::new();
        for entry in self.catalog.identities.iter() {
            let (key, value) = entry?;
            out.push((
                String::from_utf8_lossy(&key).into_owned(),
                serde_json::from_slice(&value)?,
            ));
        }
        Ok(out)
    }
}

fn pattern_matches(
    record: &serde_json::Map<String, serde_json::Value>,
    pattern: &serde_json::Map<String, serde_json::Value>,
) -> bool {
    pattern.iter().all(|(field, wanted)| match record.get(field) {
        None => false,
        Some(actual) if actual == wanted => true,
        Some(serde_json::Value::Array(items)) if !wanted.is_array() && !wanted.is_object() => {
            items.contains(wanted)
        }
        Some(_) => false,
    })
}
