//! The system tables: table metadata, ACL entries, and federated
//! identities. These three trees replicate to every mesh member so that
//! authorization always resolves locally.

use crate::error::StoreError;
use cortex_lib::permissions::Permissions;
use cortex_lib::scope::NodeScope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const META_TREE: &str = "cortex_meta";
pub const ACL_TREE: &str = "cortex_acls";
pub const IDENTITY_TREE: &str = "cortex_identities";

/// The three system trees, in replication order.
pub const SYSTEM_TREES: [&str; 3] = [META_TREE, ACL_TREE, IDENTITY_TREE];

/// One entry per user table. Exactly one of `owner_uid`/`owner_fed` is
/// set: UID-namespaced tables have a local owner, `@`-namespaced tables a
/// federated one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TableMeta {
    pub owner_uid: Option<u32>,
    pub owner_fed: Option<String>,
    pub key_field: String,
    pub attributes: Vec<String>,
    #[serde(default)]
    pub node_scope: NodeScope,
    pub created_at: i64,
}

impl TableMeta {
    pub fn owner_display(&self) -> String {
        match (&self.owner_uid, &self.owner_fed) {
            (Some(uid), _) => format!("uid:{uid}"),
            (None, Some(fed)) => fed.clone(),
            (None, None) => "unknown".to_owned(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AclEntry {
    pub permissions: Permissions,
}

/// A federated identity: one cross-node name mapped to per-node UIDs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    /// node name -> local uid on that node
    pub mappings: BTreeMap<String, u32>,
    pub created_at: i64,
    pub created_by: String,
    /// Outstanding one-time claim, consumed by `identity_claim`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_jti: Option<String>,
}

pub struct Catalog {
    pub meta: sled::Tree,
    pub acls: sled::Tree,
    pub identities: sled::Tree,
}

impl Catalog {
    pub fn open(db: &sled::Db) -> Result<Catalog, StoreError> {
        let catalog = Catalog {
            meta: db.open_tree(META_TREE)?,
            acls: db.open_tree(ACL_TREE)?,
            identities: db.open_tree(IDENTITY_TREE)?,
        };
        catalog.upgrade_meta_rows()?;
        Ok(catalog)
    }

    /// One-shot upgrade for meta rows written before scopes existed:
    /// anything without a `node_scope` field becomes `local` on disk.
    fn upgrade_meta_rows(&self) -> Result<(), StoreError> {
        for entry in self.meta.iter() {
            let (key, value) = entry?;
            let mut row: serde_json::Value = serde_json::from_slice(&value)?;
            let Some(obj) = row.as_object_mut() else { continue };
            if !obj.contains_key("node_scope") {
                obj.insert("node_scope".to_owned(), serde_json::json!("local"));
                self.meta.insert(key, serde_json::to_vec(&row)?)?;
            }
        }
        Ok(())
    }

    pub fn table_meta(&self, table: &str) -> Result<Option<TableMeta>, StoreError> {
        match self.meta.get(table.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Key of an ACL row. The separator can appear in neither an identity
    /// string nor a table name, both being validated before they get here.
    pub fn acl_key(identity: &str, table: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(identity.len() + 1 + table.len());
        key.extend_from_slice(identity.as_bytes());
        key.push(0);
        key.extend_from_slice(table.as_bytes());
        key
    }

    pub fn split_acl_key(key: &[u8]) -> Option<(String, String)> {
        let sep = key.iter().position(|&b| b == 0)?;
        let identity = std::str::from_utf8(&key[..sep]).ok()?;
        let table = std::str::from_utf8(&key[sep + 1..]).ok()?;
        Some((identity.to_owned(), table.to_owned()))
    }

    /// The permissions `identity` holds on `table`; empty when no row.
    pub fn acl_permissions(&self, identity: &str, table: &str) -> Result<Permissions, StoreError> {
        match self.acls.get(Self::acl_key(identity, table))? {
            Some(bytes) => {
                let entry: AclEntry = serde_json::from_slice(&bytes)?;
                Ok(entry.permissions)
            }
            None => Ok(Permissions::empty()),
        }
    }

    pub fn identity(&self, fed_id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        match self.identities.get(fed_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
