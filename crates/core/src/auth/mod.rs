//! Authorization: the two-gate check run for every dispatched operation.
//!
//! Gate one is node scope (may this *machine* see the table at all);
//! gate two is identity (may this *caller* perform the operation).
//! Local root skips both. The answer for a table that does not exist is
//! the same `access_denied` as for one the caller may not touch, so the
//! catalog cannot be probed.

pub mod identity;
pub mod token;

use crate::client::Caller;
use crate::error::{AuthError, StoreError};
use crate::store::{RecordStore, TableMeta};
use cortex_lib::permissions::Permissions;

/// Store operations as the identity gate sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Match,
    All,
    Keys,
    GetScope,
    TableInfo,
    Put,
    Delete,
    AclGrant,
    AclRevoke,
    DropTable,
    SetScope,
    SyncRepair,
}

impl Operation {
    pub fn required_permission(self) -> Permissions {
        match self {
            Operation::Get
            | Operation::Match
            | Operation::All
            | Operation::Keys
            | Operation::GetScope
            | Operation::TableInfo => Permissions::READ,
            Operation::Put | Operation::Delete => Permissions::WRITE,
            Operation::AclGrant
            | Operation::AclRevoke
            | Operation::DropTable
            | Operation::SetScope
            | Operation::SyncRepair => Permissions::ADMIN,
        }
    }
}

/// The effective identity of one request, derived from the connection
/// peer and the catalog. Computed per frame so that a freshly claimed or
/// revoked federated identity takes effect immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Local UID; `None` for requests arriving over TLS.
    pub uid: Option<u32>,
    /// Federated identity, when one maps to this caller.
    pub fed: Option<String>,
    /// Requesting node; `None` for the local transport.
    pub node: Option<String>,
    /// UID 0 over the local transport.
    pub root: bool,
    /// A mesh peer acting as replication infrastructure rather than on
    /// behalf of a user. Passes the identity gate; the node-scope gate
    /// still applies in full.
    pub infrastructure: bool,
}

impl Subject {
    /// Resolve a caller against the identity catalog.
    pub fn resolve(store: &RecordStore, caller: &Caller) -> Result<Subject, StoreError> {
        match &caller.peer {
            crate::client::Peer::Local { uid } => Ok(Subject {
                uid: Some(*uid),
                fed: store.lookup_federated_by_local(*uid)?,
                node: None,
                root: *uid == 0,
                infrastructure: false,
            }),
            crate::client::Peer::Node { name } => {
                let fed = match caller.claimed_uid {
                    Some(uid) => store.lookup_federated(name, uid)?,
                    None => None,
                };
                Ok(Subject {
                    uid: None,
                    fed,
                    node: Some(name.clone()),
                    root: false,
                    // A claimed origin UID turns the request into a user
                    // request; it must then carry a resolvable identity.
                    infrastructure: caller.claimed_uid.is_none(),
                })
            }
        }
    }

    /// The ACL identity strings this subject may match, in lookup order.
    /// The world entry `*` is always consulted last by the gate itself.
    fn acl_identities(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(uid) = self.uid {
            out.push(format!("uid:{uid}"));
        }
        if let Some(fed) = &self.fed {
            out.push(fed.clone());
        }
        out
    }

    fn owns(&self, meta: &TableMeta) -> bool {
        if let (Some(uid), Some(owner)) = (self.uid, meta.owner_uid) {
            if uid == owner {
                return true;
            }
        }
        matches!((&self.fed, &meta.owner_fed), (Some(f), Some(o)) if f == o)
    }
}

/// The full check. `meta` is `None` when the table has no catalog entry;
/// that case denies uniformly (after the root bypass) so existence never
/// leaks.
pub fn authorize(
    store: &RecordStore,
    subject: &Subject,
    table: &str,
    meta: Option<&TableMeta>,
    op: Operation,
) -> Result<(), AuthError> {
    if subject.root && subject.node.is_none() {
        return Ok(());
    }

    let Some(meta) = meta else {
        return Err(AuthError::Denied);
    };

    // Gate one: node scope.
    if let Some(node) = &subject.node {
        if !meta.node_scope.includes(node) {
            log::debug!("scope gate denied {} on {table}", node);
            return Err(AuthError::Denied);
        }
    }

    // Gate two: identity.
    if subject.infrastructure {
        // A mesh peer inside the table's scope replicates it wholesale.
        return Ok(());
    }
    if subject.owns(meta) {
        return Ok(());
    }

    let needed = op.required_permission();
    for identity in subject.acl_identities() {
        if store.acl_check(&identity, table, needed)? {
            return Ok(());
        }
    }
    if store.acl_check("*", table, needed)? {
        return Ok(());
    }

    Err(AuthError::Denied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record_store::TableOwner;
    use cortex_lib::scope::NodeScope;
    use tempfile::TempDir;

    fn store() -> (TempDir, RecordStore) {
        let tmp = TempDir::with_prefix("auth").unwrap();
        let store = RecordStore::open(tmp.path(), "alpha".to_owned()).unwrap();
        (tmp, store)
    }

    fn make_table(store: &RecordStore, scope: NodeScope) -> TableMeta {
        store
            .create_table(TableOwner::Uid(1000), "1000:notes", vec!["id".into()], scope)
            .unwrap();
        store.table_meta("1000:notes").unwrap().unwrap()
    }

    fn local_subject(store: &RecordStore, uid: u32) -> Subject {
        Subject::resolve(store, &Caller::local(uid)).unwrap()
    }

    #[test]
    fn owner_has_full_rights() {
        let (_tmp, store) = store();
        let meta = make_table(&store, NodeScope::Local);
        let owner = local_subject(&store, 1000);
        for op in [Operation::Get, Operation::Put, Operation::DropTable, Operation::AclGrant] {
            authorize(&store, &owner, "1000:notes", Some(&meta), op).unwrap();
        }
    }

    #[test]
    fn stranger_is_denied_until_granted() {
        let (_tmp, store) = store();
        let meta = make_table(&store, NodeScope::Local);
        let stranger = local_subject(&store, 1001);

        let denied = authorize(&store, &stranger, "1000:notes", Some(&meta), Operation::Get);
        assert!(matches!(denied, Err(AuthError::Denied)));

        store.acl_grant("uid:1001", "1000:notes", Permissions::READ).unwrap();
        authorize(&store, &stranger, "1000:notes", Some(&meta), Operation::Get).unwrap();

        // Read does not imply write.
        let denied = authorize(&store, &stranger, "1000:notes", Some(&meta), Operation::Put);
        assert!(matches!(denied, Err(AuthError::Denied)));
    }

    #[test]
    fn world_grant_applies_to_anyone() {
        let (_tmp, store) = store();
        let meta = make_table(&store, NodeScope::Local);
        store.acl_grant("*", "1000:notes", Permissions::READ).unwrap();

        let anyone = local_subject(&store, 2000);
        authorize(&store, &anyone, "1000:notes", Some(&meta), Operation::Get).unwrap();
        let denied = authorize(&store, &anyone, "1000:notes", Some(&meta), Operation::Put);
        assert!(matches!(denied, Err(AuthError::Denied)));
    }

    #[test]
    fn local_root_bypasses_everything_remote_root_does_not() {
        let (_tmp, store) = store();
        let meta = make_table(&store, NodeScope::Local);

        let root = local_subject(&store, 0);
        authorize(&store, &root, "1000:notes", Some(&meta), Operation::DropTable).unwrap();
        // Even a missing table is fine for local root short of the store
        // reporting it missing later.
        authorize(&store, &root, "1000:ghost", None, Operation::Get).unwrap();

        // A node claiming uid 0 gets no bypass and fails the scope gate.
        let remote = Subject::resolve(
            &store,
            &Caller {
                peer: crate::client::Peer::Node { name: "beta".into() },
                claimed_uid: Some(0),
            },
        )
        .unwrap();
        assert!(!remote.root);
        let denied = authorize(&store, &remote, "1000:notes", Some(&meta), Operation::Get);
        assert!(matches!(denied, Err(AuthError::Denied)));
    }

    #[test]
    fn scope_gate_for_nodes() {
        let (_tmp, store) = store();
        let meta = make_table(&store, NodeScope::Nodes(vec!["beta".into()]));
        let beta = Subject::resolve(&store, &Caller::node("beta")).unwrap();
        let gamma = Subject::resolve(&store, &Caller::node("gamma")).unwrap();

        authorize(&store, &beta, "1000:notes", Some(&meta), Operation::Get).unwrap();
        assert!(matches!(
            authorize(&store, &gamma, "1000:notes", Some(&meta), Operation::Get),
            Err(AuthError::Denied)
        ));

        // `local` scope shuts out every remote requester.
        store.set_scope("1000:notes", NodeScope::Local).unwrap();
        let meta = store.table_meta("1000:notes").unwrap().unwrap();
        assert!(matches!(
            authorize(&store, &beta, "1000:notes", Some(&meta), Operation::Get),
            Err(AuthError::Denied)
        ));
    }

    #[test]
    fn missing_table_denies_uniformly() {
        let (_tmp, store) = store();
        let subject = local_subject(&store, 1001);
        let denied = authorize(&store, &subject, "1000:ghost", None, Operation::Get);
        assert!(matches!(denied, Err(AuthError::Denied)));
    }

    #[test]
    fn claimed_uid_resolves_to_federated_subject() {
        let (_tmp, store) = store();
        store.register_identity("alice", 1000, "jti".into()).unwrap();

        let caller = Caller {
            peer: crate::client::Peer::Node { name: "alpha".into() },
            claimed_uid: Some(1000),
        };
        let subject = Subject::resolve(&store, &caller).unwrap();
        assert_eq!(subject.fed.as_deref(), Some("alice"));
        assert!(!subject.infrastructure);

        // An unmapped claim stays identity-less and gets denied.
        let caller = Caller {
            peer: crate::client::Peer::Node { name: "alpha".into() },
            claimed_uid: Some(4444),
        };
        let subject = Subject::resolve(&store, &caller).unwrap();
        assert!(subject.fed.is_none());
        let meta = make_table(&store, NodeScope::All);
        assert!(matches!(
            authorize(&store, &subject, "1000:notes", Some(&meta), Operation::Get),
            Err(AuthError::Denied)
        ));
    }
}
