//! Frame dispatch: a fixed table of method handlers, each validating its
//! parameter shape before touching the store. Store and authorization
//! failures collapse onto the wire error taxonomy here; nothing else
//! escapes to the connection loop.

use crate::auth::token::Claim;
use crate::auth::{authorize, Operation, Subject};
use crate::client::Caller;
use crate::context::ServerContext;
use crate::error::StoreError;
use crate::store::record_store::TableOwner;
use crate::store::TableMeta;
use crate::util::asyncify;
use cortex_lib::error::ErrorKind;
use cortex_lib::name::{display_name, resolve_table_name};
use cortex_lib::permissions::Permissions;
use cortex_lib::scope::NodeScope;
use cortex_lib::value::{from_json, key_string, to_json};
use cortex_lib::wire::Request;
use rmpv::Value;
use std::sync::Arc;

/// Serve one request frame. Always yields a value or a wire error kind;
/// panics inside store code are contained by `asyncify`.
pub async fn dispatch(ctx: &Arc<ServerContext>, caller: &Caller, req: Request) -> Result<Value, ErrorKind> {
    let method = req.method.clone();
    match method.as_str() {
        "ping" => {
            expect_arity(&req.params, 0)?;
            Ok(Value::from("pong"))
        }
        "status" => {
            expect_arity(&req.params, 0)?;
            let ctx = ctx.clone();
            asyncify(move || {
                Ok(json_result(serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "status": "running",
                    "node": ctx.store.node_name(),
                    "tables": ctx.store.table_count(),
                    "uptime_secs": ctx.uptime_secs(),
                })))
            })
            .await
        }
        _ => {
            let ctx = ctx.clone();
            let caller = caller.clone();
            asyncify(move || dispatch_store(&ctx, &caller, req)).await
        }
    }
}

fn dispatch_store(ctx: &ServerContext, caller: &Caller, req: Request) -> Result<Value, ErrorKind> {
    let store = &ctx.store;
    let subject = Subject::resolve(store, caller).map_err(|e| e.kind())?;
    let params = &req.params;

    match req.method.as_str() {
        "tables" => {
            expect_arity(params, 0)?;
            handle_tables(ctx, &subject)
        }
        "create_table" => handle_create_table(ctx, &subject, params),
        "drop_table" => {
            expect_arity(params, 1)?;
            let (internal, _) = resolve_existing(ctx, &subject, str_param(params, 0)?, Operation::DropTable)?;
            store.drop_table(&internal).map_err(|e| e.kind())?;
            Ok(Value::from("dropped"))
        }
        "put" => {
            expect_arity(params, 2)?;
            let (internal, meta) = resolve_existing(ctx, &subject, str_param(params, 0)?, Operation::Put)?;
            let record = map_param(params, 1)?;
            store.put(&internal, &meta, record).map_err(|e| e.kind())?;
            Ok(Value::from("ok"))
        }
        "get" => {
            expect_arity(params, 2)?;
            let (internal, _) = resolve_existing(ctx, &subject, str_param(params, 0)?, Operation::Get)?;
            let key = key_param(params, 1)?;
            let record = store.get(&internal, &key).map_err(|e| e.kind())?;
            Ok(from_json(&record))
        }
        "delete" => {
            expect_arity(params, 2)?;
            let (internal, _) = resolve_existing(ctx, &subject, str_param(params, 0)?, Operation::Delete)?;
            let key = key_param(params, 1)?;
            store.delete(&internal, &key).map_err(|e| e.kind())?;
            Ok(Value::from("ok"))
        }
        "match" => {
            expect_arity(params, 2)?;
            let (internal, _) = resolve_existing(ctx, &subject, str_param(params, 0)?, Operation::Match)?;
            let pattern = map_param(params, 1)?;
            let records = store.match_records(&internal, &pattern).map_err(|e| e.kind())?;
            Ok(Value::Array(records.iter().map(from_json).collect()))
        }
        "all" => {
            expect_arity(params, 1)?;
            let (internal, _) = resolve_existing(ctx, &subject, str_param(params, 0)?, Operation::All)?;
            let records = store.all(&internal).map_err(|e| e.kind())?;
            Ok(Value::Array(records.iter().map(from_json).collect()))
        }
        "keys" => {
            expect_arity(params, 1)?;
            let (internal, _) = resolve_existing(ctx, &subject, str_param(params, 0)?, Operation::Keys)?;
            let keys = store.keys(&internal).map_err(|e| e.kind())?;
            Ok(Value::Array(keys.into_iter().map(Value::from).collect()))
        }
        "acl_grant" => {
            expect_arity(params, 3)?;
            let identity = str_param(params, 0)?.to_owned();
            let (internal, _) = resolve_existing(ctx, &subject, str_param(params, 1)?, Operation::AclGrant)?;
            let perms = perms_param(params, 2)?;
            if perms.is_empty() {
                return Err(ErrorKind::InvalidPermissions);
            }
            store.acl_grant(&identity, &internal, perms).map_err(|e| e.kind())?;
            Ok(Value::from("granted"))
        }
        "acl_revoke" => {
            expect_arity(params, 3)?;
            let identity = str_param(params, 0)?.to_owned();
            let (internal, _) = resolve_existing(ctx, &subject, str_param(params, 1)?, Operation::AclRevoke)?;
            let perms = perms_param(params, 2)?;
            store.acl_revoke(&identity, &internal, perms).map_err(|e| e.kind())?;
            Ok(Value::from("revoked"))
        }
        "acl_list" => {
            expect_arity(params, 0)?;
            handle_acl_list(ctx, &subject)
        }
        "get_scope" => {
            expect_arity(params, 1)?;
            let (_, meta) = resolve_existing(ctx, &subject, str_param(params, 0)?, Operation::GetScope)?;
            Ok(Value::from(meta.node_scope.to_wire()))
        }
        "set_scope" => {
            expect_arity(params, 2)?;
            let (internal, _) = resolve_existing(ctx, &subject, str_param(params, 0)?, Operation::SetScope)?;
            let scope = scope_param(params, 1)?;
            store.set_scope(&internal, scope).map_err(|e| e.kind())?;
            Ok(Value::from("ok"))
        }
        "table_info" => {
            expect_arity(params, 1)?;
            let (internal, meta) = resolve_existing(ctx, &subject, str_param(params, 0)?, Operation::TableInfo)?;
            Ok(table_info_value(&internal, &meta))
        }
        "identity_register" => {
            expect_arity(params, 1)?;
            handle_identity_register(ctx, &subject, str_param(params, 0)?)
        }
        "identity_claim" => {
            expect_arity(params, 1)?;
            handle_identity_claim(ctx, &subject, str_param(params, 0)?)
        }
        "identity_list" => {
            expect_arity(params, 0)?;
            let rows = store.list_identities().map_err(|e| e.kind())?;
            Ok(Value::Array(
                rows.iter().map(|(fed, record)| identity_value(fed, record)).collect(),
            ))
        }
        "identity_revoke" => handle_identity_revoke(ctx, &subject, params),
        "mesh_list_nodes" => {
            expect_arity(params, 0)?;
            Ok(Value::Array(
                ctx.mesh
                    .members()
                    .into_iter()
                    .map(|m| {
                        json_result(serde_json::json!({
                            "name": m.name,
                            "host": m.host,
                            "port": m.port,
                            "status": m.status.as_str(),
                        }))
                    })
                    .collect(),
            ))
        }
        "mesh_status" => {
            expect_arity(params, 0)?;
            let members = ctx.mesh.members();
            let up = members
                .iter()
                .filter(|m| m.status == crate::mesh::NodeStatus::Up)
                .count();
            Ok(json_result(serde_json::json!({
                "enabled": ctx.mesh.enabled,
                "node": ctx.mesh.node_name,
                "members": members.len(),
                "members_up": up,
            })))
        }
        "sync_status" => {
            expect_arity(params, 0)?;
            handle_sync_status(ctx, &subject)
        }
        "sync_status_table" => {
            expect_arity(params, 1)?;
            let (internal, meta) =
                resolve_existing(ctx, &subject, str_param(params, 0)?, Operation::TableInfo)?;
            Ok(sync_status_value(ctx, &internal, &meta))
        }
        "sync_repair" => {
            expect_arity(params, 1)?;
            let (internal, _) = resolve_existing(ctx, &subject, str_param(params, 0)?, Operation::SyncRepair)?;
            if let Some(driver) = &ctx.driver {
                driver.repair(internal);
            }
            Ok(Value::from("ok"))
        }
        other => {
            log::warn!("unknown method `{other}` from {}", caller.peer.describe());
            Err(ErrorKind::AccessDenied)
        }
    }
}

// ----------------------------------------------------------------------
// Method bodies that are more than a few lines
// ----------------------------------------------------------------------

fn handle_tables(ctx: &ServerContext, subject: &Subject) -> Result<Value, ErrorKind> {
    let entries = ctx.store.meta_entries().map_err(|e| e.kind())?;
    let mut names: Vec<String> = if subject.root {
        entries.into_iter().map(|(name, _)| name).collect()
    } else if let Some(node) = &subject.node {
        entries
            .into_iter()
            .filter(|(_, meta)| meta.node_scope.includes(node))
            .map(|(name, _)| name)
            .collect()
    } else {
        entries
            .into_iter()
            .filter(|(name, _)| {
                let own_uid = subject
                    .uid
                    .map(|uid| name.starts_with(&format!("{uid}:")))
                    .unwrap_or(false);
                let own_fed = subject
                    .fed
                    .as_ref()
                    .map(|fed| name.starts_with(&format!("@{fed}:")))
                    .unwrap_or(false);
                own_uid || own_fed
            })
            .map(|(name, _)| display_name(&name, subject.uid))
            .collect()
    };
    names.sort();
    Ok(Value::Array(names.into_iter().map(Value::from).collect()))
}

fn handle_create_table(ctx: &ServerContext, subject: &Subject, params: &[Value]) -> Result<Value, ErrorKind> {
    if params.len() != 2 && params.len() != 3 {
        return Err(ErrorKind::InvalidParams);
    }
    let raw = str_param(params, 0)?;
    let attrs = attrs_param(params, 1)?;
    let scope = if params.len() == 3 {
        scope_param(params, 2)?
    } else {
        NodeScope::Local
    };

    let resolved = resolve_table_name(raw, subject.uid, subject.fed.as_deref())
        .map_err(|e| StoreError::from(e).kind())?;
    if !resolved.own_namespace && !subject.root {
        return Err(StoreError::ForeignNamespace(resolved.internal).kind());
    }
    let owner = parse_owner(&resolved.internal)?;
    ctx.store
        .create_table(owner, &resolved.internal, attrs, scope)
        .map_err(|e| e.kind())?;
    Ok(Value::from("created"))
}

fn handle_acl_list(ctx: &ServerContext, subject: &Subject) -> Result<Value, ErrorKind> {
    let entries = ctx.store.acl_entries().map_err(|e| e.kind())?;
    let mut rows = Vec::new();
    for (identity, table, perms) in entries {
        if !subject.root && !acl_row_visible(ctx, subject, &identity, &table)? {
            continue;
        }
        rows.push(json_result(serde_json::json!({
            "identity": identity,
            "table": table,
            "permissions": perms.names(),
        })));
    }
    Ok(Value::Array(rows))
}

/// A row is visible to whoever it names and to anyone with admin power
/// over its table.
fn acl_row_visible(
    ctx: &ServerContext,
    subject: &Subject,
    identity: &str,
    table: &str,
) -> Result<bool, ErrorKind> {
    if let Some(uid) = subject.uid {
        if identity == format!("uid:{uid}") {
            return Ok(true);
        }
    }
    if let Some(fed) = &subject.fed {
        if identity == fed {
            return Ok(true);
        }
    }
    let meta = ctx.store.table_meta(table).map_err(|e| e.kind())?;
    match meta {
        Some(meta) => Ok(authorize(&ctx.store, subject, table, Some(&meta), Operation::AclGrant).is_ok()),
        None => Ok(false),
    }
}

fn handle_identity_register(ctx: &ServerContext, subject: &Subject, fed_id: &str) -> Result<Value, ErrorKind> {
    // Identity management is a local-user action; nodes replicate the
    // results but never originate them over the wire.
    let (Some(uid), None) = (subject.uid, &subject.node) else {
        return Err(ErrorKind::AccessDenied);
    };
    let jti = crate::auth::token::new_jti();
    let record = ctx
        .store
        .register_identity(fed_id, uid, jti.clone())
        .map_err(|e| e.kind())?;
    let token = ctx
        .tokens
        .issue(&Claim {
            fed_id: fed_id.to_owned(),
            jti,
        })
        .map_err(|e| {
            log::error!("claim token issue failed: {e}");
            ErrorKind::Internal
        })?;

    let mut value = identity_value(fed_id, &record);
    if let Value::Map(entries) = &mut value {
        entries.push((Value::from("claim_token"), Value::from(token)));
    }
    Ok(value)
}

fn handle_identity_claim(ctx: &ServerContext, subject: &Subject, token: &str) -> Result<Value, ErrorKind> {
    let (Some(uid), None) = (subject.uid, &subject.node) else {
        return Err(ErrorKind::AccessDenied);
    };
    let claim = ctx.tokens.verify(token).map_err(|_| ErrorKind::Unauthorized)?;
    let record = ctx
        .store
        .claim_identity(&claim.fed_id, &claim.jti, uid)
        .map_err(|e| e.kind())?;
    Ok(identity_value(&claim.fed_id, &record))
}

fn handle_identity_revoke(ctx: &ServerContext, subject: &Subject, params: &[Value]) -> Result<Value, ErrorKind> {
    if params.len() != 1 && params.len() != 2 {
        return Err(ErrorKind::InvalidParams);
    }
    if subject.node.is_some() {
        return Err(ErrorKind::AccessDenied);
    }
    let fed_id = str_param(params, 0)?;
    let node = if params.len() == 2 {
        str_param(params, 1)?.to_owned()
    } else {
        ctx.store.node_name().to_owned()
    };
    // Only the identity itself (or root) may shrink it.
    if !subject.root && subject.fed.as_deref() != Some(fed_id) {
        return Err(ErrorKind::AccessDenied);
    }
    ctx.store.revoke_identity(fed_id, &node).map_err(|e| e.kind())?;
    Ok(Value::from("revoked"))
}

fn handle_sync_status(ctx: &ServerContext, subject: &Subject) -> Result<Value, ErrorKind> {
    let entries = ctx.store.meta_entries().map_err(|e| e.kind())?;
    let mut rows = Vec::new();
    for (table, meta) in entries {
        if meta.node_scope == NodeScope::Local {
            continue;
        }
        let visible = subject.root
            || match &subject.node {
                Some(node) => meta.node_scope.includes(node),
                None => authorize(&ctx.store, subject, &table, Some(&meta), Operation::TableInfo).is_ok(),
            };
        if visible {
            rows.push(sync_status_value(ctx, &table, &meta));
        }
    }
    Ok(Value::Array(rows))
}

// ----------------------------------------------------------------------
// Shared plumbing
// ----------------------------------------------------------------------

/// Resolve a wire name and run both authorization gates for `op`.
/// Missing tables come back as `access_denied`, indistinguishable from
/// lack of access.
fn resolve_existing(
    ctx: &ServerContext,
    subject: &Subject,
    raw: &str,
    op: Operation,
) -> Result<(String, TableMeta), ErrorKind> {
    let resolved = resolve_table_name(raw, subject.uid, subject.fed.as_deref())
        .map_err(|e| StoreError::from(e).kind())?;
    let meta = ctx.store.table_meta(&resolved.internal).map_err(|e| e.kind())?;
    authorize(&ctx.store, subject, &resolved.internal, meta.as_ref(), op).map_err(|e| e.kind())?;
    let meta = meta.ok_or(ErrorKind::AccessDenied)?;
    Ok((resolved.internal, meta))
}

fn parse_owner(internal: &str) -> Result<TableOwner, ErrorKind> {
    if let Some(rest) = internal.strip_prefix('@') {
        let (fed, _) = rest.split_once(':').ok_or(ErrorKind::InvalidParams)?;
        return Ok(TableOwner::Fed(fed.to_owned()));
    }
    let (uid, _) = internal.split_once(':').ok_or(ErrorKind::InvalidParams)?;
    let uid = uid.parse().map_err(|_| ErrorKind::InvalidParams)?;
    Ok(TableOwner::Uid(uid))
}

fn expect_arity(params: &[Value], n: usize) -> Result<(), ErrorKind> {
    if params.len() == n {
        Ok(())
    } else {
        Err(ErrorKind::InvalidParams)
    }
}

fn str_param(params: &[Value], index: usize) -> Result<&str, ErrorKind> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or(ErrorKind::InvalidParams)
}

fn key_param(params: &[Value], index: usize) -> Result<String, ErrorKind> {
    params
        .get(index)
        .and_then(key_string)
        .ok_or(ErrorKind::InvalidParams)
}

fn map_param(
    params: &[Value],
    index: usize,
) -> Result<serde_json::Map<String, serde_json::Value>, ErrorKind> {
    let value = params.get(index).ok_or(ErrorKind::InvalidParams)?;
    if !matches!(value, Value::Map(_)) {
        return Err(ErrorKind::InvalidParams);
    }
    match to_json(value).map_err(|_| ErrorKind::InvalidParams)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(ErrorKind::InvalidParams),
    }
}

fn attrs_param(params: &[Value], index: usize) -> Result<Vec<String>, ErrorKind> {
    let Some(Value::Array(items)) = params.get(index) else {
        return Err(ErrorKind::InvalidParams);
    };
    items
        .iter()
        .map(|item| item.as_str().map(str::to_owned).ok_or(ErrorKind::InvalidParams))
        .collect()
}

fn perms_param(params: &[Value], index: usize) -> Result<Permissions, ErrorKind> {
    Permissions::parse_csv(str_param(params, index)?).map_err(|_| ErrorKind::InvalidPermissions)
}

fn scope_param(params: &[Value], index: usize) -> Result<NodeScope, ErrorKind> {
    NodeScope::parse_wire(str_param(params, index)?).map_err(|_| ErrorKind::InvalidParams)
}

fn json_result(value: serde_json::Value) -> Value {
    from_json(&value)
}

fn table_info_value(internal: &str, meta: &TableMeta) -> Value {
    json_result(serde_json::json!({
        "name": internal,
        "owner": meta.owner_display(),
        "key_field": meta.key_field,
        "attributes": meta.attributes,
        "node_scope": meta.node_scope,
    }))
}

fn identity_value(fed_id: &str, record: &crate::store::IdentityRecord) -> Value {
    json_result(serde_json::json!({
        "identity": fed_id,
        "mappings": record.mappings,
        "created_at": record.created_at,
        "created_by": record.created_by,
    }))
}

fn sync_status_value(ctx: &ServerContext, table: &str, meta: &TableMeta) -> Value {
    json_result(serde_json::json!({
        "table": table,
        "scope": meta.node_scope,
        "replicas": ctx.replicator.replicas(table),
    }))
}
