//! End-to-end scenarios at the dispatch layer: real store, real
//! authorization, synthetic peers. Socket-level behavior is covered in
//! `socket.rs`.

use cortex_core::client::message_handlers::dispatch;
use cortex_core::client::Caller;
use cortex_core::server::bootstrap;
use cortex_core::{Config, ServerContext};
use cortex_lib::error::ErrorKind;
use cortex_lib::wire::Request;
use rmpv::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn test_config(tmp: &TempDir) -> Config {
    Config {
        socket_path: tmp.path().join("cortex.sock"),
        data_dir: tmp.path().join("data"),
        ..Config::default()
    }
}

fn test_context(tmp: &TempDir) -> Arc<ServerContext> {
    bootstrap(&test_config(tmp), &CancellationToken::new()).unwrap()
}

async fn call(
    ctx: &Arc<ServerContext>,
    caller: &Caller,
    method: &str,
    params: Vec<Value>,
) -> Result<Value, ErrorKind> {
    dispatch(
        ctx,
        caller,
        Request {
            msgid: 1,
            method: method.into(),
            params,
            metadata: None,
        },
    )
    .await
}

fn record(pairs: &[(&str, Value)]) -> Value {
    Value::Map(
        pairs
            .iter()
            .map(|(k, v)| (Value::from(*k), v.clone()))
            .collect(),
    )
}

fn get_field<'a>(map: &'a Value, field: &str) -> Option<&'a Value> {
    let Value::Map(entries) = map else { return None };
    entries
        .iter()
        .find(|(k, _)| k.as_str() == Some(field))
        .map(|(_, v)| v)
}

#[tokio::test]
async fn local_smoke() {
    let tmp = TempDir::with_prefix("s1").unwrap();
    let ctx = test_context(&tmp);
    let alice = Caller::local(1000);

    assert_eq!(call(&ctx, &alice, "ping", vec![]).await.unwrap(), Value::from("pong"));

    let created = call(
        &ctx,
        &alice,
        "create_table",
        vec![
            Value::from("users"),
            Value::Array(vec![Value::from("id"), Value::from("name")]),
        ],
    )
    .await
    .unwrap();
    assert_eq!(created, Value::from("created"));

    let put = call(
        &ctx,
        &alice,
        "put",
        vec![
            Value::from("users"),
            record(&[("id", Value::from("u1")), ("name", Value::from("alice"))]),
        ],
    )
    .await
    .unwrap();
    assert_eq!(put, Value::from("ok"));

    let got = call(&ctx, &alice, "get", vec![Value::from("users"), Value::from("u1")])
        .await
        .unwrap();
    assert_eq!(get_field(&got, "name"), Some(&Value::from("alice")));

    let hits = call(
        &ctx,
        &alice,
        "match",
        vec![Value::from("users"), record(&[("name", Value::from("alice"))])],
    )
    .await
    .unwrap();
    let Value::Array(hits) = hits else { panic!("match returns an array") };
    assert_eq!(hits.len(), 1);

    let listed = call(&ctx, &alice, "tables", vec![]).await.unwrap();
    assert_eq!(listed, Value::Array(vec![Value::from("users")]));
}

#[tokio::test]
async fn cross_user_isolation_until_granted() {
    let tmp = TempDir::with_prefix("s2").unwrap();
    let ctx = test_context(&tmp);
    let alice = Caller::local(1000);
    let bob = Caller::local(1001);

    call(
        &ctx,
        &alice,
        "create_table",
        vec![Value::from("notes"), Value::Array(vec![Value::from("id")])],
    )
    .await
    .unwrap();
    call(
        &ctx,
        &alice,
        "put",
        vec![Value::from("notes"), record(&[("id", Value::from("k"))])],
    )
    .await
    .unwrap();

    // Bob sees access_denied; his own namespace has no `notes` and
    // Alice's is closed to him.
    let denied = call(&ctx, &bob, "get", vec![Value::from("1000:notes"), Value::from("k")]).await;
    assert_eq!(denied.unwrap_err(), ErrorKind::AccessDenied);

    call(
        &ctx,
        &alice,
        "acl_grant",
        vec![Value::from("uid:1001"), Value::from("notes"), Value::from("read")],
    )
    .await
    .unwrap();

    let got = call(&ctx, &bob, "get", vec![Value::from("1000:notes"), Value::from("k")])
        .await
        .unwrap();
    assert_eq!(get_field(&got, "id"), Some(&Value::from("k")));

    // Read does not confer write.
    let denied = call(
        &ctx,
        &bob,
        "put",
        vec![Value::from("1000:notes"), record(&[("id", Value::from("k2"))])],
    )
    .await;
    assert_eq!(denied.unwrap_err(), ErrorKind::AccessDenied);
}

#[tokio::test]
async fn world_readability() {
    let tmp = TempDir::with_prefix("s3").unwrap();
    let ctx = test_context(&tmp);
    let alice = Caller::local(1000);
    let stranger = Caller::local(2000);

    call(
        &ctx,
        &alice,
        "create_table",
        vec![Value::from("public"), Value::Array(vec![Value::from("id")])],
    )
    .await
    .unwrap();
    call(
        &ctx,
        &alice,
        "put",
        vec![Value::from("public"), record(&[("id", Value::from("x"))])],
    )
    .await
    .unwrap();
    call(
        &ctx,
        &alice,
        "acl_grant",
        vec![Value::from("*"), Value::from("public"), Value::from("read")],
    )
    .await
    .unwrap();

    let got = call(&ctx, &stranger, "get", vec![Value::from("1000:public"), Value::from("x")])
        .await
        .unwrap();
    assert_eq!(get_field(&got, "id"), Some(&Value::from("x")));

    let denied = call(
        &ctx,
        &stranger,
        "put",
        vec![Value::from("1000:public"), record(&[("id", Value::from("y"))])],
    )
    .await;
    assert_eq!(denied.unwrap_err(), ErrorKind::AccessDenied);
}

#[tokio::test]
async fn probe_resistance() {
    let tmp = TempDir::with_prefix("s4").unwrap();
    let ctx = test_context(&tmp);
    let alice = Caller::local(1000);
    let bob = Caller::local(1001);

    call(
        &ctx,
        &alice,
        "create_table",
        vec![Value::from("notes"), Value::Array(vec![Value::from("id")])],
    )
    .await
    .unwrap();

    let existing = call(&ctx, &bob, "get", vec![Value::from("1000:notes"), Value::from("x")])
        .await
        .unwrap_err();
    let missing = call(&ctx, &bob, "get", vec![Value::from("1000:nonexistent"), Value::from("x")])
        .await
        .unwrap_err();
    assert_eq!(existing, missing);
    assert_eq!(existing, ErrorKind::AccessDenied);
}

#[tokio::test]
async fn remote_node_scope_gate() {
    let tmp = TempDir::with_prefix("s6").unwrap();
    let ctx = test_context(&tmp);
    let alice = Caller::local(1000);
    let node_b = Caller::node("beta");

    call(
        &ctx,
        &alice,
        "create_table",
        vec![
            Value::from("pinned"),
            Value::Array(vec![Value::from("id")]),
            Value::from("alpha"),
        ],
    )
    .await
    .unwrap();
    call(
        &ctx,
        &alice,
        "create_table",
        vec![
            Value::from("shared"),
            Value::Array(vec![Value::from("id")]),
            Value::from("all"),
        ],
    )
    .await
    .unwrap();
    call(
        &ctx,
        &alice,
        "put",
        vec![Value::from("shared"), record(&[("id", Value::from("r1"))])],
    )
    .await
    .unwrap();

    // Scoped to node alpha only: beta is outside the list.
    let denied = call(&ctx, &node_b, "all", vec![Value::from("1000:pinned")]).await;
    assert_eq!(denied.unwrap_err(), ErrorKind::AccessDenied);

    // `all` scope: readable by any authenticated mesh peer.
    let rows = call(&ctx, &node_b, "all", vec![Value::from("1000:shared")]).await.unwrap();
    let Value::Array(rows) = rows else { panic!("all returns an array") };
    assert_eq!(rows.len(), 1);

    // `local` tables never leave the node.
    call(
        &ctx,
        &alice,
        "set_scope",
        vec![Value::from("shared"), Value::from("local")],
    )
    .await
    .unwrap();
    let denied = call(&ctx, &node_b, "all", vec![Value::from("1000:shared")]).await;
    assert_eq!(denied.unwrap_err(), ErrorKind::AccessDenied);
}

/// A config pinned to a node name, with a mesh section whose TLS material
/// is never opened at the bootstrap layer.
fn config_as_node(tmp: &TempDir, node: &str) -> Config {
    let mut config = test_config(tmp);
    config.mesh = Some(cortex_core::config::MeshConfig {
        node_name: node.to_owned(),
        tls_port: 0,
        ca_cert: tmp.path().join("ca.pem"),
        node_cert: tmp.path().join("node.pem"),
        node_key: tmp.path().join("node.key"),
        accept_frame_metadata: false,
        nodes: vec![],
    });
    config
}

#[tokio::test]
async fn federation_claim_flow() {
    let tmp = TempDir::with_prefix("s7").unwrap();

    // Node alpha: uid 1000 registers the identity and gets a claim token.
    let cancel_a = CancellationToken::new();
    let token = {
        let ctx = bootstrap(&config_as_node(&tmp, "alpha"), &cancel_a).unwrap();
        let alice_on_a = Caller::local(1000);
        let registered = call(&ctx, &alice_on_a, "identity_register", vec![Value::from("alice")])
            .await
            .unwrap();
        let token = get_field(&registered, "claim_token")
            .and_then(Value::as_str)
            .expect("claim token issued")
            .to_owned();
        ctx.store.flush().unwrap();
        token
        // ctx drops here; the driver is cancelled below so the engine is
        // released for the "other node".
    };
    cancel_a.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Node beta: same replicated state (same data dir and daemon secret,
    // new node name), uid 1001 consumes the claim.
    let ctx = bootstrap(&config_as_node(&tmp, "beta"), &CancellationToken::new()).unwrap();

    let bob_on_b = Caller::local(1001);
    let claimed = call(&ctx, &bob_on_b, "identity_claim", vec![Value::from(token.as_str())])
        .await
        .unwrap();
    let mappings = get_field(&claimed, "mappings").expect("mappings present");
    let Value::Map(mappings) = mappings else { panic!("mappings is a map") };
    assert_eq!(mappings.len(), 2);

    // A second claim of the same token is refused.
    let replay = call(&ctx, &bob_on_b, "identity_claim", vec![Value::from(token.as_str())]).await;
    assert!(replay.is_err());

    // With the federated identity attached, `@` tables work.
    call(
        &ctx,
        &bob_on_b,
        "create_table",
        vec![Value::from("@memories"), Value::Array(vec![Value::from("id")])],
    )
    .await
    .unwrap();
    call(
        &ctx,
        &bob_on_b,
        "put",
        vec![Value::from("@alice:memories"), record(&[("id", Value::from("m1"))])],
    )
    .await
    .unwrap();
    let got = call(
        &ctx,
        &bob_on_b,
        "get",
        vec![Value::from("@alice:memories"), Value::from("m1")],
    )
    .await
    .unwrap();
    assert_eq!(get_field(&got, "id"), Some(&Value::from("m1")));

    // Identity listing shows both mappings.
    let listed = call(&ctx, &bob_on_b, "identity_list", vec![]).await.unwrap();
    let Value::Array(identities) = listed else { panic!("identity_list returns an array") };
    assert_eq!(identities.len(), 1);
}

#[tokio::test]
async fn federated_names_require_identity() {
    let tmp = TempDir::with_prefix("fed-required").unwrap();
    let ctx = test_context(&tmp);
    let nobody = Caller::local(3000);

    let err = call(
        &ctx,
        &nobody,
        "create_table",
        vec![Value::from("@memories"), Value::Array(vec![Value::from("id")])],
    )
    .await
    .unwrap_err();
    assert_eq!(err, ErrorKind::FederatedIdentityRequired);
}

#[tokio::test]
async fn root_bypass_is_local_only() {
    let tmp = TempDir::with_prefix("root").unwrap();
    let ctx = test_context(&tmp);
    let alice = Caller::local(1000);
    let root = Caller::local(0);

    call(
        &ctx,
        &alice,
        "create_table",
        vec![Value::from("notes"), Value::Array(vec![Value::from("id")])],
    )
    .await
    .unwrap();
    call(
        &ctx,
        &alice,
        "put",
        vec![Value::from("notes"), record(&[("id", Value::from("k"))])],
    )
    .await
    .unwrap();

    // Root reads anything without a grant.
    let got = call(&ctx, &root, "get", vec![Value::from("1000:notes"), Value::from("k")])
        .await
        .unwrap();
    assert_eq!(get_field(&got, "id"), Some(&Value::from("k")));

    // A remote claim of uid 0 is just an unmapped remote user.
    let fake_root = Caller {
        peer: cortex_core::client::Peer::Node { name: "beta".into() },
        claimed_uid: Some(0),
    };
    call(
        &ctx,
        &alice,
        "set_scope",
        vec![Value::from("notes"), Value::from("all")],
    )
    .await
    .unwrap();
    let denied = call(&ctx, &fake_root, "get", vec![Value::from("1000:notes"), Value::from("k")]).await;
    assert_eq!(denied.unwrap_err(), ErrorKind::AccessDenied);
}

#[tokio::test]
async fn shape_errors_are_invalid_params() {
    let tmp = TempDir::with_prefix("shapes").unwrap();
    let ctx = test_context(&tmp);
    let alice = Caller::local(1000);

    // Wrong arity.
    let err = call(&ctx, &alice, "get", vec![Value::from("users")]).await.unwrap_err();
    assert_eq!(err, ErrorKind::InvalidParams);

    // Record must be a map.
    call(
        &ctx,
        &alice,
        "create_table",
        vec![Value::from("users"), Value::Array(vec![Value::from("id")])],
    )
    .await
    .unwrap();
    let err = call(&ctx, &alice, "put", vec![Value::from("users"), Value::from("nope")])
        .await
        .unwrap_err();
    assert_eq!(err, ErrorKind::InvalidParams);

    // Missing declared key field.
    let err = call(
        &ctx,
        &alice,
        "put",
        vec![Value::from("users"), record(&[("name", Value::from("x"))])],
    )
    .await
    .unwrap_err();
    assert_eq!(err, ErrorKind::MissingKey);

    // Bad permission CSV.
    let err = call(
        &ctx,
        &alice,
        "acl_grant",
        vec![Value::from("uid:2"), Value::from("users"), Value::from("fly")],
    )
    .await
    .unwrap_err();
    assert_eq!(err, ErrorKind::InvalidPermissions);

    // Unknown methods are denied, not crashed over.
    let err = call(&ctx, &alice, "explode", vec![]).await.unwrap_err();
    assert_eq!(err, ErrorKind::AccessDenied);
}

#[tokio::test]
async fn acl_list_and_status_surfaces() {
    let tmp = TempDir::with_prefix("surfaces").unwrap();
    let ctx = test_context(&tmp);
    let alice = Caller::local(1000);
    let bob = Caller::local(1001);

    call(
        &ctx,
        &alice,
        "create_table",
        vec![Value::from("notes"), Value::Array(vec![Value::from("id")])],
    )
    .await
    .unwrap();
    call(
        &ctx,
        &alice,
        "acl_grant",
        vec![Value::from("uid:1001"), Value::from("notes"), Value::from("read,write")],
    )
    .await
    .unwrap();

    // The owner sees the grant; the grantee sees the row naming them.
    for caller in [&alice, &bob] {
        let rows = call(&ctx, caller, "acl_list", vec![]).await.unwrap();
        let Value::Array(rows) = rows else { panic!("acl_list returns an array") };
        assert_eq!(rows.len(), 1, "visible to {caller:?}");
    }
    // A third party sees nothing.
    let rows = call(&ctx, &Caller::local(9000), "acl_list", vec![]).await.unwrap();
    assert_eq!(rows, Value::Array(vec![]));

    let status = call(&ctx, &alice, "status", vec![]).await.unwrap();
    assert_eq!(get_field(&status, "status"), Some(&Value::from("running")));
    assert_eq!(get_field(&status, "tables"), Some(&Value::from(1u64)));

    let info = call(&ctx, &alice, "table_info", vec![Value::from("notes")]).await.unwrap();
    assert_eq!(get_field(&info, "owner"), Some(&Value::from("uid:1000")));
    assert_eq!(get_field(&info, "key_field"), Some(&Value::from("id")));

    let scope = call(&ctx, &alice, "get_scope", vec![Value::from("notes")]).await.unwrap();
    assert_eq!(scope, Value::from("local"));
}

#[tokio::test]
async fn drop_table_cascades_and_recreate_works() {
    let tmp = TempDir::with_prefix("drop").unwrap();
    let ctx = test_context(&tmp);
    let alice = Caller::local(1000);

    call(
        &ctx,
        &alice,
        "create_table",
        vec![Value::from("notes"), Value::Array(vec![Value::from("id")])],
    )
    .await
    .unwrap();
    call(
        &ctx,
        &alice,
        "acl_grant",
        vec![Value::from("uid:1001"), Value::from("notes"), Value::from("read")],
    )
    .await
    .unwrap();
    call(
        &ctx,
        &alice,
        "put",
        vec![Value::from("notes"), record(&[("id", Value::from("k"))])],
    )
    .await
    .unwrap();

    assert_eq!(
        call(&ctx, &alice, "drop_table", vec![Value::from("notes")]).await.unwrap(),
        Value::from("dropped")
    );
    let rows = call(&ctx, &alice, "acl_list", vec![]).await.unwrap();
    assert_eq!(rows, Value::Array(vec![]));

    // create -> drop -> create succeeds and starts empty.
    call(
        &ctx,
        &alice,
        "create_table",
        vec![Value::from("notes"), Value::Array(vec![Value::from("id")])],
    )
    .await
    .unwrap();
    let keys = call(&ctx, &alice, "keys", vec![Value::from("notes")]).await.unwrap();
    assert_eq!(keys, Value::Array(vec![]));
}
