//! Bootstrap and supervision: build the process-global state in one
//! step, run the listeners until shutdown, tear everything down in
//! reverse order, and always leave the socket path clean.

pub mod tls;
pub mod unix;

use crate::auth::token::{ClaimTokens, JwtClaimTokens};
use crate::config::Config;
use crate::context::ServerContext;
use crate::mesh::driver::ReplicationDriver;
use crate::mesh::replicator::{PlacementMap, Replicator};
use crate::mesh::MeshState;
use crate::store::RecordStore;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Build the full server context from configuration. Split out from
/// [`run`] so tests can drive handlers against a real store without
/// binding sockets.
pub fn bootstrap(config: &Config, cancel: &CancellationToken) -> anyhow::Result<Arc<ServerContext>> {
    let node_name = config.node_name();
    let store = Arc::new(RecordStore::open(&config.data_dir, node_name.clone())?);
    let tokens: Arc<dyn ClaimTokens> =
        Arc::new(JwtClaimTokens::load_or_generate(&config.data_dir.join("secret.key"))?);
    let mesh = Arc::new(MeshState::new(node_name, config.mesh.as_ref()));
    let replicator: Arc<dyn Replicator> = Arc::new(PlacementMap::new());

    let driver = if mesh.enabled {
        Some(ReplicationDriver::spawn(
            store.clone(),
            replicator.clone(),
            mesh.clone(),
            cancel.child_token(),
        ))
    } else {
        None
    };

    Ok(Arc::new(ServerContext {
        store,
        tokens,
        mesh,
        replicator,
        driver,
        buffer_cap: config.buffer_cap_bytes,
        idle_timeout: config.idle_timeout_secs.map(Duration::from_secs),
        accept_frame_metadata: config
            .mesh
            .as_ref()
            .map(|m| m.accept_frame_metadata)
            .unwrap_or(false),
        started_at: Instant::now(),
    }))
}

/// Run the daemon until `cancel` fires.
pub async fn run(config: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let ctx = bootstrap(&config, &cancel)?;
    let pool = Arc::new(Semaphore::new(config.max_connections));
    let mut listeners: Vec<JoinHandle<()>> = Vec::new();

    {
        let ctx = ctx.clone();
        let pool = pool.clone();
        let cancel = cancel.clone();
        let path = config.socket_path.clone();
        listeners.push(tokio::spawn(supervise("unix listener", cancel.clone(), move || {
            unix::listen(ctx.clone(), path.clone(), pool.clone(), cancel.clone())
        })));
    }

    if let Some(mesh_config) = &config.mesh {
        // Fail fast on unusable TLS material rather than at first accept.
        let tls_config = tls::server_config(mesh_config)?;
        let port = mesh_config.tls_port;
        let ctx = ctx.clone();
        let pool = pool.clone();
        let cancel = cancel.clone();
        listeners.push(tokio::spawn(supervise("tls listener", cancel.clone(), move || {
            tls::listen(ctx.clone(), tls_config.clone(), port, pool.clone(), cancel.clone())
        })));
    }

    log::info!(
        "cortex daemon up as node {} (mesh {})",
        ctx.mesh.node_name,
        if ctx.mesh.enabled { "enabled" } else { "disabled" },
    );

    cancel.cancelled().await;
    log::info!("shutting down");

    for listener in listeners {
        let _ = listener.await;
    }
    if let Err(e) = ctx.store.flush() {
        log::error!("final store flush failed: {e}");
    }
    if config.socket_path.exists() {
        let _ = std::fs::remove_file(&config.socket_path);
    }
    Ok(())
}

/// Keep a listener alive: a crashed accept loop is restarted after a
/// short backoff, a clean (cancelled) exit ends supervision.
async fn supervise<F, Fut>(name: &'static str, cancel: CancellationToken, mut listener: F)
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match listener().await {
            Ok(()) => break,
            Err(e) => {
                log::error!("{name} failed: {e:#}; restarting");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                }
            }
        }
    }
}
