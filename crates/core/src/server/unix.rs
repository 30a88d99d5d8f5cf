//! The Unix-socket listener: the daemon's primary, local-only surface.

use crate::auth::identity;
use crate::client::{Conn, ConnectionHandler, Peer};
use crate::context::ServerContext;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Bind the socket, replacing any stale file from a previous run. The
/// wide mode is deliberate: access policy lives in the ACL layer, not in
/// filesystem permissions.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let listener = UnixListener::bind(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    }
    Ok(listener)
}

/// Accept until cancelled. An `Err` return means the listener itself
/// failed; the supervisor rebinds and restarts it.
pub async fn listen(
    ctx: Arc<ServerContext>,
    path: std::path::PathBuf,
    pool: Arc<Semaphore>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = bind(&path)?;
    log::info!("listening on unix socket {}", path.display());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                spawn_handler(stream, &ctx, &pool);
            }
        }
    }
    Ok(())
}

fn spawn_handler(stream: UnixStream, ctx: &Arc<ServerContext>, pool: &Arc<Semaphore>) {
    // At saturation the socket is refused outright (dropped, which
    // closes it); accepted work is never queued without bound.
    let Ok(permit) = pool.clone().try_acquire_owned() else {
        log::warn!("refusing unix connection: handler pool exhausted");
        return;
    };

    // Identity comes from the kernel exactly once, before any protocol
    // bytes are read.
    let uid = match identity::peer_uid(&stream) {
        Ok(uid) => uid,
        Err(e) => {
            log::warn!("dropping unix connection without peer credentials: {e}");
            return;
        }
    };

    let ctx = ctx.clone();
    tokio::spawn(async move {
        let _permit = permit;
        ConnectionHandler::new(Conn::Unix(stream), Peer::Local { uid }, ctx)
            .run()
            .await;
    });
}
