//! The TLS listener: node-to-node infrastructure only, never end users.
//!
//! Client certificates are mandatory and verified against the mesh CA;
//! the certificate subject CN becomes the requesting node's name. The
//! handshake runs on the connection's own task so one slow peer cannot
//! stall the accept loop.

use crate::auth::identity;
use crate::client::{Conn, ConnectionHandler, Peer};
use crate::config::MeshConfig;
use crate::context::ServerContext;
use anyhow::Context as _;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

fn load_certs(path: &Path) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening certificate file {}", path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
    Ok(certs)
}

/// Build the server TLS configuration: our own chain and key, plus a
/// verifier that refuses any peer without a certificate signed by the
/// mesh CA.
pub fn server_config(mesh: &MeshConfig) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    // Idempotent; fails only if a provider is already installed.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let mut roots = RootCertStore::empty();
    for cert in load_certs(&mesh.ca_cert)? {
        roots.add(cert)?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("building client certificate verifier")?;

    let certs = load_certs(&mesh.node_cert)?;
    let mut key_reader = BufReader::new(
        File::open(&mesh.node_key)
            .with_context(|| format!("opening key file {}", mesh.node_key.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .with_context(|| format!("no private key in {}", mesh.node_key.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

pub async fn listen(
    ctx: Arc<ServerContext>,
    tls: Arc<rustls::ServerConfig>,
    port: u16,
    pool: Arc<Semaphore>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("listening for mesh peers on tcp port {port}");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                let Ok(permit) = pool.clone().try_acquire_owned() else {
                    log::warn!("refusing tls connection from {addr}: handler pool exhausted");
                    continue;
                };
                let ctx = ctx.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    handshake_and_serve(acceptor, stream, ctx).await;
                });
            }
        }
    }
    Ok(())
}

async fn handshake_and_serve(acceptor: TlsAcceptor, stream: TcpStream, ctx: Arc<ServerContext>) {
    let peer_addr = stream.peer_addr().ok();
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            log::warn!("tls handshake with {peer_addr:?} failed: {e}");
            return;
        }
    };

    let node = {
        let (_, session) = tls_stream.get_ref();
        let Some(certs) = session.peer_certificates() else {
            // The verifier requires a client certificate; not having one
            // here would be a handshake bug, but never trust it anyway.
            log::warn!("tls peer {peer_addr:?} presented no certificate after handshake");
            return;
        };
        match certs.first().map(|c| identity::certificate_node_name(c)) {
            Some(Ok(node)) => node,
            Some(Err(e)) => {
                log::warn!("rejecting tls peer {peer_addr:?}: {e}");
                return;
            }
            None => return,
        }
    };

    log::debug!("mesh peer {node} connected from {peer_addr:?}");
    ConnectionHandler::new(Conn::Tls(Box::new(tls_stream)), Peer::Node { name: node }, ctx)
        .run()
        .await;
}
