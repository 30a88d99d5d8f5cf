//! Per-connection state machine.
//!
//! Identity is resolved once, before the first byte of protocol data is
//! read, and never changes. After that the handler loops: read a chunk,
//! grow the buffer, drain every complete frame in order, answer each.
//! Framing faults and cap breaches close the connection; everything else
//! is answered and the connection lives on.

use crate::client::message_handlers::dispatch;
use crate::client::{Caller, Peer};
use crate::context::ServerContext;
use cortex_lib::buffer::FrameBuffer;
use cortex_lib::error::ErrorKind;
use cortex_lib::wire::{encode_error, encode_result, Request};
use rmpv::Value;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::server::TlsStream;

const READ_CHUNK: usize = 16 * 1024;

/// The two transports a handler serves, as a tagged variant rather than a
/// type parameter; the variance is narrow and stable.
pub enum Conn {
    Unix(UnixStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Conn {
    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Unix(stream) => stream.read(buf).await,
            Conn::Tls(stream) => stream.read(buf).await,
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Conn::Unix(stream) => stream.write_all(bytes).await,
            Conn::Tls(stream) => stream.write_all(bytes).await,
        }
    }
}

pub struct ConnectionHandler {
    conn: Conn,
    peer: Peer,
    buffer: FrameBuffer,
    ctx: Arc<ServerContext>,
}

impl ConnectionHandler {
    pub fn new(conn: Conn, peer: Peer, ctx: Arc<ServerContext>) -> ConnectionHandler {
        ConnectionHandler {
            conn,
            peer,
            buffer: FrameBuffer::new(ctx.buffer_cap),
            ctx,
        }
    }

    pub async fn run(mut self) {
        log::debug!("serving connection from {}", self.peer.describe());
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = match self.read_chunk(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    log::debug!("read from {} failed: {e}", self.peer.describe());
                    break;
                }
            };
            if let Err(e) = self.buffer.extend(&chunk[..n]) {
                // Cap breach: close immediately, dispatch nothing further.
                log::warn!("{} exceeded receive buffer: {e}", self.peer.describe());
                break;
            }
            if self.drain_frames().await.is_err() {
                break;
            }
        }
        log::debug!("connection from {} closed", self.peer.describe());
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.ctx.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.conn.read_some(buf)).await {
                Ok(result) => result,
                Err(_) => {
                    log::debug!("{} idle past {limit:?}", self.peer.describe());
                    Ok(0)
                }
            },
            None => self.conn.read_some(buf).await,
        }
    }

    /// Serve every complete frame currently buffered, in arrival order.
    /// `Err` means the connection is beyond use.
    async fn drain_frames(&mut self) -> Result<(), ()> {
        loop {
            match self.buffer.next_request() {
                Ok(Some(request)) => self.serve(request).await?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    log::warn!("framing fault from {}: {e}", self.peer.describe());
                    // Best effort; the frame boundary is gone, so msgid 0.
                    let _ = self.conn.write_all(&encode_error(0, e.kind())).await;
                    return Err(());
                }
            }
        }
    }

    async fn serve(&mut self, request: Request) -> Result<(), ()> {
        let msgid = request.msgid;
        let outcome = match self.caller_for(&request) {
            Ok(caller) => dispatch(&self.ctx, &caller, request).await,
            Err(kind) => Err(kind),
        };

        let fatal = matches!(&outcome, Err(kind) if kind.is_fatal());
        let bytes = match outcome {
            Ok(value) => encode_result(msgid, value),
            Err(kind) => encode_error(msgid, kind),
        };
        if let Err(e) = self.conn.write_all(&bytes).await {
            log::debug!("write to {} failed: {e}", self.peer.describe());
            return Err(());
        }
        if fatal {
            Err(())
        } else {
            Ok(())
        }
    }

    /// Transport policy for the 5-element metadata extension: never on
    /// the Unix socket (a local client must not smuggle claims about a
    /// remote requester), and on TLS only when configured. A rejected
    /// metadata frame is answered and the connection continues.
    fn caller_for(&self, request: &Request) -> Result<Caller, ErrorKind> {
        let Some(metadata) = &request.metadata else {
            return Ok(Caller {
                peer: self.peer.clone(),
                claimed_uid: None,
            });
        };

        match &self.peer {
            Peer::Local { .. } => Err(ErrorKind::InvalidRequest),
            Peer::Node { .. } if !self.ctx.accept_frame_metadata => Err(ErrorKind::InvalidRequest),
            Peer::Node { .. } => {
                let claimed_uid = metadata_uid(metadata).ok_or(ErrorKind::InvalidRequest)?;
                Ok(Caller {
                    peer: self.peer.clone(),
                    claimed_uid: Some(claimed_uid),
                })
            }
        }
    }
}

fn metadata_uid(metadata: &Value) -> Option<u32> {
    let Value::Map(entries) = metadata else {
        return None;
    };
    for (key, value) in entries {
        if key.as_str() == Some("uid") {
            return value.as_u64().and_then(|uid| u32::try_from(uid).ok());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_uid_extraction() {
        let meta = Value::Map(vec![(Value::from("uid"), Value::from(1000u64))]);
        assert_eq!(metadata_uid(&meta), Some(1000));

        let meta = Value::Map(vec![(Value::from("uid"), Value::from("1000"))]);
        assert_eq!(metadata_uid(&meta), None);

        assert_eq!(metadata_uid(&Value::from("uid")), None);
    }
}
