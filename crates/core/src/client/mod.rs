pub mod connection;
pub mod message_handlers;

pub use connection::{Conn, ConnectionHandler};

/// Which listener a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Unix,
    Tls,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Unix => "unix",
            Transport::Tls => "tls",
        }
    }
}

/// The connection-scoped identity, fixed once at connection start and
/// immutable afterwards.
///
/// A local peer is known by the kernel-reported UID of the process on the
/// other end of the Unix socket. A node peer is known by the subject CN
/// of its verified client certificate; the CN names a machine, never a
/// user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    Local { uid: u32 },
    Node { name: String },
}

impl Peer {
    pub fn transport(&self) -> Transport {
        match self {
            Peer::Local { .. } => Transport::Unix,
            Peer::Node { .. } => Transport::Tls,
        }
    }

    /// Root is scoped to the machine where the peer-credential evidence
    /// was obtained; a remote "uid 0" claim means nothing.
    pub fn is_local_root(&self) -> bool {
        matches!(self, Peer::Local { uid: 0 })
    }

    pub fn describe(&self) -> String {
        match self {
            Peer::Local { uid } => format!("uid:{uid}"),
            Peer::Node { name } => format!("node:{name}"),
        }
    }
}

/// A single request's caller: the connection peer plus, on the TLS
/// transport with metadata enabled, the origin UID the sending node
/// claims for the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub peer: Peer,
    pub claimed_uid: Option<u32>,
}

impl Caller {
    pub fn local(uid: u32) -> Caller {
        Caller {
            peer: Peer::Local { uid },
            claimed_uid: None,
        }
    }

    pub fn node(name: impl Into<String>) -> Caller {
        Caller {
            peer: Peer::Node { name: name.into() },
            claimed_uid: None,
        }
    }
}
