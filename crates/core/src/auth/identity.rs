//! Identity extraction at connection start.
//!
//! Local connections carry unforgeable kernel peer credentials; TLS
//! connections carry a client certificate already verified against the
//! mesh CA, from which only the subject CN is taken.

use thiserror::Error;
use tokio::net::UnixStream;
use x509_parser::prelude::{FromDer, X509Certificate};

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("peer credentials unavailable: {0}")]
    PeerCred(#[from] std::io::Error),
    #[error("peer certificate is not valid X.509: {0}")]
    BadCertificate(String),
    #[error("peer certificate subject has no CN")]
    MissingCommonName,
    #[error("peer certificate CN is not a valid node name")]
    BadCommonName,
}

/// The UID of the process on the far end of a Unix socket, as reported
/// by the kernel. Called exactly once, at connection start.
pub fn peer_uid(stream: &UnixStream) -> Result<u32, IdentityError> {
    let cred = stream.peer_cred()?;
    Ok(cred.uid())
}

/// The subject common name of a DER-encoded certificate, interpreted as
/// the requesting node's name.
pub fn certificate_node_name(der: &[u8]) -> Result<String, IdentityError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| IdentityError::BadCertificate(e.to_string()))?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .ok_or(IdentityError::MissingCommonName)?
        .as_str()
        .map_err(|_| IdentityError::BadCommonName)?;
    if !cortex_lib::name::is_node_name(cn) {
        return Err(IdentityError::BadCommonName);
    }
    Ok(cn.to_owned())
}
