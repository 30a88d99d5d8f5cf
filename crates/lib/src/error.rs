use thiserror::Error;

/// The closed set of error names a response frame may carry.
///
/// Every failure inside the daemon collapses onto exactly one of these
/// before it reaches the wire; anything unanticipated becomes `Internal`
/// and is logged server-side.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    #[error("key not found")]
    NotFound,
    #[error("table already exists")]
    AlreadyExists,
    #[error("access denied")]
    AccessDenied,
    #[error("malformed request frame")]
    InvalidRequest,
    #[error("wrong parameter shape for method")]
    InvalidParams,
    #[error("record lacks the declared key field")]
    MissingKey,
    #[error("unparseable permission set")]
    InvalidPermissions,
    #[error("operation requires a federated identity")]
    FederatedIdentityRequired,
    #[error("caller may not act on this federated namespace")]
    Unauthorized,
    #[error("receive buffer cap exceeded")]
    BufferOverflow,
    #[error("unrecoverable protocol violation")]
    ProtocolError,
    #[error("internal storage error")]
    Internal,
}

impl ErrorKind {
    /// The wire name, as carried in the `error` slot of a response frame.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::InvalidParams => "invalid_params",
            ErrorKind::MissingKey => "missing_key",
            ErrorKind::InvalidPermissions => "invalid_permissions",
            ErrorKind::FederatedIdentityRequired => "federated_identity_required",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::BufferOverflow => "buffer_overflow",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether a frame that failed with this kind poisons the connection.
    ///
    /// Framing and size violations leave the byte stream in an unknown
    /// state; everything else is answered and the connection continues.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::BufferOverflow | ErrorKind::ProtocolError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_snake_case() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::AlreadyExists,
            ErrorKind::AccessDenied,
            ErrorKind::InvalidRequest,
            ErrorKind::InvalidParams,
            ErrorKind::MissingKey,
            ErrorKind::InvalidPermissions,
            ErrorKind::FederatedIdentityRequired,
            ErrorKind::Unauthorized,
            ErrorKind::BufferOverflow,
            ErrorKind::ProtocolError,
            ErrorKind::Internal,
        ] {
            let name = kind.as_str();
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }

    #[test]
    fn only_framing_faults_are_fatal() {
        assert!(ErrorKind::BufferOverflow.is_fatal());
        assert!(ErrorKind::ProtocolError.is_fatal());
        assert!(!ErrorKind::AccessDenied.is_fatal());
        assert!(!ErrorKind::Internal.is_fatal());
    }
}
