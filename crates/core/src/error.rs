use cortex_lib::error::ErrorKind;
use cortex_lib::name::NameError;
use cortex_lib::permissions::PermissionParseError;
use cortex_lib::scope::ScopeParseError;
use cortex_lib::value::ValueError;
use thiserror::Error;

/// Failures inside the record store and catalog.
///
/// Everything here collapses onto one wire [`ErrorKind`] via [`StoreError::kind`];
/// the mapping is total so a handler can never leak an unmapped failure.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("table `{0}` already exists")]
    TableExists(String),
    #[error("table `{0}` not found")]
    TableNotFound(String),
    #[error("key `{0}` not found")]
    KeyNotFound(String),
    #[error("record lacks declared key field `{0}`")]
    MissingKeyField(String),
    #[error("invalid attribute name `{0}`")]
    InvalidAttribute(String),
    #[error("invalid ACL identity `{0}`")]
    InvalidIdentity(String),
    #[error("namespace of `{0}` does not belong to the caller")]
    ForeignNamespace(String),
    #[error("federated identity `{0}` already exists")]
    IdentityExists(String),
    #[error("federated identity `{0}` not found")]
    IdentityNotFound(String),
    #[error("identity `{0}` already has a mapping on node `{1}`")]
    MappingExists(String, String),
    #[error("claim token rejected")]
    ClaimRejected,
    #[error(transparent)]
    Name(#[from] NameError),
    #[error(transparent)]
    Permissions(#[from] PermissionParseError),
    #[error(transparent)]
    Scope(#[from] ScopeParseError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("storage engine: {0}")]
    Engine(#[from] sled::Error),
    #[error("catalog row: {0}")]
    CatalogRow(#[from] serde_json::Error),
    #[error("record decode: {0}")]
    RecordDecode(#[from] rmp_serde::decode::Error),
    #[error("record encode: {0}")]
    RecordEncode(#[from] rmp_serde::encode::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Collapse onto the wire taxonomy.
    ///
    /// `TableNotFound` maps to `access_denied`, not `not_found`: the error
    /// for a missing table and for a forbidden table must be identical so
    /// callers cannot probe for table existence.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::TableExists(_) | StoreError::IdentityExists(_) | StoreError::MappingExists(..) => {
                ErrorKind::AlreadyExists
            }
            StoreError::TableNotFound(_) => ErrorKind::AccessDenied,
            StoreError::KeyNotFound(_) | StoreError::IdentityNotFound(_) => ErrorKind::NotFound,
            StoreError::MissingKeyField(_) => ErrorKind::MissingKey,
            StoreError::InvalidAttribute(_) | StoreError::InvalidIdentity(_) => ErrorKind::InvalidParams,
            StoreError::ForeignNamespace(_) | StoreError::ClaimRejected => ErrorKind::Unauthorized,
            StoreError::Name(NameError::Invalid(_)) => ErrorKind::InvalidParams,
            StoreError::Name(NameError::FederatedIdentityRequired) => ErrorKind::FederatedIdentityRequired,
            StoreError::Name(NameError::NoNamespace(_)) => ErrorKind::AccessDenied,
            StoreError::Permissions(_) => ErrorKind::InvalidPermissions,
            StoreError::Scope(_) => ErrorKind::InvalidParams,
            StoreError::Value(_) => ErrorKind::InvalidParams,
            StoreError::Engine(e) => {
                log::error!("storage engine fault: {e}");
                ErrorKind::Internal
            }
            StoreError::CatalogRow(_)
            | StoreError::RecordDecode(_)
            | StoreError::RecordEncode(_)
            | StoreError::Io(_) => ErrorKind::Internal,
        }
    }
}

/// Failures from the authorization layer: either an explicit denial or a
/// store fault encountered while evaluating the gates.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("access denied")]
    Denied,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Denied => ErrorKind::AccessDenied,
            AuthError::Store(e) => e.kind(),
        }
    }
}
