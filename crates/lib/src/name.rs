//! Table naming and namespacing.
//!
//! On the wire a client says `users`; the store sees `{uid}:users`.
//! Federated tables live in the `@{fed_id}:{name}` namespace and are owned
//! by a federated identity rather than a UID. Validation runs before any
//! catalog access so that only well-formed names can ever reach the store.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static SHORT_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static FED_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").unwrap());
static QUALIFIED_UID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+:[A-Za-z_][A-Za-z0-9_]*$").unwrap());

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("invalid table name `{0}`")]
    Invalid(String),
    #[error("`@` table names require a federated identity")]
    FederatedIdentityRequired,
    #[error("caller has no namespace for short name `{0}`")]
    NoNamespace(String),
}

/// A wire-level table name resolved to its internal, namespaced form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    /// The fully qualified name the store indexes by, e.g. `1000:users`
    /// or `@alice:memories`.
    pub internal: String,
    /// True when the name lies in the caller's own namespace. Names in a
    /// foreign namespace may only refer to catalog entries that already
    /// exist; resolution never mints them.
    pub own_namespace: bool,
}

/// Is `s` a valid short (unqualified, non-federated) table name?
pub fn is_short_name(s: &str) -> bool {
    SHORT_NAME.is_match(s)
}

/// Is `s` a valid attribute name? Attributes obey the short-name rule.
pub fn is_attribute(s: &str) -> bool {
    SHORT_NAME.is_match(s)
}

/// Is `s` a valid federated identity name?
pub fn is_fed_id(s: &str) -> bool {
    FED_ID.is_match(s)
}

/// Is `s` a valid mesh node name? Node names share the federated-id rule.
pub fn is_node_name(s: &str) -> bool {
    FED_ID.is_match(s)
}

/// Resolve a wire-level table name against the calling identity.
///
/// `caller_uid` is present for local (Unix socket) callers; `caller_fed`
/// is the caller's federated identity when one is registered for them.
/// Fully-qualified forms (`{uid}:{name}`, `@{fed}:{name}`) are accepted
/// from anyone but marked foreign unless they match the caller.
pub fn resolve_table_name(
    raw: &str,
    caller_uid: Option<u32>,
    caller_fed: Option<&str>,
) -> Result<ResolvedName, NameError> {
    if let Some(rest) = raw.strip_prefix('@') {
        return match rest.split_once(':') {
            Some((fed, name)) => {
                if !is_fed_id(fed) || !is_short_name(name) {
                    return Err(NameError::Invalid(raw.into()));
                }
                Ok(ResolvedName {
                    internal: raw.to_owned(),
                    own_namespace: caller_fed == Some(fed),
                })
            }
            None => {
                if !is_short_name(rest) {
                    return Err(NameError::Invalid(raw.into()));
                }
                let fed = caller_fed.ok_or(NameError::FederatedIdentityRequired)?;
                Ok(ResolvedName {
                    internal: format!("@{fed}:{rest}"),
                    own_namespace: true,
                })
            }
        };
    }

    if raw.contains(':') {
        if !QUALIFIED_UID.is_match(raw) {
            return Err(NameError::Invalid(raw.into()));
        }
        let (uid_part, _) = raw.split_once(':').expect("checked above");
        let owner: Option<u32> = uid_part.parse().ok();
        return Ok(ResolvedName {
            internal: raw.to_owned(),
            own_namespace: owner.is_some() && owner == caller_uid,
        });
    }

    if !is_short_name(raw) {
        return Err(NameError::Invalid(raw.into()));
    }
    let uid = caller_uid.ok_or_else(|| NameError::NoNamespace(raw.into()))?;
    Ok(ResolvedName {
        internal: format!("{uid}:{raw}"),
        own_namespace: true,
    })
}

/// Strip the caller's own namespace prefix for display, the inverse of
/// [`resolve_table_name`] for listing tables back to their owner.
pub fn display_name(internal: &str, caller_uid: Option<u32>) -> String {
    if let Some(uid) = caller_uid {
        if let Some(short) = internal.strip_prefix(&format!("{uid}:")) {
            return short.to_owned();
        }
    }
    internal.to_owned()
}
