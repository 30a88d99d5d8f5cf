//! Permission sets attached to `(identity, table)` ACL entries.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

bitflags::bitflags! {
    /// The set of rights an ACL entry grants on a table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const ADMIN = 0b100;
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown permission `{0}`")]
pub struct PermissionParseError(pub String);

impl Permissions {
    /// Every right at once; what a table owner holds implicitly.
    pub const FULL: Permissions = Permissions::all();

    /// Parse the wire form: a comma-separated list such as `"read,write"`.
    /// The empty string parses to the empty set (useful for revoke-all).
    pub fn parse_csv(s: &str) -> Result<Permissions, PermissionParseError> {
        let mut perms = Permissions::empty();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            perms |= match part {
                "read" => Permissions::READ,
                "write" => Permissions::WRITE,
                "admin" => Permissions::ADMIN,
                other => return Err(PermissionParseError(other.into())),
            };
        }
        Ok(perms)
    }

    pub fn to_csv(self) -> String {
        self.names().join(",")
    }

    pub fn names(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.contains(Permissions::READ) {
            out.push("read");
        }
        if self.contains(Permissions::WRITE) {
            out.push("write");
        }
        if self.contains(Permissions::ADMIN) {
            out.push("admin");
        }
        out
    }
}

// Stored (and listed) as a JSON array of names, not as raw bits, so the
// catalog stays readable and order-insensitive.
impl Serialize for Permissions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let names = self.names();
        let mut seq = serializer.serialize_seq(Some(names.len()))?;
        for name in names {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PermVisitor;

        impl<'de> Visitor<'de> for PermVisitor {
            type Value = Permissions;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a list of permission names")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Permissions, A::Error> {
                let mut perms = Permissions::empty();
                while let Some(name) = seq.next_element::<String>()? {
                    perms |= Permissions::parse_csv(&name).map_err(de::Error::custom)?;
                }
                Ok(perms)
            }
        }

        deserializer.deserialize_seq(PermVisitor)
    }
}
