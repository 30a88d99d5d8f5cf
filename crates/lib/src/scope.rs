//! Per-table node scope: which mesh members may hold a copy of the table.

use crate::name::is_node_name;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `local` tables never leave this node; `all` tables converge onto every
/// mesh member; a list restricts copies to the named members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeScope {
    Local,
    All,
    Nodes(Vec<String>),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid node scope `{0}`")]
pub struct ScopeParseError(pub String);

impl NodeScope {
    /// Parse the wire form: `"local"`, `"all"`, or a comma-separated list
    /// of node names.
    pub fn parse_wire(s: &str) -> Result<NodeScope, ScopeParseError> {
        match s {
            "local" => Ok(NodeScope::Local),
            "all" => Ok(NodeScope::All),
            other => {
                let nodes: Vec<String> = other
                    .split(',')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_owned)
                    .collect();
                if nodes.is_empty() || nodes.iter().any(|n| !is_node_name(n)) {
                    return Err(ScopeParseError(other.into()));
                }
                Ok(NodeScope::Nodes(nodes))
            }
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            NodeScope::Local => "local".into(),
            NodeScope::All => "all".into(),
            NodeScope::Nodes(nodes) => nodes.join(","),
        }
    }

    /// Would a copy of a table with this scope belong on `node`?
    pub fn includes(&self, node: &str) -> bool {
        match self {
            NodeScope::Local => false,
            NodeScope::All => true,
            NodeScope::Nodes(nodes) => nodes.iter().any(|n| n == node),
        }
    }
}

impl Default for NodeScope {
    fn default() -> Self {
        NodeScope::Local
    }
}

// Stored as `"local"`, `"all"`, or a JSON array of node names.
impl Serialize for NodeScope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            NodeScope::Local => serializer.serialize_str("local"),
            NodeScope::All => serializer.serialize_str("all"),
            NodeScope::Nodes(nodes) => nodes.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for NodeScope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Tag(String),
            List(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Tag(s) if s == "local" => Ok(NodeScope::Local),
            Raw::Tag(s) if s == "all" => Ok(NodeScope::All),
            Raw::Tag(s) => Err(de::Error::custom(ScopeParseError(s))),
            Raw::List(nodes) => Ok(NodeScope::Nodes(nodes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        assert_eq!(NodeScope::parse_wire("local").unwrap(), NodeScope::Local);
        assert_eq!(NodeScope::parse_wire("all").unwrap(), NodeScope::All);
        assert_eq!(
            NodeScope::parse_wire("alpha, beta").unwrap(),
            NodeScope::Nodes(vec!["alpha".into(), "beta".into()])
        );
        assert!(NodeScope::parse_wire("").is_err());
        assert!(NodeScope::parse_wire("no spaces allowed!").is_err());
    }

    #[test]
    fn membership() {
        assert!(!NodeScope::Local.includes("a"));
        assert!(NodeScope::All.includes("a"));
        let scope = NodeScope::Nodes(vec!["a".into()]);
        assert!(scope.includes("a"));
        assert!(!scope.includes("b"));
    }

    #[test]
    fn json_forms() {
        assert_eq!(serde_json::to_string(&NodeScope::Local).unwrap(), r#""local""#);
        assert_eq!(
            serde_json::to_string(&NodeScope::Nodes(vec!["a".into()])).unwrap(),
            r#"["a"]"#
        );
        let back: NodeScope = serde_json::from_str(r#""all""#).unwrap();
        assert_eq!(back, NodeScope::All);
    }
}
