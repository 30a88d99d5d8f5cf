//! Shared types for the Cortex record-store daemon: the MessagePack-RPC
//! wire protocol, table naming and namespacing, permission sets, node
//! scopes, and the closed error taxonomy surfaced to clients.

pub mod buffer;
pub mod error;
pub mod name;
pub mod permissions;
pub mod scope;
pub mod value;
pub mod wire;

pub use error::ErrorKind;
pub use permissions::Permissions;
pub use scope::NodeScope;
pub use wire::Request;
