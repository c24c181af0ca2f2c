//! Common fabric types for the subnet manager.
//!
//! This crate provides type-safe representations of the identities and
//! addresses the subnet manager hands out and tracks:
//!
//! - [`Guid`]: 64-bit hardware identity of a node or port
//! - [`Lid`]: 16-bit local identifier (unicast or multicast)
//! - [`PKey`]: 16-bit partition key
//! - [`NodeType`], [`LinkState`]: node classification and physical link state
//! - [`PhysPortRef`]: a physical port named by its node GUID and port number

mod guid;
mod lid;
mod node;
mod pkey;

pub use guid::Guid;
pub use lid::Lid;
pub use node::{LinkState, NodeType, PhysPortRef};
pub use pkey::PKey;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid GUID format: {0}")]
    InvalidGuid(String),

    #[error("invalid LID format: {0}")]
    InvalidLid(String),

    #[error("invalid P_Key format: {0}")]
    InvalidPKey(String),

    #[error("invalid node type: {0}")]
    InvalidNodeType(String),

    #[error("invalid link state: {0}")]
    InvalidLinkState(String),
}
