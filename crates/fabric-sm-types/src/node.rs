//! Node classification, link state and physical port references.

use crate::{Guid, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of node found at the far end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Host channel adapter (end node).
    ChannelAdapter,
    /// Switch; forwards between its ports.
    Switch,
    /// Router between subnets.
    Router,
}

impl NodeType {
    /// Returns true if discovery continues through nodes of this type.
    pub const fn forwards(&self) -> bool {
        matches!(self, NodeType::Switch)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::ChannelAdapter => write!(f, "ca"),
            NodeType::Switch => write!(f, "switch"),
            NodeType::Router => write!(f, "router"),
        }
    }
}

impl FromStr for NodeType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ca" | "hca" | "channel_adapter" => Ok(NodeType::ChannelAdapter),
            "sw" | "switch" => Ok(NodeType::Switch),
            "rtr" | "router" => Ok(NodeType::Router),
            _ => Err(ParseError::InvalidNodeType(s.to_string())),
        }
    }
}

/// Physical port link state as reported by the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Down,
    Init,
    Armed,
    Active,
}

impl LinkState {
    /// Returns true if the physical link is trained, whatever its logical state.
    pub const fn is_up(&self) -> bool {
        !matches!(self, LinkState::Down)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Down => write!(f, "down"),
            LinkState::Init => write!(f, "init"),
            LinkState::Armed => write!(f, "armed"),
            LinkState::Active => write!(f, "active"),
        }
    }
}

impl FromStr for LinkState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "down" => Ok(LinkState::Down),
            "init" => Ok(LinkState::Init),
            "armed" => Ok(LinkState::Armed),
            "active" => Ok(LinkState::Active),
            _ => Err(ParseError::InvalidLinkState(s.to_string())),
        }
    }
}

/// A physical port, named by the GUID of the node that owns it and its
/// port number on that node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysPortRef {
    pub node: Guid,
    pub port: u8,
}

impl PhysPortRef {
    pub const fn new(node: Guid, port: u8) -> Self {
        Self { node, port }
    }
}

impl fmt::Display for PhysPortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_parse() {
        assert_eq!("SW".parse::<NodeType>().unwrap(), NodeType::Switch);
        assert_eq!("hca".parse::<NodeType>().unwrap(), NodeType::ChannelAdapter);
        assert!("bridge".parse::<NodeType>().is_err());
        assert!(NodeType::Switch.forwards());
        assert!(!NodeType::Router.forwards());
    }

    #[test]
    fn test_link_state() {
        assert!(!LinkState::Down.is_up());
        assert!(LinkState::Init.is_up());
        assert_eq!("ACTIVE".parse::<LinkState>().unwrap(), LinkState::Active);
    }

    #[test]
    fn test_phys_port_display() {
        let pp = PhysPortRef::new(Guid::new(0x10), 3);
        assert_eq!(pp.to_string(), "0x0000000000000010/3");
    }
}
