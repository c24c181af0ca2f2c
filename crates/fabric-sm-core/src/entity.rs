//! Entity records held by the subnet tables.
//!
//! Records own their attributes by value. Every relation to another entity
//! (owning node, remote end of a link, group member) is stored as a GUID or
//! a [`PhysPortRef`] and resolved through the tables, so removing an entity
//! can never leave a dangling reference behind.

use crate::state_machine::SmState;
use fabric_sm_types::{Guid, LinkState, Lid, NodeType, PKey, PhysPortRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Entity variants tracked by the subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Switch,
    Node,
    Port,
    Router,
    Partition,
    MulticastGroup,
    PeerManager,
}

/// GUID namespaces. Two variants in the same namespace may not share a GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum GuidNamespace {
    NodeGuid,
    PortGuid,
    Partition,
    MulticastGroup,
    PeerManager,
}

impl EntityKind {
    pub(crate) fn namespace(&self) -> GuidNamespace {
        match self {
            EntityKind::Switch | EntityKind::Node | EntityKind::Router => GuidNamespace::NodeGuid,
            EntityKind::Port => GuidNamespace::PortGuid,
            EntityKind::Partition => GuidNamespace::Partition,
            EntityKind::MulticastGroup => GuidNamespace::MulticastGroup,
            EntityKind::PeerManager => GuidNamespace::PeerManager,
        }
    }

    /// Returns true for entities that discovery observes on the wire, as
    /// opposed to entities created by configuration.
    pub fn is_discovered(&self) -> bool {
        !matches!(self, EntityKind::Partition | EntityKind::MulticastGroup)
    }

    pub(crate) fn for_node_type(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Switch => EntityKind::Switch,
            NodeType::ChannelAdapter => EntityKind::Node,
            NodeType::Router => EntityKind::Router,
        }
    }
}

/// Stable reference to a live entity: its variant and primary key.
///
/// Valid until the entity is removed; resolve it through the tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub guid: Guid,
}

impl EntityRef {
    pub const fn new(kind: EntityKind, guid: Guid) -> Self {
        Self { kind, guid }
    }
}

/// A physical port on a switch, channel adapter or router.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhysPort {
    pub port_num: u8,
    pub state: LinkState,
    /// Far end of the cable, once observed.
    pub remote: Option<PhysPortRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchAttrs {
    pub num_ports: u8,
    /// Top of the unicast LID range this switch can forward.
    pub max_unicast_lid: Lid,
    /// Top of the multicast LID range this switch can forward.
    pub max_multicast_lid: Lid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttrs {
    pub num_ports: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAttrs {
    /// GUID of the node (switch, CA or router) owning this port.
    pub node: Guid,
    pub port_num: u8,
    pub lid: Option<Lid>,
    pub lmc: u8,
    pub state: LinkState,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionAttrs {
    pub pkey: PKey,
    pub name: String,
    pub full_members: BTreeSet<Guid>,
    pub limited_members: BTreeSet<Guid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MulticastGroupAttrs {
    pub pkey: PKey,
    pub mlid: Option<Lid>,
    pub members: BTreeSet<Guid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerManagerAttrs {
    pub priority: u8,
    pub state: SmState,
    pub base_lid: Option<Lid>,
}

/// Attributes supplied to [`EntityTables::upsert`](crate::EntityTables::upsert).
/// The variant of the entity follows from the variant of the attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityAttrs {
    Switch(SwitchAttrs),
    Node(NodeAttrs),
    Port(PortAttrs),
    Router(NodeAttrs),
    Partition(PartitionAttrs),
    MulticastGroup(MulticastGroupAttrs),
    PeerManager(PeerManagerAttrs),
}

impl EntityAttrs {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityAttrs::Switch(_) => EntityKind::Switch,
            EntityAttrs::Node(_) => EntityKind::Node,
            EntityAttrs::Port(_) => EntityKind::Port,
            EntityAttrs::Router(_) => EntityKind::Router,
            EntityAttrs::Partition(_) => EntityKind::Partition,
            EntityAttrs::MulticastGroup(_) => EntityKind::MulticastGroup,
            EntityAttrs::PeerManager(_) => EntityKind::PeerManager,
        }
    }
}

/// A switch and its forwarding state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub guid: Guid,
    pub attrs: SwitchAttrs,
    pub phys_ports: BTreeMap<u8, PhysPort>,
    /// Installed linear forwarding table: destination LID to egress port.
    pub lft: BTreeMap<Lid, u8>,
}

/// A channel adapter or router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub guid: Guid,
    pub node_type: NodeType,
    pub attrs: NodeAttrs,
    pub phys_ports: BTreeMap<u8, PhysPort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub guid: Guid,
    pub attrs: PortAttrs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub guid: Guid,
    pub attrs: PartitionAttrs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastGroupRecord {
    pub guid: Guid,
    pub attrs: MulticastGroupAttrs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerManagerRecord {
    pub guid: Guid,
    pub attrs: PeerManagerAttrs,
    pub last_seen: Option<Instant>,
}

/// An entity removed from the tables, returned by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Switch(SwitchRecord),
    Node(NodeRecord),
    Port(PortRecord),
    Router(NodeRecord),
    Partition(PartitionRecord),
    MulticastGroup(MulticastGroupRecord),
    PeerManager(PeerManagerRecord),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Switch(_) => EntityKind::Switch,
            Entity::Node(_) => EntityKind::Node,
            Entity::Port(_) => EntityKind::Port,
            Entity::Router(_) => EntityKind::Router,
            Entity::Partition(_) => EntityKind::Partition,
            Entity::MulticastGroup(_) => EntityKind::MulticastGroup,
            Entity::PeerManager(_) => EntityKind::PeerManager,
        }
    }
}

/// What an upsert did to the tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertChange {
    Inserted,
    Updated,
    /// Identical attributes for a known GUID; nothing changed.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub entity: EntityRef,
    pub change: UpsertChange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_guid_namespace_shared() {
        assert_eq!(EntityKind::Switch.namespace(), EntityKind::Node.namespace());
        assert_eq!(EntityKind::Router.namespace(), EntityKind::Node.namespace());
        assert_ne!(EntityKind::Port.namespace(), EntityKind::Node.namespace());
        assert_ne!(
            EntityKind::PeerManager.namespace(),
            EntityKind::Port.namespace()
        );
    }

    #[test]
    fn test_attrs_kind() {
        let attrs = EntityAttrs::Router(NodeAttrs { num_ports: 2 });
        assert_eq!(attrs.kind(), EntityKind::Router);
        assert_eq!(
            EntityKind::for_node_type(NodeType::ChannelAdapter),
            EntityKind::Node
        );
    }

    #[test]
    fn test_discovered_kinds() {
        assert!(EntityKind::Switch.is_discovered());
        assert!(EntityKind::PeerManager.is_discovered());
        assert!(!EntityKind::Partition.is_discovered());
        assert!(!EntityKind::MulticastGroup.is_discovered());
    }
}
