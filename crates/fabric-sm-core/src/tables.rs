//! Entity tables: the authoritative store of everything discovered or
//! configured on the fabric.
//!
//! One [`EntityTable`] per variant, keyed by GUID. The tables are the sole
//! owner of every entity; everything else (the LID index, snapshots, the
//! watch list) refers to entities by key.

use crate::entity::{
    Entity, EntityAttrs, EntityKind, EntityRef, GuidNamespace, MulticastGroupRecord, NodeRecord,
    PartitionRecord, PeerManagerRecord, PhysPort, PortRecord, SwitchRecord, UpsertChange,
    UpsertOutcome,
};
use crate::error::TopologyError;
use crate::table::EntityTable;
use fabric_sm_types::{Guid, LinkState, NodeType, PKey, PhysPortRef};
use std::collections::BTreeMap;
use tracing::debug;

/// Keyed containers for every entity variant plus the light-sweep watch list.
#[derive(Debug, Default)]
pub struct EntityTables {
    switches: EntityTable<Guid, SwitchRecord>,
    nodes: EntityTable<Guid, NodeRecord>,
    routers: EntityTable<Guid, NodeRecord>,
    ports: EntityTable<Guid, PortRecord>,
    partitions: EntityTable<Guid, PartitionRecord>,
    mcast_groups: EntityTable<Guid, MulticastGroupRecord>,
    peers: EntityTable<Guid, PeerManagerRecord>,
    /// Physical ports whose remote end did not answer and must be re-probed.
    watch_list: Vec<PhysPortRef>,
}

/// Inserts or updates a record in place, comparing attributes for the
/// idempotent case.
fn upsert_record<R, A: PartialEq>(
    table: &mut EntityTable<Guid, R>,
    guid: Guid,
    attrs: A,
    attrs_of: fn(&mut R) -> &mut A,
    create: impl FnOnce(A) -> R,
) -> UpsertChange {
    match table.get_mut(&guid) {
        Some(record) => {
            let current = attrs_of(record);
            if *current == attrs {
                UpsertChange::Unchanged
            } else {
                *current = attrs;
                UpsertChange::Updated
            }
        }
        None => {
            table.insert(guid, create(attrs));
            UpsertChange::Inserted
        }
    }
}

/// Keeps the physical port map sized to `num_ports` (ports 1..=num_ports).
fn sync_phys_ports(ports: &mut BTreeMap<u8, PhysPort>, num_ports: u8) {
    ports.retain(|num, _| *num >= 1 && *num <= num_ports);
    for num in 1..=num_ports {
        ports.entry(num).or_insert_with(|| PhysPort {
            port_num: num,
            ..PhysPort::default()
        });
    }
}

impl EntityTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new entity or updates a known one in place.
    ///
    /// The variant comes from `attrs`. A GUID already bound to a different
    /// variant of the same namespace is refused with
    /// [`TopologyError::DuplicateGuid`] and the existing entity is kept.
    pub fn upsert(
        &mut self,
        guid: Guid,
        attrs: EntityAttrs,
    ) -> Result<UpsertOutcome, TopologyError> {
        let kind = attrs.kind();
        if guid.is_zero() {
            return Err(TopologyError::InvalidGuid(guid, kind));
        }
        if let Some(existing) = self.conflicting_kind(guid, kind) {
            return Err(TopologyError::DuplicateGuid {
                guid,
                existing,
                requested: kind,
            });
        }

        let change = match attrs {
            EntityAttrs::Switch(a) => {
                let change = upsert_record(&mut self.switches, guid, a, |r| &mut r.attrs, |a| {
                    SwitchRecord {
                        guid,
                        attrs: a,
                        phys_ports: BTreeMap::new(),
                        lft: BTreeMap::new(),
                    }
                });
                if let Some(sw) = self.switches.get_mut(&guid) {
                    sync_phys_ports(&mut sw.phys_ports, sw.attrs.num_ports);
                }
                change
            }
            EntityAttrs::Node(a) => {
                let change = upsert_record(&mut self.nodes, guid, a, |r| &mut r.attrs, |a| {
                    NodeRecord {
                        guid,
                        node_type: NodeType::ChannelAdapter,
                        attrs: a,
                        phys_ports: BTreeMap::new(),
                    }
                });
                if let Some(node) = self.nodes.get_mut(&guid) {
                    sync_phys_ports(&mut node.phys_ports, node.attrs.num_ports);
                }
                change
            }
            EntityAttrs::Router(a) => {
                let change = upsert_record(&mut self.routers, guid, a, |r| &mut r.attrs, |a| {
                    NodeRecord {
                        guid,
                        node_type: NodeType::Router,
                        attrs: a,
                        phys_ports: BTreeMap::new(),
                    }
                });
                if let Some(rtr) = self.routers.get_mut(&guid) {
                    sync_phys_ports(&mut rtr.phys_ports, rtr.attrs.num_ports);
                }
                change
            }
            EntityAttrs::Port(a) => upsert_record(&mut self.ports, guid, a, |r| &mut r.attrs, |a| {
                PortRecord { guid, attrs: a }
            }),
            EntityAttrs::Partition(a) => {
                upsert_record(&mut self.partitions, guid, a, |r| &mut r.attrs, |a| {
                    PartitionRecord { guid, attrs: a }
                })
            }
            EntityAttrs::MulticastGroup(a) => {
                upsert_record(&mut self.mcast_groups, guid, a, |r| &mut r.attrs, |a| {
                    MulticastGroupRecord { guid, attrs: a }
                })
            }
            EntityAttrs::PeerManager(a) => {
                upsert_record(&mut self.peers, guid, a, |r| &mut r.attrs, |a| {
                    PeerManagerRecord {
                        guid,
                        attrs: a,
                        last_seen: None,
                    }
                })
            }
        };

        if change != UpsertChange::Unchanged {
            debug!(%guid, ?kind, ?change, "entity upsert");
        }

        Ok(UpsertOutcome {
            entity: EntityRef::new(kind, guid),
            change,
        })
    }

    /// Removes an entity. A missing GUID is a no-op.
    ///
    /// Removing a switch, CA or router also clears the remote end of every
    /// link that pointed at it.
    pub fn remove(&mut self, kind: EntityKind, guid: Guid) -> Option<Entity> {
        let removed = match kind {
            EntityKind::Switch => self.switches.remove(&guid).map(Entity::Switch),
            EntityKind::Node => self.nodes.remove(&guid).map(Entity::Node),
            EntityKind::Router => self.routers.remove(&guid).map(Entity::Router),
            EntityKind::Port => self.ports.remove(&guid).map(Entity::Port),
            EntityKind::Partition => self.partitions.remove(&guid).map(Entity::Partition),
            EntityKind::MulticastGroup => {
                self.mcast_groups.remove(&guid).map(Entity::MulticastGroup)
            }
            EntityKind::PeerManager => self.peers.remove(&guid).map(Entity::PeerManager),
        }?;

        let remotes: Vec<PhysPortRef> = match &removed {
            Entity::Switch(sw) => sw.phys_ports.values().filter_map(|p| p.remote).collect(),
            Entity::Node(n) | Entity::Router(n) => {
                n.phys_ports.values().filter_map(|p| p.remote).collect()
            }
            _ => Vec::new(),
        };
        for remote in remotes {
            if let Some(port) = self.phys_port_mut(remote) {
                port.remote = None;
            }
        }
        self.watch_list.retain(|pp| pp.node != guid);

        debug!(%guid, ?kind, "entity removed");
        Some(removed)
    }

    /// Returns a reference to the entity if it is live.
    pub fn lookup(&self, kind: EntityKind, guid: Guid) -> Option<EntityRef> {
        let present = match kind {
            EntityKind::Switch => self.switches.contains_key(&guid),
            EntityKind::Node => self.nodes.contains_key(&guid),
            EntityKind::Router => self.routers.contains_key(&guid),
            EntityKind::Port => self.ports.contains_key(&guid),
            EntityKind::Partition => self.partitions.contains_key(&guid),
            EntityKind::MulticastGroup => self.mcast_groups.contains_key(&guid),
            EntityKind::PeerManager => self.peers.contains_key(&guid),
        };
        present.then_some(EntityRef::new(kind, guid))
    }

    /// Variant bound to a node GUID, if any.
    pub fn node_kind(&self, guid: Guid) -> Option<EntityKind> {
        if self.switches.contains_key(&guid) {
            Some(EntityKind::Switch)
        } else if self.nodes.contains_key(&guid) {
            Some(EntityKind::Node)
        } else if self.routers.contains_key(&guid) {
            Some(EntityKind::Router)
        } else {
            None
        }
    }

    fn conflicting_kind(&self, guid: Guid, kind: EntityKind) -> Option<EntityKind> {
        match kind.namespace() {
            GuidNamespace::NodeGuid => self.node_kind(guid).filter(|existing| *existing != kind),
            // Every other namespace holds a single variant.
            _ => None,
        }
    }

    // ===== Typed accessors =====

    pub fn switch(&self, guid: Guid) -> Option<&SwitchRecord> {
        self.switches.get(&guid)
    }

    pub fn switch_mut(&mut self, guid: Guid) -> Option<&mut SwitchRecord> {
        self.switches.get_mut(&guid)
    }

    /// A channel adapter or router record.
    pub fn node(&self, guid: Guid) -> Option<&NodeRecord> {
        self.nodes.get(&guid).or_else(|| self.routers.get(&guid))
    }

    pub fn port(&self, guid: Guid) -> Option<&PortRecord> {
        self.ports.get(&guid)
    }

    pub(crate) fn port_mut(&mut self, guid: Guid) -> Option<&mut PortRecord> {
        self.ports.get_mut(&guid)
    }

    pub fn partition(&self, guid: Guid) -> Option<&PartitionRecord> {
        self.partitions.get(&guid)
    }

    pub fn partition_by_pkey(&self, pkey: PKey) -> Option<&PartitionRecord> {
        self.partitions
            .values()
            .find(|p| p.attrs.pkey.base() == pkey.base())
    }

    pub fn multicast_group(&self, guid: Guid) -> Option<&MulticastGroupRecord> {
        self.mcast_groups.get(&guid)
    }

    pub(crate) fn multicast_group_mut(&mut self, guid: Guid) -> Option<&mut MulticastGroupRecord> {
        self.mcast_groups.get_mut(&guid)
    }

    pub fn peer_manager(&self, guid: Guid) -> Option<&PeerManagerRecord> {
        self.peers.get(&guid)
    }

    pub(crate) fn peer_manager_mut(&mut self, guid: Guid) -> Option<&mut PeerManagerRecord> {
        self.peers.get_mut(&guid)
    }

    pub fn switches(&self) -> impl Iterator<Item = &SwitchRecord> {
        self.switches.values()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn routers(&self) -> impl Iterator<Item = &NodeRecord> {
        self.routers.values()
    }

    pub fn ports(&self) -> impl Iterator<Item = &PortRecord> {
        self.ports.values()
    }

    pub fn partitions(&self) -> impl Iterator<Item = &PartitionRecord> {
        self.partitions.values()
    }

    pub fn multicast_groups(&self) -> impl Iterator<Item = &MulticastGroupRecord> {
        self.mcast_groups.values()
    }

    pub fn peer_managers(&self) -> impl Iterator<Item = &PeerManagerRecord> {
        self.peers.values()
    }

    /// GUIDs of one variant in ascending order.
    pub fn guids(&self, kind: EntityKind) -> Vec<Guid> {
        match kind {
            EntityKind::Switch => self.switches.sorted_keys(),
            EntityKind::Node => self.nodes.sorted_keys(),
            EntityKind::Router => self.routers.sorted_keys(),
            EntityKind::Port => self.ports.sorted_keys(),
            EntityKind::Partition => self.partitions.sorted_keys(),
            EntityKind::MulticastGroup => self.mcast_groups.sorted_keys(),
            EntityKind::PeerManager => self.peers.sorted_keys(),
        }
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Switch => self.switches.len(),
            EntityKind::Node => self.nodes.len(),
            EntityKind::Router => self.routers.len(),
            EntityKind::Port => self.ports.len(),
            EntityKind::Partition => self.partitions.len(),
            EntityKind::MulticastGroup => self.mcast_groups.len(),
            EntityKind::PeerManager => self.peers.len(),
        }
    }

    /// Port GUIDs owned by a node, in port-number order.
    pub fn ports_of_node(&self, node: Guid) -> Vec<Guid> {
        let mut owned: Vec<&PortRecord> =
            self.ports.values().filter(|p| p.attrs.node == node).collect();
        owned.sort_by_key(|p| p.attrs.port_num);
        owned.into_iter().map(|p| p.guid).collect()
    }

    // ===== Physical links =====

    /// Physical ports of any switch, CA or router.
    pub fn phys_ports_of(&self, node: Guid) -> Option<&BTreeMap<u8, PhysPort>> {
        if let Some(sw) = self.switches.get(&node) {
            return Some(&sw.phys_ports);
        }
        self.node(node).map(|n| &n.phys_ports)
    }

    fn phys_ports_of_mut(&mut self, node: Guid) -> Option<&mut BTreeMap<u8, PhysPort>> {
        if let Some(sw) = self.switches.get_mut(&node) {
            return Some(&mut sw.phys_ports);
        }
        if let Some(n) = self.nodes.get_mut(&node) {
            return Some(&mut n.phys_ports);
        }
        self.routers.get_mut(&node).map(|r| &mut r.phys_ports)
    }

    pub fn phys_port(&self, pp: PhysPortRef) -> Option<&PhysPort> {
        self.phys_ports_of(pp.node)?.get(&pp.port)
    }

    fn phys_port_mut(&mut self, pp: PhysPortRef) -> Option<&mut PhysPort> {
        self.phys_ports_of_mut(pp.node)?.get_mut(&pp.port)
    }

    pub fn remote_of(&self, pp: PhysPortRef) -> Option<PhysPortRef> {
        self.phys_port(pp).and_then(|p| p.remote)
    }

    /// Records the link state of a physical port. Returns true if it changed.
    pub fn set_link_state(&mut self, pp: PhysPortRef, state: LinkState) -> bool {
        match self.phys_port_mut(pp) {
            Some(port) if port.state != state => {
                port.state = state;
                true
            }
            _ => false,
        }
    }

    /// Connects two physical ports, dropping any previous links either end
    /// had. Returns true if the topology changed.
    pub fn link(&mut self, a: PhysPortRef, b: PhysPortRef) -> bool {
        if self.phys_port(a).is_none() || self.phys_port(b).is_none() {
            return false;
        }
        if self.remote_of(a) == Some(b) && self.remote_of(b) == Some(a) {
            return false;
        }
        self.unlink(a);
        self.unlink(b);
        if let Some(port) = self.phys_port_mut(a) {
            port.remote = Some(b);
        }
        if let Some(port) = self.phys_port_mut(b) {
            port.remote = Some(a);
        }
        true
    }

    /// Disconnects a physical port from its remote end, if any.
    pub fn unlink(&mut self, pp: PhysPortRef) -> Option<PhysPortRef> {
        let remote = self.phys_port_mut(pp)?.remote.take()?;
        if let Some(far) = self.phys_port_mut(remote) {
            if far.remote == Some(pp) {
                far.remote = None;
            }
        }
        Some(remote)
    }

    /// Every physical port that currently has a remote end, in order.
    pub fn linked_phys_ports(&self) -> Vec<PhysPortRef> {
        let mut linked = Vec::new();
        let mut push_all = |guid: Guid, ports: &BTreeMap<u8, PhysPort>| {
            for port in ports.values().filter(|p| p.remote.is_some()) {
                linked.push(PhysPortRef::new(guid, port.port_num));
            }
        };
        for sw in self.switches.values() {
            push_all(sw.guid, &sw.phys_ports);
        }
        for node in self.nodes.values().chain(self.routers.values()) {
            push_all(node.guid, &node.phys_ports);
        }
        linked.sort();
        linked
    }

    // ===== Light-sweep watch list =====

    /// Adds a physical port to the watch list (once).
    pub fn watch(&mut self, pp: PhysPortRef) {
        if !self.watch_list.contains(&pp) {
            self.watch_list.push(pp);
        }
    }

    pub fn unwatch(&mut self, pp: PhysPortRef) {
        self.watch_list.retain(|w| *w != pp);
    }

    pub fn watch_list(&self) -> &[PhysPortRef] {
        &self.watch_list
    }

    pub fn clear_watch_list(&mut self) {
        self.watch_list.clear();
    }

    /// Drops every entity and the watch list. Used on manager shutdown.
    pub fn clear(&mut self) {
        self.switches.clear();
        self.nodes.clear();
        self.routers.clear();
        self.ports.clear();
        self.partitions.clear();
        self.mcast_groups.clear();
        self.peers.clear();
        self.watch_list.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{NodeAttrs, PortAttrs, SwitchAttrs};
    use fabric_sm_types::Lid;
    use pretty_assertions::assert_eq;

    fn switch_attrs(num_ports: u8) -> EntityAttrs {
        EntityAttrs::Switch(SwitchAttrs {
            num_ports,
            max_unicast_lid: Lid::new(0xbfff),
            max_multicast_lid: Lid::new(0xc3ff),
        })
    }

    fn port_attrs(node: u64, port_num: u8) -> EntityAttrs {
        EntityAttrs::Port(PortAttrs {
            node: Guid::new(node),
            port_num,
            lid: None,
            lmc: 0,
            state: LinkState::Active,
        })
    }

    #[test]
    fn test_upsert_insert_update_unchanged() {
        let mut tables = EntityTables::new();
        let guid = Guid::new(0x10);

        let first = tables.upsert(guid, switch_attrs(4)).unwrap();
        assert_eq!(first.change, UpsertChange::Inserted);
        assert_eq!(first.entity, EntityRef::new(EntityKind::Switch, guid));

        let again = tables.upsert(guid, switch_attrs(4)).unwrap();
        assert_eq!(again.change, UpsertChange::Unchanged);

        let grown = tables.upsert(guid, switch_attrs(8)).unwrap();
        assert_eq!(grown.change, UpsertChange::Updated);
        assert_eq!(tables.switch(guid).unwrap().phys_ports.len(), 8);
    }

    #[test]
    fn test_update_preserves_links() {
        let mut tables = EntityTables::new();
        let sw = Guid::new(0x10);
        let ca = Guid::new(0x20);
        tables.upsert(sw, switch_attrs(4)).unwrap();
        tables
            .upsert(ca, EntityAttrs::Node(NodeAttrs { num_ports: 1 }))
            .unwrap();
        assert!(tables.link(PhysPortRef::new(sw, 1), PhysPortRef::new(ca, 1)));

        tables.upsert(sw, switch_attrs(6)).unwrap();
        assert_eq!(
            tables.remote_of(PhysPortRef::new(sw, 1)),
            Some(PhysPortRef::new(ca, 1))
        );
    }

    #[test]
    fn test_duplicate_guid_across_variants_keeps_existing() {
        let mut tables = EntityTables::new();
        let guid = Guid::new(0x10);
        tables.upsert(guid, switch_attrs(4)).unwrap();

        let err = tables
            .upsert(guid, EntityAttrs::Node(NodeAttrs { num_ports: 2 }))
            .unwrap_err();
        assert_eq!(
            err,
            TopologyError::DuplicateGuid {
                guid,
                existing: EntityKind::Switch,
                requested: EntityKind::Node,
            }
        );
        assert!(tables.switch(guid).is_some());
        assert!(tables.lookup(EntityKind::Node, guid).is_none());
    }

    #[test]
    fn test_port_guid_may_equal_node_guid() {
        let mut tables = EntityTables::new();
        let guid = Guid::new(0x10);
        tables.upsert(guid, switch_attrs(4)).unwrap();
        assert!(tables.upsert(guid, port_attrs(0x10, 0)).is_ok());
    }

    #[test]
    fn test_zero_guid_rejected() {
        let mut tables = EntityTables::new();
        assert!(matches!(
            tables.upsert(Guid::ZERO, port_attrs(1, 1)),
            Err(TopologyError::InvalidGuid(_, EntityKind::Port))
        ));
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut tables = EntityTables::new();
        assert!(tables.remove(EntityKind::Port, Guid::new(99)).is_none());
    }

    #[test]
    fn test_remove_clears_remote_links_and_watch_entries() {
        let mut tables = EntityTables::new();
        let sw = Guid::new(0x10);
        let ca = Guid::new(0x20);
        tables.upsert(sw, switch_attrs(4)).unwrap();
        tables
            .upsert(ca, EntityAttrs::Node(NodeAttrs { num_ports: 1 }))
            .unwrap();
        tables.link(PhysPortRef::new(sw, 2), PhysPortRef::new(ca, 1));
        tables.watch(PhysPortRef::new(ca, 1));

        let removed = tables.remove(EntityKind::Node, ca).unwrap();
        assert_eq!(removed.kind(), EntityKind::Node);
        assert_eq!(tables.remote_of(PhysPortRef::new(sw, 2)), None);
        assert!(tables.watch_list().is_empty());
    }

    #[test]
    fn test_relink_drops_stale_far_end() {
        let mut tables = EntityTables::new();
        let sw = Guid::new(0x10);
        tables.upsert(sw, switch_attrs(4)).unwrap();
        let a = PhysPortRef::new(sw, 1);
        let b = PhysPortRef::new(sw, 2);
        let c = PhysPortRef::new(sw, 3);

        tables.link(a, b);
        tables.link(a, c);
        assert_eq!(tables.remote_of(a), Some(c));
        assert_eq!(tables.remote_of(b), None);
        assert!(!tables.link(a, c));
    }

    #[test]
    fn test_watch_list_deduplicates() {
        let mut tables = EntityTables::new();
        let pp = PhysPortRef::new(Guid::new(1), 1);
        tables.watch(pp);
        tables.watch(pp);
        assert_eq!(tables.watch_list(), &[pp]);
        tables.unwatch(pp);
        assert!(tables.watch_list().is_empty());
    }

    #[test]
    fn test_ports_of_node_ordered() {
        let mut tables = EntityTables::new();
        tables.upsert(Guid::new(0x22), port_attrs(0x20, 2)).unwrap();
        tables.upsert(Guid::new(0x21), port_attrs(0x20, 1)).unwrap();
        tables.upsert(Guid::new(0x31), port_attrs(0x30, 1)).unwrap();
        assert_eq!(
            tables.ports_of_node(Guid::new(0x20)),
            vec![Guid::new(0x21), Guid::new(0x22)]
        );
    }
}
