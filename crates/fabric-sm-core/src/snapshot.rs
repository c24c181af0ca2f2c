//! Immutable per-sweep topology view handed to routing and multicast
//! collaborators.

use crate::entity::{
    MulticastGroupRecord, NodeRecord, PartitionRecord, PortRecord, SwitchRecord,
};
use crate::lid_index::LidIndex;
use crate::tables::EntityTables;
use chrono::{DateTime, Utc};
use fabric_sm_types::{Guid, Lid, PhysPortRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Copy of the entity tables and LID index taken at the end of a sweep.
///
/// Collaborators may hold on to it for as long as they like; the next sweep
/// mutates the live tables, never a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub sweep_id: u64,
    pub taken_at: DateTime<Utc>,
    /// Address assignment was skipped; the view may be partial.
    pub degraded: bool,
    pub max_unicast_lid_ho: Lid,
    pub max_multicast_lid_ho: Lid,
    pub switches: BTreeMap<Guid, SwitchRecord>,
    /// Channel adapters and routers.
    pub nodes: BTreeMap<Guid, NodeRecord>,
    pub ports: BTreeMap<Guid, PortRecord>,
    pub partitions: BTreeMap<Guid, PartitionRecord>,
    pub multicast_groups: BTreeMap<Guid, MulticastGroupRecord>,
    pub unicast_lids: BTreeMap<Lid, Guid>,
    pub multicast_lids: BTreeMap<Lid, Guid>,
}

impl TopologySnapshot {
    pub fn capture(sweep_id: u64, degraded: bool, tables: &EntityTables, index: &LidIndex) -> Self {
        Self {
            sweep_id,
            taken_at: Utc::now(),
            degraded,
            max_unicast_lid_ho: index.max_unicast_lid_ho(),
            max_multicast_lid_ho: index.max_multicast_lid_ho(),
            switches: tables.switches().map(|r| (r.guid, r.clone())).collect(),
            nodes: tables
                .nodes()
                .chain(tables.routers())
                .map(|r| (r.guid, r.clone()))
                .collect(),
            ports: tables.ports().map(|r| (r.guid, r.clone())).collect(),
            partitions: tables.partitions().map(|r| (r.guid, r.clone())).collect(),
            multicast_groups: tables
                .multicast_groups()
                .map(|r| (r.guid, r.clone()))
                .collect(),
            unicast_lids: index.unicast_bindings(),
            multicast_lids: index.multicast_bindings(),
        }
    }

    /// Port bound to a unicast base LID.
    pub fn port_by_lid(&self, lid: Lid) -> Option<&PortRecord> {
        self.unicast_lids
            .get(&lid)
            .and_then(|guid| self.ports.get(guid))
    }

    /// Ports owned by a node, in port-number order.
    pub fn ports_of(&self, node: Guid) -> Vec<&PortRecord> {
        let mut owned: Vec<&PortRecord> = self
            .ports
            .values()
            .filter(|p| p.attrs.node == node)
            .collect();
        owned.sort_by_key(|p| p.attrs.port_num);
        owned
    }

    /// Remote end of a physical port.
    pub fn remote_of(&self, pp: PhysPortRef) -> Option<PhysPortRef> {
        let ports = match self.switches.get(&pp.node) {
            Some(sw) => &sw.phys_ports,
            None => &self.nodes.get(&pp.node)?.phys_ports,
        };
        ports.get(&pp.port).and_then(|p| p.remote)
    }

    /// Every link once, lower endpoint first.
    pub fn links(&self) -> Vec<(PhysPortRef, PhysPortRef)> {
        let mut links = Vec::new();
        let all = self
            .switches
            .values()
            .map(|sw| (sw.guid, &sw.phys_ports))
            .chain(self.nodes.values().map(|n| (n.guid, &n.phys_ports)));
        for (guid, ports) in all {
            for port in ports.values() {
                let local = PhysPortRef::new(guid, port.port_num);
                if let Some(remote) = port.remote {
                    if local < remote {
                        links.push((local, remote));
                    }
                }
            }
        }
        links.sort();
        links
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityAttrs, NodeAttrs, PortAttrs, SwitchAttrs};
    use fabric_sm_types::LinkState;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_capture_is_detached_copy() {
        let mut tables = EntityTables::new();
        let sw = Guid::new(0x10);
        let ca = Guid::new(0x20);
        tables
            .upsert(
                sw,
                EntityAttrs::Switch(SwitchAttrs {
                    num_ports: 2,
                    max_unicast_lid: Lid::new(0xbfff),
                    max_multicast_lid: Lid::new(0xc3ff),
                }),
            )
            .unwrap();
        tables
            .upsert(ca, EntityAttrs::Node(NodeAttrs { num_ports: 1 }))
            .unwrap();
        tables
            .upsert(
                Guid::new(0x21),
                EntityAttrs::Port(PortAttrs {
                    node: ca,
                    port_num: 1,
                    lid: Some(Lid::new(3)),
                    lmc: 0,
                    state: LinkState::Active,
                }),
            )
            .unwrap();
        tables.link(PhysPortRef::new(sw, 1), PhysPortRef::new(ca, 1));

        let mut index = LidIndex::new();
        index.rebuild_from(&tables);
        let snap = TopologySnapshot::capture(7, false, &tables, &index);

        tables.remove(crate::EntityKind::Node, ca);

        assert_eq!(snap.sweep_id, 7);
        assert_eq!(snap.port_by_lid(Lid::new(3)).map(|p| p.guid), Some(Guid::new(0x21)));
        assert_eq!(
            snap.links(),
            vec![(PhysPortRef::new(sw, 1), PhysPortRef::new(ca, 1))]
        );
        assert_eq!(
            snap.remote_of(PhysPortRef::new(ca, 1)),
            Some(PhysPortRef::new(sw, 1))
        );
        assert_eq!(snap.ports_of(ca).len(), 1);
    }
}
