//! In-memory fabric that answers probes.
//!
//! Used by the daemon's `--simulate` mode and by tests. Nodes and cables
//! can be added, removed and made unresponsive while the manager runs; LID
//! and forwarding-table programming is recorded and reflected in later
//! probe answers.

use crate::discovery::{
    NodeDescription, PeerSmInfo, PortDescription, PortStatus, ProbeData, ProbeOutcome,
    ProbeRequest, ProbeTarget, SwitchCapabilities,
};
use crate::plugin::{ForwardingTable, InstallError};
use crate::scheduler::ProbeTransport;
use crate::sweep::LidUpdate;
use async_trait::async_trait;
use fabric_sm_types::{Guid, LinkState, Lid, NodeType, PhysPortRef};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// One node of a simulated topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimNode {
    pub guid: Guid,
    pub node_type: NodeType,
    pub num_ports: u8,
    /// Port GUIDs by port number. Missing entries get a default: switch
    /// port 0 takes the node GUID, CA and router port `n` take GUID + `n`.
    #[serde(default)]
    pub port_guids: BTreeMap<u8, Guid>,
    #[serde(default)]
    pub switch: Option<SwitchCapabilities>,
    #[serde(default)]
    pub sm: Option<PeerSmInfo>,
    /// GUID the node reports instead of its own.
    #[serde(default)]
    pub reports_as: Option<Guid>,
}

impl SimNode {
    pub fn switch(guid: Guid, num_ports: u8) -> Self {
        Self::new(guid, NodeType::Switch, num_ports)
    }

    pub fn channel_adapter(guid: Guid, num_ports: u8) -> Self {
        Self::new(guid, NodeType::ChannelAdapter, num_ports)
    }

    pub fn router(guid: Guid, num_ports: u8) -> Self {
        Self::new(guid, NodeType::Router, num_ports)
    }

    fn new(guid: Guid, node_type: NodeType, num_ports: u8) -> Self {
        Self {
            guid,
            node_type,
            num_ports,
            port_guids: BTreeMap::new(),
            switch: None,
            sm: None,
            reports_as: None,
        }
    }

    /// Port numbers that exist on this node.
    fn port_numbers(&self) -> impl Iterator<Item = u8> {
        let first = if self.node_type == NodeType::Switch { 0 } else { 1 };
        first..=self.num_ports
    }

    /// GUID of a port, if the port carries one.
    pub fn port_guid(&self, port: u8) -> Option<Guid> {
        if let Some(guid) = self.port_guids.get(&port) {
            return Some(*guid);
        }
        match (self.node_type, port) {
            (NodeType::Switch, 0) => Some(self.guid),
            (NodeType::Switch, _) => None,
            (_, 0) => None,
            (_, n) => Some(Guid::new(self.guid.raw().wrapping_add(u64::from(n)))),
        }
    }
}

/// Serialized form of a simulated fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimTopology {
    /// Port this manager runs on.
    pub local: PhysPortRef,
    pub nodes: Vec<SimNode>,
    #[serde(default)]
    pub links: Vec<(PhysPortRef, PhysPortRef)>,
}

#[derive(Debug, Default)]
struct SimState {
    local: Option<PhysPortRef>,
    nodes: BTreeMap<Guid, SimNode>,
    links: HashMap<PhysPortRef, PhysPortRef>,
    lids: HashMap<Guid, (Lid, u8)>,
    tables: BTreeMap<Guid, BTreeMap<Lid, u8>>,
    unresponsive: HashSet<Guid>,
    failing: HashSet<Guid>,
    probes: u64,
}

impl SimState {
    fn describe(&self, node: &SimNode, entered_port: u8) -> NodeDescription {
        let ports = node
            .port_numbers()
            .map(|n| {
                let linked = self.links.contains_key(&PhysPortRef::new(node.guid, n));
                let state = if linked || n == 0 {
                    LinkState::Active
                } else {
                    LinkState::Down
                };
                let port_guid = node.port_guid(n);
                let programmed = port_guid.and_then(|g| self.lids.get(&g).copied());
                PortDescription {
                    port_num: n,
                    state,
                    port_guid,
                    lid: programmed.map(|(lid, _)| lid),
                    lmc: programmed.map(|(_, lmc)| lmc).unwrap_or(0),
                }
            })
            .collect();
        NodeDescription {
            node_guid: node.reports_as.unwrap_or(node.guid),
            node_type: node.node_type,
            num_ports: node.num_ports,
            entered_port,
            switch: match node.node_type {
                NodeType::Switch => Some(node.switch.unwrap_or_default()),
                _ => None,
            },
            ports,
            sm: node.sm,
        }
    }

    fn owner_of_port(&self, port_guid: Guid) -> Option<Guid> {
        self.nodes
            .values()
            .find(|n| n.port_numbers().any(|p| n.port_guid(p) == Some(port_guid)))
            .map(|n| n.guid)
    }

    fn answer(&self, request: &ProbeRequest) -> ProbeOutcome {
        match request.target {
            ProbeTarget::Local => {
                let Some(local) = self.local else {
                    return ProbeOutcome::Unreachable;
                };
                match self.nodes.get(&local.node) {
                    Some(_) if self.unresponsive.contains(&local.node) => ProbeOutcome::Timeout,
                    Some(node) => ProbeOutcome::Response(ProbeData::Node(self.describe(node, local.port))),
                    None => ProbeOutcome::Unreachable,
                }
            }
            ProbeTarget::Neighbor(pp) => {
                if !self.nodes.contains_key(&pp.node) {
                    return ProbeOutcome::Unreachable;
                }
                let Some(remote) = self.links.get(&pp) else {
                    return ProbeOutcome::Unreachable;
                };
                match self.nodes.get(&remote.node) {
                    Some(_) if self.unresponsive.contains(&remote.node) => ProbeOutcome::Timeout,
                    Some(node) => ProbeOutcome::Response(ProbeData::Node(self.describe(node, remote.port))),
                    None => ProbeOutcome::Timeout,
                }
            }
            ProbeTarget::Port(pp) => {
                if self.unresponsive.contains(&pp.node) {
                    return ProbeOutcome::Timeout;
                }
                match self.nodes.get(&pp.node) {
                    Some(node) if pp.port <= node.num_ports => {
                        let state = if self.links.contains_key(&pp) {
                            LinkState::Active
                        } else {
                            LinkState::Down
                        };
                        ProbeOutcome::Response(ProbeData::Port(PortStatus { state }))
                    }
                    _ => ProbeOutcome::Unreachable,
                }
            }
        }
    }
}

/// A fabric held in memory behind a lock.
#[derive(Debug, Default)]
pub struct SimulatedFabric {
    state: Mutex<SimState>,
}

impl SimulatedFabric {
    pub fn new(local: PhysPortRef) -> Self {
        let fabric = Self::default();
        fabric.state.lock().local = Some(local);
        fabric
    }

    pub fn from_topology(topology: SimTopology) -> Self {
        let fabric = Self::new(topology.local);
        for node in topology.nodes {
            fabric.add_node(node);
        }
        for (a, b) in topology.links {
            fabric.connect(a, b);
        }
        fabric
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let topology: SimTopology = serde_json::from_str(json)?;
        Ok(Self::from_topology(topology))
    }

    pub fn add_node(&self, node: SimNode) {
        self.state.lock().nodes.insert(node.guid, node);
    }

    /// Unplugs a node and every cable attached to it.
    pub fn remove_node(&self, guid: Guid) {
        let mut state = self.state.lock();
        state.nodes.remove(&guid);
        state.links.retain(|a, b| a.node != guid && b.node != guid);
    }

    /// Plugs a cable between two ports, replacing whatever either end had.
    pub fn connect(&self, a: PhysPortRef, b: PhysPortRef) {
        let mut state = self.state.lock();
        for end in [a, b] {
            if let Some(old) = state.links.remove(&end) {
                state.links.remove(&old);
            }
        }
        state.links.insert(a, b);
        state.links.insert(b, a);
    }

    pub fn disconnect(&self, pp: PhysPortRef) {
        let mut state = self.state.lock();
        if let Some(remote) = state.links.remove(&pp) {
            state.links.remove(&remote);
        }
    }

    /// Makes a node stop answering probes, or start again.
    pub fn set_unresponsive(&self, guid: Guid, unresponsive: bool) {
        let mut state = self.state.lock();
        if unresponsive {
            state.unresponsive.insert(guid);
        } else {
            state.unresponsive.remove(&guid);
        }
    }

    /// Makes LID and forwarding programming of a node fail, or succeed again.
    pub fn set_failing(&self, guid: Guid, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(guid);
        } else {
            state.failing.remove(&guid);
        }
    }

    /// Runs a manager on a node, as seen by discovery.
    pub fn set_manager(&self, node: Guid, sm: Option<PeerSmInfo>) {
        if let Some(n) = self.state.lock().nodes.get_mut(&node) {
            n.sm = sm;
        }
    }

    /// LIDs programmed on ports, by port GUID.
    pub fn programmed_lids(&self) -> BTreeMap<Guid, (Lid, u8)> {
        self.state.lock().lids.iter().map(|(g, b)| (*g, *b)).collect()
    }

    pub fn installed_tables(&self) -> BTreeMap<Guid, BTreeMap<Lid, u8>> {
        self.state.lock().tables.clone()
    }

    pub fn probe_count(&self) -> u64 {
        self.state.lock().probes
    }
}

#[async_trait]
impl ProbeTransport for SimulatedFabric {
    async fn probe(&self, request: &ProbeRequest) -> ProbeOutcome {
        let mut state = self.state.lock();
        state.probes += 1;
        state.answer(request)
    }

    async fn program_lid(&self, update: &LidUpdate) -> Result<(), InstallError> {
        let mut state = self.state.lock();
        let Some(owner) = state.owner_of_port(update.port) else {
            return Err(InstallError::new(update.port, "no such port"));
        };
        if state.failing.contains(&owner) || state.unresponsive.contains(&owner) {
            return Err(InstallError::new(update.port, "port did not accept LID"));
        }
        debug!(port = %update.port, lid = %update.lid, "LID programmed");
        state.lids.insert(update.port, (update.lid, update.lmc));
        Ok(())
    }

    async fn install_forwarding(&self, table: &ForwardingTable) -> Result<(), InstallError> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&table.switch) {
            return Err(InstallError::new(table.switch, "no such switch"));
        }
        if state.failing.contains(&table.switch) || state.unresponsive.contains(&table.switch) {
            return Err(InstallError::new(table.switch, "forwarding table rejected"));
        }
        state.tables.insert(table.switch, table.entries.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn g(v: u64) -> Guid {
        Guid::new(v)
    }

    #[test]
    fn test_default_port_guids() {
        let sw = SimNode::switch(g(0x10), 4);
        assert_eq!(sw.port_guid(0), Some(g(0x10)));
        assert_eq!(sw.port_guid(3), None);
        let ca = SimNode::channel_adapter(g(0x20), 2);
        assert_eq!(ca.port_guid(2), Some(g(0x22)));
        assert_eq!(ca.port_guid(0), None);
    }

    #[tokio::test]
    async fn test_neighbor_probe_reports_entered_port() {
        let fabric = SimulatedFabric::new(PhysPortRef::new(g(0x20), 1));
        fabric.add_node(SimNode::channel_adapter(g(0x20), 1));
        fabric.add_node(SimNode::switch(g(0x10), 4));
        fabric.connect(PhysPortRef::new(g(0x20), 1), PhysPortRef::new(g(0x10), 3));

        let outcome = fabric
            .probe(&ProbeRequest::node_info(
                ProbeTarget::Neighbor(PhysPortRef::new(g(0x20), 1)),
                1,
            ))
            .await;
        let ProbeOutcome::Response(ProbeData::Node(desc)) = outcome else {
            panic!("expected a node description");
        };
        assert_eq!(desc.node_guid, g(0x10));
        assert_eq!(desc.entered_port, 3);
        assert_eq!(desc.ports.len(), 5);
        assert_eq!(desc.ports[3].state, LinkState::Active);
        assert_eq!(desc.ports[1].state, LinkState::Down);

        fabric.set_unresponsive(g(0x10), true);
        let outcome = fabric
            .probe(&ProbeRequest::node_info(
                ProbeTarget::Neighbor(PhysPortRef::new(g(0x20), 1)),
                1,
            ))
            .await;
        assert_eq!(outcome, ProbeOutcome::Timeout);
        assert_eq!(fabric.probe_count(), 2);
    }

    #[tokio::test]
    async fn test_programmed_lid_shows_in_description() {
        let fabric = SimulatedFabric::new(PhysPortRef::new(g(0x20), 1));
        fabric.add_node(SimNode::channel_adapter(g(0x20), 1));
        fabric
            .program_lid(&LidUpdate {
                port: g(0x21),
                lid: Lid::new(7),
                lmc: 0,
            })
            .await
            .unwrap();

        let outcome = fabric
            .probe(&ProbeRequest::node_info(ProbeTarget::Local, 0))
            .await;
        let ProbeOutcome::Response(ProbeData::Node(desc)) = outcome else {
            panic!("expected a node description");
        };
        assert_eq!(desc.ports[0].lid, Some(Lid::new(7)));
        assert!(fabric
            .program_lid(&LidUpdate {
                port: g(0x99),
                lid: Lid::new(8),
                lmc: 0,
            })
            .await
            .is_err());
    }

    #[test]
    fn test_topology_from_json() {
        let json = r#"{
            "local": {"node": "0x20", "port": 1},
            "nodes": [
                {"guid": "0x10", "node_type": "switch", "num_ports": 8},
                {"guid": "0x20", "node_type": "channel_adapter", "num_ports": 1}
            ],
            "links": [[{"node": "0x20", "port": 1}, {"node": "0x10", "port": 1}]]
        }"#;
        let fabric = SimulatedFabric::from_json(json).unwrap();
        let state = fabric.state.lock();
        assert_eq!(state.nodes.len(), 2);
        assert_eq!(
            state.links.get(&PhysPortRef::new(g(0x10), 1)),
            Some(&PhysPortRef::new(g(0x20), 1))
        );
    }
}
