//! Fabric discovery.
//!
//! A sweep is driven from outside: [`Subnet::begin_sweep`] hands out the
//! first probe requests, the caller sends them over whatever transport it
//! has, and feeds each answer back through [`Subnet::on_probe_result`],
//! which mutates the tables and returns the follow-up probes. When nothing
//! is outstanding the caller calls [`Subnet::finish_sweep`] to run the
//! eviction, address and routing phases and collect the [`SweepReport`].
//!
//! Heavy sweeps walk the fabric breadth-first over switch adjacency. Light
//! sweeps only check known links, the watch list and the nodes of known
//! peer managers. They touch nothing but peer heartbeats; a change they see
//! becomes a delayed heavy sweep.

use crate::entity::{
    EntityAttrs, EntityKind, EntityRef, NodeAttrs, PortAttrs, SwitchAttrs, UpsertChange,
    UpsertOutcome,
};
use crate::error::{SmError, SmResult, TopologyError};
use crate::events::SmEventKind;
use crate::lid_mgr::AssignmentPolicy;
use crate::plugin::{ForwardingTable, InstallError};
use crate::snapshot::TopologySnapshot;
use crate::state_machine::{SmSignal, SmState};
use crate::subnet::Subnet;
use crate::sweep::{HeavyCompletion, LidUpdate, SweepDecision, SweepKind, SweepReport};
use fabric_sm_types::{Guid, LinkState, Lid, NodeType, PhysPortRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where a probe is aimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTarget {
    /// The node hosting this manager's port.
    Local,
    /// The node at the far end of the given physical port.
    Neighbor(PhysPortRef),
    /// The given physical port itself.
    Port(PhysPortRef),
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeTarget::Local => write!(f, "local"),
            ProbeTarget::Neighbor(pp) => write!(f, "neighbor of {}", pp),
            ProbeTarget::Port(pp) => write!(f, "port {}", pp),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeQuery {
    /// Node identity, ports and any manager running there.
    NodeInfo,
    /// Link state of one physical port.
    PortInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub target: ProbeTarget,
    pub query: ProbeQuery,
    /// Zero-based attempt number.
    pub attempt: u32,
    /// Hops from the local node.
    pub hops: u8,
}

impl ProbeRequest {
    pub fn node_info(target: ProbeTarget, hops: u8) -> Self {
        Self {
            target,
            query: ProbeQuery::NodeInfo,
            attempt: 0,
            hops,
        }
    }

    pub fn port_info(pp: PhysPortRef) -> Self {
        Self {
            target: ProbeTarget::Port(pp),
            query: ProbeQuery::PortInfo,
            attempt: 0,
            hops: 0,
        }
    }

    fn retry(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..*self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Response(ProbeData),
    /// No answer within the transaction timeout. Retried.
    Timeout,
    /// The transport could not route the probe. Retried.
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeData {
    Node(NodeDescription),
    Port(PortStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub state: LinkState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchCapabilities {
    pub max_unicast_lid: Lid,
    pub max_multicast_lid: Lid,
}

impl Default for SwitchCapabilities {
    fn default() -> Self {
        Self {
            max_unicast_lid: Lid::UNICAST_END,
            max_multicast_lid: Lid::MULTICAST_END,
        }
    }
}

/// One port as a node describes it. Switch external ports carry no GUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescription {
    pub port_num: u8,
    pub state: LinkState,
    #[serde(default)]
    pub port_guid: Option<Guid>,
    #[serde(default)]
    pub lid: Option<Lid>,
    #[serde(default)]
    pub lmc: u8,
}

/// A manager found running on a discovered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSmInfo {
    pub port_guid: Guid,
    pub priority: u8,
    pub state: SmState,
    #[serde(default)]
    pub base_lid: Option<Lid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub node_guid: Guid,
    pub node_type: NodeType,
    pub num_ports: u8,
    /// Port the probe arrived on; for the local node, the manager's port.
    pub entered_port: u8,
    #[serde(default)]
    pub switch: Option<SwitchCapabilities>,
    pub ports: Vec<PortDescription>,
    #[serde(default)]
    pub sm: Option<PeerSmInfo>,
}

/// The opening move of a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepStart {
    pub sweep_id: u64,
    pub decision: SweepDecision,
    pub requests: Vec<ProbeRequest>,
}

/// Bookkeeping for the sweep in flight.
#[derive(Debug)]
pub(crate) struct SweepRun {
    pub(crate) report: SweepReport,
    started: Instant,
    hop_limit: Option<u8>,
    observed: HashSet<EntityRef>,
    visited: HashSet<Guid>,
    /// (node, entered port) to the port the probe left from.
    entries: HashMap<PhysPortRef, PhysPortRef>,
    /// Node shape and the first location it was seen at.
    shapes: HashMap<Guid, (NodeType, u8, PhysPortRef)>,
    port_owners: HashMap<Guid, PhysPortRef>,
    unresolved: BTreeSet<PhysPortRef>,
    local_unreachable: bool,
    aborted: bool,
    conflicted: bool,
    fatal: Option<String>,
}

impl SweepRun {
    fn new(report: SweepReport, started: Instant) -> Self {
        let hop_limit = (report.decision.kind == SweepKind::HopZero).then_some(1);
        Self {
            report,
            started,
            hop_limit,
            observed: HashSet::new(),
            visited: HashSet::new(),
            entries: HashMap::new(),
            shapes: HashMap::new(),
            port_owners: HashMap::new(),
            unresolved: BTreeSet::new(),
            local_unreachable: false,
            aborted: false,
            conflicted: false,
            fatal: None,
        }
    }

    fn note(&mut self, outcome: UpsertOutcome) {
        self.observed.insert(outcome.entity);
        match outcome.change {
            UpsertChange::Inserted => self.report.added.push(outcome.entity),
            UpsertChange::Updated => self.report.updated.push(outcome.entity),
            UpsertChange::Unchanged => {}
        }
    }
}

impl Subnet {
    /// Starts a sweep cycle. Returns `None` when the controller decides
    /// there is nothing to do.
    pub fn begin_sweep(&mut self, now: Instant) -> SmResult<Option<SweepStart>> {
        if self.run.is_some() {
            return Err(SmError::SweepInProgress);
        }
        let decision = self.next_decision(now);
        if decision.is_idle() {
            return Ok(None);
        }

        let sweep_id = self.next_sweep_id;
        self.next_sweep_id += 1;
        self.epoch.begin(&decision);

        let requests = match decision.kind {
            SweepKind::Heavy | SweepKind::HopZero => {
                vec![ProbeRequest::node_info(ProbeTarget::Local, 0)]
            }
            SweepKind::Light => self.light_probes(),
            SweepKind::Idle => Vec::new(),
        };
        info!(
            sweep_id,
            kind = ?decision.kind,
            reason = ?decision.reason,
            probes = requests.len(),
            "sweep started"
        );
        self.run = Some(SweepRun::new(SweepReport::new(sweep_id, decision), now));
        Ok(Some(SweepStart {
            sweep_id,
            decision,
            requests,
        }))
    }

    /// Watch-listed ports and the nodes hosting known peer managers, plus
    /// every port of every switch and every other linked port.
    fn light_probes(&self) -> Vec<ProbeRequest> {
        let mut targets: BTreeSet<ProbeTarget> = self
            .tables
            .watch_list()
            .iter()
            .map(|pp| ProbeTarget::Neighbor(*pp))
            .collect();
        targets.extend(self.peer_targets());
        let mut requests: Vec<ProbeRequest> = targets
            .into_iter()
            .map(|target| ProbeRequest::node_info(target, 0))
            .collect();
        let mut ports: BTreeSet<PhysPortRef> = self.tables.linked_phys_ports().into_iter().collect();
        for sw in self.tables.switches() {
            ports.extend(sw.phys_ports.keys().map(|n| PhysPortRef::new(sw.guid, *n)));
        }
        requests.extend(ports.into_iter().map(ProbeRequest::port_info));
        requests
    }

    /// Where to reach each known peer manager's node. Their answers keep
    /// the peers' heartbeats fresh between heavy sweeps.
    fn peer_targets(&self) -> Vec<ProbeTarget> {
        let local_node = self
            .tables
            .port(self.sm.sm_port_guid)
            .map(|p| p.attrs.node);
        self.tables
            .peer_managers()
            .filter_map(|peer| {
                let port = self.tables.port(peer.guid)?;
                if Some(port.attrs.node) == local_node {
                    return Some(ProbeTarget::Local);
                }
                let here = PhysPortRef::new(port.attrs.node, port.attrs.port_num);
                self.tables.remote_of(here).map(ProbeTarget::Neighbor)
            })
            .collect()
    }

    /// Feeds one probe answer into the sweep in flight and returns the
    /// probes it gives rise to. Answers arriving after an abort, or with no
    /// sweep running, are dropped.
    pub fn on_probe_result(
        &mut self,
        request: &ProbeRequest,
        outcome: ProbeOutcome,
        now: Instant,
    ) -> Vec<ProbeRequest> {
        let kind = match self.run.as_ref() {
            Some(run) if !run.aborted => run.report.decision.kind,
            _ => return Vec::new(),
        };
        match outcome {
            ProbeOutcome::Response(ProbeData::Node(desc)) if kind == SweepKind::Light => {
                self.check_neighbor(request, &desc);
                self.refresh_peer(&desc, now);
                Vec::new()
            }
            ProbeOutcome::Response(ProbeData::Port(status)) if kind == SweepKind::Light => {
                self.check_port(request, status);
                Vec::new()
            }
            ProbeOutcome::Response(ProbeData::Node(desc)) => self.apply_node(request, desc, now),
            ProbeOutcome::Response(ProbeData::Port(_)) => Vec::new(),
            ProbeOutcome::Timeout | ProbeOutcome::Unreachable => {
                if request.attempt + 1 < self.options.probe_attempts() {
                    debug!(probe = %request.target, attempt = request.attempt + 1, "retrying probe");
                    return vec![request.retry()];
                }
                self.mark_unresolved(request, kind);
                Vec::new()
            }
        }
    }

    fn mark_unresolved(&mut self, request: &ProbeRequest, kind: SweepKind) {
        let attempts = self.options.probe_attempts();
        let Some(run) = self.run.as_mut() else { return };
        warn!(probe = %request.target, attempts, "probe unresolved");
        match (kind, request.target) {
            (_, ProbeTarget::Local) => run.local_unreachable = true,
            // A known port that stops answering is itself a change.
            (SweepKind::Light, ProbeTarget::Port(_)) => run.report.changes_detected = true,
            (SweepKind::Light, ProbeTarget::Neighbor(_)) => {}
            (_, ProbeTarget::Neighbor(pp) | ProbeTarget::Port(pp)) => {
                run.unresolved.insert(pp);
            }
        }
        run.report.cycle_errors.push(SmError::ProbeUnresolved {
            target: request.target.to_string(),
            attempts,
        });
    }

    /// Records an identity conflict. Conflicts on a switch are fatal.
    fn conflict(&mut self, err: TopologyError, fatal: bool) {
        warn!(%err, fatal, "topology conflict during discovery");
        let Some(run) = self.run.as_mut() else { return };
        run.conflicted = true;
        if fatal && run.fatal.is_none() {
            run.fatal = Some(err.to_string());
        }
        run.report.topology_errors.push(err);
    }

    /// Checks a node description against what this sweep already saw.
    fn check_identity(&self, from: Option<PhysPortRef>, desc: &NodeDescription) -> Option<TopologyError> {
        let run = self.run.as_ref()?;
        let node = desc.node_guid;
        let entry = PhysPortRef::new(node, desc.entered_port);
        if node.is_zero() {
            return Some(TopologyError::InvalidGuid(node, EntityKind::for_node_type(desc.node_type)));
        }
        if let (Some(from), Some(first)) = (from, run.entries.get(&entry)) {
            if *first != from {
                return Some(TopologyError::DuplicateLocation {
                    guid: node,
                    first: *first,
                    second: from,
                });
            }
        }
        if let Some((node_type, num_ports, first)) = run.shapes.get(&node) {
            if (*node_type, *num_ports) != (desc.node_type, desc.num_ports) {
                return Some(TopologyError::DuplicateLocation {
                    guid: node,
                    first: *first,
                    second: from.unwrap_or(entry),
                });
            }
        }
        for port in &desc.ports {
            let Some(guid) = port.port_guid else { continue };
            let here = PhysPortRef::new(node, port.port_num);
            if let Some(first) = run.port_owners.get(&guid) {
                if *first != here {
                    return Some(TopologyError::DuplicateLocation {
                        guid,
                        first: *first,
                        second: here,
                    });
                }
            }
        }
        None
    }

    /// Heavy and hop-0 handling of a node description.
    fn apply_node(&mut self, request: &ProbeRequest, desc: NodeDescription, now: Instant) -> Vec<ProbeRequest> {
        let from = match request.target {
            ProbeTarget::Local => None,
            ProbeTarget::Neighbor(pp) => Some(pp),
            ProbeTarget::Port(_) => return Vec::new(),
        };
        let node = desc.node_guid;
        let entry = PhysPortRef::new(node, desc.entered_port);

        if let Some(err) = self.check_identity(from, &desc) {
            self.emit(SmEventKind::TopologyConflict {
                guid: err.guid(),
                message: err.to_string(),
            });
            self.conflict(err, desc.node_type == NodeType::Switch);
            return Vec::new();
        }

        let first_visit = match self.run.as_mut() {
            Some(run) => {
                if let Some(from) = from {
                    run.entries.insert(entry, from);
                }
                run.shapes
                    .entry(node)
                    .or_insert((desc.node_type, desc.num_ports, from.unwrap_or(entry)));
                for port in &desc.ports {
                    if let Some(guid) = port.port_guid {
                        run.port_owners.insert(guid, PhysPortRef::new(node, port.port_num));
                    }
                }
                run.visited.insert(node)
            }
            None => return Vec::new(),
        };

        let attrs = match desc.node_type {
            NodeType::Switch => {
                let caps = desc.switch.unwrap_or_default();
                EntityAttrs::Switch(SwitchAttrs {
                    num_ports: desc.num_ports,
                    max_unicast_lid: caps.max_unicast_lid,
                    max_multicast_lid: caps.max_multicast_lid,
                })
            }
            NodeType::ChannelAdapter => EntityAttrs::Node(NodeAttrs {
                num_ports: desc.num_ports,
            }),
            NodeType::Router => EntityAttrs::Router(NodeAttrs {
                num_ports: desc.num_ports,
            }),
        };
        match self.upsert(node, attrs) {
            Ok(outcome) => self.note_observed(outcome),
            Err(err) => {
                self.conflict(err, desc.node_type == NodeType::Switch);
                return Vec::new();
            }
        }

        if from.is_none() && self.sm.sm_port_guid.is_zero() {
            let local_port = desc
                .ports
                .iter()
                .find(|p| p.port_num == desc.entered_port)
                .and_then(|p| p.port_guid);
            if let Some(guid) = local_port {
                info!(port = %guid, "manager bound to local port");
                self.sm.bind_port(guid);
            }
        }

        for port in &desc.ports {
            let pp = PhysPortRef::new(node, port.port_num);
            if port.port_num > 0 {
                self.tables.set_link_state(pp, port.state);
                if !port.state.is_up() {
                    self.tables.unlink(pp);
                }
            }
            let Some(port_guid) = port.port_guid else { continue };
            let attrs = EntityAttrs::Port(PortAttrs {
                node,
                port_num: port.port_num,
                lid: port.lid,
                lmc: port.lmc,
                state: port.state,
            });
            match self.upsert(port_guid, attrs) {
                Ok(outcome) => self.note_observed(outcome),
                Err(err) => self.conflict(err, false),
            }
        }

        if let Some(from) = from {
            if self.tables.link(from, entry) {
                debug!(%from, to = %entry, "link recorded");
            }
            self.tables.unwatch(from);
        }

        if let Some(peer) = desc.sm {
            if peer.port_guid != self.sm.sm_port_guid {
                match self.record_peer(peer.port_guid, peer.priority, peer.state, peer.base_lid, now) {
                    Ok(_) => {
                        if let Some(run) = self.run.as_mut() {
                            run.observed
                                .insert(EntityRef::new(EntityKind::PeerManager, peer.port_guid));
                        }
                    }
                    Err(err) => warn!(peer = %peer.port_guid, %err, "peer manager not recorded"),
                }
            }
        }

        let within_limit = self
            .run
            .as_ref()
            .map(|run| run.hop_limit.map_or(true, |limit| request.hops < limit))
            .unwrap_or(false);
        if !first_visit || !within_limit || !(desc.node_type.forwards() || from.is_none()) {
            return Vec::new();
        }
        desc.ports
            .iter()
            .filter(|p| p.port_num > 0 && p.state.is_up())
            .filter(|p| from.is_none() || p.port_num != desc.entered_port)
            .map(|p| {
                ProbeRequest::node_info(
                    ProbeTarget::Neighbor(PhysPortRef::new(node, p.port_num)),
                    request.hops.saturating_add(1),
                )
            })
            .collect()
    }

    fn note_observed(&mut self, outcome: UpsertOutcome) {
        if let Some(run) = self.run.as_mut() {
            run.note(outcome);
        }
    }

    /// Light sweep: a watch-listed port answered.
    fn check_neighbor(&mut self, request: &ProbeRequest, desc: &NodeDescription) {
        let ProbeTarget::Neighbor(pp) = request.target else { return };
        let seen = PhysPortRef::new(desc.node_guid, desc.entered_port);
        let known = self.tables.node_kind(desc.node_guid).is_some();
        if known && self.tables.remote_of(pp) == Some(seen) {
            debug!(%pp, "neighbor answers as before");
            self.tables.unwatch(pp);
        } else if let Some(run) = self.run.as_mut() {
            debug!(%pp, neighbor = %seen, "port found a different neighbor");
            run.report.changes_detected = true;
        }
    }

    /// Light sweep: a node answered with a manager running on it.
    fn refresh_peer(&mut self, desc: &NodeDescription, now: Instant) {
        let Some(peer) = desc.sm else { return };
        if peer.port_guid == self.sm.sm_port_guid || self.tables.peer_manager(peer.port_guid).is_none() {
            return;
        }
        if let Err(err) = self.record_peer(peer.port_guid, peer.priority, peer.state, peer.base_lid, now) {
            warn!(peer = %peer.port_guid, %err, "peer heartbeat not recorded");
        }
    }

    /// Light sweep: compare a port's link state with the tables.
    fn check_port(&mut self, request: &ProbeRequest, status: PortStatus) {
        let ProbeTarget::Port(pp) = request.target else { return };
        let known = self.tables.phys_port(pp).map(|p| p.state);
        if known != Some(status.state) {
            debug!(%pp, ?known, seen = %status.state, "link state changed");
            if let Some(run) = self.run.as_mut() {
                run.report.changes_detected = true;
            }
        }
    }

    /// Stops the sweep in flight. Later answers are dropped and the
    /// tables keep what was observed so far.
    pub fn abort_sweep(&mut self) {
        if let Some(run) = self.run.as_mut() {
            warn!(sweep_id = run.report.sweep_id, "sweep aborted");
            run.aborted = true;
        }
    }

    /// Closes the sweep in flight and returns its report.
    pub fn finish_sweep(&mut self, now: Instant) -> Option<SweepReport> {
        let mut run = self.run.take()?;
        match run.report.decision.kind {
            SweepKind::Heavy => self.finish_heavy(&mut run),
            SweepKind::Light => self.finish_light(&mut run),
            SweepKind::HopZero => {
                run.report.aborted = run.aborted;
                run.report.unresolved = run.unresolved.iter().copied().collect();
                for pp in &run.unresolved {
                    self.tables.watch(*pp);
                }
                self.epoch.finish_hop_zero();
            }
            SweepKind::Idle => {}
        }

        let report = &mut run.report;
        report.duration = now.saturating_duration_since(run.started);
        self.last_sweep_at = Some(now);
        self.emit(SmEventKind::SweepCompleted {
            sweep_id: report.sweep_id,
            kind: report.decision.kind,
            reason: report.decision.reason,
            duration_ms: u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            added: report.added.len(),
            updated: report.updated.len(),
            removed: report.removed.len(),
            unresolved: report.unresolved.len(),
            lid_updates: report.lid_updates.len(),
            degraded: report.degraded,
            aborted: report.aborted,
        });
        Some(run.report)
    }

    fn push_transition(&mut self, report: &mut SweepReport, signal: SmSignal) {
        match self.handle_signal(signal) {
            Ok(Some(t)) => report.transitions.push(t),
            Ok(None) => {}
            Err(err) => warn!(%err, "state machine rejected signal"),
        }
    }

    fn finish_heavy(&mut self, run: &mut SweepRun) {
        let sweep_id = run.report.sweep_id;
        if run.aborted {
            run.report.aborted = true;
            self.epoch.finish_heavy(&HeavyCompletion {
                aborted: true,
                ..Default::default()
            });
            return;
        }

        self.tables.clear_watch_list();
        for pp in &run.unresolved {
            self.tables.watch(*pp);
        }
        run.report.unresolved = run.unresolved.iter().copied().collect();

        if run.local_unreachable {
            warn!(sweep_id, "local port unreachable, keeping every known entity");
        } else {
            self.evict_unobserved(run);
        }

        let dropped = self.refresh_horizon();
        if !dropped.is_empty() {
            warn!(
                count = dropped.len(),
                max_unicast = %self.index.max_unicast_lid_ho(),
                "addresses beyond the forwarding horizon dropped"
            );
        }

        if let Some(reason) = run.fatal.clone() {
            let exit_requested = self.options.exit_on_fatal;
            run.report.terminate_requested = exit_requested;
            run.report
                .cycle_errors
                .push(SmError::FatalTopologyDesync { reason: reason.clone() });
            self.emit(SmEventKind::FatalDesync {
                reason: reason.clone(),
                exit_requested,
            });
        }
        run.report.degraded = run.conflicted;

        let mut assignment_errors = false;
        let mut addresses_assigned = false;
        if run.report.decision.assign_addresses && self.sm.is_master() {
            if run.report.degraded {
                warn!(sweep_id, "topology inconsistent, address assignment skipped");
            } else {
                assignment_errors = self.assign_addresses(&mut run.report);
                addresses_assigned = true;
            }
        }

        let snapshot = Arc::new(TopologySnapshot::capture(
            sweep_id,
            run.report.degraded,
            &self.tables,
            &self.index,
        ));
        self.last_snapshot = Some(snapshot.clone());
        // A manager promoted by this sweep's eviction routes on its next one.
        if run.report.decision.assign_addresses && self.sm.is_master() {
            self.plan_forwarding(&mut run.report, &snapshot);
        }
        run.report.snapshot = Some(snapshot);

        let errors = run.local_unreachable
            || assignment_errors
            || !run.report.unresolved.is_empty()
            || !run.report.topology_errors.is_empty();
        self.epoch.finish_heavy(&HeavyCompletion {
            aborted: false,
            errors,
            addresses_assigned,
        });

        // After the epoch update so the re-entry flags survive.
        if let Some(reason) = run.fatal.clone() {
            self.push_transition(&mut run.report, SmSignal::FatalDesync { reason });
        } else if self.sm.state() == SmState::Discovering && !run.local_unreachable {
            self.push_transition(&mut run.report, SmSignal::DiscoveryComplete);
        }

        if addresses_assigned && !errors && !self.epoch.moved_to_master_state {
            self.epoch.moved_to_master_state = true;
            self.emit(SmEventKind::SubnetUp {
                sweep_id,
                ports: self.tables.len(EntityKind::Port),
            });
        }

        if self.epoch.subnet_initialization_error {
            let report = &run.report;
            let errors = report
                .topology_errors
                .iter()
                .map(ToString::to_string)
                .chain(report.cycle_errors.iter().map(ToString::to_string))
                .chain(report.address_errors.iter().map(|(guid, e)| format!("{}: {}", guid, e)))
                .collect();
            self.emit(SmEventKind::InitializationError {
                sweep_id,
                unresolved: report.unresolved.clone(),
                errors,
            });
        }
    }

    /// Drops discovered entities this sweep did not see. Nodes behind an
    /// unresolved probe are kept with their ports.
    fn evict_unobserved(&mut self, run: &mut SweepRun) {
        let mut master_lost = false;
        let retained: HashSet<Guid> = run
            .unresolved
            .iter()
            .filter_map(|pp| self.tables.remote_of(*pp))
            .map(|remote| remote.node)
            .collect();

        for kind in [EntityKind::Switch, EntityKind::Node, EntityKind::Router] {
            for guid in self.tables.guids(kind) {
                let entity = EntityRef::new(kind, guid);
                if run.observed.contains(&entity) || retained.contains(&guid) {
                    continue;
                }
                let ports = self.tables.ports_of_node(guid);
                if self.remove_entity(kind, guid, &mut master_lost).is_some() {
                    debug!(%guid, ?kind, "evicted");
                    run.report.removed.push(entity);
                    run.report
                        .removed
                        .extend(ports.into_iter().map(|p| EntityRef::new(EntityKind::Port, p)));
                }
            }
        }

        // Ports that vanished from a node that is still present.
        for guid in self.tables.guids(EntityKind::Port) {
            let entity = EntityRef::new(EntityKind::Port, guid);
            let owner = self.tables.port(guid).map(|p| p.attrs.node);
            if run.observed.contains(&entity) || owner.map_or(false, |n| retained.contains(&n)) {
                continue;
            }
            if self
                .remove_entity(EntityKind::Port, guid, &mut master_lost)
                .is_some()
            {
                run.report.removed.push(entity);
            }
        }

        if master_lost {
            info!(sweep_id = run.report.sweep_id, "master's node evicted");
            match self.master_lost() {
                Ok(Some(t)) => run.report.transitions.push(t),
                Ok(None) => {}
                Err(err) => warn!(%err, "election after master eviction failed"),
            }
        }
    }

    /// LID and MLID assignment. Returns true if anything could not be
    /// assigned.
    fn assign_addresses(&mut self, report: &mut SweepReport) -> bool {
        let decision = report.decision;
        let mut failed = false;
        if decision.rebuild_index {
            let rejected = self.rebuild_index();
            failed |= !rejected.is_empty();
            report.address_errors.extend(rejected);
        }

        let mut pins = BTreeMap::new();
        let mut hook_changed = false;
        if let Some(hook) = self.lid_hook.clone() {
            let view = TopologySnapshot::capture(report.sweep_id, false, &self.tables, &self.index);
            hook_changed = hook.pre_assign(&view, &mut pins);
        }
        let policy = AssignmentPolicy {
            reassign_lids: decision.reassign_lids,
            reassert_all: decision.reassert_all,
            honor_persisted: self.options.honor_guid2lid_file,
        };
        let lids = self
            .lids
            .assign(&mut self.tables, &mut self.index, &self.options, policy, &pins);
        if hook_changed || lids.hook_changed {
            debug!(pins = pins.len(), "pre-assignment hook pinned LIDs");
        }
        failed |= !lids.errors.is_empty();
        report.lid_updates = lids.reasserted;
        report.address_errors.extend(lids.errors);

        if !self.options.disable_multicast {
            let mlids = self.mcast.assign_mlids(&mut self.tables, &mut self.index);
            failed |= !mlids.errors.is_empty();
            report.mlid_updates = mlids.assigned;
            report.address_errors.extend(mlids.errors);
            let deltas = self.mcast.take_deltas(&self.tables);
            if let Some(hook) = &self.mcast_hook {
                for delta in &deltas {
                    hook.on_membership_delta(delta);
                }
            }
        }

        let base = self.index.binding_of(self.sm.sm_port_guid).map(|(lid, _)| lid);
        self.sm.sm_base_lid = base;
        self.sm.master_sm_base_lid = base;
        failed
    }

    /// Runs the routing engine and keeps the tables that differ from what
    /// the switches hold. With `ignore_existing_lfts` every table is kept.
    fn plan_forwarding(&mut self, report: &mut SweepReport, snapshot: &TopologySnapshot) {
        let computed = self.routing.compute(snapshot);
        for table in computed {
            let Some(sw) = self.tables.switch(table.switch) else {
                debug!(switch = %table.switch, engine = self.routing.name(), "table for unknown switch dropped");
                continue;
            };
            if report.decision.ignore_existing_lfts || sw.lft != table.entries {
                report.forwarding.push(table);
            }
        }
        if report.forwarding.is_empty() {
            self.epoch.forwarding_installed(true);
        }
    }

    fn finish_light(&mut self, run: &mut SweepRun) {
        run.report.aborted = run.aborted;
        run.report.unresolved = self.tables.watch_list().to_vec();
        if run.aborted {
            return;
        }
        self.epoch.finish_light(run.report.changes_detected);
        if run.report.changes_detected {
            info!(sweep_id = run.report.sweep_id, "light sweep saw a change, heavy sweep requested");
        }
        if self.sm.is_master() {
            let snapshot = Arc::new(TopologySnapshot::capture(
                run.report.sweep_id,
                false,
                &self.tables,
                &self.index,
            ));
            self.plan_forwarding(&mut run.report, &snapshot);
            self.last_snapshot = Some(snapshot.clone());
            run.report.snapshot = Some(snapshot);
        }
    }

    /// Records what the transport did with a report's LID updates and
    /// forwarding tables. Installed tables become the switches' current
    /// tables; failures are reported and retried on a later cycle.
    pub fn complete_programming(
        &mut self,
        report: &mut SweepReport,
        lid_results: Vec<(LidUpdate, Result<(), InstallError>)>,
        table_results: Vec<(ForwardingTable, Result<(), InstallError>)>,
    ) {
        let mut lids_ok = true;
        for (update, result) in lid_results {
            if let Err(err) = result {
                warn!(port = %update.port, lid = %update.lid, %err, "LID programming failed");
                lids_ok = false;
                self.emit(SmEventKind::InstallFailed {
                    entity: err.entity,
                    message: err.message.clone(),
                });
                report.install_errors.push(err);
            }
        }
        if !lids_ok {
            self.epoch.subnet_initialization_error = true;
        }

        let mut tables_ok = true;
        for (table, result) in table_results {
            match result {
                Ok(()) => {
                    if let Some(sw) = self.tables.switch_mut(table.switch) {
                        sw.lft = table.entries;
                        report.forwarding_updates.push(table.switch);
                    }
                }
                Err(err) => {
                    tables_ok = false;
                    self.emit(SmEventKind::InstallFailed {
                        entity: err.entity,
                        message: err.message.clone(),
                    });
                    report.install_errors.push(err);
                }
            }
        }
        self.epoch.forwarding_installed(tables_ok);
    }
}
