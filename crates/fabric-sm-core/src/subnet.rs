//! Subnet context: the aggregate that owns the entity tables, the LID index,
//! the manager state machine and the sticky sweep flags.
//!
//! The context is not internally synchronized. Exactly one sweep cycle may
//! be in flight and the caller holds one exclusive lock around the whole
//! cycle (see [`SweepScheduler`](crate::SweepScheduler)); every mutation
//! below is a plain synchronous state transition.

use crate::discovery::SweepRun;
use crate::entity::{Entity, EntityAttrs, EntityKind, EntityRef, PeerManagerAttrs, UpsertOutcome};
use crate::error::{AddressError, SmError, SmResult, TopologyError};
use crate::events::{EventSink, SmEvent, SmEventKind, TracingEventSink};
use crate::lid_index::LidIndex;
use crate::lid_mgr::{LidBinding, LidManager};
use crate::mcast_mgr::McastManager;
use crate::options::SubnetOptions;
use crate::plugin::{LidAssignHook, MulticastHook, NoopRoutingEngine, RoutingEngine};
use crate::snapshot::TopologySnapshot;
use crate::state_machine::{
    Candidate, ElectionPolicy, ManagerStateMachine, PeerView, SmSignal, SmState, Transition,
};
use crate::sweep::{decide, SweepDecision, SweepEpochState, SweepInputs};
use crate::tables::EntityTables;
use fabric_sm_types::{Guid, Lid};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of aging the peer-manager table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerAging {
    pub aged: Vec<Guid>,
    pub transition: Option<Transition>,
}

pub struct Subnet {
    pub(crate) options: SubnetOptions,
    pub(crate) tables: EntityTables,
    pub(crate) index: LidIndex,
    pub(crate) lids: LidManager,
    pub(crate) mcast: McastManager,
    pub(crate) sm: ManagerStateMachine,
    pub(crate) epoch: SweepEpochState,
    pub(crate) routing: Arc<dyn RoutingEngine>,
    pub(crate) lid_hook: Option<Arc<dyn LidAssignHook>>,
    pub(crate) mcast_hook: Option<Arc<dyn MulticastHook>>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) next_sweep_id: u64,
    pub(crate) last_sweep_at: Option<Instant>,
    pub(crate) run: Option<SweepRun>,
    pub(crate) last_snapshot: Option<Arc<TopologySnapshot>>,
}

impl std::fmt::Debug for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subnet")
            .field("state", &self.sm.state())
            .field("epoch", &self.epoch)
            .field("routing", &self.routing.name())
            .field("next_sweep_id", &self.next_sweep_id)
            .field("sweep_in_progress", &self.run.is_some())
            .finish()
    }
}

impl Subnet {
    /// Creates a context from validated options. The manager starts
    /// NotActive with empty tables.
    pub fn new(options: SubnetOptions) -> SmResult<Self> {
        options.validate()?;
        let local = Candidate::new(options.sm_priority, options.guid);
        let sm = ManagerStateMachine::new(local, ElectionPolicy::new(options.tie_break))
            .with_inactive(options.sm_inactive);
        Ok(Self {
            options,
            tables: EntityTables::new(),
            index: LidIndex::new(),
            lids: LidManager::new(),
            mcast: McastManager::new(),
            sm,
            epoch: SweepEpochState::default(),
            routing: Arc::new(NoopRoutingEngine),
            lid_hook: None,
            mcast_hook: None,
            events: Arc::new(TracingEventSink),
            next_sweep_id: 1,
            last_sweep_at: None,
            run: None,
            last_snapshot: None,
        })
    }

    pub fn with_routing_engine(mut self, engine: Arc<dyn RoutingEngine>) -> Self {
        self.routing = engine;
        self
    }

    pub fn with_lid_hook(mut self, hook: Arc<dyn LidAssignHook>) -> Self {
        self.lid_hook = Some(hook);
        self
    }

    pub fn with_multicast_hook(mut self, hook: Arc<dyn MulticastHook>) -> Self {
        self.mcast_hook = Some(hook);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    // ===== Read access =====

    pub fn options(&self) -> &SubnetOptions {
        &self.options
    }

    pub fn tables(&self) -> &EntityTables {
        &self.tables
    }

    pub fn index(&self) -> &LidIndex {
        &self.index
    }

    pub fn state(&self) -> SmState {
        self.sm.state()
    }

    pub fn manager(&self) -> &ManagerStateMachine {
        &self.sm
    }

    pub fn epoch(&self) -> &SweepEpochState {
        &self.epoch
    }

    pub fn max_unicast_lid_ho(&self) -> Lid {
        self.index.max_unicast_lid_ho()
    }

    pub fn max_multicast_lid_ho(&self) -> Lid {
        self.index.max_multicast_lid_ho()
    }

    /// Topology published at the end of the last sweep.
    pub fn snapshot(&self) -> Option<Arc<TopologySnapshot>> {
        self.last_snapshot.clone()
    }

    pub fn sweep_in_progress(&self) -> bool {
        self.run.is_some()
    }

    pub(crate) fn emit(&self, kind: SmEventKind) {
        self.events.emit(SmEvent::now(kind));
    }

    // ===== Entity table operations =====

    /// Inserts or updates an entity and keeps the LID index in step.
    ///
    /// A port or multicast group carrying an address is registered in the
    /// index; if the address collides or lies beyond the horizon the
    /// entity is kept but left unaddressed. A GUID bound to a different
    /// variant is refused, the existing entity retained, and the cycle
    /// flagged with `subnet_initialization_error`.
    pub fn upsert(&mut self, guid: Guid, attrs: EntityAttrs) -> Result<UpsertOutcome, TopologyError> {
        let outcome = match self.tables.upsert(guid, attrs) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%guid, %err, "upsert refused");
                self.epoch.subnet_initialization_error = true;
                self.emit(SmEventKind::TopologyConflict {
                    guid,
                    message: err.to_string(),
                });
                return Err(err);
            }
        };
        match outcome.entity.kind {
            EntityKind::Port => self.sync_port_index(guid),
            EntityKind::MulticastGroup => self.sync_group_index(guid),
            _ => {}
        }
        Ok(outcome)
    }

    fn sync_port_index(&mut self, guid: Guid) {
        let Some(port) = self.tables.port(guid) else { return };
        match port.attrs.lid {
            Some(lid) => {
                let lmc = port.attrs.lmc;
                if self.index.binding_of(guid) == Some((lid, lmc)) {
                    return;
                }
                if let Err(err) = self.index.assign_lid(guid, lid, lmc) {
                    // The tables must never carry an address the index refuses.
                    self.index.release(guid);
                    if let Some(port) = self.tables.port_mut(guid) {
                        port.attrs.lid = None;
                    }
                    self.note_address_error(guid, err);
                }
            }
            None => {
                self.index.release(guid);
            }
        }
    }

    fn sync_group_index(&mut self, guid: Guid) {
        let Some(group) = self.tables.multicast_group(guid) else { return };
        match group.attrs.mlid {
            Some(mlid) => {
                if self.index.mlid_of(guid) == Some(mlid) {
                    return;
                }
                if let Err(err) = self.index.assign_mlid(guid, mlid) {
                    self.index.release_mlid(guid);
                    if let Some(group) = self.tables.multicast_group_mut(guid) {
                        group.attrs.mlid = None;
                    }
                    self.note_address_error(guid, err);
                }
            }
            None => {
                self.index.release_mlid(guid);
            }
        }
    }

    pub(crate) fn note_address_error(&mut self, guid: Guid, err: AddressError) {
        debug!(%guid, %err, "address left unassigned");
        if let Some(run) = self.run.as_mut() {
            run.report.address_errors.push((guid, err));
        }
    }

    /// Removes an entity, deregistering it from the LID index first.
    ///
    /// Removing a switch, channel adapter or router also removes its ports,
    /// the peer managers bound to them, and their multicast memberships.
    /// Losing the master's peer entry while Standby runs the election again.
    /// Absent GUIDs are a no-op.
    pub fn remove(&mut self, kind: EntityKind, guid: Guid) -> Option<Entity> {
        let mut master_lost = false;
        let removed = self.remove_entity(kind, guid, &mut master_lost);
        if master_lost {
            if let Err(err) = self.master_lost() {
                warn!(%err, "election after master removal failed");
            }
        }
        removed
    }

    /// [`Subnet::remove`] without the election; `master_lost` is set when a
    /// peer that claimed Master went with the entity.
    pub(crate) fn remove_entity(
        &mut self,
        kind: EntityKind,
        guid: Guid,
        master_lost: &mut bool,
    ) -> Option<Entity> {
        match kind {
            EntityKind::Port => {
                self.index.release(guid);
                let removed = self.tables.remove(kind, guid)?;
                *master_lost |= self.forget_peer(guid);
                McastManager::prune_members(&mut self.tables, &[guid]);
                Some(removed)
            }
            EntityKind::MulticastGroup => {
                self.index.release_mlid(guid);
                self.tables.remove(kind, guid)
            }
            EntityKind::Switch | EntityKind::Node | EntityKind::Router => {
                self.tables.lookup(kind, guid)?;
                let ports = self.tables.ports_of_node(guid);
                for port in &ports {
                    self.index.release(*port);
                    self.tables.remove(EntityKind::Port, *port);
                    *master_lost |= self.forget_peer(*port);
                }
                McastManager::prune_members(&mut self.tables, &ports);
                self.tables.remove(kind, guid)
            }
            EntityKind::PeerManager => {
                let was_master = self.peer_is_master(guid);
                let removed = self.tables.remove(kind, guid)?;
                *master_lost |= was_master;
                Some(removed)
            }
            EntityKind::Partition => self.tables.remove(kind, guid),
        }
    }

    fn peer_is_master(&self, port_guid: Guid) -> bool {
        self.tables
            .peer_manager(port_guid)
            .map_or(false, |p| p.attrs.state == SmState::Master)
    }

    /// Drops the peer bound to a removed port. Returns true if it was the
    /// master.
    fn forget_peer(&mut self, port_guid: Guid) -> bool {
        let was_master = self.peer_is_master(port_guid);
        if self.tables.remove(EntityKind::PeerManager, port_guid).is_some() {
            self.emit(SmEventKind::PeerRemoved {
                guid: port_guid,
                was_master,
            });
        }
        was_master
    }

    /// The master's peer entry is gone. A Standby manager forgets the
    /// master's LID and runs the election among the remaining peers.
    pub(crate) fn master_lost(&mut self) -> SmResult<Option<Transition>> {
        if self.sm.state() != SmState::Standby {
            return Ok(None);
        }
        self.sm.master_sm_base_lid = None;
        self.handle_signal(SmSignal::MasterAgedOut)
    }

    pub fn lookup(&self, kind: EntityKind, guid: Guid) -> Option<EntityRef> {
        self.tables.lookup(kind, guid)
    }

    // ===== Addressing =====

    /// Binds a port to `lid` in both the index and the tables.
    pub fn assign_lid(&mut self, port: Guid, lid: Lid) -> Result<(), AddressError> {
        if self.tables.port(port).is_none() {
            return Err(AddressError::UnknownEntity(port));
        }
        let lmc = LidManager::lmc_for(&self.tables, port, &self.options);
        self.index.assign_lid(port, lid, lmc)?;
        if let Some(record) = self.tables.port_mut(port) {
            record.attrs.lid = Some(lid);
            record.attrs.lmc = lmc;
        }
        Ok(())
    }

    /// Resolves a unicast or multicast LID in O(1).
    pub fn resolve(&self, lid: Lid) -> Option<EntityRef> {
        self.index.resolve(lid)
    }

    /// Discards the index and rebuilds it from the tables. Entities whose
    /// address cannot be registered lose it.
    pub fn rebuild_index(&mut self) -> Vec<(Guid, AddressError)> {
        let rejected = self.index.rebuild_from(&self.tables);
        for (guid, _) in &rejected {
            if let Some(port) = self.tables.port_mut(*guid) {
                port.attrs.lid = None;
            }
            if let Some(group) = self.tables.multicast_group_mut(*guid) {
                group.attrs.mlid = None;
            }
        }
        info!(bindings = self.index.len(), rejected = rejected.len(), "LID index rebuilt from tables");
        rejected
    }

    /// Recomputes the horizon from the switch table and shrinks or grows
    /// the index to match. Returns the GUIDs that lost their address.
    pub(crate) fn refresh_horizon(&mut self) -> Vec<Guid> {
        let (ucast, mcast) = LidIndex::horizon_of(&self.tables);
        let dropped = self.index.set_horizon(ucast, mcast);
        for guid in &dropped {
            if let Some(port) = self.tables.port_mut(*guid) {
                port.attrs.lid = None;
            }
            if let Some(group) = self.tables.multicast_group_mut(*guid) {
                group.attrs.mlid = None;
            }
        }
        dropped
    }

    /// Loads persisted GUID to LID bindings.
    pub fn seed_lid_bindings(&mut self, bindings: impl IntoIterator<Item = (Guid, LidBinding)>) {
        self.lids.seed(bindings);
    }

    /// Current GUID to LID bindings, for the persistence collaborator.
    pub fn lid_bindings(&self) -> BTreeMap<Guid, LidBinding> {
        self.tables
            .ports()
            .filter_map(|p| {
                let (lid, lmc) = self.index.binding_of(p.guid)?;
                Some((p.guid, LidBinding { lid, lmc }))
            })
            .collect()
    }

    // ===== Manager role =====

    pub(crate) fn peer_views(&self) -> Vec<PeerView> {
        self.tables
            .peer_managers()
            .map(|p| PeerView {
                candidate: Candidate::new(p.attrs.priority, p.guid),
                state: p.attrs.state,
            })
            .collect()
    }

    /// Feeds a signal to the state machine and publishes the transition.
    pub fn handle_signal(&mut self, signal: SmSignal) -> SmResult<Option<Transition>> {
        let peers = self.peer_views();
        let transition = self.sm.apply(signal, &peers, &mut self.epoch)?;
        if let Some(t) = &transition {
            self.emit(SmEventKind::RoleTransition {
                from: t.from,
                to: t.to,
                cause: t.cause.name().to_string(),
            });
            if let Some(run) = self.run.as_mut() {
                run.report.transitions.push(t.clone());
            }
        }
        Ok(transition)
    }

    /// Activates the manager: NotActive to Discovering.
    pub fn activate(&mut self) -> SmResult<Option<Transition>> {
        self.handle_signal(SmSignal::Activate)
    }

    /// Records a peer manager heartbeat. Ignored when `ignore_other_sm` is
    /// set. A peer claiming Master while we are Master is resolved by rank.
    pub fn record_peer(
        &mut self,
        port_guid: Guid,
        priority: u8,
        state: SmState,
        base_lid: Option<Lid>,
        now: Instant,
    ) -> SmResult<Option<Transition>> {
        if self.options.ignore_other_sm || port_guid == self.sm.sm_port_guid {
            return Ok(None);
        }
        self.upsert(
            port_guid,
            EntityAttrs::PeerManager(PeerManagerAttrs {
                priority,
                state,
                base_lid,
            }),
        )?;
        if let Some(peer) = self.tables.peer_manager_mut(port_guid) {
            peer.last_seen = Some(now);
        }
        if state == SmState::Master {
            if self.sm.is_master() {
                return self.on_peer_master_claim(Candidate::new(priority, port_guid));
            }
            self.sm.master_sm_base_lid = base_lid;
        }
        Ok(None)
    }

    /// Resolves two managers both claiming Master. The loser is us only if
    /// the peer outranks us, in which case we drop to Standby.
    pub fn on_peer_master_claim(&mut self, peer: Candidate) -> SmResult<Option<Transition>> {
        if !self.sm.is_master() {
            return Ok(None);
        }
        let local = self.sm.local();
        let winner = if self.sm.policy().outranks(&peer, &local) {
            peer.guid
        } else {
            local.guid
        };
        let conflict = SmError::RoleConflict {
            peer: peer.guid,
            winner,
        };
        warn!(%conflict, "two managers claim master");
        self.emit(SmEventKind::RoleConflict {
            peer: peer.guid,
            winner,
        });
        if let Some(run) = self.run.as_mut() {
            run.report.cycle_errors.push(conflict);
        }
        self.handle_signal(SmSignal::PeerMasterClaim { peer })
    }

    /// Drops peers silent for longer than the polling budget. If the master
    /// was among them and we are Standby, the election runs again.
    pub fn age_peers(&mut self, now: Instant) -> SmResult<PeerAging> {
        let timeout = self.options.peer_timeout();
        let stale: Vec<(Guid, bool)> = self
            .tables
            .peer_managers()
            .filter(|p| {
                p.last_seen
                    .map(|seen| now.saturating_duration_since(seen) > timeout)
                    .unwrap_or(false)
            })
            .map(|p| (p.guid, p.attrs.state == SmState::Master))
            .collect();

        let mut aging = PeerAging::default();
        let mut master_lost = false;
        for (guid, was_master) in stale {
            self.tables.remove(EntityKind::PeerManager, guid);
            self.emit(SmEventKind::PeerAgedOut { guid, was_master });
            master_lost |= was_master;
            aging.aged.push(guid);
        }
        if master_lost {
            aging.transition = self.master_lost()?;
        }
        Ok(aging)
    }

    // ===== External sweep triggers =====

    /// A trap arrived. Forces an immediate heavy sweep when `sweep_on_trap`
    /// is enabled; returns whether it did.
    pub fn on_trap(&mut self) -> bool {
        let accepted = self.options.sweep_on_trap && self.sm.state() != SmState::NotActive;
        if accepted {
            self.epoch.force_immediate_heavy_sweep = true;
        }
        self.emit(SmEventKind::TrapReceived { accepted });
        accepted
    }

    /// Requests a heavy sweep on the next cycle.
    pub fn request_heavy_sweep(&mut self) {
        self.epoch.force_immediate_heavy_sweep = true;
    }

    /// Requests a hop-0 bring-up sweep on the next cycle.
    pub fn request_hop_zero_sweep(&mut self) {
        self.epoch.in_sweep_hop_0 = true;
    }

    /// The decision the next cycle would make at `now`.
    pub fn next_decision(&self, now: Instant) -> SweepDecision {
        let interval_elapsed = match (self.last_sweep_at, self.options.sweep_interval()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(last), Some(interval)) => now.saturating_duration_since(last) >= interval,
        };
        decide(
            &self.epoch,
            &self.options,
            &SweepInputs {
                role: self.sm.state(),
                watch_list_len: self.tables.watch_list().len(),
                interval_elapsed,
            },
        )
    }

    /// Tears down every table. Used on manager shutdown.
    pub fn shutdown(&mut self) {
        self.run = None;
        self.tables.clear();
        self.index.clear();
        self.last_snapshot = None;
        info!("subnet context cleared");
    }
}
