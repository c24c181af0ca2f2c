//! Control-plane core of the fabric subnet manager.
//!
//! This crate keeps the authoritative picture of a switched fabric and
//! decides what to do with it on every sweep cycle:
//!
//! - [`EntityTables`]: GUID-keyed tables of switches, channel adapters,
//!   routers, ports, partitions, multicast groups and peer managers
//! - [`LidIndex`]: O(1) LID to entity resolution bounded by the fabric's
//!   forwarding horizon
//! - [`ManagerStateMachine`]: NotActive / Discovering / Standby / Master
//! - [`decide`] and [`SweepEpochState`]: heavy, light and hop-0 sweep
//!   selection with sticky cross-cycle flags
//! - [`Subnet`]: the aggregate owning all of the above, driven one sweep at
//!   a time by a [`SweepScheduler`] over a [`ProbeTransport`]
//!
//! Routing, LID pinning and multicast policy are injected through the
//! [`RoutingEngine`], [`LidAssignHook`] and [`MulticastHook`] traits.

pub mod discovery;
pub mod entity;
pub mod error;
pub mod events;
pub mod lid_index;
pub mod lid_mgr;
pub mod mcast_mgr;
pub mod options;
pub mod plugin;
pub mod scheduler;
pub mod sim;
pub mod snapshot;
pub mod state_machine;
pub mod subnet;
pub mod sweep;
pub mod table;
pub mod tables;

pub use discovery::{
    NodeDescription, PeerSmInfo, PortDescription, PortStatus, ProbeData, ProbeOutcome,
    ProbeQuery, ProbeRequest, ProbeTarget, SweepStart, SwitchCapabilities,
};
pub use entity::{
    Entity, EntityAttrs, EntityKind, EntityRef, MulticastGroupAttrs, MulticastGroupRecord,
    NodeAttrs, NodeRecord, PartitionAttrs, PartitionRecord, PeerManagerAttrs, PeerManagerRecord,
    PhysPort, PortAttrs, PortRecord, SwitchAttrs, SwitchRecord, UpsertChange, UpsertOutcome,
};
pub use error::{AddressError, SmError, SmResult, StateError, TopologyError};
pub use events::{EventSink, MemoryEventSink, SmEvent, SmEventKind, TracingEventSink};
pub use lid_index::{lmc_block, LidIndex};
pub use lid_mgr::{AssignmentPolicy, LidAssignmentReport, LidBinding, LidManager};
pub use mcast_mgr::{McastManager, MlidAssignmentReport};
pub use options::{PortClass, QosOptions, QosSettings, SubnetOptions, MAX_LMC, MAX_SM_PRIORITY};
pub use plugin::{
    ForwardingTable, InstallError, LidAssignHook, MulticastDelta, MulticastHook,
    NoopRoutingEngine, RoutingEngine,
};
pub use scheduler::{ProbeTransport, SweepScheduler};
pub use sim::{SimNode, SimTopology, SimulatedFabric};
pub use snapshot::TopologySnapshot;
pub use state_machine::{
    Candidate, ElectionPolicy, ManagerStateMachine, PeerView, SmSignal, SmState, TieBreak,
    Transition,
};
pub use subnet::{PeerAging, Subnet};
pub use sweep::{
    decide, HeavyCompletion, LidUpdate, SweepDecision, SweepEpochState, SweepInputs, SweepKind,
    SweepReason, SweepReport,
};
pub use table::EntityTable;
pub use tables::EntityTables;

pub use fabric_sm_types::{Guid, Lid, LinkState, NodeType, PKey, PhysPortRef};
