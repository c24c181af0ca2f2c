//! Sweep controller: per-cycle sweep selection and the sticky flags that
//! carry state from one cycle to the next.
//!
//! [`decide`] is a pure function from the flags, the options and a few
//! cycle inputs to a [`SweepDecision`]. The flags live in
//! [`SweepEpochState`], which the subnet context owns and threads through
//! the state machine and the discovery run; they are only ever updated at
//! the well-defined points below.

use crate::entity::EntityRef;
use crate::error::{AddressError, SmError, TopologyError};
use crate::options::SubnetOptions;
use crate::plugin::{ForwardingTable, InstallError};
use crate::snapshot::TopologySnapshot;
use crate::state_machine::{SmState, Transition};
use fabric_sm_types::{Guid, Lid, PhysPortRef};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Flags that persist across sweep cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepEpochState {
    /// Set on trap or handover; cleared once the forced heavy sweep completes.
    pub force_immediate_heavy_sweep: bool,
    /// Set on an anomaly seen by a light sweep; consumed at the start of the
    /// next cycle.
    pub force_delayed_heavy_sweep: bool,
    /// Hop-0 bring-up sweep requested.
    pub in_sweep_hop_0: bool,
    /// From entry to Master until the end of that cycle's address phase.
    pub first_time_master_sweep: bool,
    /// First sweep after Standby to Master.
    pub coming_out_of_standby: bool,
    /// Pre-master discovery stage.
    pub need_update: bool,
    /// Forwarding must be recomputed and pushed regardless of what the
    /// switches already hold.
    pub ignore_existing_lfts: bool,
    /// Sticky until a heavy sweep completes without errors.
    pub subnet_initialization_error: bool,
    /// Latch for the one-off "subnet up" notification.
    pub moved_to_master_state: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    /// Probe the local port and its immediate neighbours only.
    HopZero,
    Heavy,
    Light,
    /// Nothing to do this cycle.
    Idle,
}

/// Which rule selected the sweep kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepReason {
    Inactive,
    HopZeroRequested,
    ForcedImmediate,
    InitializationError,
    BecameMaster,
    PreMasterDiscovery,
    ForcedByOption,
    DelayedHeavy,
    WatchList,
    IntervalElapsed,
    NothingPending,
}

/// Inputs to [`decide`] that are not sticky flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepInputs {
    pub role: SmState,
    pub watch_list_len: usize,
    pub interval_elapsed: bool,
}

/// What one cycle will do, fixed at the start of the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepDecision {
    pub kind: SweepKind,
    pub reason: SweepReason,
    /// Run LID and MLID assignment (Master only).
    pub assign_addresses: bool,
    /// Discard every existing LID and allocate from scratch.
    pub reassign_lids: bool,
    /// Re-assert every assignment downstream, changed or not.
    pub reassert_all: bool,
    /// Rebuild the LID index from the tables before assigning.
    pub rebuild_index: bool,
    /// Push forwarding tables even where they look unchanged.
    pub ignore_existing_lfts: bool,
    /// This cycle consumes `force_delayed_heavy_sweep`.
    pub consumes_delayed: bool,
}

impl SweepDecision {
    fn new(kind: SweepKind, reason: SweepReason) -> Self {
        Self {
            kind,
            reason,
            assign_addresses: false,
            reassign_lids: false,
            reassert_all: false,
            rebuild_index: false,
            ignore_existing_lfts: false,
            consumes_delayed: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.kind == SweepKind::Idle
    }
}

/// Selects the sweep kind for this cycle. First matching rule wins:
///
/// 1. hop-0 requested
/// 2. forced immediate, initialization error, new master, pre-master
///    discovery, or the `force_heavy_sweep` option: heavy
/// 3. delayed heavy from the previous cycle: heavy
/// 4. non-empty watch list or elapsed interval: light
/// 5. idle
pub fn decide(epoch: &SweepEpochState, opts: &SubnetOptions, inputs: &SweepInputs) -> SweepDecision {
    if inputs.role == SmState::NotActive {
        return SweepDecision::new(SweepKind::Idle, SweepReason::Inactive);
    }
    if epoch.in_sweep_hop_0 {
        return SweepDecision::new(SweepKind::HopZero, SweepReason::HopZeroRequested);
    }

    let heavy_reason = if epoch.force_immediate_heavy_sweep {
        Some(SweepReason::ForcedImmediate)
    } else if epoch.subnet_initialization_error {
        Some(SweepReason::InitializationError)
    } else if inputs.role == SmState::Master
        && (epoch.first_time_master_sweep || epoch.coming_out_of_standby)
    {
        Some(SweepReason::BecameMaster)
    } else if epoch.need_update {
        Some(SweepReason::PreMasterDiscovery)
    } else if opts.force_heavy_sweep {
        Some(SweepReason::ForcedByOption)
    } else if epoch.force_delayed_heavy_sweep {
        Some(SweepReason::DelayedHeavy)
    } else {
        None
    };

    let mut decision = match heavy_reason {
        Some(reason) => SweepDecision::new(SweepKind::Heavy, reason),
        None if inputs.watch_list_len > 0 => {
            SweepDecision::new(SweepKind::Light, SweepReason::WatchList)
        }
        None if inputs.interval_elapsed => {
            SweepDecision::new(SweepKind::Light, SweepReason::IntervalElapsed)
        }
        None => return SweepDecision::new(SweepKind::Idle, SweepReason::NothingPending),
    };

    if decision.kind == SweepKind::Heavy {
        // A pending delayed request is satisfied by any heavy sweep.
        decision.consumes_delayed = epoch.force_delayed_heavy_sweep;
        decision.assign_addresses = inputs.role == SmState::Master;
        decision.reassign_lids = opts.reassign_lids;
        decision.reassert_all = epoch.first_time_master_sweep;
        decision.rebuild_index = inputs.role == SmState::Master && epoch.coming_out_of_standby;
    }
    decision.ignore_existing_lfts = epoch.ignore_existing_lfts;
    decision
}

/// How a heavy sweep ended, as far as the sticky flags care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeavyCompletion {
    pub aborted: bool,
    /// Unresolved probes or configuration errors remain.
    pub errors: bool,
    /// The address phase ran to completion.
    pub addresses_assigned: bool,
}

impl SweepEpochState {
    /// Applies the start-of-cycle updates for `decision`.
    pub fn begin(&mut self, decision: &SweepDecision) {
        if decision.consumes_delayed {
            self.force_delayed_heavy_sweep = false;
        }
    }

    /// Applies the end-of-cycle updates after a heavy sweep.
    pub fn finish_heavy(&mut self, done: &HeavyCompletion) {
        if done.aborted {
            // Re-run promptly; nothing else is considered settled.
            self.force_immediate_heavy_sweep = true;
            return;
        }
        self.force_immediate_heavy_sweep = false;
        self.need_update = false;
        self.subnet_initialization_error = done.errors;
        if done.addresses_assigned {
            self.first_time_master_sweep = false;
            self.coming_out_of_standby = false;
        }
    }

    /// Applies the end-of-cycle updates after a light sweep.
    pub fn finish_light(&mut self, changes_detected: bool) {
        if changes_detected {
            self.force_delayed_heavy_sweep = true;
        }
    }

    /// Records the result of installing the cycle's forwarding tables.
    pub fn forwarding_installed(&mut self, all_ok: bool) {
        if all_ok {
            self.ignore_existing_lfts = false;
        }
    }

    pub fn finish_hop_zero(&mut self) {
        self.in_sweep_hop_0 = false;
    }
}

/// A LID assignment pushed downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LidUpdate {
    pub port: Guid,
    pub lid: Lid,
    pub lmc: u8,
}

/// Outcome of one sweep cycle. Expected fabric instability is reported
/// here and in the sticky flags, never as an `Err`.
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub sweep_id: u64,
    pub decision: SweepDecision,
    pub aborted: bool,
    pub duration: Duration,
    pub added: Vec<EntityRef>,
    pub updated: Vec<EntityRef>,
    pub removed: Vec<EntityRef>,
    /// Physical ports left on the watch list.
    pub unresolved: Vec<PhysPortRef>,
    pub topology_errors: Vec<TopologyError>,
    pub address_errors: Vec<(Guid, AddressError)>,
    /// Unresolved probes, role conflicts and desyncs seen this cycle.
    pub cycle_errors: Vec<SmError>,
    /// Assignments to re-assert on the ports.
    pub lid_updates: Vec<LidUpdate>,
    pub mlid_updates: Vec<(Guid, Lid)>,
    /// Forwarding tables to install downstream.
    pub forwarding: Vec<ForwardingTable>,
    /// Switches whose installed table changed this cycle.
    pub forwarding_updates: Vec<Guid>,
    pub install_errors: Vec<InstallError>,
    /// Topology published to routing; absent for idle cycles.
    pub snapshot: Option<Arc<TopologySnapshot>>,
    /// Address assignment was skipped because the topology is inconsistent.
    pub degraded: bool,
    pub transitions: Vec<Transition>,
    /// A fatal desync occurred and the options ask the process to exit.
    pub terminate_requested: bool,
    /// A light sweep saw a change and requested a delayed heavy sweep.
    pub changes_detected: bool,
}

impl SweepReport {
    pub(crate) fn new(sweep_id: u64, decision: SweepDecision) -> Self {
        Self {
            sweep_id,
            decision,
            aborted: false,
            duration: Duration::ZERO,
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            unresolved: Vec::new(),
            topology_errors: Vec::new(),
            address_errors: Vec::new(),
            cycle_errors: Vec::new(),
            lid_updates: Vec::new(),
            mlid_updates: Vec::new(),
            forwarding: Vec::new(),
            forwarding_updates: Vec::new(),
            install_errors: Vec::new(),
            snapshot: None,
            degraded: false,
            transitions: Vec::new(),
            terminate_requested: false,
            changes_detected: false,
        }
    }

    pub fn kind(&self) -> SweepKind {
        self.decision.kind
    }

    /// Reason of the fatal desync that asked for termination, if any.
    pub fn fatal_reason(&self) -> Option<String> {
        if !self.terminate_requested {
            return None;
        }
        let reason = self.cycle_errors.iter().find_map(|e| match e {
            SmError::FatalTopologyDesync { reason } => Some(reason.clone()),
            _ => None,
        });
        Some(reason.unwrap_or_else(|| "fatal topology desync".to_string()))
    }

    /// True when the sweep found nothing wrong.
    pub fn is_clean(&self) -> bool {
        !self.aborted
            && !self.degraded
            && self.unresolved.is_empty()
            && self.topology_errors.is_empty()
            && self.address_errors.is_empty()
            && self.cycle_errors.is_empty()
            && self.install_errors.is_empty()
    }
}
