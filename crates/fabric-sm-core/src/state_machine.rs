//! Manager role state machine.
//!
//! ```text
//!              Activate
//!  NotActive ───────────► Discovering ──DiscoveryComplete──► Standby
//!                              │   ▲                          │   ▲
//!        DiscoveryComplete /   │   │ FatalDesync              │   │ AcknowledgeHandover
//!        HandoverReceived      ▼   │                          ▼   │ PeerMasterClaim
//!                            Master ◄──HandoverReceived / MasterAgedOut
//! ```
//!
//! Every input is a [`SmSignal`]; [`ManagerStateMachine::apply`] either
//! returns the resulting [`Transition`], returns `None` for an accepted
//! input that does not move the role, or rejects the input.

use crate::error::StateError;
use crate::sweep::SweepEpochState;
use fabric_sm_types::{Guid, Lid};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::info;

/// Role of a subnet manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmState {
    #[default]
    NotActive,
    Discovering,
    Standby,
    Master,
}

impl fmt::Display for SmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SmState::NotActive => "not-active",
            SmState::Discovering => "discovering",
            SmState::Standby => "standby",
            SmState::Master => "master",
        };
        write!(f, "{}", s)
    }
}

/// A manager taking part in mastership election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub priority: u8,
    pub guid: Guid,
}

impl Candidate {
    pub const fn new(priority: u8, guid: Guid) -> Self {
        Self { priority, guid }
    }
}

/// How equal priorities are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The numerically lower GUID wins.
    #[default]
    LowerGuid,
    HigherGuid,
}

/// Mastership ranking: higher priority wins, ties go to the GUID favoured by
/// the tie-break rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ElectionPolicy {
    pub tie_break: TieBreak,
}

impl ElectionPolicy {
    pub const fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    /// Orders two candidates; `Greater` means `a` should be master over `b`.
    pub fn rank(&self, a: &Candidate, b: &Candidate) -> Ordering {
        a.priority.cmp(&b.priority).then_with(|| match self.tie_break {
            TieBreak::LowerGuid => b.guid.cmp(&a.guid),
            TieBreak::HigherGuid => a.guid.cmp(&b.guid),
        })
    }

    /// Returns true if `a` wins mastership against `b`.
    pub fn outranks(&self, a: &Candidate, b: &Candidate) -> bool {
        self.rank(a, b) == Ordering::Greater
    }

    /// The winner among a set of candidates.
    pub fn winner<'a>(&self, candidates: impl IntoIterator<Item = &'a Candidate>) -> Option<&'a Candidate> {
        candidates.into_iter().max_by(|a, b| self.rank(a, b))
    }
}

/// A peer manager as seen by the election: its ranking and reported role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerView {
    pub candidate: Candidate,
    pub state: SmState,
}

/// Inputs to the manager state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "signal")]
pub enum SmSignal {
    /// External activation of the manager.
    Activate,
    /// The discovery window closed with the topology observed.
    DiscoveryComplete,
    /// The current master handed mastership to us.
    HandoverReceived { from: Guid },
    /// The master's peer entry aged out.
    MasterAgedOut,
    /// A peer asks us to step down.
    HandoverDemand { from: Candidate },
    /// We acknowledged the pending handover demand.
    AcknowledgeHandover,
    /// A peer reports itself Master while we are Master.
    PeerMasterClaim { peer: Candidate },
    /// Unrecoverable protocol or topology inconsistency.
    FatalDesync { reason: String },
}

impl SmSignal {
    pub fn name(&self) -> &'static str {
        match self {
            SmSignal::Activate => "activate",
            SmSignal::DiscoveryComplete => "discovery-complete",
            SmSignal::HandoverReceived { .. } => "handover-received",
            SmSignal::MasterAgedOut => "master-aged-out",
            SmSignal::HandoverDemand { .. } => "handover-demand",
            SmSignal::AcknowledgeHandover => "acknowledge-handover",
            SmSignal::PeerMasterClaim { .. } => "peer-master-claim",
            SmSignal::FatalDesync { .. } => "fatal-desync",
        }
    }
}

/// A completed role change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: SmState,
    pub to: SmState,
    pub cause: SmSignal,
}

/// This manager's role and identity.
#[derive(Debug, Clone)]
pub struct ManagerStateMachine {
    state: SmState,
    local: Candidate,
    policy: ElectionPolicy,
    /// Peer whose handover demand awaits our acknowledgement.
    pending_handover: Option<Candidate>,
    /// Base LID of whichever manager is master, local or remote.
    pub master_sm_base_lid: Option<Lid>,
    /// This manager's own base LID.
    pub sm_base_lid: Option<Lid>,
    /// Port GUID this manager runs on.
    pub sm_port_guid: Guid,
    inactive: bool,
}

impl ManagerStateMachine {
    pub fn new(local: Candidate, policy: ElectionPolicy) -> Self {
        Self {
            state: SmState::NotActive,
            local,
            policy,
            pending_handover: None,
            master_sm_base_lid: None,
            sm_base_lid: None,
            sm_port_guid: local.guid,
            inactive: false,
        }
    }

    /// Keeps the manager NotActive; activation is refused.
    pub fn with_inactive(mut self, inactive: bool) -> Self {
        self.inactive = inactive;
        self
    }

    pub fn state(&self) -> SmState {
        self.state
    }

    pub fn local(&self) -> Candidate {
        self.local
    }

    pub fn policy(&self) -> ElectionPolicy {
        self.policy
    }

    pub fn pending_handover(&self) -> Option<Candidate> {
        self.pending_handover
    }

    pub fn is_master(&self) -> bool {
        self.state == SmState::Master
    }

    /// Binds the manager to its local port once discovery has seen it. A
    /// manager configured without a GUID takes the port GUID as its own.
    pub fn bind_port(&mut self, port_guid: Guid) {
        if self.local.guid.is_zero() {
            self.local.guid = port_guid;
        }
        self.sm_port_guid = port_guid;
    }

    /// Feeds one signal through the state machine.
    ///
    /// `peers` is the current peer-manager table; `epoch` receives the
    /// sticky flags set on entry to the new role.
    pub fn apply(
        &mut self,
        signal: SmSignal,
        peers: &[PeerView],
        epoch: &mut SweepEpochState,
    ) -> Result<Option<Transition>, StateError> {
        let next = match (&signal, self.state) {
            (SmSignal::Activate, SmState::NotActive) => {
                if self.inactive {
                    return Err(StateError::Inactive);
                }
                Some(SmState::Discovering)
            }

            (SmSignal::DiscoveryComplete, SmState::Discovering) => {
                if self.yields_to_any(peers) {
                    Some(SmState::Standby)
                } else {
                    Some(SmState::Master)
                }
            }

            (SmSignal::HandoverReceived { .. }, SmState::Discovering | SmState::Standby) => {
                Some(SmState::Master)
            }

            (SmSignal::MasterAgedOut, SmState::Standby) => {
                let beaten = peers
                    .iter()
                    .filter(|p| p.state != SmState::NotActive)
                    .all(|peer| self.policy.outranks(&self.local, &peer.candidate));
                beaten.then_some(SmState::Master)
            }
            (SmSignal::MasterAgedOut, _) => None,

            (SmSignal::HandoverDemand { from }, SmState::Master) => {
                if from.priority > self.local.priority {
                    info!(peer = %from.guid, priority = from.priority, "handover demand pending acknowledgement");
                    self.pending_handover = Some(*from);
                    None
                } else {
                    return Err(StateError::HandoverRejected {
                        peer_priority: from.priority,
                        local_priority: self.local.priority,
                    });
                }
            }

            (SmSignal::AcknowledgeHandover, SmState::Master) if self.pending_handover.is_some() => {
                Some(SmState::Standby)
            }

            (SmSignal::PeerMasterClaim { peer }, SmState::Master) => {
                self.policy
                    .outranks(peer, &self.local)
                    .then_some(SmState::Standby)
            }
            (SmSignal::PeerMasterClaim { .. }, SmState::Discovering | SmState::Standby) => None,

            (SmSignal::FatalDesync { .. }, SmState::Master | SmState::Standby) => {
                Some(SmState::Discovering)
            }
            (SmSignal::FatalDesync { .. }, SmState::Discovering) => {
                epoch.need_update = true;
                epoch.force_immediate_heavy_sweep = true;
                None
            }

            (_, state) => {
                return Err(StateError::InvalidTransition {
                    state,
                    signal: signal.name(),
                })
            }
        };

        let Some(to) = next else {
            return Ok(None);
        };
        let from = self.state;
        self.enter(to, from, epoch);
        info!(%from, %to, cause = signal.name(), "manager state transition");
        Ok(Some(Transition {
            from,
            to,
            cause: signal,
        }))
    }

    /// Returns true if some peer should hold mastership instead of us.
    fn yields_to_any(&self, peers: &[PeerView]) -> bool {
        peers.iter().any(|peer| match peer.state {
            // An established master keeps its role unless we outrank it.
            SmState::Master => !self.policy.outranks(&self.local, &peer.candidate),
            SmState::Discovering | SmState::Standby => {
                self.policy.outranks(&peer.candidate, &self.local)
            }
            SmState::NotActive => false,
        })
    }

    fn enter(&mut self, to: SmState, from: SmState, epoch: &mut SweepEpochState) {
        self.state = to;
        match to {
            SmState::Master => {
                self.pending_handover = None;
                self.master_sm_base_lid = self.sm_base_lid;
                epoch.first_time_master_sweep = true;
                if from == SmState::Standby {
                    epoch.coming_out_of_standby = true;
                    epoch.ignore_existing_lfts = true;
                }
            }
            SmState::Standby => {
                self.pending_handover = None;
                if from == SmState::Master {
                    self.master_sm_base_lid = None;
                }
                epoch.moved_to_master_state = false;
                epoch.first_time_master_sweep = false;
                epoch.coming_out_of_standby = false;
                epoch.ignore_existing_lfts = false;
            }
            SmState::Discovering => {
                self.pending_handover = None;
                self.master_sm_base_lid = None;
                epoch.need_update = true;
                epoch.first_time_master_sweep = false;
                epoch.coming_out_of_standby = false;
                epoch.force_immediate_heavy_sweep = true;
            }
            SmState::NotActive => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn local(priority: u8) -> ManagerStateMachine {
        ManagerStateMachine::new(
            Candidate::new(priority, Guid::new(0x100)),
            ElectionPolicy::default(),
        )
    }

    fn peer(priority: u8, guid: u64, state: SmState) -> PeerView {
        PeerView {
            candidate: Candidate::new(priority, Guid::new(guid)),
            state,
        }
    }

    fn drive(sm: &mut ManagerStateMachine, signals: Vec<SmSignal>, epoch: &mut SweepEpochState) {
        for signal in signals {
            sm.apply(signal, &[], epoch).unwrap();
        }
    }

    #[test]
    fn test_tie_break_lower_guid_wins_by_default() {
        let policy = ElectionPolicy::default();
        let a = Candidate::new(5, Guid::new(1));
        let b = Candidate::new(5, Guid::new(2));
        assert!(policy.outranks(&a, &b));
        assert!(!policy.outranks(&b, &a));
        assert!(!policy.outranks(&a, &a));

        let higher = ElectionPolicy::new(TieBreak::HigherGuid);
        assert!(higher.outranks(&b, &a));

        let strong = Candidate::new(6, Guid::new(9));
        assert!(policy.outranks(&strong, &a));
        assert_eq!(policy.winner([&a, &b, &strong]), Some(&strong));
    }

    #[test]
    fn test_activation_then_master_without_peers() {
        let mut sm = local(1);
        let mut epoch = SweepEpochState::default();

        let t = sm.apply(SmSignal::Activate, &[], &mut epoch).unwrap().unwrap();
        assert_eq!((t.from, t.to), (SmState::NotActive, SmState::Discovering));
        assert!(epoch.need_update);

        let t = sm
            .apply(SmSignal::DiscoveryComplete, &[], &mut epoch)
            .unwrap()
            .unwrap();
        assert_eq!(t.to, SmState::Master);
        assert!(epoch.first_time_master_sweep);
        assert!(!epoch.coming_out_of_standby);
    }

    #[test]
    fn test_stepping_down_clears_standby_exit() {
        let mut sm = local(1);
        let mut epoch = SweepEpochState::default();
        drive(&mut sm, vec![SmSignal::Activate], &mut epoch);
        sm.apply(
            SmSignal::DiscoveryComplete,
            &[peer(9, 0x200, SmState::Master)],
            &mut epoch,
        )
        .unwrap();
        sm.apply(
            SmSignal::HandoverReceived {
                from: Guid::new(0x200),
            },
            &[],
            &mut epoch,
        )
        .unwrap();
        assert!(epoch.coming_out_of_standby);

        let t = sm
            .apply(
                SmSignal::PeerMasterClaim {
                    peer: Candidate::new(9, Guid::new(0x200)),
                },
                &[],
                &mut epoch,
            )
            .unwrap()
            .unwrap();
        assert_eq!((t.from, t.to), (SmState::Master, SmState::Standby));
        assert!(!epoch.coming_out_of_standby);
        assert!(!epoch.first_time_master_sweep);
        assert!(!epoch.ignore_existing_lfts);
    }

    #[test]
    fn test_inactive_manager_refuses_activation() {
        let mut sm = local(1).with_inactive(true);
        let mut epoch = SweepEpochState::default();
        assert_eq!(
            sm.apply(SmSignal::Activate, &[], &mut epoch),
            Err(StateError::Inactive)
        );
        assert_eq!(sm.state(), SmState::NotActive);
    }

    #[test]
    fn test_discovery_yields_to_existing_master() {
        let mut sm = local(5);
        let mut epoch = SweepEpochState::default();
        drive(&mut sm, vec![SmSignal::Activate], &mut epoch);

        let peers = [peer(5, 0x200, SmState::Master)];
        let t = sm
            .apply(SmSignal::DiscoveryComplete, &peers, &mut epoch)
            .unwrap()
            .unwrap();
        assert_eq!(t.to, SmState::Standby);
    }

    #[test]
    fn test_discovery_yields_to_higher_priority_candidate() {
        let mut sm = local(1);
        let mut epoch = SweepEpochState::default();
        drive(&mut sm, vec![SmSignal::Activate], &mut epoch);

        let peers = [peer(9, 0x200, SmState::Discovering)];
        let t = sm
            .apply(SmSignal::DiscoveryComplete, &peers, &mut epoch)
            .unwrap()
            .unwrap();
        assert_eq!(t.to, SmState::Standby);
    }

    #[test]
    fn test_standby_handover_sets_coming_out_of_standby() {
        let mut sm = local(1);
        let mut epoch = SweepEpochState::default();
        drive(&mut sm, vec![SmSignal::Activate], &mut epoch);
        sm.apply(
            SmSignal::DiscoveryComplete,
            &[peer(9, 0x200, SmState::Master)],
            &mut epoch,
        )
        .unwrap();
        assert_eq!(sm.state(), SmState::Standby);

        let t = sm
            .apply(
                SmSignal::HandoverReceived {
                    from: Guid::new(0x200),
                },
                &[],
                &mut epoch,
            )
            .unwrap()
            .unwrap();
        assert_eq!((t.from, t.to), (SmState::Standby, SmState::Master));
        assert!(epoch.first_time_master_sweep);
        assert!(epoch.coming_out_of_standby);
        assert!(epoch.ignore_existing_lfts);
    }

    #[test]
    fn test_master_aged_out_requires_highest_remaining_priority() {
        let mut epoch = SweepEpochState::default();

        let mut sm = local(3);
        drive(&mut sm, vec![SmSignal::Activate], &mut epoch);
        sm.apply(
            SmSignal::DiscoveryComplete,
            &[peer(9, 0x200, SmState::Master)],
            &mut epoch,
        )
        .unwrap();

        // Another standby outranks us: stay put.
        let others = [peer(4, 0x300, SmState::Standby)];
        assert_eq!(
            sm.apply(SmSignal::MasterAgedOut, &others, &mut epoch).unwrap(),
            None
        );
        assert_eq!(sm.state(), SmState::Standby);

        // Equal priority, lower GUID wins.
        let others = [peer(3, 0x300, SmState::Standby)];
        let t = sm
            .apply(SmSignal::MasterAgedOut, &others, &mut epoch)
            .unwrap()
            .unwrap();
        assert_eq!(t.to, SmState::Master);
    }

    #[test]
    fn test_lower_priority_handover_demand_rejected() {
        let mut sm = local(5);
        let mut epoch = SweepEpochState::default();
        drive(
            &mut sm,
            vec![SmSignal::Activate, SmSignal::DiscoveryComplete],
            &mut epoch,
        );

        let err = sm
            .apply(
                SmSignal::HandoverDemand {
                    from: Candidate::new(4, Guid::new(0x1)),
                },
                &[],
                &mut epoch,
            )
            .unwrap_err();
        assert_eq!(
            err,
            StateError::HandoverRejected {
                peer_priority: 4,
                local_priority: 5
            }
        );
        // Equal priority is not strictly higher either.
        assert!(sm
            .apply(
                SmSignal::HandoverDemand {
                    from: Candidate::new(5, Guid::new(0x1)),
                },
                &[],
                &mut epoch,
            )
            .is_err());
        assert_eq!(sm.state(), SmState::Master);
    }

    #[test]
    fn test_graceful_handover_requires_acknowledgement() {
        let mut sm = local(5);
        let mut epoch = SweepEpochState::default();
        drive(
            &mut sm,
            vec![SmSignal::Activate, SmSignal::DiscoveryComplete],
            &mut epoch,
        );

        // No demand yet: acknowledging is invalid.
        assert!(sm
            .apply(SmSignal::AcknowledgeHandover, &[], &mut epoch)
            .is_err());

        let demand = Candidate::new(7, Guid::new(0x200));
        let pending = sm
            .apply(SmSignal::HandoverDemand { from: demand }, &[], &mut epoch)
            .unwrap();
        assert_eq!(pending, None);
        assert_eq!(sm.state(), SmState::Master);
        assert_eq!(sm.pending_handover(), Some(demand));

        let t = sm
            .apply(SmSignal::AcknowledgeHandover, &[], &mut epoch)
            .unwrap()
            .unwrap();
        assert_eq!((t.from, t.to), (SmState::Master, SmState::Standby));
        assert!(!epoch.moved_to_master_state);
    }

    #[test]
    fn test_peer_master_claim_resolved_by_rank() {
        let mut sm = local(5);
        let mut epoch = SweepEpochState::default();
        drive(
            &mut sm,
            vec![SmSignal::Activate, SmSignal::DiscoveryComplete],
            &mut epoch,
        );

        let weaker = Candidate::new(5, Guid::new(0x900));
        assert_eq!(
            sm.apply(SmSignal::PeerMasterClaim { peer: weaker }, &[], &mut epoch)
                .unwrap(),
            None
        );
        let stronger = Candidate::new(5, Guid::new(0x001));
        let t = sm
            .apply(SmSignal::PeerMasterClaim { peer: stronger }, &[], &mut epoch)
            .unwrap()
            .unwrap();
        assert_eq!(t.to, SmState::Standby);
    }

    #[test]
    fn test_fatal_desync_restarts_discovery() {
        let mut sm = local(5);
        let mut epoch = SweepEpochState::default();
        drive(
            &mut sm,
            vec![SmSignal::Activate, SmSignal::DiscoveryComplete],
            &mut epoch,
        );
        epoch.need_update = false;

        let t = sm
            .apply(
                SmSignal::FatalDesync {
                    reason: "duplicate switch guid".to_string(),
                },
                &[],
                &mut epoch,
            )
            .unwrap()
            .unwrap();
        assert_eq!((t.from, t.to), (SmState::Master, SmState::Discovering));
        assert!(epoch.need_update);
        assert!(!epoch.first_time_master_sweep);
    }

    #[test]
    fn test_unlisted_transitions_rejected() {
        let mut epoch = SweepEpochState::default();
        let mut sm = local(1);
        for signal in [
            SmSignal::DiscoveryComplete,
            SmSignal::HandoverReceived {
                from: Guid::new(2),
            },
            SmSignal::AcknowledgeHandover,
            SmSignal::FatalDesync {
                reason: String::new(),
            },
        ] {
            assert!(matches!(
                sm.apply(signal, &[], &mut epoch),
                Err(StateError::InvalidTransition {
                    state: SmState::NotActive,
                    ..
                })
            ));
        }

        drive(
            &mut sm,
            vec![SmSignal::Activate, SmSignal::DiscoveryComplete],
            &mut epoch,
        );
        assert!(sm.apply(SmSignal::Activate, &[], &mut epoch).is_err());
        assert!(sm
            .apply(
                SmSignal::HandoverReceived {
                    from: Guid::new(2)
                },
                &[],
                &mut epoch
            )
            .is_err());
    }
}
