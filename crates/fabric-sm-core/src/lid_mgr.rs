//! Unicast LID assignment.
//!
//! Runs once per master heavy sweep, after discovery. Every port ends the
//! run either bound to an aligned block of `2^lmc` LIDs, identically in the
//! tables and the index, or unbound with an [`AddressError`] reported.
//!
//! Precedence for each port: a LID pinned by the pre-assignment hook, then
//! the LID the port already holds, then its persisted binding (when
//! honored), then the lowest free aligned block.

use crate::entity::EntityKind;
use crate::error::AddressError;
use crate::lid_index::{lmc_block, LidIndex};
use crate::options::SubnetOptions;
use crate::sweep::LidUpdate;
use crate::tables::EntityTables;
use fabric_sm_types::{Guid, Lid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// A persisted GUID to LID binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LidBinding {
    pub lid: Lid,
    #[serde(default)]
    pub lmc: u8,
}

/// What one assignment run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LidAssignmentReport {
    /// Ports whose binding changed.
    pub assigned: Vec<LidUpdate>,
    /// Bindings to re-assert downstream.
    pub reasserted: Vec<LidUpdate>,
    pub errors: Vec<(Guid, AddressError)>,
    /// The pre-assignment hook changed at least one LID.
    pub hook_changed: bool,
}

/// Inputs of one assignment run that come from the sweep decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AssignmentPolicy {
    pub reassign_lids: bool,
    pub reassert_all: bool,
    pub honor_persisted: bool,
}

/// Allocates unicast LIDs and remembers persisted bindings.
#[derive(Debug, Clone, Default)]
pub struct LidManager {
    persisted: BTreeMap<Guid, LidBinding>,
}

impl LidManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads bindings saved by a previous run.
    pub fn seed(&mut self, bindings: impl IntoIterator<Item = (Guid, LidBinding)>) {
        self.persisted.extend(bindings);
        debug!(count = self.persisted.len(), "seeded persisted LID bindings");
    }

    pub fn persisted(&self) -> &BTreeMap<Guid, LidBinding> {
        &self.persisted
    }

    /// LMC that applies to a port: switch port 0 takes a single LID unless
    /// `lmc_esp0` is set.
    pub fn lmc_for(tables: &EntityTables, port: Guid, opts: &SubnetOptions) -> u8 {
        let on_switch = tables
            .port(port)
            .map(|p| tables.node_kind(p.attrs.node) == Some(EntityKind::Switch))
            .unwrap_or(false);
        if on_switch && !opts.lmc_esp0 {
            0
        } else {
            opts.lmc
        }
    }

    /// Assigns LIDs to every port in the tables.
    pub fn assign(
        &mut self,
        tables: &mut EntityTables,
        index: &mut LidIndex,
        opts: &SubnetOptions,
        policy: AssignmentPolicy,
        pins: &BTreeMap<Guid, Lid>,
    ) -> LidAssignmentReport {
        let mut report = LidAssignmentReport::default();
        let ports = tables.guids(EntityKind::Port);
        let before: HashMap<Guid, Option<(Lid, u8)>> = ports
            .iter()
            .map(|guid| (*guid, index.binding_of(*guid)))
            .collect();

        if policy.reassign_lids {
            info!(ports = ports.len(), "reassigning all LIDs");
            for guid in &ports {
                unbind(tables, index, *guid);
            }
        }

        // Pins first: the hook is authoritative and evicts whoever holds
        // the pinned block.
        for (guid, lid) in pins {
            if tables.port(*guid).is_none() {
                continue;
            }
            let lmc = Self::lmc_for(tables, *guid, opts);
            if index.binding_of(*guid) == Some((*lid, lmc)) {
                continue;
            }
            for offset in 0..lmc_block(lmc) {
                let Some(slot) = lid.checked_add(offset) else { break };
                if let Some(owner) = index.resolve(slot).map(|r| r.guid) {
                    if owner != *guid {
                        unbind(tables, index, owner);
                    }
                }
            }
            match bind(tables, index, *guid, *lid, lmc) {
                Ok(()) => report.hook_changed = true,
                Err(err) => {
                    warn!(port = %guid, %err, "pinned LID rejected");
                    report.errors.push((*guid, err));
                }
            }
        }

        // Keep what ports already hold, re-binding on an LMC change.
        for guid in &ports {
            let lmc = Self::lmc_for(tables, *guid, opts);
            match index.binding_of(*guid) {
                Some((_, bound_lmc)) if bound_lmc == lmc => {}
                Some((lid, _)) => {
                    unbind(tables, index, *guid);
                    if bind(tables, index, *guid, lid, lmc).is_err() {
                        debug!(port = %guid, %lid, "LMC change moves port to a new block");
                    }
                }
                None => {}
            }
        }

        if policy.honor_persisted {
            for guid in &ports {
                if index.binding_of(*guid).is_some() {
                    continue;
                }
                let Some(saved) = self.persisted.get(guid) else { continue };
                let lmc = Self::lmc_for(tables, *guid, opts);
                if let Err(err) = bind(tables, index, *guid, saved.lid, lmc) {
                    debug!(port = %guid, lid = %saved.lid, %err, "persisted LID not honored");
                }
            }
        }

        // Everything still unbound gets the lowest free aligned block.
        let mut cursors: HashMap<u8, Lid> = HashMap::new();
        for guid in &ports {
            if index.binding_of(*guid).is_some() {
                continue;
            }
            let lmc = Self::lmc_for(tables, *guid, opts);
            let from = cursors.get(&lmc).copied().unwrap_or(Lid::UNICAST_START);
            let Some(lid) = index.first_free_block(lmc, from) else {
                let err = AddressError::Exhausted {
                    port: *guid,
                    max: index.max_unicast_lid_ho(),
                };
                warn!(port = %guid, %err, "LID space exhausted");
                report.errors.push((*guid, err));
                continue;
            };
            match bind(tables, index, *guid, lid, lmc) {
                Ok(()) => {
                    cursors.insert(lmc, lid.checked_add(lmc_block(lmc)).unwrap_or(lid));
                }
                Err(err) => report.errors.push((*guid, err)),
            }
        }

        for guid in &ports {
            let Some((lid, lmc)) = index.binding_of(*guid) else { continue };
            let update = LidUpdate {
                port: *guid,
                lid,
                lmc,
            };
            let changed = before.get(guid).copied().flatten() != Some((lid, lmc));
            if changed {
                report.assigned.push(update);
            }
            if changed || policy.reassert_all {
                report.reasserted.push(update);
            }
            self.persisted.insert(*guid, LidBinding { lid, lmc });
        }

        info!(
            assigned = report.assigned.len(),
            reasserted = report.reasserted.len(),
            errors = report.errors.len(),
            "LID assignment complete"
        );
        report
    }
}

/// Binds a port in the index and records the LID in its table entry.
fn bind(
    tables: &mut EntityTables,
    index: &mut LidIndex,
    port: Guid,
    lid: Lid,
    lmc: u8,
) -> Result<(), AddressError> {
    index.assign_lid(port, lid, lmc)?;
    if let Some(record) = tables.port_mut(port) {
        record.attrs.lid = Some(lid);
        record.attrs.lmc = lmc;
    }
    Ok(())
}

fn unbind(tables: &mut EntityTables, index: &mut LidIndex, port: Guid) {
    index.release(port);
    if let Some(record) = tables.port_mut(port) {
        record.attrs.lid = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityAttrs, NodeAttrs, PortAttrs, SwitchAttrs};
    use fabric_sm_types::LinkState;
    use pretty_assertions::assert_eq;

    fn fabric(ca_ports: &[(u64, Option<u16>)]) -> (EntityTables, LidIndex) {
        let mut tables = EntityTables::new();
        tables
            .upsert(
                Guid::new(0x10),
                EntityAttrs::Switch(SwitchAttrs {
                    num_ports: 8,
                    max_unicast_lid: Lid::new(0xbfff),
                    max_multicast_lid: Lid::new(0xc3ff),
                }),
            )
            .unwrap();
        tables
            .upsert(
                Guid::new(0x10),
                EntityAttrs::Port(PortAttrs {
                    node: Guid::new(0x10),
                    port_num: 0,
                    lid: None,
                    lmc: 0,
                    state: LinkState::Active,
                }),
            )
            .unwrap();
        for (i, (guid, lid)) in ca_ports.iter().enumerate() {
            let node = Guid::new(0x1000 + i as u64);
            tables
                .upsert(node, EntityAttrs::Node(NodeAttrs { num_ports: 1 }))
                .unwrap();
            tables
                .upsert(
                    Guid::new(*guid),
                    EntityAttrs::Port(PortAttrs {
                        node,
                        port_num: 1,
                        lid: lid.map(Lid::new),
                        lmc: 0,
                        state: LinkState::Active,
                    }),
                )
                .unwrap();
        }
        let mut index = LidIndex::new();
        index.rebuild_from(&tables);
        (tables, index)
    }

    fn lid_of(tables: &EntityTables, guid: u64) -> Option<Lid> {
        tables.port(Guid::new(guid)).and_then(|p| p.attrs.lid)
    }

    #[test]
    fn test_fresh_fabric_assigns_from_one() {
        let (mut tables, mut index) = fabric(&[(0x21, None), (0x22, None)]);
        let mut mgr = LidManager::new();
        let report = mgr.assign(
            &mut tables,
            &mut index,
            &SubnetOptions::default(),
            AssignmentPolicy::default(),
            &BTreeMap::new(),
        );

        assert!(report.errors.is_empty());
        // Port GUID order: switch port 0 (0x10), then the CAs.
        assert_eq!(lid_of(&tables, 0x10), Some(Lid::new(1)));
        assert_eq!(lid_of(&tables, 0x21), Some(Lid::new(2)));
        assert_eq!(lid_of(&tables, 0x22), Some(Lid::new(3)));
        assert_eq!(report.assigned.len(), 3);
        assert_eq!(index.resolve(Lid::new(3)).map(|r| r.guid), Some(Guid::new(0x22)));
    }

    #[test]
    fn test_existing_lids_kept_and_not_reasserted() {
        let (mut tables, mut index) = fabric(&[(0x21, Some(7)), (0x22, None)]);
        let mut mgr = LidManager::new();
        let report = mgr.assign(
            &mut tables,
            &mut index,
            &SubnetOptions::default(),
            AssignmentPolicy::default(),
            &BTreeMap::new(),
        );
        assert_eq!(lid_of(&tables, 0x21), Some(Lid::new(7)));
        assert!(!report.assigned.iter().any(|u| u.port == Guid::new(0x21)));
        assert!(!report.reasserted.iter().any(|u| u.port == Guid::new(0x21)));
    }

    #[test]
    fn test_reassert_all_includes_unchanged() {
        let (mut tables, mut index) = fabric(&[(0x21, Some(7))]);
        let mut mgr = LidManager::new();
        let policy = AssignmentPolicy {
            reassert_all: true,
            ..Default::default()
        };
        let report = mgr.assign(
            &mut tables,
            &mut index,
            &SubnetOptions::default(),
            policy,
            &BTreeMap::new(),
        );
        assert!(report.reasserted.iter().any(|u| u.port == Guid::new(0x21)));
        assert_eq!(report.reasserted.len(), 2);
    }

    #[test]
    fn test_reassign_lids_starts_over() {
        let (mut tables, mut index) = fabric(&[(0x21, Some(40))]);
        let mut mgr = LidManager::new();
        let policy = AssignmentPolicy {
            reassign_lids: true,
            ..Default::default()
        };
        mgr.assign(
            &mut tables,
            &mut index,
            &SubnetOptions::default(),
            policy,
            &BTreeMap::new(),
        );
        assert_eq!(lid_of(&tables, 0x21), Some(Lid::new(2)));
        assert_eq!(index.resolve(Lid::new(40)), None);
    }

    #[test]
    fn test_lmc_blocks_aligned_and_switch_port0_single() {
        let (mut tables, mut index) = fabric(&[(0x21, None), (0x22, None)]);
        let opts = SubnetOptions {
            lmc: 2,
            ..Default::default()
        };
        let mut mgr = LidManager::new();
        let report = mgr.assign(
            &mut tables,
            &mut index,
            &opts,
            AssignmentPolicy::default(),
            &BTreeMap::new(),
        );
        assert!(report.errors.is_empty());
        assert_eq!(index.binding_of(Guid::new(0x10)), Some((Lid::new(1), 0)));
        assert_eq!(index.binding_of(Guid::new(0x21)), Some((Lid::new(4), 2)));
        assert_eq!(index.binding_of(Guid::new(0x22)), Some((Lid::new(8), 2)));
    }

    #[test]
    fn test_persisted_bindings_honored() {
        let (mut tables, mut index) = fabric(&[(0x21, None)]);
        let mut mgr = LidManager::new();
        mgr.seed([(Guid::new(0x21), LidBinding { lid: Lid::new(77), lmc: 0 })]);
        let policy = AssignmentPolicy {
            honor_persisted: true,
            ..Default::default()
        };
        mgr.assign(
            &mut tables,
            &mut index,
            &SubnetOptions::default(),
            policy,
            &BTreeMap::new(),
        );
        assert_eq!(lid_of(&tables, 0x21), Some(Lid::new(77)));
        assert_eq!(
            mgr.persisted().get(&Guid::new(0x10)),
            Some(&LidBinding { lid: Lid::new(1), lmc: 0 })
        );
    }

    #[test]
    fn test_pins_evict_current_owner() {
        let (mut tables, mut index) = fabric(&[(0x21, Some(5)), (0x22, None)]);
        let mut mgr = LidManager::new();
        let pins = BTreeMap::from([(Guid::new(0x22), Lid::new(5))]);
        let report = mgr.assign(
            &mut tables,
            &mut index,
            &SubnetOptions::default(),
            AssignmentPolicy::default(),
            &pins,
        );
        assert!(report.hook_changed);
        assert_eq!(lid_of(&tables, 0x22), Some(Lid::new(5)));
        let moved = lid_of(&tables, 0x21).unwrap();
        assert_ne!(moved, Lid::new(5));
        assert_eq!(index.resolve(moved).map(|r| r.guid), Some(Guid::new(0x21)));
    }

    #[test]
    fn test_exhausted_horizon_reports_error() {
        let (mut tables, _) = fabric(&[(0x21, None), (0x22, None)]);
        let mut index = LidIndex::with_horizon(Lid::new(2), Lid::MULTICAST_END);
        let mut mgr = LidManager::new();
        let report = mgr.assign(
            &mut tables,
            &mut index,
            &SubnetOptions::default(),
            AssignmentPolicy::default(),
            &BTreeMap::new(),
        );
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0].1, AddressError::Exhausted { .. }));
        assert_eq!(lid_of(&tables, 0x22), None);
    }
}
