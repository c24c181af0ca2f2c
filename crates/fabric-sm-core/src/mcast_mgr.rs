//! Multicast LID assignment and membership change tracking.

use crate::entity::EntityKind;
use crate::error::AddressError;
use crate::lid_index::LidIndex;
use crate::plugin::MulticastDelta;
use crate::tables::EntityTables;
use fabric_sm_types::{Guid, Lid};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MlidAssignmentReport {
    pub assigned: Vec<(Guid, Lid)>,
    pub errors: Vec<(Guid, AddressError)>,
}

/// Tracks the membership last published to the multicast hook.
#[derive(Debug, Clone, Default)]
pub struct McastManager {
    published: BTreeMap<Guid, BTreeSet<Guid>>,
}

impl McastManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gives every multicast group an MLID, keeping existing ones.
    pub fn assign_mlids(&self, tables: &mut EntityTables, index: &mut LidIndex) -> MlidAssignmentReport {
        let mut report = MlidAssignmentReport::default();
        for guid in tables.guids(EntityKind::MulticastGroup) {
            let current = tables.multicast_group(guid).and_then(|g| g.attrs.mlid);
            if current.is_some() && index.mlid_of(guid) == current {
                continue;
            }
            let requested = match current {
                Some(mlid) if index.assign_mlid(guid, mlid).is_ok() => Some(mlid),
                _ => None,
            };
            let mlid = match requested {
                Some(mlid) => mlid,
                None => {
                    let Some(free) = index.first_free_mlid() else {
                        let err = AddressError::Exhausted {
                            port: guid,
                            max: index.max_multicast_lid_ho(),
                        };
                        warn!(group = %guid, %err, "multicast LID space exhausted");
                        report.errors.push((guid, err));
                        continue;
                    };
                    if let Err(err) = index.assign_mlid(guid, free) {
                        report.errors.push((guid, err));
                        continue;
                    }
                    free
                }
            };
            if let Some(group) = tables.multicast_group_mut(guid) {
                group.attrs.mlid = Some(mlid);
            }
            debug!(group = %guid, %mlid, "MLID assigned");
            report.assigned.push((guid, mlid));
        }
        report
    }

    /// Removes ports that no longer exist from every group's membership.
    /// Returns the number of memberships dropped.
    pub fn prune_members(tables: &mut EntityTables, removed_ports: &[Guid]) -> usize {
        if removed_ports.is_empty() {
            return 0;
        }
        let mut pruned = 0;
        for guid in tables.guids(EntityKind::MulticastGroup) {
            if let Some(group) = tables.multicast_group_mut(guid) {
                let before = group.attrs.members.len();
                group
                    .attrs
                    .members
                    .retain(|member| !removed_ports.contains(member));
                pruned += before - group.attrs.members.len();
            }
        }
        pruned
    }

    /// Membership changes since the last call, one delta per changed group.
    /// Groups that disappeared report all former members as removed.
    pub fn take_deltas(&mut self, tables: &EntityTables) -> Vec<MulticastDelta> {
        let mut deltas = Vec::new();
        let mut current: BTreeMap<Guid, BTreeSet<Guid>> = BTreeMap::new();
        for group in tables.multicast_groups() {
            current.insert(group.guid, group.attrs.members.clone());
        }

        for (guid, members) in &current {
            let previous = self.published.get(guid);
            let added: Vec<Guid> = members
                .iter()
                .filter(|m| previous.map_or(true, |p| !p.contains(*m)))
                .copied()
                .collect();
            let removed: Vec<Guid> = previous
                .map(|p| p.difference(members).copied().collect())
                .unwrap_or_default();
            let delta = MulticastDelta {
                group: *guid,
                mlid: tables.multicast_group(*guid).and_then(|g| g.attrs.mlid),
                added,
                removed,
            };
            if !delta.is_empty() {
                deltas.push(delta);
            }
        }
        for (guid, members) in &self.published {
            if !current.contains_key(guid) && !members.is_empty() {
                deltas.push(MulticastDelta {
                    group: *guid,
                    mlid: None,
                    added: Vec::new(),
                    removed: members.iter().copied().collect(),
                });
            }
        }

        self.published = current;
        deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityAttrs, MulticastGroupAttrs};
    use fabric_sm_types::PKey;
    use pretty_assertions::assert_eq;

    fn group(tables: &mut EntityTables, guid: u64, members: &[u64], mlid: Option<u16>) {
        tables
            .upsert(
                Guid::new(guid),
                EntityAttrs::MulticastGroup(MulticastGroupAttrs {
                    pkey: PKey::DEFAULT,
                    mlid: mlid.map(Lid::new),
                    members: members.iter().map(|m| Guid::new(*m)).collect(),
                }),
            )
            .unwrap();
    }

    #[test]
    fn test_mlids_allocated_from_multicast_start() {
        let mut tables = EntityTables::new();
        group(&mut tables, 1, &[], None);
        group(&mut tables, 2, &[], Some(0xc000));
        let mut index = LidIndex::new();
        index.rebuild_from(&tables);

        let report = McastManager::new().assign_mlids(&mut tables, &mut index);
        assert_eq!(report.assigned, vec![(Guid::new(1), Lid::new(0xc001))]);
        assert_eq!(
            tables.multicast_group(Guid::new(2)).unwrap().attrs.mlid,
            Some(Lid::MULTICAST_START)
        );
    }

    #[test]
    fn test_mlid_space_exhausted() {
        let mut tables = EntityTables::new();
        group(&mut tables, 1, &[], None);
        group(&mut tables, 2, &[], None);
        let mut index = LidIndex::with_horizon(Lid::UNICAST_END, Lid::MULTICAST_START);

        let report = McastManager::new().assign_mlids(&mut tables, &mut index);
        assert_eq!(report.assigned.len(), 1);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn test_deltas_track_membership() {
        let mut tables = EntityTables::new();
        let mut mgr = McastManager::new();
        group(&mut tables, 1, &[0x21, 0x22], None);

        let deltas = mgr.take_deltas(&tables);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].added, vec![Guid::new(0x21), Guid::new(0x22)]);
        assert!(mgr.take_deltas(&tables).is_empty());

        assert_eq!(McastManager::prune_members(&mut tables, &[Guid::new(0x22)]), 1);
        let deltas = mgr.take_deltas(&tables);
        assert_eq!(deltas[0].removed, vec![Guid::new(0x22)]);
        assert!(deltas[0].added.is_empty());

        tables.remove(EntityKind::MulticastGroup, Guid::new(1));
        let deltas = mgr.take_deltas(&tables);
        assert_eq!(deltas[0].removed, vec![Guid::new(0x21)]);
    }
}
