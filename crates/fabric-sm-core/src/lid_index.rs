//! LID to entity reverse index.
//!
//! A dense table indexed by LID gives O(1) resolution of unicast LIDs to
//! ports and multicast LIDs to groups. The index is a derived cache: the
//! entity tables hold the authoritative LID of every port and group, and
//! [`LidIndex::rebuild_from`] can always reconstruct the index from them.
//!
//! Capacity follows the fabric horizon: the lowest LID ceiling reported by
//! any switch. A single under-provisioned switch caps the whole fabric.

use crate::entity::{EntityKind, EntityRef};
use crate::error::AddressError;
use crate::tables::EntityTables;
use fabric_sm_types::{Guid, Lid};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Bidirectional LID/GUID mapping bounded by the fabric horizon.
#[derive(Debug, Clone)]
pub struct LidIndex {
    /// Slot `n` holds the port owning unicast LID `n`.
    unicast: Vec<Option<Guid>>,
    /// Slot `n` holds the group owning multicast LID `0xC000 + n`.
    multicast: Vec<Option<Guid>>,
    /// Port GUID to (base LID, LMC).
    port_bindings: HashMap<Guid, (Lid, u8)>,
    group_bindings: HashMap<Guid, Lid>,
    max_unicast_lid_ho: Lid,
    max_multicast_lid_ho: Lid,
}

/// Number of LIDs covered by a port with the given LMC.
pub fn lmc_block(lmc: u8) -> u16 {
    1u16 << lmc.min(7)
}

impl LidIndex {
    /// Creates an index covering the full unicast and multicast ranges.
    pub fn new() -> Self {
        Self::with_horizon(Lid::UNICAST_END, Lid::MULTICAST_END)
    }

    pub fn with_horizon(max_unicast: Lid, max_multicast: Lid) -> Self {
        let mut index = Self {
            unicast: Vec::new(),
            multicast: Vec::new(),
            port_bindings: HashMap::new(),
            group_bindings: HashMap::new(),
            max_unicast_lid_ho: max_unicast,
            max_multicast_lid_ho: max_multicast,
        };
        index.resize_slots();
        index
    }

    pub fn max_unicast_lid_ho(&self) -> Lid {
        self.max_unicast_lid_ho
    }

    pub fn max_multicast_lid_ho(&self) -> Lid {
        self.max_multicast_lid_ho
    }

    fn resize_slots(&mut self) {
        self.unicast
            .resize(usize::from(self.max_unicast_lid_ho.raw()) + 1, None);
        let mcast_len = self
            .max_multicast_lid_ho
            .raw()
            .saturating_sub(Lid::MULTICAST_START.raw())
            .saturating_add(1);
        self.multicast.resize(usize::from(mcast_len), None);
    }

    /// Computes the fabric horizon from the switch tables: the minimum of
    /// every switch's reported LID capability, clamped to the LID ranges.
    /// Without switches the full ranges apply.
    pub fn horizon_of(tables: &EntityTables) -> (Lid, Lid) {
        let ucast = tables
            .switches()
            .map(|sw| sw.attrs.max_unicast_lid)
            .min()
            .unwrap_or(Lid::UNICAST_END)
            .min(Lid::UNICAST_END)
            .max(Lid::UNICAST_START);
        let mcast = tables
            .switches()
            .map(|sw| sw.attrs.max_multicast_lid)
            .min()
            .unwrap_or(Lid::MULTICAST_END)
            .min(Lid::MULTICAST_END)
            .max(Lid::MULTICAST_START);
        (ucast, mcast)
    }

    /// Moves the horizon. Bindings that no longer fit are dropped and the
    /// GUIDs that lost their address are returned.
    pub fn set_horizon(&mut self, max_unicast: Lid, max_multicast: Lid) -> Vec<Guid> {
        let mut dropped = Vec::new();

        if max_unicast < self.max_unicast_lid_ho {
            let over: Vec<Guid> = self
                .port_bindings
                .iter()
                .filter(|(_, (lid, lmc))| {
                    u32::from(lid.raw()) + u32::from(lmc_block(*lmc)) - 1
                        > u32::from(max_unicast.raw())
                })
                .map(|(guid, _)| *guid)
                .collect();
            for guid in over {
                self.release(guid);
                dropped.push(guid);
            }
        }
        if max_multicast < self.max_multicast_lid_ho {
            let over: Vec<Guid> = self
                .group_bindings
                .iter()
                .filter(|(_, mlid)| **mlid > max_multicast)
                .map(|(guid, _)| *guid)
                .collect();
            for guid in over {
                self.release_mlid(guid);
                dropped.push(guid);
            }
        }

        if max_unicast != self.max_unicast_lid_ho || max_multicast != self.max_multicast_lid_ho {
            debug!(%max_unicast, %max_multicast, "LID horizon moved");
        }
        self.max_unicast_lid_ho = max_unicast;
        self.max_multicast_lid_ho = max_multicast;
        self.resize_slots();
        dropped
    }

    /// Checks that a unicast block starting at `lid` fits under the horizon
    /// and is aligned for `lmc`.
    fn check_unicast(&self, lid: Lid, lmc: u8) -> Result<(), AddressError> {
        let block = lmc_block(lmc);
        let top = u32::from(lid.raw()) + u32::from(block) - 1;
        if !lid.is_unicast() || top > u32::from(self.max_unicast_lid_ho.raw()) {
            return Err(AddressError::OutOfRange {
                lid,
                max: self.max_unicast_lid_ho,
            });
        }
        if lid.raw() % block != 0 {
            return Err(AddressError::Misaligned { lid, block });
        }
        Ok(())
    }

    /// Binds `port` to the block of `2^lmc` LIDs starting at `lid`.
    ///
    /// Fails with [`AddressError::DuplicateLid`] if any LID of the block is
    /// bound to a different port, and with [`AddressError::OutOfRange`] if
    /// the block crosses the unicast horizon. A previous binding of the same
    /// port is replaced.
    pub fn assign_lid(&mut self, port: Guid, lid: Lid, lmc: u8) -> Result<(), AddressError> {
        self.check_unicast(lid, lmc)?;

        let start = usize::from(lid.raw());
        let end = start + usize::from(lmc_block(lmc));
        for (offset, slot) in self.unicast[start..end].iter().enumerate() {
            if let Some(owner) = slot {
                if *owner != port {
                    return Err(AddressError::DuplicateLid {
                        lid: Lid::new(lid.raw() + offset as u16),
                        owner: *owner,
                    });
                }
            }
        }

        if self.port_bindings.get(&port) == Some(&(lid, lmc)) {
            return Ok(());
        }
        self.release(port);
        for slot in &mut self.unicast[start..end] {
            *slot = Some(port);
        }
        self.port_bindings.insert(port, (lid, lmc));
        Ok(())
    }

    /// Binds a multicast group to `mlid`.
    pub fn assign_mlid(&mut self, group: Guid, mlid: Lid) -> Result<(), AddressError> {
        if !mlid.is_multicast() || mlid > self.max_multicast_lid_ho {
            return Err(AddressError::OutOfRange {
                lid: mlid,
                max: self.max_multicast_lid_ho,
            });
        }
        let slot = usize::from(mlid.raw() - Lid::MULTICAST_START.raw());
        match self.multicast[slot] {
            Some(owner) if owner != group => Err(AddressError::DuplicateLid { lid: mlid, owner }),
            Some(_) => Ok(()),
            None => {
                self.release_mlid(group);
                self.multicast[slot] = Some(group);
                self.group_bindings.insert(group, mlid);
                Ok(())
            }
        }
    }

    /// Unbinds a port. Returns its former base LID.
    pub fn release(&mut self, port: Guid) -> Option<Lid> {
        let (lid, lmc) = self.port_bindings.remove(&port)?;
        let start = usize::from(lid.raw());
        let end = (start + usize::from(lmc_block(lmc))).min(self.unicast.len());
        for slot in self.unicast.get_mut(start..end).into_iter().flatten() {
            if *slot == Some(port) {
                *slot = None;
            }
        }
        Some(lid)
    }

    /// Unbinds a multicast group. Returns its former MLID.
    pub fn release_mlid(&mut self, group: Guid) -> Option<Lid> {
        let mlid = self.group_bindings.remove(&group)?;
        let slot = usize::from(mlid.raw() - Lid::MULTICAST_START.raw());
        if let Some(entry) = self.multicast.get_mut(slot) {
            if *entry == Some(group) {
                *entry = None;
            }
        }
        Some(mlid)
    }

    /// Resolves a LID to the port or group bound to it, in O(1).
    pub fn resolve(&self, lid: Lid) -> Option<EntityRef> {
        if lid.is_unicast() {
            self.unicast
                .get(usize::from(lid.raw()))
                .copied()
                .flatten()
                .map(|guid| EntityRef::new(EntityKind::Port, guid))
        } else if lid.is_multicast() {
            self.multicast
                .get(usize::from(lid.raw() - Lid::MULTICAST_START.raw()))
                .copied()
                .flatten()
                .map(|guid| EntityRef::new(EntityKind::MulticastGroup, guid))
        } else {
            None
        }
    }

    /// Base LID and LMC of a port, if bound.
    pub fn binding_of(&self, port: Guid) -> Option<(Lid, u8)> {
        self.port_bindings.get(&port).copied()
    }

    pub fn mlid_of(&self, group: Guid) -> Option<Lid> {
        self.group_bindings.get(&group).copied()
    }

    /// Returns true if every LID of the block is unbound (or bound to
    /// `except`) and the block fits under the horizon.
    pub fn is_block_free(&self, lid: Lid, lmc: u8, except: Option<Guid>) -> bool {
        if self.check_unicast(lid, lmc).is_err() {
            return false;
        }
        let start = usize::from(lid.raw());
        let end = start + usize::from(lmc_block(lmc));
        self.unicast[start..end]
            .iter()
            .all(|slot| slot.is_none() || *slot == except)
    }

    /// Lowest free aligned block at or above `from`.
    pub fn first_free_block(&self, lmc: u8, from: Lid) -> Option<Lid> {
        let block = lmc_block(lmc);
        let floor = from.raw().max(1);
        let mut candidate = floor.div_ceil(block) * block;
        while u32::from(candidate) + u32::from(block) - 1 <= u32::from(self.max_unicast_lid_ho.raw())
        {
            if self.is_block_free(Lid::new(candidate), lmc, None) {
                return Some(Lid::new(candidate));
            }
            candidate = candidate.checked_add(block)?;
        }
        None
    }

    /// Lowest free multicast LID.
    pub fn first_free_mlid(&self) -> Option<Lid> {
        self.multicast
            .iter()
            .position(Option::is_none)
            .map(|slot| Lid::new(Lid::MULTICAST_START.raw() + slot as u16))
    }

    /// Unicast bindings by base LID.
    pub fn unicast_bindings(&self) -> BTreeMap<Lid, Guid> {
        self.port_bindings
            .iter()
            .map(|(guid, (lid, _))| (*lid, *guid))
            .collect()
    }

    pub fn multicast_bindings(&self) -> BTreeMap<Lid, Guid> {
        self.group_bindings
            .iter()
            .map(|(guid, mlid)| (*mlid, *guid))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.port_bindings.len() + self.group_bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.unicast.iter_mut().for_each(|slot| *slot = None);
        self.multicast.iter_mut().for_each(|slot| *slot = None);
        self.port_bindings.clear();
        self.group_bindings.clear();
    }

    /// Discards the whole index and reconstructs it from the tables.
    ///
    /// The horizon is recomputed from the switch table first. Ports and
    /// groups are registered in GUID order; any whose LID collides or falls
    /// outside the horizon is left unregistered and reported, so the caller
    /// can clear it from the tables.
    pub fn rebuild_from(&mut self, tables: &EntityTables) -> Vec<(Guid, AddressError)> {
        let (ucast, mcast) = Self::horizon_of(tables);
        self.max_unicast_lid_ho = ucast;
        self.max_multicast_lid_ho = mcast;
        self.unicast.clear();
        self.multicast.clear();
        self.port_bindings.clear();
        self.group_bindings.clear();
        self.resize_slots();

        let mut rejected = Vec::new();
        for guid in tables.guids(EntityKind::Port) {
            let Some(port) = tables.port(guid) else { continue };
            if let Some(lid) = port.attrs.lid {
                if let Err(err) = self.assign_lid(guid, lid, port.attrs.lmc) {
                    warn!(%guid, %err, "dropping port LID during index rebuild");
                    rejected.push((guid, err));
                }
            }
        }
        for guid in tables.guids(EntityKind::MulticastGroup) {
            let Some(group) = tables.multicast_group(guid) else { continue };
            if let Some(mlid) = group.attrs.mlid {
                if let Err(err) = self.assign_mlid(guid, mlid) {
                    warn!(%guid, %err, "dropping MLID during index rebuild");
                    rejected.push((guid, err));
                }
            }
        }
        debug!(bindings = self.len(), "LID index rebuilt");
        rejected
    }
}

impl Default for LidIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityAttrs, PortAttrs, SwitchAttrs};
    use fabric_sm_types::LinkState;
    use pretty_assertions::assert_eq;

    fn g(raw: u64) -> Guid {
        Guid::new(raw)
    }

    #[test]
    fn test_assign_and_resolve() {
        let mut index = LidIndex::new();
        index.assign_lid(g(1), Lid::new(5), 0).unwrap();
        assert_eq!(
            index.resolve(Lid::new(5)),
            Some(EntityRef::new(EntityKind::Port, g(1)))
        );
        assert_eq!(index.resolve(Lid::new(6)), None);
        assert_eq!(index.binding_of(g(1)), Some((Lid::new(5), 0)));
    }

    #[test]
    fn test_duplicate_lid_rejected() {
        let mut index = LidIndex::new();
        index.assign_lid(g(1), Lid::new(5), 0).unwrap();
        assert_eq!(
            index.assign_lid(g(2), Lid::new(5), 0),
            Err(AddressError::DuplicateLid {
                lid: Lid::new(5),
                owner: g(1)
            })
        );
        // Re-binding the owner is idempotent.
        assert!(index.assign_lid(g(1), Lid::new(5), 0).is_ok());
    }

    #[test]
    fn test_reassign_moves_binding() {
        let mut index = LidIndex::new();
        index.assign_lid(g(1), Lid::new(5), 0).unwrap();
        index.assign_lid(g(1), Lid::new(9), 0).unwrap();
        assert_eq!(index.resolve(Lid::new(5)), None);
        assert_eq!(index.resolve(Lid::new(9)).map(|r| r.guid), Some(g(1)));
    }

    #[test]
    fn test_out_of_range() {
        let mut index = LidIndex::with_horizon(Lid::new(2047), Lid::MULTICAST_END);
        assert_eq!(
            index.assign_lid(g(1), Lid::new(2048), 0),
            Err(AddressError::OutOfRange {
                lid: Lid::new(2048),
                max: Lid::new(2047)
            })
        );
        assert!(matches!(
            index.assign_lid(g(1), Lid::new(0), 0),
            Err(AddressError::OutOfRange { .. })
        ));
        assert!(index.assign_lid(g(1), Lid::new(2047), 0).is_ok());
    }

    #[test]
    fn test_lmc_block_alignment_and_coverage() {
        let mut index = LidIndex::new();
        assert_eq!(
            index.assign_lid(g(1), Lid::new(5), 2),
            Err(AddressError::Misaligned {
                lid: Lid::new(5),
                block: 4
            })
        );
        index.assign_lid(g(1), Lid::new(8), 2).unwrap();
        for raw in 8..12 {
            assert_eq!(index.resolve(Lid::new(raw)).map(|r| r.guid), Some(g(1)));
        }
        assert!(matches!(
            index.assign_lid(g(2), Lid::new(10), 0),
            Err(AddressError::DuplicateLid { .. })
        ));
    }

    #[test]
    fn test_first_free_block() {
        let mut index = LidIndex::new();
        assert_eq!(index.first_free_block(0, Lid::new(1)), Some(Lid::new(1)));
        assert_eq!(index.first_free_block(2, Lid::new(1)), Some(Lid::new(4)));
        index.assign_lid(g(1), Lid::new(1), 0).unwrap();
        index.assign_lid(g(2), Lid::new(4), 2).unwrap();
        assert_eq!(index.first_free_block(0, Lid::new(1)), Some(Lid::new(2)));
        assert_eq!(index.first_free_block(2, Lid::new(1)), Some(Lid::new(8)));
    }

    #[test]
    fn test_exhausted_horizon() {
        let mut index = LidIndex::with_horizon(Lid::new(2), Lid::MULTICAST_END);
        index.assign_lid(g(1), Lid::new(1), 0).unwrap();
        index.assign_lid(g(2), Lid::new(2), 0).unwrap();
        assert_eq!(index.first_free_block(0, Lid::new(1)), None);
    }

    #[test]
    fn test_shrinking_horizon_drops_bindings() {
        let mut index = LidIndex::new();
        index.assign_lid(g(1), Lid::new(100), 0).unwrap();
        index.assign_lid(g(2), Lid::new(3000), 0).unwrap();

        let dropped = index.set_horizon(Lid::new(2047), Lid::MULTICAST_END);
        assert_eq!(dropped, vec![g(2)]);
        assert_eq!(index.max_unicast_lid_ho(), Lid::new(2047));
        assert_eq!(index.resolve(Lid::new(100)).map(|r| r.guid), Some(g(1)));
        assert_eq!(index.binding_of(g(2)), None);
    }

    #[test]
    fn test_multicast_binding() {
        let mut index = LidIndex::new();
        assert_eq!(index.first_free_mlid(), Some(Lid::MULTICAST_START));
        index.assign_mlid(g(9), Lid::MULTICAST_START).unwrap();
        assert_eq!(
            index.resolve(Lid::MULTICAST_START),
            Some(EntityRef::new(EntityKind::MulticastGroup, g(9)))
        );
        assert!(index.assign_mlid(g(10), Lid::MULTICAST_START).is_err());
        assert!(index.assign_mlid(g(10), Lid::new(5)).is_err());
        assert_eq!(index.first_free_mlid(), Some(Lid::new(0xc001)));
    }

    #[test]
    fn test_horizon_is_minimum_switch_capability() {
        let mut tables = EntityTables::new();
        for (guid, max) in [(0x10, 2047u16), (0x11, 16383)] {
            tables
                .upsert(
                    g(guid),
                    EntityAttrs::Switch(SwitchAttrs {
                        num_ports: 8,
                        max_unicast_lid: Lid::new(max),
                        max_multicast_lid: Lid::new(0xc1ff),
                    }),
                )
                .unwrap();
        }
        assert_eq!(
            LidIndex::horizon_of(&tables),
            (Lid::new(2047), Lid::new(0xc1ff))
        );
    }

    #[test]
    fn test_rebuild_from_tables_round_trip() {
        let mut tables = EntityTables::new();
        for (guid, lid) in [(0x21u64, 7u16), (0x22, 8)] {
            tables
                .upsert(
                    g(guid),
                    EntityAttrs::Port(PortAttrs {
                        node: g(0x20),
                        port_num: (guid - 0x20) as u8,
                        lid: Some(Lid::new(lid)),
                        lmc: 0,
                        state: LinkState::Active,
                    }),
                )
                .unwrap();
        }

        let mut index = LidIndex::new();
        // Stale binding that the tables know nothing about.
        index.assign_lid(g(0x99), Lid::new(7), 0).unwrap();

        let rejected = index.rebuild_from(&tables);
        assert!(rejected.is_empty());
        assert_eq!(index.resolve(Lid::new(7)).map(|r| r.guid), Some(g(0x21)));
        assert_eq!(index.binding_of(g(0x22)), Some((Lid::new(8), 0)));
        assert_eq!(index.binding_of(g(0x99)), None);
    }

    #[test]
    fn test_rebuild_reports_collisions() {
        let mut tables = EntityTables::new();
        for guid in [0x21u64, 0x22] {
            tables
                .upsert(
                    g(guid),
                    EntityAttrs::Port(PortAttrs {
                        node: g(0x20),
                        port_num: 1,
                        lid: Some(Lid::new(7)),
                        lmc: 0,
                        state: LinkState::Active,
                    }),
                )
                .unwrap();
        }
        let mut index = LidIndex::new();
        let rejected = index.rebuild_from(&tables);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, g(0x22));
        assert_eq!(index.resolve(Lid::new(7)).map(|r| r.guid), Some(g(0x21)));
    }
}
