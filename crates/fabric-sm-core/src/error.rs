//! Error types for subnet state operations.
//!
//! Per-entity errors ([`AddressError`], [`TopologyError`]) are recoverable
//! and are collected into sweep reports rather than aborting a sweep.
//! [`SmError`] is the aggregate returned from the public API.

use crate::entity::EntityKind;
use crate::state_machine::SmState;
use fabric_sm_types::{Guid, Lid, PhysPortRef};
use thiserror::Error;

/// Result type alias for subnet manager operations.
pub type SmResult<T> = Result<T, SmError>;

/// LID assignment contract violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("LID {lid} already bound to {owner}")]
    DuplicateLid { lid: Lid, owner: Guid },

    #[error("LID {lid} is outside the addressable range (max {max})")]
    OutOfRange { lid: Lid, max: Lid },

    #[error("LID {lid} is not aligned to a block of {block} for LMC")]
    Misaligned { lid: Lid, block: u16 },

    #[error("no free LID left below {max} for {port}")]
    Exhausted { port: Guid, max: Lid },

    #[error("unknown entity {0}")]
    UnknownEntity(Guid),
}

impl AddressError {
    /// Address errors leave the entity unassigned for this cycle only.
    pub fn is_recoverable(&self) -> bool {
        true
    }
}

/// Identity conflicts found while populating the entity tables.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("GUID {guid} already bound to a {existing:?}, refusing {requested:?}")]
    DuplicateGuid {
        guid: Guid,
        existing: EntityKind,
        requested: EntityKind,
    },

    #[error("GUID {guid} reported by two different physical locations ({first} and {second})")]
    DuplicateLocation {
        guid: Guid,
        first: PhysPortRef,
        second: PhysPortRef,
    },

    #[error("invalid GUID {0} for a {1:?}")]
    InvalidGuid(Guid, EntityKind),
}

impl TopologyError {
    /// The GUID under contention.
    pub fn guid(&self) -> Guid {
        match self {
            TopologyError::DuplicateGuid { guid, .. }
            | TopologyError::DuplicateLocation { guid, .. }
            | TopologyError::InvalidGuid(guid, _) => *guid,
        }
    }
}

/// Rejected manager state machine inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("signal {signal} is not valid in state {state:?}")]
    InvalidTransition { state: SmState, signal: &'static str },

    #[error("handover demand from priority {peer_priority} rejected (local priority {local_priority})")]
    HandoverRejected { peer_priority: u8, local_priority: u8 },

    #[error("manager is configured inactive")]
    Inactive,
}

/// Aggregate error for the subnet manager core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("probe to {target} unresolved after {attempts} attempts")]
    ProbeUnresolved { target: String, attempts: u32 },

    #[error("master role conflict with {peer}: {winner} wins")]
    RoleConflict { peer: Guid, winner: Guid },

    #[error("fatal topology desync: {reason}")]
    FatalTopologyDesync { reason: String },

    #[error("invalid options for {field}: {message}")]
    InvalidOptions { field: String, message: String },

    #[error("a sweep is already in progress")]
    SweepInProgress,
}

impl SmError {
    /// Creates an invalid options error.
    pub fn invalid_options(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns true if the condition is expected fabric instability that the
    /// next sweep can remediate.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SmError::FatalTopologyDesync { .. } | SmError::InvalidOptions { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_error_display() {
        let err = AddressError::OutOfRange {
            lid: Lid::new(2048),
            max: Lid::new(2047),
        };
        assert_eq!(
            err.to_string(),
            "LID 0x0800 is outside the addressable range (max 0x07ff)"
        );
    }

    #[test]
    fn test_topology_error_guid() {
        let err = TopologyError::DuplicateGuid {
            guid: Guid::new(5),
            existing: EntityKind::Switch,
            requested: EntityKind::Node,
        };
        assert_eq!(err.guid(), Guid::new(5));
    }

    #[test]
    fn test_recoverable() {
        assert!(SmError::from(AddressError::UnknownEntity(Guid::new(1))).is_recoverable());
        assert!(!SmError::FatalTopologyDesync {
            reason: "dup switch".to_string()
        }
        .is_recoverable());
        assert!(SmError::RoleConflict {
            peer: Guid::new(2),
            winner: Guid::new(1)
        }
        .is_recoverable());
    }
}
