//! Collaborator seams: routing engines and address-assignment hooks.
//!
//! Implementations are injected as trait objects when the subnet context
//! is built. All of them see the topology only through an immutable
//! [`TopologySnapshot`]; none gets a live reference into the tables.

use crate::snapshot::TopologySnapshot;
use fabric_sm_types::{Guid, Lid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Linear forwarding table for one switch: destination LID to egress port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingTable {
    pub switch: Guid,
    pub entries: BTreeMap<Lid, u8>,
}

impl ForwardingTable {
    pub fn new(switch: Guid) -> Self {
        Self {
            switch,
            entries: BTreeMap::new(),
        }
    }

    pub fn route(mut self, lid: Lid, port: u8) -> Self {
        self.entries.insert(lid, port);
        self
    }
}

/// A downstream programming failure for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to program {entity}: {message}")]
pub struct InstallError {
    pub entity: Guid,
    pub message: String,
}

impl InstallError {
    pub fn new(entity: Guid, message: impl Into<String>) -> Self {
        Self {
            entity,
            message: message.into(),
        }
    }
}

/// Computes forwarding tables from a topology snapshot.
pub trait RoutingEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the full table for every switch that should forward.
    fn compute(&self, snapshot: &TopologySnapshot) -> Vec<ForwardingTable>;
}

/// Leaves forwarding to an external engine: computes nothing.
#[derive(Debug, Clone, Default)]
pub struct NoopRoutingEngine;

impl RoutingEngine for NoopRoutingEngine {
    fn name(&self) -> &str {
        "none"
    }

    fn compute(&self, _snapshot: &TopologySnapshot) -> Vec<ForwardingTable> {
        Vec::new()
    }
}

/// Pre-assignment hook: runs before LIDs are allocated and may pin
/// specific ports to specific LIDs.
pub trait LidAssignHook: Send + Sync {
    /// Inserts pinned LIDs into `pins`. Returns true if any pin differs
    /// from what the port currently holds.
    fn pre_assign(&self, snapshot: &TopologySnapshot, pins: &mut BTreeMap<Guid, Lid>) -> bool;
}

/// Change in one multicast group's membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastDelta {
    pub group: Guid,
    pub mlid: Option<Lid>,
    pub added: Vec<Guid>,
    pub removed: Vec<Guid>,
}

impl MulticastDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Invoked once per multicast membership delta during the address phase.
pub trait MulticastHook: Send + Sync {
    fn on_membership_delta(&self, delta: &MulticastDelta);
}
