//! Structured outcome events.
//!
//! The core never formats operator text for sweep outcomes; it hands
//! [`SmEvent`] values to an [`EventSink`]. Where they end up (log lines,
//! a JSON stream, a test buffer) is the sink's business.

use crate::state_machine::SmState;
use crate::sweep::{SweepKind, SweepReason};
use chrono::{DateTime, Utc};
use fabric_sm_types::{Guid, PhysPortRef};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// One structured event with its UTC timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SmEventKind,
}

impl SmEvent {
    pub fn now(kind: SmEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Serializes the event as one JSON line.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SmEventKind {
    SweepCompleted {
        sweep_id: u64,
        kind: SweepKind,
        reason: SweepReason,
        duration_ms: u64,
        added: usize,
        updated: usize,
        removed: usize,
        unresolved: usize,
        lid_updates: usize,
        degraded: bool,
        aborted: bool,
    },
    RoleTransition {
        from: SmState,
        to: SmState,
        cause: String,
    },
    /// First successful master sweep; the subnet is up.
    SubnetUp {
        sweep_id: u64,
        ports: usize,
    },
    /// The cycle ended with `subnet_initialization_error` set.
    InitializationError {
        sweep_id: u64,
        unresolved: Vec<PhysPortRef>,
        errors: Vec<String>,
    },
    TopologyConflict {
        guid: Guid,
        message: String,
    },
    RoleConflict {
        peer: Guid,
        winner: Guid,
    },
    FatalDesync {
        reason: String,
        exit_requested: bool,
    },
    PeerAgedOut {
        guid: Guid,
        was_master: bool,
    },
    /// A peer's port left the fabric.
    PeerRemoved {
        guid: Guid,
        was_master: bool,
    },
    TrapReceived {
        accepted: bool,
    },
    InstallFailed {
        entity: Guid,
        message: String,
    },
}

/// Receives structured events from the core.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SmEvent);
}

/// Forwards every event to `tracing` with structured fields.
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: SmEvent) {
        match &event.kind {
            SmEventKind::SweepCompleted {
                sweep_id,
                kind,
                reason,
                duration_ms,
                added,
                updated,
                removed,
                unresolved,
                lid_updates,
                degraded,
                aborted,
            } => info!(
                sweep_id,
                ?kind,
                ?reason,
                duration_ms,
                added,
                updated,
                removed,
                unresolved,
                lid_updates,
                degraded,
                aborted,
                "sweep completed"
            ),
            SmEventKind::RoleTransition { from, to, cause } => {
                info!(%from, %to, cause = cause.as_str(), "role transition")
            }
            SmEventKind::SubnetUp { sweep_id, ports } => {
                info!(sweep_id, ports, "subnet up")
            }
            SmEventKind::InitializationError {
                sweep_id,
                unresolved,
                errors,
            } => warn!(
                sweep_id,
                unresolved = unresolved.len(),
                errors = ?errors,
                "subnet initialization error"
            ),
            SmEventKind::TopologyConflict { guid, message } => {
                warn!(%guid, message = message.as_str(), "topology conflict")
            }
            SmEventKind::RoleConflict { peer, winner } => {
                warn!(%peer, %winner, "master role conflict")
            }
            SmEventKind::FatalDesync {
                reason,
                exit_requested,
            } => error!(reason = reason.as_str(), exit_requested, "fatal topology desync"),
            SmEventKind::PeerAgedOut { guid, was_master } => {
                info!(%guid, was_master, "peer manager aged out")
            }
            SmEventKind::PeerRemoved { guid, was_master } => {
                info!(%guid, was_master, "peer manager removed with its port")
            }
            SmEventKind::TrapReceived { accepted } => info!(accepted, "trap received"),
            SmEventKind::InstallFailed { entity, message } => {
                warn!(%entity, message = message.as_str(), "downstream programming failed")
            }
        }
    }
}

/// Keeps events in memory. Useful for tests and for exposing recent history.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SmEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SmEvent> {
        self.events.lock().clone()
    }

    pub fn drain(&self) -> Vec<SmEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: SmEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_flat_and_tagged() {
        let event = SmEvent::now(SmEventKind::PeerAgedOut {
            guid: Guid::new(0x42),
            was_master: true,
        });
        let json = event.to_json().unwrap();
        assert!(json.contains(r#""event":"peer_aged_out""#));
        assert!(json.contains(r#""guid":"0x0000000000000042""#));
        assert!(json.contains("timestamp"));

        let back: SmEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_memory_sink_drain() {
        let sink = MemoryEventSink::new();
        sink.emit(SmEvent::now(SmEventKind::TrapReceived { accepted: true }));
        sink.emit(SmEvent::now(SmEventKind::TrapReceived { accepted: false }));
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.drain().len(), 2);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_tracing_sink_accepts_every_kind() {
        let sink = TracingEventSink;
        sink.emit(SmEvent::now(SmEventKind::FatalDesync {
            reason: "duplicate switch".to_string(),
            exit_requested: false,
        }));
        sink.emit(SmEvent::now(SmEventKind::RoleTransition {
            from: SmState::Discovering,
            to: SmState::Master,
            cause: "discovery-complete".to_string(),
        }));
    }
}
