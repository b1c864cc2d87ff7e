// Procedure slots: at most one outstanding procedure per kind per session

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::events::{CorrelationId, ProcedureStatus};

/// Negotiation procedure kinds that get their own slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureKind {
    Security,
    ConnParams,
    Phy,
    Mtu,
    DataLength,
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureKind::Security => write!(f, "security"),
            ProcedureKind::ConnParams => write!(f, "connection parameters"),
            ProcedureKind::Phy => write!(f, "PHY"),
            ProcedureKind::Mtu => write!(f, "MTU"),
            ProcedureKind::DataLength => write!(f, "data length"),
        }
    }
}

/// Which side started a procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    Local,
    Peer,
}

/// The most recent procedure of one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureSlot {
    pub id: CorrelationId,
    pub initiator: Initiator,
    pub status: ProcedureStatus,
    /// A command for this procedure has been handed to the transport
    pub applying: bool,
}

impl ProcedureSlot {
    pub fn is_outstanding(&self) -> bool {
        self.status == ProcedureStatus::Pending
    }
}

/// Result of claiming a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClaim {
    /// A new procedure was started
    Started,
    /// The caller continues the outstanding procedure with the same id
    Continued(Initiator),
}

/// A different procedure of the same kind is outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBusy {
    pub outstanding: CorrelationId,
}

/// Per-session procedure slots
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotTable {
    slots: HashMap<ProcedureKind, ProcedureSlot>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last procedure of this kind, outstanding or terminal
    pub fn get(&self, kind: ProcedureKind) -> Option<&ProcedureSlot> {
        self.slots.get(&kind)
    }

    /// Procedure of this kind that has not reached a terminal status
    pub fn outstanding(&self, kind: ProcedureKind) -> Option<&ProcedureSlot> {
        self.slots.get(&kind).filter(|slot| slot.is_outstanding())
    }

    pub fn is_outstanding(&self, kind: ProcedureKind) -> bool {
        self.outstanding(kind).is_some()
    }

    /// Start a procedure, or continue the outstanding one when `id` matches it
    pub fn begin(
        &mut self,
        kind: ProcedureKind,
        id: CorrelationId,
        initiator: Initiator,
    ) -> Result<SlotClaim, SlotBusy> {
        if let Some(slot) = self.outstanding(kind) {
            if slot.id == id {
                return Ok(SlotClaim::Continued(slot.initiator));
            }
            return Err(SlotBusy {
                outstanding: slot.id,
            });
        }

        self.slots.insert(
            kind,
            ProcedureSlot {
                id,
                initiator,
                status: ProcedureStatus::Pending,
                applying: false,
            },
        );
        Ok(SlotClaim::Started)
    }

    /// Flag the outstanding procedure `id` as having a command in flight
    pub fn mark_applying(&mut self, kind: ProcedureKind, id: CorrelationId) {
        if let Some(slot) = self.slots.get_mut(&kind) {
            if slot.id == id && slot.is_outstanding() {
                slot.applying = true;
            }
        }
    }

    /// Move procedure `id` to a terminal status. Returns false when it is no
    /// longer the outstanding procedure of that kind.
    pub fn finish(&mut self, kind: ProcedureKind, id: CorrelationId, status: ProcedureStatus) -> bool {
        match self.slots.get_mut(&kind) {
            Some(slot) if slot.id == id && slot.is_outstanding() => {
                slot.status = status;
                slot.applying = false;
                true
            }
            _ => false,
        }
    }

    /// Move whatever procedure of this kind is outstanding to a terminal status
    pub fn finish_outstanding(
        &mut self,
        kind: ProcedureKind,
        status: ProcedureStatus,
    ) -> Option<CorrelationId> {
        let slot = self.slots.get_mut(&kind).filter(|slot| slot.is_outstanding())?;
        slot.status = status;
        slot.applying = false;
        Some(slot.id)
    }

    /// Drop every outstanding procedure, keeping terminal ones for inspection
    pub fn clear_outstanding(&mut self) {
        self.slots.retain(|_, slot| !slot.is_outstanding());
    }
}
