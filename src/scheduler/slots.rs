use std::collections::HashSet;

use serde::Serialize;

use crate::scheduler::registry::TaskRegistry;

/// Observed state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Idle,
    Busy,
    /// Backend view unavailable and no local task bound to it.
    Unknown,
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotStatus::Idle => write!(f, "idle"),
            SlotStatus::Busy => write!(f, "busy"),
            SlotStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// The fixed set of exclusive execution slots.
///
/// Holds nothing but the slot names. Availability is decided against two
/// sources: the backend's own view of which slots are executing, and the
/// local registry. The backend view can lag behind a submission we just
/// made, so the registry acts as the tie-breaker.
#[derive(Debug, Clone)]
pub struct SlotPool {
    slots: Vec<String>,
}

impl SlotPool {
    pub fn new(slots: Vec<String>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// First slot, in configured order, that is idle on both sides.
    ///
    /// `backend_busy` is `None` when the backend could not be asked; then
    /// only the registry is consulted.
    pub fn available_slot(
        &self,
        backend_busy: Option<&HashSet<String>>,
        registry: &TaskRegistry,
    ) -> Option<String> {
        self.slots
            .iter()
            .find(|slot| {
                let externally_idle = backend_busy.map_or(true, |busy| !busy.contains(*slot));
                externally_idle && registry.slot_holder(slot).is_none()
            })
            .cloned()
    }

    /// Per-slot status for reporting.
    pub fn statuses(
        &self,
        backend_busy: Option<&HashSet<String>>,
        registry: &TaskRegistry,
    ) -> Vec<(String, SlotStatus)> {
        self.slots
            .iter()
            .map(|slot| {
                let locally_busy = registry.slot_holder(slot).is_some();
                let status = match backend_busy {
                    _ if locally_busy => SlotStatus::Busy,
                    Some(busy) if busy.contains(slot) => SlotStatus::Busy,
                    Some(_) => SlotStatus::Idle,
                    None => SlotStatus::Unknown,
                };
                (slot.clone(), status)
            })
            .collect()
    }
}
