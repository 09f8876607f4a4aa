use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{MAX_PRODUCT_ID_LEN, MAX_SLOT_ID_LEN};

/// Unix milliseconds.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {what}: {reason}")]
pub struct InvalidId {
    pub what: &'static str,
    pub reason: &'static str,
}

/// Catalog product identifier. The catalog itself lives outside this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProductId(String);

impl ProductId {
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidId { what: "product id", reason: "empty" });
        }
        if s.len() > MAX_PRODUCT_ID_LEN {
            return Err(InvalidId { what: "product id", reason: "too long" });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Physical, motor-addressable compartment. Restricted to `[A-Za-z0-9_-]`
/// so it can be written verbatim into a serial frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotId(String);

impl SlotId {
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidId { what: "slot id", reason: "empty" });
        }
        if s.len() > MAX_SLOT_ID_LEN {
            return Err(InvalidId { what: "slot id", reason: "too long" });
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(InvalidId { what: "slot id", reason: "must be ascii alphanumeric" });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_id_impls {
    ($t:ty) => {
        impl TryFrom<String> for $t {
            type Error = InvalidId;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }

        impl From<$t> for String {
            fn from(id: $t) -> String {
                id.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id_impls!(ProductId);
string_id_impls!(SlotId);

/// Per-slot stock, owned by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub slot_id: SlotId,
    pub product_id: ProductId,
    pub available: u32,
    pub last_updated: Ms,
    /// Bumped on every mutation. Allocation commits only if unchanged since snapshot.
    pub version: u64,
    /// Changes on every restock. Reservations taken under an older stocking
    /// are never restored onto this one.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseRequest {
    pub product_id: ProductId,
    pub quantity: u32,
    #[serde(default)]
    pub preferred_slot: Option<SlotId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub slot_id: SlotId,
    pub quantity: u32,
    /// Slot generation the units were reserved from.
    #[serde(default)]
    pub generation: u64,
}

/// Ordered `(slot, quantity)` pairs produced by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub id: Ulid,
    pub product_id: ProductId,
    pub entries: Vec<PlanEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPlan {
    #[error("plan totals {planned} units, request wants {requested}")]
    TotalMismatch { planned: u64, requested: u32 },
    #[error("plan entry for slot {0} has zero quantity")]
    EmptyEntry(SlotId),
    #[error("slot {0} appears twice in plan")]
    DuplicateSlot(SlotId),
}

impl AllocationPlan {
    pub fn total(&self) -> u64 {
        self.entries.iter().map(|e| e.quantity as u64).sum()
    }

    /// Must pass before any entry is sent to hardware.
    pub fn validate(&self, requested: u32) -> Result<(), InvalidPlan> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.entries {
            if entry.quantity == 0 {
                return Err(InvalidPlan::EmptyEntry(entry.slot_id.clone()));
            }
            if !seen.insert(&entry.slot_id) {
                return Err(InvalidPlan::DuplicateSlot(entry.slot_id.clone()));
            }
        }
        let planned = self.total();
        if planned != requested as u64 {
            return Err(InvalidPlan::TotalMismatch { planned, requested });
        }
        Ok(())
    }
}

/// Why a unit (or a whole slot) did not deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DeviceNotReady,
    MotorAckTimeout,
    SensorConfirmTimeout,
    ProtocolDesync,
    Transport,
    RetriesExhausted,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::DeviceNotReady => "device not ready",
            FailureKind::MotorAckTimeout => "motor ack timeout",
            FailureKind::SensorConfirmTimeout => "sensor confirm timeout",
            FailureKind::ProtocolDesync => "protocol desync",
            FailureKind::Transport => "transport error",
            FailureKind::RetriesExhausted => "retries exhausted",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Confirmed,
    /// Motor accepted the command but the drop sensor never fired.
    AckOnlyUnconfirmed,
    Failed(FailureKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseAttempt {
    pub slot_id: SlotId,
    /// 1-based position of the unit within its slot.
    pub unit_index: u32,
    /// 1-based try number for this unit.
    pub try_number: u32,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotResult {
    pub slot_id: SlotId,
    pub planned: u32,
    pub confirmed: u32,
    /// Units whose final attempt was ambiguous (motor ack without sensor).
    pub ambiguous: u32,
    /// Units handed to a supplemental allocation on another slot.
    pub rerouted: u32,
    /// Units given back to the ledger.
    pub restored: u32,
    /// Units not given back because the slot was restocked first.
    #[serde(default)]
    pub written_off: u32,
    pub attempts: Vec<DispenseAttempt>,
}

impl SlotResult {
    pub fn new(slot_id: SlotId, planned: u32) -> Self {
        Self {
            slot_id,
            planned,
            confirmed: 0,
            ambiguous: 0,
            rerouted: 0,
            restored: 0,
            written_off: 0,
            attempts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    /// Last per-unit failure when `kind` is `RetriesExhausted`.
    #[serde(default)]
    pub cause: Option<FailureKind>,
    #[serde(default)]
    pub slot_id: Option<SlotId>,
    #[serde(default)]
    pub unit_index: Option<u32>,
    pub requested: u32,
    pub confirmed: u32,
    pub detail: String,
}

/// What the purchase flow shows the customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    /// Something left the machine, but not everything. Contact support.
    PartiallyDelivered,
    /// Nothing was delivered; no charge should be retained.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseOutcome {
    pub request_id: Ulid,
    pub product_id: ProductId,
    pub requested_quantity: u32,
    pub slots: Vec<SlotResult>,
    pub total_confirmed: u32,
    pub overall_success: bool,
    pub status: DeliveryStatus,
    pub failure_reason: Option<FailureReason>,
}

impl DispenseOutcome {
    pub fn slot(&self, slot_id: &SlotId) -> Option<&SlotResult> {
        self.slots.iter().find(|s| &s.slot_id == slot_id)
    }

    pub fn attempts(&self) -> impl Iterator<Item = &DispenseAttempt> {
        self.slots.iter().flat_map(|s| s.attempts.iter())
    }
}

/// WAL record format for the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Creates a slot or overwrites its product and quantity (restock).
    SlotStocked {
        slot_id: SlotId,
        product_id: ProductId,
        quantity: u32,
        at: Ms,
    },
    SlotRemoved {
        slot_id: SlotId,
        at: Ms,
    },
    /// Whole plan decremented in one record.
    StockAllocated {
        allocation_id: Ulid,
        product_id: ProductId,
        entries: Vec<PlanEntry>,
        at: Ms,
    },
    StockRestored {
        slot_id: SlotId,
        quantity: u32,
        at: Ms,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(s: &str) -> SlotId {
        SlotId::parse(s).unwrap()
    }

    fn plan(entries: &[(&str, u32)]) -> AllocationPlan {
        AllocationPlan {
            id: Ulid::new(),
            product_id: ProductId::parse("cola").unwrap(),
            entries: entries
                .iter()
                .map(|(s, q)| PlanEntry { slot_id: slot(s), quantity: *q, generation: 1 })
                .collect(),
        }
    }

    #[test]
    fn slot_id_rules() {
        assert!(SlotId::parse("11").is_ok());
        assert!(SlotId::parse("A-2_b").is_ok());
        assert!(SlotId::parse("").is_err());
        assert!(SlotId::parse("has space").is_err());
        assert!(SlotId::parse("x\r\nINIT").is_err()); // no frame injection
        assert!(SlotId::parse("x".repeat(MAX_SLOT_ID_LEN + 1)).is_err());
    }

    #[test]
    fn slot_id_serde_validates() {
        let ok: SlotId = serde_json::from_str("\"A\"").unwrap();
        assert_eq!(ok.as_str(), "A");
        assert!(serde_json::from_str::<SlotId>("\"bad id\"").is_err());
    }

    #[test]
    fn plan_validation() {
        assert!(plan(&[("A", 2), ("B", 2)]).validate(4).is_ok());
        assert_eq!(
            plan(&[("A", 2)]).validate(3),
            Err(InvalidPlan::TotalMismatch { planned: 2, requested: 3 })
        );
        assert!(matches!(plan(&[("A", 0), ("B", 3)]).validate(3), Err(InvalidPlan::EmptyEntry(_))));
        assert!(matches!(plan(&[("A", 1), ("A", 1)]).validate(2), Err(InvalidPlan::DuplicateSlot(_))));
    }

    #[test]
    fn attempt_outcome_wire_shape() {
        let json = serde_json::to_string(&AttemptOutcome::Failed(FailureKind::MotorAckTimeout)).unwrap();
        assert_eq!(json, r#"{"result":"failed","kind":"motor_ack_timeout"}"#);
        let json = serde_json::to_string(&AttemptOutcome::Confirmed).unwrap();
        assert_eq!(json, r#"{"result":"confirmed"}"#);
    }
}
