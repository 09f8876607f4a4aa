use crate::device::CycleError;
use crate::ledger::LedgerError;
use crate::model::{FailureKind, FailureReason, InvalidPlan, ProductId, SlotId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispenseError {
    #[error("insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock { product_id: ProductId, requested: u32, available: u64 },
    #[error("allocation conflict on slot {slot_id}, gave up after {attempts} attempts")]
    AllocationConflict { slot_id: SlotId, attempts: u32 },
    #[error("device not ready: {detail}")]
    DeviceNotReady { requested: u32, detail: String },
    #[error("slot {slot_id} unit {unit_index}: motor ack timeout ({confirmed}/{requested} confirmed)")]
    MotorAckTimeout { slot_id: SlotId, unit_index: u32, requested: u32, confirmed: u32 },
    #[error("slot {slot_id} unit {unit_index}: sensor never confirmed ({confirmed}/{requested} confirmed)")]
    SensorConfirmTimeout { slot_id: SlotId, unit_index: u32, requested: u32, confirmed: u32 },
    #[error("protocol desync: {detail} ({confirmed}/{requested} confirmed)")]
    ProtocolDesync {
        slot_id: Option<SlotId>,
        unit_index: Option<u32>,
        requested: u32,
        confirmed: u32,
        detail: String,
    },
    #[error("slot {slot_id} unit {unit_index}: retries exhausted, last {cause} ({confirmed}/{requested} confirmed)")]
    RetriesExhausted {
        slot_id: SlotId,
        unit_index: u32,
        requested: u32,
        confirmed: u32,
        cause: FailureKind,
    },
    #[error("cancelled ({confirmed}/{requested} confirmed)")]
    Cancelled { requested: u32, confirmed: u32 },
    #[error("dispenser is shutting down")]
    ShuttingDown,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid allocation plan: {0}")]
    InvalidPlan(#[from] InvalidPlan),
    #[error("ledger: {0}")]
    Ledger(LedgerError),
}

impl From<LedgerError> for DispenseError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientStock { product_id, requested, available } => {
                DispenseError::InsufficientStock { product_id, requested, available }
            }
            LedgerError::AllocationConflict { slot_id, .. } => DispenseError::AllocationConflict { slot_id, attempts: 1 },
            LedgerError::InvalidRequest(msg) | LedgerError::LimitExceeded(msg) => DispenseError::InvalidRequest(msg.into()),
            other => DispenseError::Ledger(other),
        }
    }
}

impl DispenseError {
    /// A failure before any unit was attempted (session bring-up).
    pub fn from_prepare(err: CycleError, requested: u32) -> Self {
        match err {
            CycleError::ProtocolDesync { detail, .. } => DispenseError::ProtocolDesync {
                slot_id: None,
                unit_index: None,
                requested,
                confirmed: 0,
                detail,
            },
            other => DispenseError::DeviceNotReady { requested, detail: other.to_string() },
        }
    }

    /// The error equivalent of an outcome's failure reason.
    pub fn from_reason(reason: &FailureReason) -> Self {
        let requested = reason.requested;
        let confirmed = reason.confirmed;
        let unit_index = reason.unit_index.unwrap_or(0);
        let slot = || reason.slot_id.clone();
        match (reason.kind, slot()) {
            (FailureKind::Cancelled, _) => DispenseError::Cancelled { requested, confirmed },
            (FailureKind::RetriesExhausted, Some(slot_id)) => DispenseError::RetriesExhausted {
                slot_id,
                unit_index,
                requested,
                confirmed,
                cause: reason.cause.unwrap_or(FailureKind::RetriesExhausted),
            },
            (FailureKind::MotorAckTimeout, Some(slot_id)) => {
                DispenseError::MotorAckTimeout { slot_id, unit_index, requested, confirmed }
            }
            (FailureKind::SensorConfirmTimeout, Some(slot_id)) => {
                DispenseError::SensorConfirmTimeout { slot_id, unit_index, requested, confirmed }
            }
            (FailureKind::DeviceNotReady | FailureKind::Transport, _) => {
                DispenseError::DeviceNotReady { requested, detail: reason.detail.clone() }
            }
            (_, slot_id) => DispenseError::ProtocolDesync {
                slot_id,
                unit_index: reason.unit_index,
                requested,
                confirmed,
                detail: reason.detail.clone(),
            },
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            DispenseError::InsufficientStock { .. } => "insufficient_stock",
            DispenseError::AllocationConflict { .. } => "allocation_conflict",
            DispenseError::DeviceNotReady { .. } => "device_not_ready",
            DispenseError::MotorAckTimeout { .. } => "motor_ack_timeout",
            DispenseError::SensorConfirmTimeout { .. } => "sensor_confirm_timeout",
            DispenseError::ProtocolDesync { .. } => "protocol_desync",
            DispenseError::RetriesExhausted { .. } => "retries_exhausted",
            DispenseError::Cancelled { .. } => "cancelled",
            DispenseError::ShuttingDown => "shutting_down",
            DispenseError::InvalidRequest(_) => "invalid_request",
            DispenseError::InvalidPlan(_) => "invalid_plan",
            DispenseError::Ledger(_) => "ledger",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_maps_to_error_with_counts() {
        let reason = FailureReason {
            kind: FailureKind::RetriesExhausted,
            cause: Some(FailureKind::MotorAckTimeout),
            slot_id: Some(SlotId::parse("A").unwrap()),
            unit_index: Some(2),
            requested: 3,
            confirmed: 1,
            detail: String::new(),
        };
        let err = DispenseError::from_reason(&reason);
        assert_eq!(
            err,
            DispenseError::RetriesExhausted {
                slot_id: SlotId::parse("A").unwrap(),
                unit_index: 2,
                requested: 3,
                confirmed: 1,
                cause: FailureKind::MotorAckTimeout,
            }
        );
        assert!(err.to_string().contains("1/3"));
    }

    #[test]
    fn ledger_errors_keep_their_meaning() {
        let e: DispenseError = LedgerError::InsufficientStock {
            product_id: ProductId::parse("cola").unwrap(),
            requested: 6,
            available: 5,
        }
        .into();
        assert_eq!(e.label(), "insufficient_stock");
        let e: DispenseError = LedgerError::Wal("disk full".into()).into();
        assert!(matches!(e, DispenseError::Ledger(_)));
    }
}
