use crate::model::{ProductId, SlotId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("slot not found: {0}")]
    SlotNotFound(SlotId),
    #[error("insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u64,
    },
    /// The slot changed between snapshot and commit. `found` is `None` if it was removed.
    #[error("allocation conflict on slot {slot_id}: expected version {expected}, found {found:?}")]
    AllocationConflict {
        slot_id: SlotId,
        expected: u64,
        found: Option<u64>,
    },
    /// The slot was restocked or given to another product after the units
    /// being restored were reserved.
    #[error("slot {0} was restocked since allocation")]
    Restocked(SlotId),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}
