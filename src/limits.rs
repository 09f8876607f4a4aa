/// Max length of a slot id. Slot ids are sent verbatim on the serial line.
pub const MAX_SLOT_ID_LEN: usize = 16;

/// Max length of a product id.
pub const MAX_PRODUCT_ID_LEN: usize = 128;

/// Max slots the ledger will track for one kiosk.
pub const MAX_SLOTS: usize = 1024;

/// Max units a single slot can be stocked with.
pub const MAX_SLOT_QUANTITY: u32 = 10_000;

/// Max units in a single dispense request.
pub const MAX_REQUEST_QUANTITY: u32 = 64;

/// Max length of one frame on the serial line (excluding CRLF).
pub const MAX_FRAME_LEN: usize = 256;

/// Max length of one control-socket request line.
pub const MAX_CONTROL_LINE_LEN: usize = 64 * 1024;
