//! JSON-lines control socket. One request object per line, one response
//! object per line, in order.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::dispense::{DispenseError, DispenseService};
use crate::ledger::LedgerError;
use crate::limits::MAX_CONTROL_LINE_LEN;
use crate::model::*;
use crate::observability::{op_label, CONTROL_REQUESTS_TOTAL};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Dispense {
        product_id: ProductId,
        quantity: u32,
        #[serde(default)]
        preferred_slot: Option<SlotId>,
    },
    /// Set a slot's product and quantity, creating it if needed.
    Stock {
        slot_id: SlotId,
        product_id: ProductId,
        quantity: u32,
    },
    RemoveSlot {
        slot_id: SlotId,
    },
    Slots {
        #[serde(default)]
        product_id: Option<ProductId>,
    },
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Outcome { outcome: DispenseOutcome },
    Slot { slot: SlotRecord },
    Removed { slot_id: SlotId },
    Slots { slots: Vec<SlotRecord> },
    Cancel { cancelled: bool },
    Error { code: String, message: String },
}

impl Response {
    fn error(code: &str, message: impl ToString) -> Self {
        Response::Error { code: code.to_string(), message: message.to_string() }
    }

    fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<LinesCodecError> for WireError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(e) => WireError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => {
                WireError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "line too long"))
            }
        }
    }
}

pub struct ControlHandler {
    service: Arc<DispenseService>,
}

impl ControlHandler {
    pub fn new(service: Arc<DispenseService>) -> Self {
        Self { service }
    }

    pub async fn execute(&self, req: Request) -> Response {
        let ledger = self.service.ledger();
        match req {
            Request::Dispense { product_id, quantity, preferred_slot } => {
                match self.service.dispense_for_product(&product_id, quantity, preferred_slot.as_ref()).await {
                    Ok(outcome) => Response::Outcome { outcome },
                    Err(e) => dispense_err(e),
                }
            }
            Request::Stock { slot_id, product_id, quantity } => {
                match ledger.stock_slot(slot_id, product_id, quantity).await {
                    Ok(slot) => {
                        tracing::info!(slot = %slot.slot_id, product = %slot.product_id, quantity, "slot stocked");
                        Response::Slot { slot }
                    }
                    Err(e) => ledger_err(e),
                }
            }
            Request::RemoveSlot { slot_id } => match ledger.remove_slot(&slot_id).await {
                Ok(()) => {
                    tracing::info!(slot = %slot_id, "slot removed");
                    Response::Removed { slot_id }
                }
                Err(e) => ledger_err(e),
            },
            Request::Slots { product_id } => {
                let slots = match product_id {
                    Some(product_id) => ledger.slots_for_product(&product_id).await,
                    None => ledger.slots().await,
                };
                Response::Slots { slots }
            }
            Request::Cancel => Response::Cancel { cancelled: self.service.cancel() },
        }
    }
}

/// Serve one control connection until the peer hangs up.
pub async fn process_connection<S>(socket: S, service: Arc<DispenseService>) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_CONTROL_LINE_LEN));
    let handler = ControlHandler::new(service);

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                // The framed stream ends after a decode error; say why, then hang up.
                let resp = Response::error("bad_request", format!("line exceeds {MAX_CONTROL_LINE_LEN} bytes"));
                framed.send(serde_json::to_string(&resp)?).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                let op = op_label(&req);
                let resp = handler.execute(req).await;
                let status = if resp.is_error() { "error" } else { "ok" };
                metrics::counter!(CONTROL_REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
                resp
            }
            Err(e) => Response::error("bad_request", e),
        };
        framed.send(serde_json::to_string(&response)?).await?;
    }
    Ok(())
}

fn dispense_err(e: DispenseError) -> Response {
    Response::error(e.label(), &e)
}

fn ledger_err(e: LedgerError) -> Response {
    let code = match &e {
        LedgerError::SlotNotFound(_) => "slot_not_found",
        LedgerError::InsufficientStock { .. } => "insufficient_stock",
        LedgerError::AllocationConflict { .. } => "allocation_conflict",
        LedgerError::Restocked(_) => "restocked",
        LedgerError::InvalidRequest(_) => "invalid_request",
        LedgerError::LimitExceeded(_) => "limit_exceeded",
        LedgerError::Wal(_) => "ledger",
    };
    Response::error(code, e)
}
