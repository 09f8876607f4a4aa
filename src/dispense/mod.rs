mod error;
mod outcome;
mod retry;
mod sequencer;

pub use error::DispenseError;
pub use outcome::ResultAggregator;
pub use retry::RetryPolicy;
pub use sequencer::DispenseSequencer;

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::device::DeviceController;
use crate::ledger::{Ledger, LedgerError};
use crate::limits::MAX_REQUEST_QUANTITY;
use crate::model::*;
use crate::observability::{ALLOCATION_CONFLICTS_TOTAL, DISPENSE_DURATION_SECONDS, DISPENSE_REQUESTS_TOTAL};

/// What the ledger does with a unit whose motor acknowledged but whose
/// sensor never fired. Such units never count as delivered either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguousUnitPolicy {
    /// Treat as never dispensed and put back in stock.
    #[default]
    Restore,
    /// Keep out of stock; the item may be in the tray.
    Retain,
}

impl FromStr for AmbiguousUnitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restore" => Ok(AmbiguousUnitPolicy::Restore),
            "retain" => Ok(AmbiguousUnitPolicy::Retain),
            other => Err(format!("unknown ambiguous unit policy: {other}")),
        }
    }
}

/// Re-plan the undelivered units of an abandoned slot onto other slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackPolicy {
    pub enabled: bool,
    /// Largest shortfall that may be rerouted.
    pub max_units: u32,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self { enabled: true, max_units: 4 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispenseSettings {
    pub unit_retry: RetryPolicy,
    pub allocation_retry: RetryPolicy,
    pub fallback: FallbackPolicy,
    pub ambiguous_policy: AmbiguousUnitPolicy,
}

impl Default for DispenseSettings {
    fn default() -> Self {
        Self {
            unit_retry: RetryPolicy::unit_default(),
            allocation_retry: RetryPolicy::allocation_default(),
            fallback: FallbackPolicy::default(),
            ambiguous_policy: AmbiguousUnitPolicy::default(),
        }
    }
}

/// Allocate, retrying optimistic conflicts per `policy`.
pub(crate) async fn allocate_with_retry(
    ledger: &Ledger,
    product_id: &ProductId,
    quantity: u32,
    preferred: Option<&SlotId>,
    exclude: &[SlotId],
    policy: &RetryPolicy,
) -> Result<AllocationPlan, DispenseError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match ledger.allocate_excluding(product_id, quantity, preferred, exclude).await {
            Ok(plan) => return Ok(plan),
            Err(LedgerError::AllocationConflict { slot_id, .. }) => {
                metrics::counter!(ALLOCATION_CONFLICTS_TOTAL).increment(1);
                if !policy.allows_retry(attempts) {
                    return Err(DispenseError::AllocationConflict { slot_id, attempts });
                }
                tracing::debug!(slot = %slot_id, attempts, "allocation conflict, retrying");
                tokio::time::sleep(policy.backoff_for(attempts)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Entry point for the purchase flow. Owns the device; one request drives
/// the hardware at a time and the rest queue on the device lock.
pub struct DispenseService {
    ledger: Arc<Ledger>,
    device: Mutex<Box<dyn DeviceController>>,
    settings: DispenseSettings,
    /// Token of the request currently holding the device.
    in_flight: std::sync::Mutex<Option<CancellationToken>>,
    /// Parent of every request token. Once cancelled, no new request starts.
    shutdown: CancellationToken,
}

/// Clears the in-flight token when the request lets go of the device,
/// whichever way it returns.
struct InFlight<'a>(&'a DispenseService);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.set_in_flight(None);
    }
}

impl DispenseService {
    pub fn new(ledger: Arc<Ledger>, device: Box<dyn DeviceController>, settings: DispenseSettings) -> Self {
        Self {
            ledger,
            device: Mutex::new(device),
            settings,
            in_flight: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn settings(&self) -> &DispenseSettings {
        &self.settings
    }

    /// Stop the in-flight request at its next unit boundary. Returns `false`
    /// if nothing holds the device. Queued requests are unaffected.
    ///
    /// A request holds the device from the moment it is dequeued, so a
    /// cancel during allocation or session bring-up stops it before the
    /// first motor command.
    pub fn cancel(&self) -> bool {
        let guard = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn set_in_flight(&self, token: Option<CancellationToken>) {
        *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }

    /// Refuse new requests and stop the running one at its next unit
    /// boundary. Requests still queued on the device fail with
    /// [`DispenseError::ShuttingDown`] without touching stock.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until every request queued before this call has let go of the
    /// device and settled the ledger.
    pub async fn wait_idle(&self) {
        let _device = self.device.lock().await;
    }

    /// Dispense `quantity` units of `product_id`.
    ///
    /// Returns `Err` only when nothing was sent to the motors: bad input,
    /// not enough stock, persistent allocation conflicts, or a device that
    /// would not come up. Hardware trouble after that is reported in the
    /// outcome.
    pub async fn dispense_for_product(
        &self,
        product_id: &ProductId,
        quantity: u32,
        preferred_slot: Option<&SlotId>,
    ) -> Result<DispenseOutcome, DispenseError> {
        let started = std::time::Instant::now();
        let result = self.dispense_inner(product_id, quantity, preferred_slot).await;
        let status = match &result {
            Ok(outcome) => match outcome.status {
                DeliveryStatus::Delivered => "delivered",
                DeliveryStatus::PartiallyDelivered => "partially_delivered",
                DeliveryStatus::Failed => "failed",
            },
            Err(e) => e.label(),
        };
        metrics::counter!(DISPENSE_REQUESTS_TOTAL, "status" => status).increment(1);
        metrics::histogram!(DISPENSE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispense_inner(
        &self,
        product_id: &ProductId,
        quantity: u32,
        preferred_slot: Option<&SlotId>,
    ) -> Result<DispenseOutcome, DispenseError> {
        if quantity == 0 {
            return Err(DispenseError::InvalidRequest("quantity must be positive".into()));
        }
        if quantity > MAX_REQUEST_QUANTITY {
            return Err(DispenseError::InvalidRequest(format!(
                "quantity {quantity} exceeds limit {MAX_REQUEST_QUANTITY}"
            )));
        }

        let mut device = self.device.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(DispenseError::ShuttingDown);
        }
        let token = self.shutdown.child_token();
        self.set_in_flight(Some(token.clone()));
        let _in_flight = InFlight(self);

        let request_id = Ulid::new();
        tracing::info!(%request_id, product = %product_id, quantity, preferred = ?preferred_slot, "dispense started");

        let plan = allocate_with_retry(
            &self.ledger,
            product_id,
            quantity,
            preferred_slot,
            &[],
            &self.settings.allocation_retry,
        )
        .await
        .inspect_err(|e| tracing::warn!(%request_id, error = %e, "allocation failed"))?;

        if let Err(e) = plan.validate(quantity) {
            tracing::error!(%request_id, error = %e, "allocator produced an invalid plan");
            self.restore_plan(&plan).await;
            return Err(e.into());
        }

        if let Err(e) = device.prepare().await {
            tracing::warn!(%request_id, device = device.name(), error = %e, "device not ready, releasing stock");
            self.restore_plan(&plan).await;
            return Err(DispenseError::from_prepare(e, quantity));
        }

        let outcome = DispenseSequencer::new(&self.ledger, &mut **device, &self.settings, &token)
            .run(request_id, quantity, plan)
            .await;
        device.finish().await;

        match &outcome.failure_reason {
            None => tracing::info!(%request_id, confirmed = outcome.total_confirmed, "dispense delivered"),
            Some(reason) => tracing::warn!(
                %request_id,
                status = ?outcome.status,
                confirmed = outcome.total_confirmed,
                requested = quantity,
                error = %DispenseError::from_reason(reason),
                "dispense incomplete"
            ),
        }
        Ok(outcome)
    }

    async fn restore_plan(&self, plan: &AllocationPlan) {
        for entry in &plan.entries {
            let restored = self.ledger.restore(&plan.product_id, &entry.slot_id, entry.generation, entry.quantity).await;
            if let Err(e) = restored {
                tracing::error!(slot = %entry.slot_id, quantity = entry.quantity, error = %e, "failed to restore stock");
            }
        }
    }
}
