use std::collections::VecDeque;

use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::device::{CycleError, DeviceController};
use crate::ledger::{Ledger, LedgerError};
use crate::model::*;
use crate::observability::{SLOTS_ABANDONED_TOTAL, STOCK_RESTORED_TOTAL, UNITS_TOTAL, UNIT_CYCLE_DURATION_SECONDS};

use super::outcome::ResultAggregator;
use super::{allocate_with_retry, AmbiguousUnitPolicy, DispenseSettings};

enum UnitResult {
    Confirmed,
    Failed(UnitFailure),
}

struct UnitFailure {
    error: CycleError,
    unit_index: u32,
    /// The unit may have left the machine; never send it again.
    ambiguous: bool,
    /// Cancel arrived while waiting to retry.
    cancelled: bool,
}

/// Units reserved from one stocking of a slot and not yet settled.
#[derive(Debug, Clone, Copy)]
struct Lease {
    generation: u64,
    held: u32,
}

/// Runs an allocation plan against the device, one unit cycle at a time,
/// and settles the ledger for every unit that did not leave the machine.
pub struct DispenseSequencer<'a> {
    ledger: &'a Ledger,
    device: &'a mut dyn DeviceController,
    settings: &'a DispenseSettings,
    cancel: &'a CancellationToken,
    requested: u32,
    slots: Vec<SlotResult>,
    /// Parallel to `slots`, oldest reservation first.
    leases: Vec<VecDeque<Lease>>,
    abandoned: Vec<SlotId>,
    failure: Option<FailureReason>,
}

impl<'a> DispenseSequencer<'a> {
    pub fn new(
        ledger: &'a Ledger,
        device: &'a mut dyn DeviceController,
        settings: &'a DispenseSettings,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            ledger,
            device,
            settings,
            cancel,
            requested: 0,
            slots: Vec::new(),
            leases: Vec::new(),
            abandoned: Vec::new(),
            failure: None,
        }
    }

    /// Execute `plan`, which must already be committed to the ledger.
    pub async fn run(mut self, request_id: Ulid, requested: u32, plan: AllocationPlan) -> DispenseOutcome {
        self.requested = requested;
        let product_id = plan.product_id.clone();
        let mut work: VecDeque<PlanEntry> = plan.entries.into();
        for entry in &work {
            self.reserve(entry);
        }

        'work: while let Some(entry) = work.pop_front() {
            let idx = self.slot_index(&entry.slot_id);
            let mut confirmed_here = 0;
            while confirmed_here < entry.quantity {
                if self.cancel.is_cancelled() {
                    let next_unit = self.next_unit_index(idx);
                    self.record_cancel(idx, next_unit);
                    break 'work;
                }
                match self.dispense_one(idx).await {
                    UnitResult::Confirmed => confirmed_here += 1,
                    UnitResult::Failed(failure) => {
                        if failure.ambiguous {
                            self.slots[idx].ambiguous += 1;
                        }
                        if failure.cancelled {
                            self.record_cancel(idx, failure.unit_index);
                            break 'work;
                        }
                        let untried = entry.quantity - confirmed_here - 1;
                        self.abandon(idx, &product_id, untried, failure, &mut work).await;
                        continue 'work;
                    }
                }
            }
        }

        self.reconcile(&product_id).await;
        ResultAggregator::new(request_id, product_id, requested).finish(self.slots, self.failure)
    }

    /// Index of the result for `slot_id`, created on first sight.
    fn slot_index(&mut self, slot_id: &SlotId) -> usize {
        match self.slots.iter().position(|s| &s.slot_id == slot_id) {
            Some(idx) => idx,
            None => {
                self.slots.push(SlotResult::new(slot_id.clone(), 0));
                self.leases.push(VecDeque::new());
                self.slots.len() - 1
            }
        }
    }

    /// Account for units the ledger has already decremented for `entry`.
    fn reserve(&mut self, entry: &PlanEntry) -> usize {
        let idx = self.slot_index(&entry.slot_id);
        self.slots[idx].planned += entry.quantity;
        self.leases[idx].push_back(Lease { generation: entry.generation, held: entry.quantity });
        idx
    }

    fn next_unit_index(&self, idx: usize) -> u32 {
        self.slots[idx].attempts.last().map_or(1, |a| a.unit_index + 1)
    }

    /// A confirmed unit settles the oldest reservation that still holds one.
    fn settle_one(&mut self, idx: usize) {
        if let Some(lease) = self.leases[idx].iter_mut().find(|l| l.held > 0) {
            lease.held -= 1;
        }
    }

    fn total_confirmed(&self) -> u32 {
        self.slots.iter().map(|s| s.confirmed).sum()
    }

    /// One unit, retried per policy. Each try is a full cycle.
    async fn dispense_one(&mut self, idx: usize) -> UnitResult {
        let slot_id = self.slots[idx].slot_id.clone();
        let unit_index = self.next_unit_index(idx);
        let policy = self.settings.unit_retry;
        let mut try_number = 0;
        let mut motor_moved = false;
        loop {
            try_number += 1;
            let result = self.device.dispense_unit(&slot_id).await;
            let outcome = match &result {
                Ok(_) => AttemptOutcome::Confirmed,
                Err(f) if f.error.is_ambiguous() => AttemptOutcome::AckOnlyUnconfirmed,
                Err(f) => AttemptOutcome::Failed(f.error.kind()),
            };
            self.slots[idx].attempts.push(DispenseAttempt {
                slot_id: slot_id.clone(),
                unit_index,
                try_number,
                outcome,
            });

            let failure = match result {
                Ok(report) => {
                    metrics::counter!(UNITS_TOTAL, "result" => "confirmed").increment(1);
                    metrics::histogram!(UNIT_CYCLE_DURATION_SECONDS).record(report.elapsed.as_secs_f64());
                    tracing::debug!(slot = %slot_id, unit = unit_index, try_number, "unit confirmed");
                    self.slots[idx].confirmed += 1;
                    self.settle_one(idx);
                    return UnitResult::Confirmed;
                }
                Err(failure) => failure,
            };

            let ambiguous = failure.error.is_ambiguous();
            let label = if ambiguous { "ambiguous" } else { "failed" };
            metrics::counter!(UNITS_TOTAL, "result" => label).increment(1);
            // The drop sensor fired after all for the previous try: that unit
            // may be in the tray, so this one is not sent again.
            if motor_moved && matches!(failure.error, CycleError::LateSensor { .. }) {
                tracing::warn!(slot = %slot_id, unit = unit_index, try_number, "late drop after unconfirmed try, halting unit");
                return UnitResult::Failed(UnitFailure { error: failure.error, unit_index, ambiguous: true, cancelled: false });
            }
            motor_moved = ambiguous;
            if !policy.allows_retry(try_number) {
                return UnitResult::Failed(UnitFailure { error: failure.error, unit_index, ambiguous, cancelled: false });
            }
            tracing::warn!(slot = %slot_id, unit = unit_index, try_number, error = %failure.error, "unit cycle failed, retrying");
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return UnitResult::Failed(UnitFailure { error: failure.error, unit_index, ambiguous, cancelled: true });
                }
                _ = tokio::time::sleep(policy.backoff_for(try_number)) => {}
            }
        }
    }

    /// Give up on a slot: restore what it still owes, then try to cover the
    /// undelivered units from other slots.
    async fn abandon(
        &mut self,
        idx: usize,
        product_id: &ProductId,
        untried: u32,
        failure: UnitFailure,
        work: &mut VecDeque<PlanEntry>,
    ) {
        let UnitFailure { error, unit_index, ambiguous, .. } = failure;
        let slot_id = self.slots[idx].slot_id.clone();
        // Later supplemental entries for this slot go with it.
        let queued: u32 = work.iter().filter(|e| e.slot_id == slot_id).map(|e| e.quantity).sum();
        work.retain(|e| e.slot_id != slot_id);
        // An ambiguous unit may already be in the tray; never send a second one for it.
        let shortfall = untried + queued + u32::from(!ambiguous);

        metrics::counter!(SLOTS_ABANDONED_TOTAL).increment(1);
        tracing::warn!(slot = %slot_id, unit = unit_index, error = %error, shortfall, "slot abandoned");
        self.abandoned.push(slot_id.clone());
        let outstanding = self.outstanding(idx);
        self.give_back(idx, product_id, outstanding).await;

        let mut reason = FailureReason {
            kind: FailureKind::RetriesExhausted,
            cause: Some(error.kind()),
            slot_id: Some(slot_id.clone()),
            unit_index: Some(unit_index),
            requested: self.requested,
            confirmed: self.total_confirmed(),
            detail: error.to_string(),
        };

        let fallback = self.settings.fallback;
        if shortfall > 0 && !fallback.enabled {
            reason.detail.push_str("; fallback disabled");
        } else if shortfall > fallback.max_units {
            reason.detail.push_str(&format!("; shortfall {shortfall} exceeds fallback limit {}", fallback.max_units));
        } else if shortfall > 0 {
            match allocate_with_retry(self.ledger, product_id, shortfall, None, &self.abandoned, &self.settings.allocation_retry)
                .await
            {
                Ok(plan) => {
                    tracing::info!(
                        from = %slot_id,
                        to = ?plan.entries.iter().map(|e| e.slot_id.as_str()).collect::<Vec<_>>(),
                        units = shortfall,
                        "rerouting shortfall"
                    );
                    self.slots[idx].rerouted += shortfall;
                    for entry in plan.entries {
                        self.reserve(&entry);
                        work.push_back(entry);
                    }
                    if !ambiguous {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(slot = %slot_id, error = %e, "fallback allocation failed");
                    reason.detail.push_str(&format!("; fallback unavailable: {e}"));
                }
            }
        }
        self.failure.get_or_insert(reason);
    }

    /// `unit_index` is the first unit of the slot that was not finished.
    fn record_cancel(&mut self, idx: usize, unit_index: u32) {
        let slot_id = self.slots[idx].slot_id.clone();
        tracing::info!(slot = %slot_id, unit = unit_index, "dispense cancelled");
        self.failure = Some(FailureReason {
            kind: FailureKind::Cancelled,
            cause: None,
            slot_id: Some(slot_id),
            unit_index: Some(unit_index),
            requested: self.requested,
            confirmed: self.total_confirmed(),
            detail: format!("cancelled before unit {unit_index} finished"),
        });
    }

    /// Units of this slot still decremented in the ledger that never left.
    fn outstanding(&self, idx: usize) -> u32 {
        let res = &self.slots[idx];
        let retained = match self.settings.ambiguous_policy {
            AmbiguousUnitPolicy::Retain => res.ambiguous,
            AmbiguousUnitPolicy::Restore => 0,
        };
        res.planned
            .saturating_sub(res.confirmed)
            .saturating_sub(res.restored)
            .saturating_sub(res.written_off)
            .saturating_sub(retained)
    }

    /// Restore up to `quantity` units, newest reservation first. Units from a
    /// stocking the operator has since replaced are written off instead.
    async fn give_back(&mut self, idx: usize, product_id: &ProductId, quantity: u32) {
        let slot_id = self.slots[idx].slot_id.clone();
        let mut remaining = quantity;
        for pos in (0..self.leases[idx].len()).rev() {
            if remaining == 0 {
                break;
            }
            let lease = self.leases[idx][pos];
            let take = remaining.min(lease.held);
            if take == 0 {
                continue;
            }
            match self.ledger.restore(product_id, &slot_id, lease.generation, take).await {
                Ok(rec) => {
                    self.slots[idx].restored += take;
                    metrics::counter!(STOCK_RESTORED_TOTAL).increment(u64::from(take));
                    tracing::info!(slot = %slot_id, quantity = take, available = rec.available, "stock restored");
                }
                Err(LedgerError::Restocked(_)) => {
                    self.slots[idx].written_off += take;
                    tracing::warn!(slot = %slot_id, quantity = take, "slot restocked mid-request, not restoring");
                }
                Err(e) => {
                    tracing::error!(slot = %slot_id, quantity = take, error = %e, "failed to restore stock");
                    continue;
                }
            }
            self.leases[idx][pos].held -= take;
            remaining -= take;
        }
    }

    /// Every unit not confirmed goes back to the ledger, except ambiguous
    /// units under [`AmbiguousUnitPolicy::Retain`].
    async fn reconcile(&mut self, product_id: &ProductId) {
        for idx in 0..self.slots.len() {
            let outstanding = self.outstanding(idx);
            self.give_back(idx, product_id, outstanding).await;
            let res = &self.slots[idx];
            if res.ambiguous > 0 && self.settings.ambiguous_policy == AmbiguousUnitPolicy::Retain {
                tracing::warn!(slot = %res.slot_id, units = res.ambiguous, "ambiguous units kept out of stock");
            }
        }
    }
}
