use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::allocator::plan_allocation;
use super::{apply_to_slot, Ledger, LedgerError};

impl Ledger {
    /// Create a slot or overwrite its product and quantity. This is how the
    /// operator restocks; it is not a delta.
    pub async fn stock_slot(
        &self,
        slot_id: SlotId,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<SlotRecord, LedgerError> {
        if quantity > MAX_SLOT_QUANTITY {
            return Err(LedgerError::LimitExceeded("slot quantity too large"));
        }
        let _structure = self.structure.lock().await;
        let existing = self.get_shared(&slot_id);
        if existing.is_none() && self.slots.len() >= MAX_SLOTS {
            return Err(LedgerError::LimitExceeded("too many slots"));
        }

        let _barrier = self.barrier.read().await;
        let event = Event::SlotStocked {
            slot_id: slot_id.clone(),
            product_id: product_id.clone(),
            quantity,
            at: now_ms(),
        };
        match existing {
            Some(slot) => {
                let mut rec = slot.write().await;
                self.wal_append(&event).await?;
                apply_to_slot(&mut rec, &event);
                rec.generation = self.next_generation();
                Ok(rec.clone())
            }
            None => {
                self.wal_append(&event).await?;
                let rec = SlotRecord {
                    slot_id: slot_id.clone(),
                    product_id,
                    available: quantity,
                    last_updated: now_ms(),
                    version: 1,
                    generation: self.next_generation(),
                };
                self.slots.insert(slot_id, Arc::new(RwLock::new(rec.clone())));
                Ok(rec)
            }
        }
    }

    pub async fn remove_slot(&self, slot_id: &SlotId) -> Result<(), LedgerError> {
        let _structure = self.structure.lock().await;
        let slot = self
            .get_shared(slot_id)
            .ok_or_else(|| LedgerError::SlotNotFound(slot_id.clone()))?;
        let _barrier = self.barrier.read().await;
        let mut rec = slot.write().await;
        let event = Event::SlotRemoved { slot_id: slot_id.clone(), at: now_ms() };
        self.wal_append(&event).await?;
        self.slots.remove(slot_id);
        // Commits holding a stale snapshot of this slot must see it moved.
        rec.version += 1;
        Ok(())
    }

    /// Plan and reserve `quantity` units of `product_id`. The returned plan
    /// is already decremented in the ledger; units that never leave the
    /// machine must be given back with [`Ledger::restore`].
    pub async fn allocate(
        &self,
        product_id: &ProductId,
        quantity: u32,
        preferred: Option<&SlotId>,
    ) -> Result<AllocationPlan, LedgerError> {
        self.allocate_excluding(product_id, quantity, preferred, &[]).await
    }

    /// Like [`Ledger::allocate`], never touching the slots in `exclude`.
    pub async fn allocate_excluding(
        &self,
        product_id: &ProductId,
        quantity: u32,
        preferred: Option<&SlotId>,
        exclude: &[SlotId],
    ) -> Result<AllocationPlan, LedgerError> {
        if quantity > MAX_REQUEST_QUANTITY {
            return Err(LedgerError::LimitExceeded("request quantity too large"));
        }
        let snapshot: Vec<SlotRecord> = self
            .slots_for_product(product_id)
            .await
            .into_iter()
            .filter(|r| !exclude.contains(&r.slot_id))
            .collect();
        let entries = plan_allocation(product_id, &snapshot, quantity, preferred, self.ordering)?;
        let plan = AllocationPlan { id: Ulid::new(), product_id: product_id.clone(), entries };
        self.commit_plan(&snapshot, &plan).await?;
        Ok(plan)
    }

    /// Decrement every slot in `plan`, provided none has changed since `snapshot`.
    pub(super) async fn commit_plan(
        &self,
        snapshot: &[SlotRecord],
        plan: &AllocationPlan,
    ) -> Result<(), LedgerError> {
        let _barrier = self.barrier.read().await;

        let mut ordered: Vec<&PlanEntry> = plan.entries.iter().collect();
        ordered.sort_by(|a, b| a.slot_id.cmp(&b.slot_id));

        let mut guards = Vec::with_capacity(ordered.len());
        for entry in ordered {
            let expected = snapshot
                .iter()
                .find(|r| r.slot_id == entry.slot_id)
                .map(|r| r.version)
                .ok_or(LedgerError::InvalidRequest("plan entry missing from snapshot"))?;
            let slot = self.get_shared(&entry.slot_id).ok_or_else(|| LedgerError::AllocationConflict {
                slot_id: entry.slot_id.clone(),
                expected,
                found: None,
            })?;
            let guard = slot.write_owned().await;
            if guard.version != expected
                || guard.product_id != plan.product_id
                || guard.available < entry.quantity
            {
                return Err(LedgerError::AllocationConflict {
                    slot_id: entry.slot_id.clone(),
                    expected,
                    found: Some(guard.version),
                });
            }
            guards.push(guard);
        }

        let event = Event::StockAllocated {
            allocation_id: plan.id,
            product_id: plan.product_id.clone(),
            entries: plan.entries.clone(),
            at: now_ms(),
        };
        self.wal_append(&event).await?;
        for guard in guards.iter_mut() {
            apply_to_slot(guard, &event);
        }
        Ok(())
    }

    /// Give back units that were allocated but never dispensed.
    ///
    /// `product_id` and `generation` identify the stocking the units were
    /// reserved from. If the slot has been restocked or reassigned since,
    /// the operator's count already stands and nothing is added.
    pub async fn restore(
        &self,
        product_id: &ProductId,
        slot_id: &SlotId,
        generation: u64,
        quantity: u32,
    ) -> Result<SlotRecord, LedgerError> {
        let _barrier = self.barrier.read().await;
        let slot = self
            .get_shared(slot_id)
            .ok_or_else(|| LedgerError::SlotNotFound(slot_id.clone()))?;
        let mut rec = slot.write().await;
        // Removed while we waited for the lock.
        if !self.get_shared(slot_id).is_some_and(|cur| Arc::ptr_eq(&cur, &slot)) {
            return Err(LedgerError::SlotNotFound(slot_id.clone()));
        }
        if rec.generation != generation || rec.product_id != *product_id {
            return Err(LedgerError::Restocked(slot_id.clone()));
        }
        if quantity == 0 {
            return Ok(rec.clone());
        }
        if rec.available.checked_add(quantity).is_none_or(|q| q > MAX_SLOT_QUANTITY) {
            return Err(LedgerError::LimitExceeded("slot quantity too large"));
        }
        let event = Event::StockRestored { slot_id: slot_id.clone(), quantity, at: now_ms() };
        self.wal_append(&event).await?;
        apply_to_slot(&mut rec, &event);
        Ok(rec.clone())
    }
}
