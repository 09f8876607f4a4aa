use crate::model::*;

use super::Ledger;

impl Ledger {
    pub async fn get_slot(&self, slot_id: &SlotId) -> Option<SlotRecord> {
        let slot = self.get_shared(slot_id)?;
        let rec = slot.read().await;
        Some(rec.clone())
    }

    /// Every slot, ordered by slot id.
    pub async fn slots(&self) -> Vec<SlotRecord> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in self.all_shared() {
            out.push(slot.read().await.clone());
        }
        out
    }

    /// Slots mapped to `product_id`, including empty ones, ordered by slot id.
    pub async fn slots_for_product(&self, product_id: &ProductId) -> Vec<SlotRecord> {
        let mut out = Vec::new();
        for slot in self.all_shared() {
            let rec = slot.read().await;
            if &rec.product_id == product_id {
                out.push(rec.clone());
            }
        }
        out
    }

    pub async fn available_for_product(&self, product_id: &ProductId) -> u64 {
        self.slots_for_product(product_id)
            .await
            .iter()
            .map(|r| r.available as u64)
            .sum()
    }
}
