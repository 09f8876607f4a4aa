use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::{PlanEntry, ProductId, SlotId, SlotRecord};

use super::LedgerError;

/// Order in which non-preferred slots are drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotOrdering {
    /// Most stocked first, ties by ascending slot id. Keeps plans short.
    #[default]
    MostStocked,
    /// Ascending slot id, i.e. the planogram's mapping order.
    MappingOrder,
}

impl FromStr for SlotOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "most_stocked" => Ok(Self::MostStocked),
            "mapping_order" => Ok(Self::MappingOrder),
            other => Err(format!("unknown slot ordering: {other}")),
        }
    }
}

/// Choose which slots serve `quantity` units of `product_id`.
///
/// The preferred slot (if stocked) is drained first; the rest follow
/// `ordering`. Records for other products or with no stock are ignored.
/// Fails without planning anything if the candidates can't cover the request.
pub fn plan_allocation(
    product_id: &ProductId,
    candidates: &[SlotRecord],
    quantity: u32,
    preferred: Option<&SlotId>,
    ordering: SlotOrdering,
) -> Result<Vec<PlanEntry>, LedgerError> {
    if quantity == 0 {
        return Err(LedgerError::InvalidRequest("quantity must be positive"));
    }
    let mut stocked: Vec<&SlotRecord> = candidates
        .iter()
        .filter(|r| &r.product_id == product_id && r.available > 0)
        .collect();

    let available: u64 = stocked.iter().map(|r| r.available as u64).sum();
    if available < quantity as u64 {
        return Err(LedgerError::InsufficientStock {
            product_id: product_id.clone(),
            requested: quantity,
            available,
        });
    }

    match ordering {
        SlotOrdering::MostStocked => stocked
            .sort_by(|a, b| b.available.cmp(&a.available).then_with(|| a.slot_id.cmp(&b.slot_id))),
        SlotOrdering::MappingOrder => stocked.sort_by(|a, b| a.slot_id.cmp(&b.slot_id)),
    }
    if let Some(pref) = preferred
        && let Some(pos) = stocked.iter().position(|r| &r.slot_id == pref)
    {
        let rec = stocked.remove(pos);
        stocked.insert(0, rec);
    }

    let mut remaining = quantity;
    let mut entries = Vec::new();
    for rec in stocked {
        if remaining == 0 {
            break;
        }
        let take = rec.available.min(remaining);
        entries.push(PlanEntry { slot_id: rec.slot_id.clone(), quantity: take, generation: rec.generation });
        remaining -= take;
    }
    debug_assert_eq!(remaining, 0);
    Ok(entries)
}
