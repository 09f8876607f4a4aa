use ulid::Ulid;

use crate::model::*;

/// Folds per-slot results into the customer-facing [`DispenseOutcome`].
#[derive(Debug)]
pub struct ResultAggregator {
    request_id: Ulid,
    product_id: ProductId,
    requested: u32,
}

impl ResultAggregator {
    pub fn new(request_id: Ulid, product_id: ProductId, requested: u32) -> Self {
        Self { request_id, product_id, requested }
    }

    /// Success means every requested unit was sensor-confirmed, no attempt
    /// was left ambiguous, and every slot accounts for its planned units.
    pub fn finish(self, slots: Vec<SlotResult>, failure: Option<FailureReason>) -> DispenseOutcome {
        let total_confirmed: u32 = slots.iter().map(|s| s.confirmed).sum();
        let ambiguous_attempt = slots
            .iter()
            .flat_map(|s| s.attempts.iter())
            .find(|a| a.outcome == AttemptOutcome::AckOnlyUnconfirmed);
        let balanced = slots.iter().all(|s| s.confirmed + s.rerouted == s.planned);

        let overall_success = total_confirmed == self.requested && ambiguous_attempt.is_none() && balanced;

        let status = if overall_success {
            DeliveryStatus::Delivered
        } else if total_confirmed == 0 && ambiguous_attempt.is_none() {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::PartiallyDelivered
        };

        let failure_reason = if overall_success {
            None
        } else {
            Some(failure.unwrap_or_else(|| match ambiguous_attempt {
                Some(a) => FailureReason {
                    kind: FailureKind::SensorConfirmTimeout,
                    cause: None,
                    slot_id: Some(a.slot_id.clone()),
                    unit_index: Some(a.unit_index),
                    requested: self.requested,
                    confirmed: total_confirmed,
                    detail: "motor acknowledged but drop sensor never fired".into(),
                },
                None => FailureReason {
                    kind: FailureKind::RetriesExhausted,
                    cause: None,
                    slot_id: None,
                    unit_index: None,
                    requested: self.requested,
                    confirmed: total_confirmed,
                    detail: format!("{total_confirmed} of {} units confirmed", self.requested),
                },
            }))
        };

        DispenseOutcome {
            request_id: self.request_id,
            product_id: self.product_id,
            requested_quantity: self.requested,
            slots,
            total_confirmed,
            overall_success,
            status,
            failure_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(s: &str) -> SlotId {
        SlotId::parse(s).unwrap()
    }

    fn attempt(s: &str, unit: u32, outcome: AttemptOutcome) -> DispenseAttempt {
        DispenseAttempt { slot_id: slot(s), unit_index: unit, try_number: 1, outcome }
    }

    fn result(s: &str, planned: u32, confirmed: u32, rerouted: u32) -> SlotResult {
        let mut r = SlotResult::new(slot(s), planned);
        r.confirmed = confirmed;
        r.rerouted = rerouted;
        r.attempts = (1..=confirmed).map(|u| attempt(s, u, AttemptOutcome::Confirmed)).collect();
        r
    }

    fn aggregate(requested: u32, slots: Vec<SlotResult>) -> DispenseOutcome {
        ResultAggregator::new(Ulid::new(), ProductId::parse("cola").unwrap(), requested).finish(slots, None)
    }

    #[test]
    fn all_confirmed_is_delivered() {
        let out = aggregate(4, vec![result("A", 2, 2, 0), result("B", 2, 2, 0)]);
        assert!(out.overall_success);
        assert_eq!(out.status, DeliveryStatus::Delivered);
        assert_eq!(out.total_confirmed, 4);
        assert!(out.failure_reason.is_none());
    }

    #[test]
    fn rerouted_units_balance_an_abandoned_slot() {
        let out = aggregate(3, vec![result("A", 3, 1, 2), result("B", 2, 2, 0)]);
        assert!(out.overall_success);
    }

    #[test]
    fn ambiguous_attempt_spoils_success_even_if_counts_match() {
        let mut a = result("A", 1, 1, 0);
        a.attempts.insert(0, attempt("A", 1, AttemptOutcome::AckOnlyUnconfirmed));
        let out = aggregate(1, vec![a]);
        assert!(!out.overall_success);
        assert_eq!(out.status, DeliveryStatus::PartiallyDelivered);
        assert_eq!(out.failure_reason.unwrap().kind, FailureKind::SensorConfirmTimeout);
    }

    #[test]
    fn nothing_confirmed_is_failed() {
        let mut a = result("A", 2, 0, 0);
        a.attempts.push(attempt("A", 1, AttemptOutcome::Failed(FailureKind::MotorAckTimeout)));
        let out = aggregate(2, vec![a]);
        assert_eq!(out.status, DeliveryStatus::Failed);
        assert_eq!(out.failure_reason.unwrap().confirmed, 0);
    }

    #[test]
    fn only_ambiguous_is_not_reported_as_failed() {
        let mut a = result("A", 1, 0, 0);
        a.ambiguous = 1;
        a.attempts.push(attempt("A", 1, AttemptOutcome::AckOnlyUnconfirmed));
        let out = aggregate(1, vec![a]);
        assert_eq!(out.status, DeliveryStatus::PartiallyDelivered);
    }
}
