//! The dispensation gate: may this order line be fulfilled?
//!
//! Read-only with respect to orders and prescriptions. Re-evaluation happens
//! only on explicit prescription decision events, never by polling.

use medipaw_catalog::ProductId;

use crate::prescription::{Prescription, PrescriptionStatus};

/// Outcome of gating one order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateResolution {
    /// The product is not prescription-gated.
    NotRequired,
    /// The line is gated but no prescription is linked yet.
    AwaitingUpload,
    /// A linked prescription exists but has not been reviewed.
    AwaitingApproval,
    /// Approved for at least the ordered quantity.
    Approved(u32),
    /// Rejected outright, or approved for less than the ordered quantity
    /// (partial fulfillment is not offered; the customer re-orders the
    /// approved amount).
    Rejected,
}

impl GateResolution {
    /// The line may ship.
    pub fn is_cleared(&self) -> bool {
        matches!(self, Self::NotRequired | Self::Approved(_))
    }

    /// The line is waiting on the review workflow.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::AwaitingUpload | Self::AwaitingApproval)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// Resolve the gate for one order line.
///
/// `prescription` is the record linked by the line's `prescription_ref`,
/// already looked up by the caller (or `None` if the line has no link).
pub fn evaluate(
    requires_prescription: bool,
    product_id: ProductId,
    quantity: u32,
    prescription: Option<&Prescription>,
) -> GateResolution {
    if !requires_prescription {
        return GateResolution::NotRequired;
    }

    let Some(prescription) = prescription else {
        return GateResolution::AwaitingUpload;
    };

    match prescription.status {
        PrescriptionStatus::Pending => GateResolution::AwaitingApproval,
        PrescriptionStatus::Rejected => GateResolution::Rejected,
        PrescriptionStatus::Approved => match prescription.approved_quantity_for(product_id) {
            Some(approved) if approved >= quantity => GateResolution::Approved(approved),
            // Approved for less than ordered (or for other products only):
            // the line is rejected, not partially fulfilled.
            _ => GateResolution::Rejected,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use medipaw_core::{AggregateId, UserId};

    use super::*;
    use crate::prescription::{PrescriptionId, ReviewDecision};

    fn test_product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn rx_with(decision: Option<ReviewDecision>) -> Prescription {
        let mut rx = Prescription::upload(
            PrescriptionId::new(AggregateId::new()),
            UserId::new(),
            "uploads/rx.pdf",
            Utc::now(),
        )
        .unwrap();
        if let Some(decision) = decision {
            rx.decide(decision, Utc::now()).unwrap();
        }
        rx
    }

    #[test]
    fn ungated_products_always_clear() {
        assert_eq!(
            evaluate(false, test_product_id(), 3, None),
            GateResolution::NotRequired
        );
    }

    #[test]
    fn gated_line_without_prescription_awaits_upload() {
        assert_eq!(
            evaluate(true, test_product_id(), 1, None),
            GateResolution::AwaitingUpload
        );
    }

    #[test]
    fn pending_prescription_awaits_approval() {
        let rx = rx_with(None);
        assert_eq!(
            evaluate(true, test_product_id(), 1, Some(&rx)),
            GateResolution::AwaitingApproval
        );
    }

    #[test]
    fn approval_covers_the_ordered_quantity() {
        let product = test_product_id();
        let rx = rx_with(Some(ReviewDecision::Approve {
            quantities: BTreeMap::from([(product, 2)]),
            notes: None,
        }));

        assert_eq!(evaluate(true, product, 2, Some(&rx)), GateResolution::Approved(2));
        assert_eq!(evaluate(true, product, 1, Some(&rx)), GateResolution::Approved(2));
    }

    #[test]
    fn partial_approval_resolves_rejected() {
        let product = test_product_id();
        let rx = rx_with(Some(ReviewDecision::Approve {
            quantities: BTreeMap::from([(product, 1)]),
            notes: None,
        }));

        // Ordered 2, approved 1: no partial fulfillment.
        assert_eq!(evaluate(true, product, 2, Some(&rx)), GateResolution::Rejected);
    }

    #[test]
    fn approval_for_a_different_product_does_not_clear_the_line() {
        let ordered = test_product_id();
        let other = test_product_id();
        let rx = rx_with(Some(ReviewDecision::Approve {
            quantities: BTreeMap::from([(other, 5)]),
            notes: None,
        }));

        assert_eq!(evaluate(true, ordered, 1, Some(&rx)), GateResolution::Rejected);
    }

    #[test]
    fn rejected_prescription_rejects_the_line() {
        let rx = rx_with(Some(ReviewDecision::Reject { notes: None }));
        assert_eq!(
            evaluate(true, test_product_id(), 1, Some(&rx)),
            GateResolution::Rejected
        );
    }
}
