use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use medipaw_catalog::ProductId;
use medipaw_core::{Aggregate, AggregateId, AggregateRoot, DomainError, UserId};
use medipaw_events::Event;
use medipaw_prescriptions::{GateResolution, PrescriptionId};

/// Order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub AggregateId);

impl OrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Whether money has moved for this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Refunded,
}

/// Order fulfillment lifecycle.
///
/// `Draft → AwaitingPayment → Paid → UnderReview → Fulfilling → Completed`,
/// with terminal off-ramps for failed payment, rejected prescriptions,
/// cancellation, and exhausted stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Draft,
    AwaitingPayment,
    Paid,
    UnderReview,
    Fulfilling,
    Completed,
    PaymentFailed,
    PrescriptionRejected,
    Cancelled,
    OutOfStock,
}

impl FulfillmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::PaymentFailed
                | Self::PrescriptionRejected
                | Self::Cancelled
                | Self::OutOfStock
        )
    }

    /// A customer may cancel only strictly before payment.
    pub fn allows_customer_cancel(&self) -> bool {
        matches!(self, Self::Draft | Self::AwaitingPayment)
    }
}

/// One line of an order.
///
/// `unit_price` and `requires_prescription` are snapshotted from the catalog
/// at order time; later product edits never alter a placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
    /// Price in smallest currency unit (e.g., cents), captured at order time.
    pub unit_price: u64,
    pub requires_prescription: bool,
    /// The prescription that authorizes this line once approved.
    pub prescription_ref: Option<PrescriptionId>,
}

impl OrderLine {
    pub fn subtotal(&self) -> u64 {
        self.unit_price.saturating_mul(u64::from(self.quantity))
    }
}

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelActor {
    Customer,
    /// Administrative override; past `Paid` this is a compensating
    /// release-and-refund, not a true cancel.
    Admin,
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    user_id: UserId,
    lines: Vec<OrderLine>,
    /// Sum of line subtotals at creation time; never recomputed afterwards.
    total: u64,
    payment_status: PaymentStatus,
    fulfillment_status: FulfillmentStatus,
    /// Money moved but the order cannot ship; an external refund workflow
    /// picks these up.
    refund_due: bool,
    gateway_payment_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
    created: bool,
}

impl Order {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            user_id: UserId::from_uuid(uuid::Uuid::nil()),
            lines: Vec::new(),
            total: 0,
            payment_status: PaymentStatus::Unpaid,
            fulfillment_status: FulfillmentStatus::Draft,
            refund_due: false,
            gateway_payment_id: None,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.payment_status
    }

    pub fn fulfillment_status(&self) -> FulfillmentStatus {
        self.fulfillment_status
    }

    pub fn refund_due(&self) -> bool {
        self.refund_due
    }

    pub fn gateway_payment_id(&self) -> Option<&str> {
        self.gateway_payment_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Lines that are prescription-gated.
    pub fn gated_lines(&self) -> impl Iterator<Item = &OrderLine> {
        self.lines.iter().filter(|l| l.requires_prescription)
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateOrder (cart checkout; lines already price-snapshotted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOrder {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub lines: Vec<OrderLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: BeginPayment (a payment intent is being created).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginPayment {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmPayment (the verifier authorized a callback).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmPayment {
    pub order_id: OrderId,
    pub gateway_payment_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkOutOfStock (reservation failed after payment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkOutOfStock {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApplyGating (gate resolutions for every line, in line order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyGating {
    pub order_id: OrderId,
    pub resolutions: Vec<GateResolution>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FailPayment (the payment intent expired unredeemed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailPayment {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteFulfillment (all reservations committed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteFulfillment {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub cancelled_by: CancelActor,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderCommand {
    CreateOrder(CreateOrder),
    BeginPayment(BeginPayment),
    ConfirmPayment(ConfirmPayment),
    MarkOutOfStock(MarkOutOfStock),
    ApplyGating(ApplyGating),
    FailPayment(FailPayment),
    CompleteFulfillment(CompleteFulfillment),
    CancelOrder(CancelOrder),
}

/// Events emitted by the order state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderCreated {
        order_id: OrderId,
        user_id: UserId,
        lines: Vec<OrderLine>,
        total: u64,
        occurred_at: DateTime<Utc>,
    },
    PaymentRequested {
        order_id: OrderId,
        occurred_at: DateTime<Utc>,
    },
    PaymentConfirmed {
        order_id: OrderId,
        gateway_payment_id: String,
        occurred_at: DateTime<Utc>,
    },
    StockExhausted {
        order_id: OrderId,
        occurred_at: DateTime<Utc>,
    },
    OrderGated {
        order_id: OrderId,
        occurred_at: DateTime<Utc>,
    },
    FulfillmentReleased {
        order_id: OrderId,
        occurred_at: DateTime<Utc>,
    },
    PrescriptionDeclined {
        order_id: OrderId,
        occurred_at: DateTime<Utc>,
    },
    PaymentExpired {
        order_id: OrderId,
        occurred_at: DateTime<Utc>,
    },
    OrderCompleted {
        order_id: OrderId,
        occurred_at: DateTime<Utc>,
    },
    OrderCancelled {
        order_id: OrderId,
        cancelled_by: CancelActor,
        refund_due: bool,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated { .. } => "order.created",
            OrderEvent::PaymentRequested { .. } => "order.payment_requested",
            OrderEvent::PaymentConfirmed { .. } => "order.payment_confirmed",
            OrderEvent::StockExhausted { .. } => "order.out_of_stock",
            OrderEvent::OrderGated { .. } => "order.under_review",
            OrderEvent::FulfillmentReleased { .. } => "order.fulfilling",
            OrderEvent::PrescriptionDeclined { .. } => "order.prescription_rejected",
            OrderEvent::PaymentExpired { .. } => "order.payment_failed",
            OrderEvent::OrderCompleted { .. } => "order.completed",
            OrderEvent::OrderCancelled { .. } => "order.cancelled",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderCreated { occurred_at, .. }
            | OrderEvent::PaymentRequested { occurred_at, .. }
            | OrderEvent::PaymentConfirmed { occurred_at, .. }
            | OrderEvent::StockExhausted { occurred_at, .. }
            | OrderEvent::OrderGated { occurred_at, .. }
            | OrderEvent::FulfillmentReleased { occurred_at, .. }
            | OrderEvent::PrescriptionDeclined { occurred_at, .. }
            | OrderEvent::PaymentExpired { occurred_at, .. }
            | OrderEvent::OrderCompleted { occurred_at, .. }
            | OrderEvent::OrderCancelled { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderCreated {
                order_id,
                user_id,
                lines,
                total,
                occurred_at,
            } => {
                self.id = *order_id;
                self.user_id = *user_id;
                self.lines = lines.clone();
                self.total = *total;
                self.payment_status = PaymentStatus::Unpaid;
                self.fulfillment_status = FulfillmentStatus::Draft;
                self.created_at = *occurred_at;
                self.created = true;
            }
            OrderEvent::PaymentRequested { .. } => {
                self.fulfillment_status = FulfillmentStatus::AwaitingPayment;
            }
            OrderEvent::PaymentConfirmed {
                gateway_payment_id, ..
            } => {
                self.payment_status = PaymentStatus::Paid;
                self.fulfillment_status = FulfillmentStatus::Paid;
                self.gateway_payment_id = Some(gateway_payment_id.clone());
            }
            OrderEvent::StockExhausted { .. } => {
                self.fulfillment_status = FulfillmentStatus::OutOfStock;
                self.refund_due = true;
            }
            OrderEvent::OrderGated { .. } => {
                self.fulfillment_status = FulfillmentStatus::UnderReview;
            }
            OrderEvent::FulfillmentReleased { .. } => {
                self.fulfillment_status = FulfillmentStatus::Fulfilling;
            }
            OrderEvent::PrescriptionDeclined { .. } => {
                self.fulfillment_status = FulfillmentStatus::PrescriptionRejected;
                self.refund_due = true;
            }
            OrderEvent::PaymentExpired { .. } => {
                self.fulfillment_status = FulfillmentStatus::PaymentFailed;
            }
            OrderEvent::OrderCompleted { .. } => {
                self.fulfillment_status = FulfillmentStatus::Completed;
            }
            OrderEvent::OrderCancelled { refund_due, .. } => {
                self.fulfillment_status = FulfillmentStatus::Cancelled;
                self.refund_due = *refund_due;
            }
        }

        self.updated_at = event.occurred_at();
        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::CreateOrder(cmd) => self.handle_create(cmd),
            OrderCommand::BeginPayment(cmd) => self.handle_begin_payment(cmd),
            OrderCommand::ConfirmPayment(cmd) => self.handle_confirm_payment(cmd),
            OrderCommand::MarkOutOfStock(cmd) => self.handle_mark_out_of_stock(cmd),
            OrderCommand::ApplyGating(cmd) => self.handle_apply_gating(cmd),
            OrderCommand::FailPayment(cmd) => self.handle_fail_payment(cmd),
            OrderCommand::CompleteFulfillment(cmd) => self.handle_complete(cmd),
            OrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Order {
    fn ensure_created(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        Ok(())
    }

    fn ensure_order_id(&self, order_id: OrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("order already exists"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("order must have at least one line"));
        }

        let mut total: u64 = 0;
        for line in &cmd.lines {
            if line.quantity == 0 {
                return Err(DomainError::validation("quantity must be at least 1"));
            }
            if line.unit_price == 0 {
                return Err(DomainError::validation("unit_price must be positive"));
            }
            // A gated line without a prescription_ref is fine here; the gate
            // resolves it AwaitingUpload after payment.
            total = total
                .checked_add(line.subtotal())
                .ok_or_else(|| DomainError::validation("order total overflows"))?;
        }

        Ok(vec![OrderEvent::OrderCreated {
            order_id: cmd.order_id,
            user_id: cmd.user_id,
            lines: cmd.lines.clone(),
            total,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_begin_payment(&self, cmd: &BeginPayment) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        if self.fulfillment_status != FulfillmentStatus::Draft {
            return Err(DomainError::conflict(
                "payment can only be requested for a draft order",
            ));
        }

        Ok(vec![OrderEvent::PaymentRequested {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_confirm_payment(
        &self,
        cmd: &ConfirmPayment,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        if self.fulfillment_status != FulfillmentStatus::AwaitingPayment {
            return Err(DomainError::conflict("order is not awaiting payment"));
        }

        Ok(vec![OrderEvent::PaymentConfirmed {
            order_id: cmd.order_id,
            gateway_payment_id: cmd.gateway_payment_id.clone(),
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_mark_out_of_stock(
        &self,
        cmd: &MarkOutOfStock,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        // Reservation happens on entry to Paid; the off-ramp exists only there.
        if self.fulfillment_status != FulfillmentStatus::Paid {
            return Err(DomainError::conflict(
                "only a freshly paid order can run out of stock",
            ));
        }

        Ok(vec![OrderEvent::StockExhausted {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        }])
    }

    /// The single decision table for the four gating transitions:
    /// `Paid → UnderReview | Fulfilling` and
    /// `UnderReview → Fulfilling | PrescriptionRejected`.
    fn handle_apply_gating(&self, cmd: &ApplyGating) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        // Stock state wins: once OutOfStock (or any other terminal state), a
        // late prescription decision is recorded on the prescription but has
        // no effect on the order.
        match self.fulfillment_status {
            FulfillmentStatus::Paid | FulfillmentStatus::UnderReview => {}
            _ => {
                return Err(DomainError::conflict(
                    "gating applies only to paid or under-review orders",
                ));
            }
        }

        if cmd.resolutions.len() != self.lines.len() {
            return Err(DomainError::validation(
                "one gate resolution per order line is required",
            ));
        }

        if cmd.resolutions.iter().any(GateResolution::is_rejected) {
            return Ok(vec![OrderEvent::PrescriptionDeclined {
                order_id: cmd.order_id,
                occurred_at: cmd.occurred_at,
            }]);
        }

        if cmd.resolutions.iter().any(GateResolution::is_pending) {
            // Already under review: the decision event changed nothing yet.
            if self.fulfillment_status == FulfillmentStatus::UnderReview {
                return Ok(vec![]);
            }
            return Ok(vec![OrderEvent::OrderGated {
                order_id: cmd.order_id,
                occurred_at: cmd.occurred_at,
            }]);
        }

        Ok(vec![OrderEvent::FulfillmentReleased {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_fail_payment(&self, cmd: &FailPayment) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        if self.fulfillment_status != FulfillmentStatus::AwaitingPayment {
            return Err(DomainError::conflict("order is not awaiting payment"));
        }

        Ok(vec![OrderEvent::PaymentExpired {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_complete(&self, cmd: &CompleteFulfillment) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        if self.fulfillment_status != FulfillmentStatus::Fulfilling {
            return Err(DomainError::conflict(
                "only a fulfilling order can be completed",
            ));
        }

        Ok(vec![OrderEvent::OrderCompleted {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        if self.fulfillment_status.is_terminal() {
            return Err(DomainError::conflict("order is already settled"));
        }

        let refund_due = match cmd.cancelled_by {
            CancelActor::Customer => {
                if !self.fulfillment_status.allows_customer_cancel() {
                    return Err(DomainError::conflict(
                        "order is already paid; cancellation requires an administrative refund",
                    ));
                }
                false
            }
            // Past Paid this is a compensating transition: money and stock
            // have already moved, so the release/refund is triggered by the
            // fulfillment service alongside this event.
            CancelActor::Admin => self.payment_status == PaymentStatus::Paid,
        };

        Ok(vec![OrderEvent::OrderCancelled {
            order_id: cmd.order_id,
            cancelled_by: cmd.cancelled_by,
            refund_due,
            occurred_at: cmd.occurred_at,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medipaw_events::execute;

    fn test_order_id() -> OrderId {
        OrderId::new(AggregateId::new())
    }

    fn test_product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn line(quantity: u32, unit_price: u64, gated: bool) -> OrderLine {
        OrderLine {
            product_id: test_product_id(),
            quantity,
            unit_price,
            requires_prescription: gated,
            prescription_ref: None,
        }
    }

    fn created_order(lines: Vec<OrderLine>) -> Order {
        let order_id = test_order_id();
        let mut order = Order::empty(order_id);
        execute(
            &mut order,
            &OrderCommand::CreateOrder(CreateOrder {
                order_id,
                user_id: UserId::new(),
                lines,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        order
    }

    fn paid_order(lines: Vec<OrderLine>) -> Order {
        let mut order = created_order(lines);
        let order_id = order.id_typed();
        execute(
            &mut order,
            &OrderCommand::BeginPayment(BeginPayment {
                order_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        execute(
            &mut order,
            &OrderCommand::ConfirmPayment(ConfirmPayment {
                order_id,
                gateway_payment_id: "pay_123".to_string(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        order
    }

    #[test]
    fn create_computes_total_from_line_subtotals() {
        let order = created_order(vec![line(2, 500, false), line(1, 250, false)]);
        assert_eq!(order.total(), 1250);
        assert_eq!(order.fulfillment_status(), FulfillmentStatus::Draft);
        assert_eq!(order.payment_status(), PaymentStatus::Unpaid);
    }

    #[test]
    fn create_rejects_bad_lines_before_any_mutation() {
        let order_id = test_order_id();
        let order = Order::empty(order_id);

        for bad in [vec![], vec![line(0, 500, false)], vec![line(1, 0, false)]] {
            let err = order
                .handle(&OrderCommand::CreateOrder(CreateOrder {
                    order_id,
                    user_id: UserId::new(),
                    lines: bad,
                    occurred_at: test_time(),
                }))
                .unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)));
        }
    }

    #[test]
    fn happy_path_without_gated_lines() {
        let mut order = paid_order(vec![line(1, 999, false)]);
        let order_id = order.id_typed();

        let events = execute(
            &mut order,
            &OrderCommand::ApplyGating(ApplyGating {
                order_id,
                resolutions: vec![GateResolution::NotRequired],
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert!(matches!(events[0], OrderEvent::FulfillmentReleased { .. }));
        assert_eq!(order.fulfillment_status(), FulfillmentStatus::Fulfilling);

        execute(
            &mut order,
            &OrderCommand::CompleteFulfillment(CompleteFulfillment {
                order_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.fulfillment_status(), FulfillmentStatus::Completed);
        assert_eq!(order.payment_status(), PaymentStatus::Paid);
    }

    #[test]
    fn pending_gate_parks_the_order_under_review() {
        let mut order = paid_order(vec![line(1, 999, true)]);
        let order_id = order.id_typed();

        execute(
            &mut order,
            &OrderCommand::ApplyGating(ApplyGating {
                order_id,
                resolutions: vec![GateResolution::AwaitingApproval],
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.fulfillment_status(), FulfillmentStatus::UnderReview);

        // A decision event that leaves the line pending changes nothing.
        let events = execute(
            &mut order,
            &OrderCommand::ApplyGating(ApplyGating {
                order_id,
                resolutions: vec![GateResolution::AwaitingApproval],
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert!(events.is_empty());
        assert_eq!(order.fulfillment_status(), FulfillmentStatus::UnderReview);

        // Approval for the full quantity releases fulfillment.
        execute(
            &mut order,
            &OrderCommand::ApplyGating(ApplyGating {
                order_id,
                resolutions: vec![GateResolution::Approved(1)],
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.fulfillment_status(), FulfillmentStatus::Fulfilling);
    }

    #[test]
    fn any_rejected_line_dooms_the_order() {
        let mut order = paid_order(vec![line(1, 100, false), line(2, 400, true)]);
        let order_id = order.id_typed();

        execute(
            &mut order,
            &OrderCommand::ApplyGating(ApplyGating {
                order_id,
                resolutions: vec![GateResolution::NotRequired, GateResolution::Rejected],
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(
            order.fulfillment_status(),
            FulfillmentStatus::PrescriptionRejected
        );
        assert!(order.refund_due());

        // Terminal: no later gating can resurrect the order.
        let err = order
            .handle(&OrderCommand::ApplyGating(ApplyGating {
                order_id,
                resolutions: vec![
                    GateResolution::NotRequired,
                    GateResolution::Approved(2),
                ],
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn stock_state_wins_over_late_prescription_decisions() {
        let mut order = paid_order(vec![line(1, 100, true)]);
        let order_id = order.id_typed();

        execute(
            &mut order,
            &OrderCommand::MarkOutOfStock(MarkOutOfStock {
                order_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.fulfillment_status(), FulfillmentStatus::OutOfStock);
        assert!(order.refund_due());

        // A late approval cannot move the order back into Fulfilling.
        let err = order
            .handle(&OrderCommand::ApplyGating(ApplyGating {
                order_id,
                resolutions: vec![GateResolution::Approved(1)],
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn duplicate_payment_confirmation_is_a_conflict() {
        let order = paid_order(vec![line(1, 100, false)]);

        let err = order
            .handle(&OrderCommand::ConfirmPayment(ConfirmPayment {
                order_id: order.id_typed(),
                gateway_payment_id: "pay_456".to_string(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        // The first confirmation's payment id is untouched.
        assert_eq!(order.gateway_payment_id(), Some("pay_123"));
    }

    #[test]
    fn customer_cancel_is_only_honored_before_payment() {
        let mut draft = created_order(vec![line(1, 100, false)]);
        let draft_id = draft.id_typed();
        execute(
            &mut draft,
            &OrderCommand::CancelOrder(CancelOrder {
                order_id: draft_id,
                cancelled_by: CancelActor::Customer,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(draft.fulfillment_status(), FulfillmentStatus::Cancelled);
        assert!(!draft.refund_due());

        let paid = paid_order(vec![line(1, 100, false)]);
        let err = paid
            .handle(&OrderCommand::CancelOrder(CancelOrder {
                order_id: paid.id_typed(),
                cancelled_by: CancelActor::Customer,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn admin_cancel_after_payment_flags_a_refund() {
        let mut order = paid_order(vec![line(1, 100, false)]);
        let order_id = order.id_typed();

        execute(
            &mut order,
            &OrderCommand::CancelOrder(CancelOrder {
                order_id,
                cancelled_by: CancelActor::Admin,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.fulfillment_status(), FulfillmentStatus::Cancelled);
        assert!(order.refund_due());
    }

    #[test]
    fn payment_expiry_only_applies_while_awaiting_payment() {
        let mut order = created_order(vec![line(1, 100, false)]);
        let order_id = order.id_typed();
        execute(
            &mut order,
            &OrderCommand::BeginPayment(BeginPayment {
                order_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        execute(
            &mut order,
            &OrderCommand::FailPayment(FailPayment {
                order_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.fulfillment_status(), FulfillmentStatus::PaymentFailed);

        // Expiring a paid order is a lost race, not a transition.
        let paid = paid_order(vec![line(1, 100, false)]);
        let err = paid
            .handle(&OrderCommand::FailPayment(FailPayment {
                order_id: paid.id_typed(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let order = paid_order(vec![line(1, 100, false)]);
        let status_before = order.fulfillment_status();
        let version_before = order.version();

        let cmd = OrderCommand::ApplyGating(ApplyGating {
            order_id: order.id_typed(),
            resolutions: vec![GateResolution::NotRequired],
            occurred_at: test_time(),
        });

        let events1 = order.handle(&cmd).unwrap();
        let events2 = order.handle(&cmd).unwrap();

        assert_eq!(order.fulfillment_status(), status_before);
        assert_eq!(order.version(), version_before);
        assert_eq!(events1, events2);
    }

    #[test]
    fn version_increments_once_per_applied_event() {
        let order = paid_order(vec![line(1, 100, false)]);
        // OrderCreated + PaymentRequested + PaymentConfirmed
        assert_eq!(order.version(), 3);
    }
}
