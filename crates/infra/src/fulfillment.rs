//! The fulfillment workflow: the only writer of order state.
//!
//! Composes the catalog, inventory ledger, prescription gate, payment
//! verifier, and status broadcaster behind one service. Every transition on a
//! given order runs under that order's mutex: concurrent attempts (a
//! duplicate callback racing a cancellation) serialize, observe the
//! post-transition state, and re-evaluate, usually collapsing into a
//! conflict or a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use medipaw_catalog::{Catalog, ProductId};
use medipaw_core::{Aggregate, AggregateId, DomainError, DomainResult, UserId};
use medipaw_events::{execute, Event, StatusSink, StatusUpdate};
use medipaw_inventory::InventoryLedger;
use medipaw_orders::{
    ApplyGating, BeginPayment, CancelActor, CancelOrder, CompleteFulfillment, ConfirmPayment,
    CreateOrder, FailPayment, FulfillmentStatus, MarkOutOfStock, Order, OrderCommand, OrderEvent,
    OrderId, OrderLine,
};
use medipaw_payments::{CallbackPayload, PaymentGateway, PaymentIntent, Verification};
use medipaw_prescriptions::{
    evaluate, GateResolution, Prescription, PrescriptionDirectory, PrescriptionId, ReviewDecision,
};

use crate::order_store::OrderStore;
use crate::retry::{with_retry, RetryPolicy};

/// One cart line as submitted at checkout; prices are looked up server-side.
#[derive(Debug, Clone)]
pub struct OrderLineRequest {
    pub product_id: ProductId,
    pub quantity: u32,
    pub prescription_ref: Option<PrescriptionId>,
}

/// Counters reported by one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub reservations_released: usize,
    pub intents_expired: usize,
}

pub struct FulfillmentService<S> {
    store: S,
    catalog: Arc<Catalog>,
    ledger: Arc<InventoryLedger>,
    gateway: Arc<PaymentGateway>,
    prescriptions: Arc<PrescriptionDirectory>,
    sink: Arc<dyn StatusSink>,
    locks: Mutex<HashMap<OrderId, Arc<Mutex<()>>>>,
    retry: RetryPolicy,
    currency: String,
}

impl<S: OrderStore> FulfillmentService<S> {
    pub fn new(
        store: S,
        catalog: Arc<Catalog>,
        ledger: Arc<InventoryLedger>,
        gateway: Arc<PaymentGateway>,
        prescriptions: Arc<PrescriptionDirectory>,
        sink: Arc<dyn StatusSink>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            catalog,
            ledger,
            gateway,
            prescriptions,
            sink,
            locks: Mutex::new(HashMap::new()),
            retry: RetryPolicy::default(),
            currency: currency.into(),
        }
    }

    /// Checkout: snapshot prices and prescription flags out of the catalog
    /// and persist a draft order.
    pub fn create_order(
        &self,
        user_id: UserId,
        requests: Vec<OrderLineRequest>,
    ) -> DomainResult<Order> {
        if requests.is_empty() {
            return Err(DomainError::validation("order must have at least one line"));
        }

        let mut lines = Vec::with_capacity(requests.len());
        for request in requests {
            let product = self.catalog.get(request.product_id).ok_or_else(|| {
                DomainError::validation(format!("unknown product {}", request.product_id))
            })?;
            lines.push(OrderLine {
                product_id: product.id,
                quantity: request.quantity,
                unit_price: product.price,
                requires_prescription: product.requires_prescription,
                prescription_ref: request.prescription_ref,
            });
        }

        let order_id = OrderId::new(AggregateId::new());
        let mut order = Order::empty(order_id);
        let events = execute(
            &mut order,
            &OrderCommand::CreateOrder(CreateOrder {
                order_id,
                user_id,
                lines,
                occurred_at: Utc::now(),
            }),
        )?;

        with_retry(&self.retry, || {
            self.store.insert(&order).map_err(DomainError::from)
        })?;
        self.publish(&order, &events);

        info!(%order_id, total = order.total(), "order created");
        Ok(order)
    }

    /// `Draft → AwaitingPayment` plus a gateway intent for the order total.
    ///
    /// The amount is the total snapshotted at creation; it is never
    /// recomputed here.
    pub fn create_intent(&self, order_id: OrderId) -> DomainResult<PaymentIntent> {
        let lock = self.order_lock(order_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut order = self.load_order(order_id)?;
        let events = execute(
            &mut order,
            &OrderCommand::BeginPayment(BeginPayment {
                order_id,
                occurred_at: Utc::now(),
            }),
        )?;

        let intent = self
            .gateway
            .create_intent(order_id, order.total(), self.currency.clone(), Utc::now());

        self.persist(&order)?;
        self.publish(&order, &events);

        info!(%order_id, gateway_order_id = %intent.gateway_order_id, "payment intent created");
        Ok(intent)
    }

    /// Verify a gateway callback and drive the order through
    /// `AwaitingPayment → Paid → {UnderReview | Fulfilling | OutOfStock}`.
    pub fn handle_callback(&self, callback: &CallbackPayload) -> DomainResult<Order> {
        let verification = match self.gateway.verify_callback(callback, Utc::now()) {
            Ok(v) => v,
            Err(err) => {
                // Full context stays server-side; the client response is generic.
                warn!(
                    gateway_order_id = %callback.gateway_order_id,
                    gateway_payment_id = %callback.gateway_payment_id,
                    %err,
                    "payment callback rejected"
                );
                return Err(err.into());
            }
        };

        let (order_id, gateway_payment_id) = match verification {
            Verification::Replayed { order_id } => {
                // Duplicate webhook: acknowledge idempotently with current state.
                debug!(%order_id, "replayed payment callback acknowledged");
                return self.load_order(order_id);
            }
            Verification::Authorized {
                order_id,
                gateway_payment_id,
                ..
            } => (order_id, gateway_payment_id),
        };

        let lock = self.order_lock(order_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut order = self.load_order(order_id)?;
        let events = execute(
            &mut order,
            &OrderCommand::ConfirmPayment(ConfirmPayment {
                order_id,
                gateway_payment_id,
                occurred_at: Utc::now(),
            }),
        )?;
        self.persist(&order)?;
        self.publish(&order, &events);

        // Entry into Paid: hold stock for every line, all-or-nothing.
        let line_quantities: Vec<(ProductId, u32)> = order
            .lines()
            .iter()
            .map(|l| (l.product_id, l.quantity))
            .collect();

        match self
            .ledger
            .reserve_all(order_id.0, &line_quantities, Utc::now())
        {
            Ok(reservations) => {
                debug!(%order_id, count = reservations.len(), "stock reserved");
            }
            Err(err) if err.is_insufficient_stock() => {
                info!(%order_id, %err, "stock exhausted after payment");
                let events = execute(
                    &mut order,
                    &OrderCommand::MarkOutOfStock(MarkOutOfStock {
                        order_id,
                        occurred_at: Utc::now(),
                    }),
                )?;
                self.persist(&order)?;
                self.publish(&order, &events);
                return Ok(order);
            }
            Err(err) => return Err(DomainError::invariant(err.to_string())),
        }

        self.apply_gating_locked(&mut order)?;
        Ok(order)
    }

    /// Record an admin review decision, then re-evaluate every order the
    /// prescription was holding under review. Gate re-evaluation happens only
    /// here, never by polling.
    pub fn on_prescription_decision(
        &self,
        prescription_id: PrescriptionId,
        decision: ReviewDecision,
    ) -> DomainResult<Prescription> {
        let prescription = self
            .prescriptions
            .decide(prescription_id, decision, Utc::now())?;

        let under_review = with_retry(&self.retry, || {
            self.store
                .list_by_status(FulfillmentStatus::UnderReview)
                .map_err(DomainError::from)
        })?;

        for stale in under_review {
            let order_id = stale.id_typed();
            let refers_to_prescription = stale
                .lines()
                .iter()
                .any(|l| l.prescription_ref == Some(prescription_id));
            if !refers_to_prescription {
                continue;
            }

            let lock = self.order_lock(order_id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

            // Re-read under the lock; the snapshot above may have lost a race.
            let mut order = self.load_order(order_id)?;
            if order.fulfillment_status() != FulfillmentStatus::UnderReview {
                continue;
            }

            self.apply_gating_locked(&mut order)?;
        }

        Ok(prescription)
    }

    /// Cancel an order. Customers are honored only strictly before `Paid`;
    /// an admin cancel afterwards is the compensating release-and-refund.
    pub fn cancel_order(&self, order_id: OrderId, actor: CancelActor) -> DomainResult<Order> {
        let lock = self.order_lock(order_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut order = self.load_order(order_id)?;
        let events = execute(
            &mut order,
            &OrderCommand::CancelOrder(CancelOrder {
                order_id,
                cancelled_by: actor,
                occurred_at: Utc::now(),
            }),
        )?;

        if order.refund_due() {
            let released = self.ledger.release_for_order(order_id.0);
            info!(%order_id, released, "cancelled paid order; stock released and refund flagged");
        }

        self.persist(&order)?;
        self.publish(&order, &events);
        Ok(order)
    }

    /// `Fulfilling → Completed`: convert every hold into a permanent
    /// decrement, then close the order.
    pub fn complete_fulfillment(&self, order_id: OrderId) -> DomainResult<Order> {
        let lock = self.order_lock(order_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut order = self.load_order(order_id)?;
        let cmd = OrderCommand::CompleteFulfillment(CompleteFulfillment {
            order_id,
            occurred_at: Utc::now(),
        });
        // Decide first so an ineligible order fails before stock moves.
        let events = order.handle(&cmd)?;

        // Holds lapse if fulfillment starts long after payment (the sweep
        // returned them to the pool). Take the stock again rather than
        // shipping units the ledger may have re-sold in the meantime.
        if self.ledger.outstanding_for_order(order_id.0) == 0
            && self.ledger.committed_for_order(order_id.0) == 0
        {
            let line_quantities: Vec<(ProductId, u32)> = order
                .lines()
                .iter()
                .map(|l| (l.product_id, l.quantity))
                .collect();
            self.ledger
                .reserve_all(order_id.0, &line_quantities, Utc::now())
                .map_err(|err| {
                    if err.is_insufficient_stock() {
                        DomainError::conflict(
                            "reservations expired and the stock is no longer available",
                        )
                    } else {
                        DomainError::invariant(err.to_string())
                    }
                })?;
            warn!(%order_id, "reservations had expired; stock re-taken at completion");
        }

        self.ledger
            .commit_for_order(order_id.0)
            .map_err(|e| DomainError::invariant(e.to_string()))?;

        for event in &events {
            order.apply(event);
        }
        self.persist(&order)?;
        self.publish(&order, &events);

        info!(%order_id, "order completed");
        Ok(order)
    }

    pub fn get_order(&self, order_id: OrderId) -> DomainResult<Order> {
        self.load_order(order_id)
    }

    /// Timeout housekeeping: overdue reservations go back to stock, and
    /// orders whose payment intent lapsed move to `PaymentFailed`.
    pub fn expire_stale(&self) -> SweepStats {
        let now = Utc::now();
        let mut stats = SweepStats {
            reservations_released: self.ledger.release_expired(now).len(),
            intents_expired: 0,
        };

        for order_id in self.gateway.expire_stale(now) {
            let lock = self.order_lock(order_id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

            let mut order = match self.load_order(order_id) {
                Ok(order) => order,
                Err(err) => {
                    warn!(%order_id, %err, "sweep could not load order");
                    continue;
                }
            };

            let result = execute(
                &mut order,
                &OrderCommand::FailPayment(FailPayment {
                    order_id,
                    occurred_at: now,
                }),
            );
            match result {
                Ok(events) => {
                    self.ledger.release_for_order(order_id.0);
                    if self.persist(&order).is_ok() {
                        self.publish(&order, &events);
                        stats.intents_expired += 1;
                    }
                }
                // The order moved on (paid or cancelled) before the sweep ran.
                Err(DomainError::Conflict(_)) => {
                    debug!(%order_id, "intent expired but order already moved on");
                }
                Err(err) => warn!(%order_id, %err, "sweep transition failed"),
            }
        }

        stats
    }

    /// Gate every line and apply the resulting transition. Caller must hold
    /// the order lock; the order must be `Paid` or `UnderReview`.
    fn apply_gating_locked(&self, order: &mut Order) -> DomainResult<()> {
        let order_id = order.id_typed();
        let resolutions: Vec<GateResolution> = order
            .lines()
            .iter()
            .map(|line| {
                let prescription = line
                    .prescription_ref
                    .and_then(|id| self.prescriptions.get(id));
                evaluate(
                    line.requires_prescription,
                    line.product_id,
                    line.quantity,
                    prescription.as_ref(),
                )
            })
            .collect();

        let events = execute(
            order,
            &OrderCommand::ApplyGating(ApplyGating {
                order_id,
                resolutions,
                occurred_at: Utc::now(),
            }),
        )?;

        if events.is_empty() {
            // Still waiting on review; nothing changed, nothing to persist.
            return Ok(());
        }

        if matches!(
            order.fulfillment_status(),
            FulfillmentStatus::PrescriptionRejected
        ) {
            let released = self.ledger.release_for_order(order_id.0);
            info!(%order_id, released, "prescription rejected; stock released and refund flagged");
        }

        self.persist(order)?;
        self.publish(order, &events);
        Ok(())
    }

    fn order_lock(&self, order_id: OrderId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(order_id).or_default().clone()
    }

    fn load_order(&self, order_id: OrderId) -> DomainResult<Order> {
        with_retry(&self.retry, || {
            self.store.load(order_id).map_err(DomainError::from)
        })
    }

    fn persist(&self, order: &Order) -> DomainResult<()> {
        with_retry(&self.retry, || {
            self.store.update(order).map_err(DomainError::from)
        })
    }

    /// Fire-and-forget fan-out; never blocks or fails the transition.
    fn publish(&self, order: &Order, events: &[OrderEvent]) {
        for event in events {
            self.sink.publish(StatusUpdate {
                order_id: order.id_typed().0,
                event_type: event.event_type().to_string(),
                payload: json!({
                    "fulfillment_status": order.fulfillment_status(),
                    "payment_status": order.payment_status(),
                    "refund_due": order.refund_due(),
                    "total": order.total(),
                }),
                occurred_at: event.occurred_at(),
            });
        }
    }
}
