use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tower::ServiceBuilder;

use medipaw_catalog::{Catalog, Product, ProductId, ProductKind};
use medipaw_core::{AggregateId, DomainError, UserId};
use medipaw_events::OrderTopics;
use medipaw_infra::{FulfillmentService, InMemoryOrderStore, OrderLineRequest};
use medipaw_inventory::InventoryLedger;
use medipaw_orders::{CancelActor, OrderId};
use medipaw_payments::{CallbackPayload, PaymentGateway};
use medipaw_prescriptions::{PrescriptionDirectory, PrescriptionId, ReviewDecision};

/// Process configuration, read from the environment by `main`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gateway_secret: String,
    pub currency: String,
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FulfillmentService<InMemoryOrderStore>>,
    pub catalog: Arc<Catalog>,
    pub ledger: Arc<InventoryLedger>,
    pub prescriptions: Arc<PrescriptionDirectory>,
    pub topics: Arc<OrderTopics>,
}

/// Wire the components and build the router.
///
/// Every handle is constructed here and passed in explicitly; the returned
/// state is what `main` hands to the expiry sweeper.
pub fn build_app(config: AppConfig) -> (Router, AppState) {
    let catalog = Arc::new(Catalog::new());
    let ledger = Arc::new(InventoryLedger::with_default_ttl());
    let gateway = Arc::new(PaymentGateway::with_default_ttl(config.gateway_secret));
    let prescriptions = Arc::new(PrescriptionDirectory::new());
    let topics = Arc::new(OrderTopics::default());

    let service = Arc::new(FulfillmentService::new(
        InMemoryOrderStore::new(),
        Arc::clone(&catalog),
        Arc::clone(&ledger),
        Arc::clone(&gateway),
        Arc::clone(&prescriptions),
        topics.clone(),
        config.currency,
    ));

    let state = AppState {
        service,
        catalog,
        ledger,
        prescriptions,
        topics,
    };

    let router = Router::new()
        .route("/products", post(create_product).get(list_products))
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/intent", post(create_intent))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/fulfill", post(fulfill_order))
        .route("/orders/:id/events", get(order_events))
        .route("/payments/callback", post(payment_callback))
        .route("/prescriptions", post(upload_prescription))
        .route("/prescriptions/:id/decision", post(decide_prescription))
        .layer(ServiceBuilder::new().layer(Extension(state.clone())));

    (router, state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Request DTOs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateProductRequest {
    pub name: String,
    pub price: u64,
    pub stock: u32,
    #[serde(default)]
    pub requires_prescription: bool,
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderLineRequest {
    pub product_id: String,
    pub quantity: u32,
    pub prescription_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: String,
    pub lines: Vec<CreateOrderLineRequest>,
}

#[derive(Debug, Deserialize)]
pub struct CancelOrderRequest {
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadPrescriptionRequest {
    pub user_id: String,
    pub document_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub verdict: String,
    #[serde(default)]
    pub quantities: BTreeMap<String, u32>,
    pub notes: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────────────────────────

fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        // Details were already logged server-side; answer generically.
        DomainError::Security(_) => json_error(
            StatusCode::BAD_REQUEST,
            "verification_failed",
            "payment verification failed",
        ),
        DomainError::Transient(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg)
        }
    }
}

fn parse_order_id(raw: &str) -> Result<OrderId, axum::response::Response> {
    raw.parse::<AggregateId>()
        .map(OrderId::new)
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid order id"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

pub async fn create_product(
    Extension(state): Extension<AppState>,
    Json(body): Json<CreateProductRequest>,
) -> axum::response::Response {
    let kind = match body.kind.to_lowercase().as_str() {
        "medicine" => ProductKind::Medicine,
        "pet" => ProductKind::Pet,
        _ => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "invalid_kind",
                "kind must be one of: medicine, pet",
            )
        }
    };

    let id = ProductId::new(AggregateId::new());
    let product = match Product::new(
        id,
        body.name,
        body.price,
        body.stock,
        body.requires_prescription,
        kind,
    ) {
        Ok(p) => p,
        Err(e) => return domain_error_to_response(e),
    };

    if let Err(e) = state.catalog.insert(product.clone()) {
        return domain_error_to_response(e);
    }
    state.ledger.seed(id, product.stock);

    (StatusCode::CREATED, Json(product)).into_response()
}

pub async fn list_products(
    Extension(state): Extension<AppState>,
) -> axum::response::Response {
    Json(state.catalog.all()).into_response()
}

pub async fn create_order(
    Extension(state): Extension<AppState>,
    Json(body): Json<CreateOrderRequest>,
) -> axum::response::Response {
    let user_id: UserId = match body.user_id.parse() {
        Ok(id) => id,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid user id"),
    };

    let mut lines = Vec::with_capacity(body.lines.len());
    for line in body.lines {
        let product_id = match line.product_id.parse::<AggregateId>() {
            Ok(id) => ProductId::new(id),
            Err(_) => {
                return json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid product id")
            }
        };
        let prescription_ref = match line.prescription_ref {
            Some(raw) => match raw.parse::<AggregateId>() {
                Ok(id) => Some(PrescriptionId::new(id)),
                Err(_) => {
                    return json_error(
                        StatusCode::BAD_REQUEST,
                        "invalid_id",
                        "invalid prescription id",
                    )
                }
            },
            None => None,
        };
        lines.push(OrderLineRequest {
            product_id,
            quantity: line.quantity,
            prescription_ref,
        });
    }

    match state.service.create_order(user_id, lines) {
        Ok(order) => (StatusCode::CREATED, Json(order)).into_response(),
        Err(e) => domain_error_to_response(e),
    }
}

pub async fn get_order(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.get_order(order_id) {
        Ok(order) => Json(order).into_response(),
        Err(e) => domain_error_to_response(e),
    }
}

pub async fn create_intent(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.create_intent(order_id) {
        Ok(intent) => (StatusCode::CREATED, Json(intent)).into_response(),
        Err(e) => domain_error_to_response(e),
    }
}

pub async fn cancel_order(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CancelOrderRequest>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let actor = match body.actor.to_lowercase().as_str() {
        "customer" => CancelActor::Customer,
        "admin" => CancelActor::Admin,
        _ => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "invalid_actor",
                "actor must be one of: customer, admin",
            )
        }
    };
    match state.service.cancel_order(order_id, actor) {
        Ok(order) => Json(order).into_response(),
        Err(e) => domain_error_to_response(e),
    }
}

pub async fn fulfill_order(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.complete_fulfillment(order_id) {
        Ok(order) => Json(order).into_response(),
        Err(e) => domain_error_to_response(e),
    }
}

pub async fn payment_callback(
    Extension(state): Extension<AppState>,
    Json(body): Json<CallbackPayload>,
) -> axum::response::Response {
    match state.service.handle_callback(&body) {
        Ok(order) => Json(json!({
            "order_id": order.id_typed(),
            "payment_status": order.payment_status(),
            "fulfillment_status": order.fulfillment_status(),
        }))
        .into_response(),
        Err(e) => domain_error_to_response(e),
    }
}

pub async fn upload_prescription(
    Extension(state): Extension<AppState>,
    Json(body): Json<UploadPrescriptionRequest>,
) -> axum::response::Response {
    let user_id: UserId = match body.user_id.parse() {
        Ok(id) => id,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid user id"),
    };
    match state
        .prescriptions
        .upload(user_id, body.document_ref, chrono::Utc::now())
    {
        Ok(prescription) => (StatusCode::CREATED, Json(prescription)).into_response(),
        Err(e) => domain_error_to_response(e),
    }
}

pub async fn decide_prescription(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DecisionRequest>,
) -> axum::response::Response {
    let prescription_id = match id.parse::<AggregateId>() {
        Ok(id) => PrescriptionId::new(id),
        Err(_) => {
            return json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid prescription id")
        }
    };

    let decision = match body.verdict.to_lowercase().as_str() {
        "approve" => {
            let mut quantities = BTreeMap::new();
            for (raw, qty) in body.quantities {
                match raw.parse::<AggregateId>() {
                    Ok(id) => {
                        quantities.insert(ProductId::new(id), qty);
                    }
                    Err(_) => {
                        return json_error(
                            StatusCode::BAD_REQUEST,
                            "invalid_id",
                            "invalid product id in quantities",
                        )
                    }
                }
            }
            ReviewDecision::Approve {
                quantities,
                notes: body.notes,
            }
        }
        "reject" => ReviewDecision::Reject { notes: body.notes },
        _ => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "invalid_verdict",
                "verdict must be one of: approve, reject",
            )
        }
    };

    match state
        .service
        .on_prescription_decision(prescription_id, decision)
    {
        Ok(prescription) => Json(prescription).into_response(),
        Err(e) => domain_error_to_response(e),
    }
}

/// GET /orders/:id/events
///
/// Stream the order's status topic via Server-Sent Events. Delivery is
/// best-effort: clients that reconnect re-fetch `GET /orders/:id` instead of
/// relying on replay.
pub async fn order_events(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id: AggregateId = match id.parse() {
        Ok(id) => id,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid order id"),
    };

    let rx = state.topics.subscribe(order_id);
    let stream = BroadcastStream::new(rx)
        // A lagged subscriber just misses those events.
        .filter_map(|message| message.ok())
        .map(|update| {
            let data = serde_json::to_string(&update).unwrap_or_else(|_| "{}".to_string());
            Ok::<SseEvent, Infallible>(SseEvent::default().event(update.event_type).data(data))
        });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}
