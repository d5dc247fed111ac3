use reqwest::StatusCode;
use serde_json::json;

use medipaw_api::app::{build_app, AppConfig};

const SECRET: &str = "whsec_black_box";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Build the app (same router as prod), but bind to an ephemeral port.
        let (app, _state) = build_app(AppConfig {
            gateway_secret: SECRET.to_string(),
            currency: "INR".to_string(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Compute the callback signature the gateway would send.
fn gateway_signature(gateway_order_id: &str, gateway_payment_id: &str) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac =
        HmacSha256::new_from_slice(SECRET.as_bytes()).expect("HMAC can take key of any size");
    mac.update(format!("{gateway_order_id}|{gateway_payment_id}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn user_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

async fn create_product(
    client: &reqwest::Client,
    base_url: &str,
    price: u64,
    stock: u32,
    gated: bool,
) -> serde_json::Value {
    let res = client
        .post(format!("{}/products", base_url))
        .json(&json!({
            "name": if gated { "Amoxicillin 500mg" } else { "Flea Collar" },
            "price": price,
            "stock": stock,
            "requires_prescription": gated,
            "kind": if gated { "medicine" } else { "pet" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

async fn create_order(
    client: &reqwest::Client,
    base_url: &str,
    product_id: &str,
    quantity: u32,
    prescription_ref: Option<&str>,
) -> serde_json::Value {
    let res = client
        .post(format!("{}/orders", base_url))
        .json(&json!({
            "user_id": user_id(),
            "lines": [{
                "product_id": product_id,
                "quantity": quantity,
                "prescription_ref": prescription_ref,
            }],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

async fn pay_order(
    client: &reqwest::Client,
    base_url: &str,
    order_id: &str,
) -> serde_json::Value {
    let res = client
        .post(format!("{}/orders/{}/intent", base_url, order_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let intent: serde_json::Value = res.json().await.unwrap();

    let gateway_order_id = intent["gateway_order_id"].as_str().unwrap();
    let res = client
        .post(format!("{}/payments/callback", base_url))
        .json(&json!({
            "gateway_order_id": gateway_order_id,
            "gateway_payment_id": "pay_e2e",
            "amount": intent["amount"],
            "signature": gateway_signature(gateway_order_id, "pay_e2e"),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    res.json().await.unwrap()
}

#[tokio::test]
async fn ungated_order_completes_over_http() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let product = create_product(&client, &server.base_url, 1299, 10, false).await;
    let product_id = product["id"].as_str().unwrap();

    let order = create_order(&client, &server.base_url, product_id, 2, None).await;
    let order_id = order["id"].as_str().unwrap();
    assert_eq!(order["total"], 2598);
    assert_eq!(order["fulfillment_status"], "draft");

    let ack = pay_order(&client, &server.base_url, order_id).await;
    assert_eq!(ack["fulfillment_status"], "fulfilling");
    assert_eq!(ack["payment_status"], "paid");

    let res = client
        .post(format!("{}/orders/{}/fulfill", server.base_url, order_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let done: serde_json::Value = res.json().await.unwrap();
    assert_eq!(done["fulfillment_status"], "completed");
}

#[tokio::test]
async fn gated_order_goes_through_review_over_http() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let product = create_product(&client, &server.base_url, 2000, 5, true).await;
    let product_id = product["id"].as_str().unwrap();

    // Upload a prescription first, then order against it.
    let res = client
        .post(format!("{}/prescriptions", server.base_url))
        .json(&json!({
            "user_id": user_id(),
            "document_ref": "uploads/rx-e2e.pdf",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let prescription: serde_json::Value = res.json().await.unwrap();
    let prescription_id = prescription["id"].as_str().unwrap();

    let order =
        create_order(&client, &server.base_url, product_id, 2, Some(prescription_id)).await;
    let order_id = order["id"].as_str().unwrap();

    let ack = pay_order(&client, &server.base_url, order_id).await;
    assert_eq!(ack["fulfillment_status"], "under_review");

    // The admin approves the full quantity; the order is released.
    let res = client
        .post(format!(
            "{}/prescriptions/{}/decision",
            server.base_url, prescription_id
        ))
        .json(&json!({
            "verdict": "approve",
            "quantities": { product_id: 2 },
            "notes": "verified",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .get(format!("{}/orders/{}", server.base_url, order_id))
        .send()
        .await
        .unwrap();
    let current: serde_json::Value = res.json().await.unwrap();
    assert_eq!(current["fulfillment_status"], "fulfilling");

    // Deciding the same prescription again is refused (one-shot review).
    let res = client
        .post(format!(
            "{}/prescriptions/{}/decision",
            server.base_url, prescription_id
        ))
        .json(&json!({ "verdict": "reject" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn tampered_callback_is_rejected_generically() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let product = create_product(&client, &server.base_url, 900, 3, false).await;
    let product_id = product["id"].as_str().unwrap();
    let order = create_order(&client, &server.base_url, product_id, 1, None).await;
    let order_id = order["id"].as_str().unwrap();

    let res = client
        .post(format!("{}/orders/{}/intent", server.base_url, order_id))
        .send()
        .await
        .unwrap();
    let intent: serde_json::Value = res.json().await.unwrap();
    let gateway_order_id = intent["gateway_order_id"].as_str().unwrap();

    // Signature over a different payment id: refused without leaking detail.
    let res = client
        .post(format!("{}/payments/callback", server.base_url))
        .json(&json!({
            "gateway_order_id": gateway_order_id,
            "gateway_payment_id": "pay_real",
            "amount": intent["amount"],
            "signature": gateway_signature(gateway_order_id, "pay_other"),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "verification_failed");
    assert_eq!(body["message"], "payment verification failed");

    // The order did not move.
    let res = client
        .get(format!("{}/orders/{}", server.base_url, order_id))
        .send()
        .await
        .unwrap();
    let current: serde_json::Value = res.json().await.unwrap();
    assert_eq!(current["fulfillment_status"], "awaiting_payment");
}

#[tokio::test]
async fn order_events_stream_delivers_status_updates() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let product = create_product(&client, &server.base_url, 500, 5, false).await;
    let product_id = product["id"].as_str().unwrap();
    let order = create_order(&client, &server.base_url, product_id, 1, None).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    // Open the SSE subscription before triggering the transition.
    let mut events = client
        .get(format!("{}/orders/{}/events", server.base_url, order_id))
        .send()
        .await
        .unwrap();
    assert_eq!(events.status(), StatusCode::OK);

    let res = client
        .post(format!("{}/orders/{}/intent", server.base_url, order_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    // The first data frame carries the payment_requested transition.
    let mut received = String::new();
    let deadline = std::time::Duration::from_secs(5);
    let frame = tokio::time::timeout(deadline, async {
        loop {
            match events.chunk().await.unwrap() {
                Some(chunk) => {
                    received.push_str(&String::from_utf8_lossy(&chunk));
                    if received.contains("order.payment_requested") {
                        return received.clone();
                    }
                }
                None => panic!("event stream closed before any update arrived"),
            }
        }
    })
    .await
    .expect("no status update within timeout");

    assert!(frame.contains("order.payment_requested"));
    assert!(frame.contains(&order_id));
}
