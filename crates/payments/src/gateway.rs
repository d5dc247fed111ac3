use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

use medipaw_core::{AggregateId, DomainError};
use medipaw_orders::OrderId;

type HmacSha256 = Hmac<Sha256>;

/// Unredeemed intents older than this are expired; the owning order
/// auto-transitions to `PaymentFailed`.
pub const DEFAULT_INTENT_TTL_MINUTES: i64 = 30;

/// A locally created record of the expected payment for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Gateway-side order id, echoed back in the callback.
    pub gateway_order_id: String,
    pub order_id: OrderId,
    /// Expected amount in smallest currency units.
    pub amount: u64,
    pub currency: String,
    /// Verification token (HMAC digest over the gateway order id), computed
    /// before the intent is handed out and consumed exactly once when the
    /// callback arrives. Never serialized into responses.
    #[serde(skip_serializing, default)]
    pub token: String,
    pub created_at: DateTime<Utc>,
}

/// Raw callback fields as delivered by the gateway redirect.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallbackPayload {
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub amount: u64,
    pub signature: String,
}

/// Outcome of a successfully processed callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// First valid callback for this intent: the order may be marked paid.
    Authorized {
        order_id: OrderId,
        amount: u64,
        gateway_payment_id: String,
    },
    /// A duplicate of an already-consumed callback (network retry, double
    /// webhook). Acknowledged as success; nothing may be re-authorized.
    Replayed { order_id: OrderId },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("callback signature mismatch")]
    SignatureMismatch,

    #[error("callback amount does not match the intent")]
    AmountMismatch,

    #[error("no intent recorded for this gateway order id")]
    UnknownIntent,

    #[error("payment intent expired")]
    Expired,
}

impl From<PaymentError> for DomainError {
    fn from(err: PaymentError) -> Self {
        match err {
            // Fail closed; details are for the server log, clients get a
            // generic verification failure.
            PaymentError::SignatureMismatch | PaymentError::AmountMismatch
            | PaymentError::UnknownIntent => DomainError::security(err.to_string()),
            PaymentError::Expired => DomainError::conflict(err.to_string()),
        }
    }
}

#[derive(Debug)]
struct IntentRecord {
    intent: PaymentIntent,
    consumed: bool,
    expired: bool,
}

/// Shared-secret payment verifier and intent registry.
///
/// `verify_callback` recomputes
/// `HMAC-SHA256(secret, gateway_order_id + "|" + gateway_payment_id)` and
/// compares it to the supplied signature in constant time. Any mismatch fails
/// closed; a callback is never partially trusted.
#[derive(Debug)]
pub struct PaymentGateway {
    secret: String,
    intent_ttl: Duration,
    intents: Mutex<HashMap<String, IntentRecord>>,
}

impl PaymentGateway {
    pub fn new(secret: impl Into<String>, intent_ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            intent_ttl,
            intents: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_ttl(secret: impl Into<String>) -> Self {
        Self::new(secret, Duration::minutes(DEFAULT_INTENT_TTL_MINUTES))
    }

    /// Record the expected amount for an order and hand out the gateway-side
    /// order id the callback must echo.
    pub fn create_intent(
        &self,
        order_id: OrderId,
        amount: u64,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> PaymentIntent {
        let gateway_order_id = format!("gwo_{}", AggregateId::new().as_uuid().simple());
        let token = self.digest(gateway_order_id.as_bytes());

        let intent = PaymentIntent {
            gateway_order_id: gateway_order_id.clone(),
            order_id,
            amount,
            currency: currency.into(),
            token,
            created_at: now,
        };

        let mut intents = self.intents.lock().unwrap_or_else(|e| e.into_inner());
        intents.insert(
            gateway_order_id,
            IntentRecord {
                intent: intent.clone(),
                consumed: false,
                expired: false,
            },
        );
        intent
    }

    /// Validate a gateway callback against the recorded intent.
    ///
    /// Check order matters: signature first (never trust unsigned fields),
    /// then amount (a valid signature over adjusted parameters must not
    /// under/over-credit), then replay (consume the token exactly once).
    pub fn verify_callback(
        &self,
        callback: &CallbackPayload,
        now: DateTime<Utc>,
    ) -> Result<Verification, PaymentError> {
        let mut intents = self.intents.lock().unwrap_or_else(|e| e.into_inner());
        let record = intents
            .get_mut(&callback.gateway_order_id)
            .ok_or(PaymentError::UnknownIntent)?;

        let signed = format!(
            "{}|{}",
            callback.gateway_order_id, callback.gateway_payment_id
        );
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| PaymentError::SignatureMismatch)?;
        mac.update(signed.as_bytes());

        // Decode hex signature and compare in constant time via verify_slice.
        let sig_bytes =
            hex::decode(&callback.signature).map_err(|_| PaymentError::SignatureMismatch)?;
        mac.verify_slice(&sig_bytes)
            .map_err(|_| PaymentError::SignatureMismatch)?;

        if callback.amount != record.intent.amount {
            warn!(
                gateway_order_id = %callback.gateway_order_id,
                expected = record.intent.amount,
                got = callback.amount,
                "callback amount mismatch"
            );
            return Err(PaymentError::AmountMismatch);
        }

        // A retry of an already-consumed callback stays an idempotent ack,
        // even if it straggles in past the expiry window.
        if record.consumed {
            return Ok(Verification::Replayed {
                order_id: record.intent.order_id,
            });
        }

        if record.expired || now - record.intent.created_at > self.intent_ttl {
            record.expired = true;
            return Err(PaymentError::Expired);
        }

        record.consumed = true;
        Ok(Verification::Authorized {
            order_id: record.intent.order_id,
            amount: record.intent.amount,
            gateway_payment_id: callback.gateway_payment_id.clone(),
        })
    }

    /// Sweep: mark unredeemed intents past their TTL as expired and return
    /// the orders whose checkout should fail.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Vec<OrderId> {
        let mut intents = self.intents.lock().unwrap_or_else(|e| e.into_inner());
        let mut failed = Vec::new();
        for record in intents.values_mut() {
            if !record.consumed
                && !record.expired
                && now - record.intent.created_at > self.intent_ttl
            {
                record.expired = true;
                failed.push(record.intent.order_id);
            }
        }
        failed
    }

    /// Compute the callback signature the gateway would produce. Used by the
    /// gateway simulator in tests.
    pub fn sign(&self, gateway_order_id: &str, gateway_payment_id: &str) -> String {
        self.digest(format!("{gateway_order_id}|{gateway_payment_id}").as_bytes())
    }

    fn digest(&self, data: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any size");
        mac.update(data);
        hex::encode(mac.finalize().into_bytes())
    }
}
