//! Payment intents and gateway callback verification.
//!
//! The verifier is the sole authority for marking an order paid. It fails
//! closed on any signature or amount mismatch and acknowledges duplicate
//! callbacks idempotently.

pub mod gateway;

pub use gateway::{
    CallbackPayload, PaymentError, PaymentGateway, PaymentIntent, Verification,
    DEFAULT_INTENT_TTL_MINUTES,
};
