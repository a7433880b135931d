//! Webhook handling utilities.
//!
//! Provides signature verification, idempotency checking, and event dispatch
//! for incoming webhooks. The payment gateway pipeline lives in
//! [`crate::billing::webhook`]; the ledger pipeline in [`crate::ledger::webhook`]
//! is built from these pieces.

pub mod handler;
pub mod idempotency;
pub mod verification;

pub use handler::{RouteOutcome, WebhookEvent, WebhookHandler, WebhookRouter};
pub use idempotency::{IdempotencyStore, MemoryIdempotencyStore};
pub use verification::{HmacSha256Verifier, WebhookVerifier};
