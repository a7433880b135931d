//! Ledger gateway webhooks (`x-ramp-signature`).
//!
//! Events are verified, deduplicated and acknowledged. None of them mutate
//! local state yet: each recognised lifecycle event is reported as
//! [`LedgerWebhookOutcome::NotYetWired`].

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{BillflowError, Result};
use crate::webhooks::{
    HmacSha256Verifier, IdempotencyStore, RouteOutcome, WebhookEvent, WebhookHandler,
    WebhookRouter, WebhookVerifier,
};

const TARGET: &str = "billflow::ledger::webhook";

/// A ledger gateway webhook event.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerWebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub business_id: Option<String>,
    #[serde(default, alias = "object")]
    pub data: serde_json::Value,
}

impl WebhookEvent for LedgerWebhookEvent {
    fn event_id(&self) -> &str {
        &self.id
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }
}

/// Resource family an event type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEventCategory {
    Transaction,
    Card,
    User,
    Reimbursement,
    Bill,
}

impl LedgerEventCategory {
    /// Classify `transactions.cleared`, `card.created` and similar.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        let resource = event_type.split('.').next().unwrap_or_default();
        match resource.trim_end_matches('s') {
            "transaction" => Some(Self::Transaction),
            "card" => Some(Self::Card),
            "user" => Some(Self::User),
            "reimbursement" => Some(Self::Reimbursement),
            "bill" => Some(Self::Bill),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Card => "card",
            Self::User => "user",
            Self::Reimbursement => "reimbursement",
            Self::Bill => "bill",
        }
    }
}

/// Result of processing a ledger webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerWebhookOutcome {
    /// A known lifecycle event; acknowledged, local state untouched.
    NotYetWired(LedgerEventCategory),
    /// Unknown event type; acknowledged.
    Unhandled,
    /// Event id was already processed.
    AlreadyProcessed,
}

/// Acknowledges ledger events without mutating local state.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerEventHandler;

#[async_trait]
impl WebhookHandler<LedgerWebhookEvent> for LedgerEventHandler {
    type Output = LedgerWebhookOutcome;

    async fn handle(&self, event: &LedgerWebhookEvent) -> Result<LedgerWebhookOutcome> {
        match LedgerEventCategory::from_event_type(&event.event_type) {
            Some(category) => {
                tracing::debug!(
                    target: TARGET,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    category = category.as_str(),
                    business_id = ?event.business_id,
                    "Ledger event acknowledged; not yet wired to local state"
                );
                Ok(LedgerWebhookOutcome::NotYetWired(category))
            }
            None => {
                tracing::info!(
                    target: TARGET,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Unhandled ledger webhook event type"
                );
                Ok(LedgerWebhookOutcome::Unhandled)
            }
        }
    }
}

/// Verify, deduplicate and dispatch ledger webhooks.
pub struct LedgerWebhookProcessor<I: IdempotencyStore> {
    verifier: HmacSha256Verifier,
    idempotency: I,
    handler: LedgerEventHandler,
    router: WebhookRouter,
}

impl<I: IdempotencyStore> LedgerWebhookProcessor<I> {
    /// Signatures are hex HMAC-SHA256 of the raw body, optionally prefixed `sha256=`.
    pub fn new(secret: impl Into<secrecy::SecretString>, idempotency: I) -> Self {
        Self {
            verifier: HmacSha256Verifier::new_with_prefix(secret, "sha256="),
            idempotency,
            handler: LedgerEventHandler,
            router: WebhookRouter::new(),
        }
    }

    pub async fn process(&self, payload: &[u8], signature: &str) -> Result<LedgerWebhookOutcome> {
        if !self.verifier.verify_signature(payload, signature).await? {
            return Err(BillflowError::signature_invalid("ledger webhook signature mismatch"));
        }

        let event: LedgerWebhookEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(target: TARGET, error = %e, "Failed to parse ledger webhook payload");
            BillflowError::invalid_input("malformed ledger webhook payload")
        })?;

        match self
            .router
            .process(&event, &self.handler, &self.idempotency)
            .await?
        {
            RouteOutcome::Handled(outcome) => Ok(outcome),
            RouteOutcome::Duplicate => Ok(LedgerWebhookOutcome::AlreadyProcessed),
        }
    }
}
