//! Payment gateway webhook handling.
//!
//! Verifies `stripe-signature` headers over the raw body, parses events into
//! a closed set of typed variants and applies them to local state. Every
//! mutation is conditional on the current local record, so redelivering an
//! event is harmless even before the event id is remembered.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillflowError, Result};
use super::error::BillingError;
use super::gateway::{GatewaySubscription, GatewaySubscriptionItem};
use super::model::{InvoiceStatus, PaymentStatus, SubscriptionStatus};
use super::storage::BillingStore;
use super::subscription::adopt_gateway_state;

const TARGET: &str = "billflow::billing::webhook";

/// Default allowed clock skew between the signature timestamp and now.
pub const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

/// Webhook handler for payment gateway events.
///
/// The webhook secret is stored using [`SecretString`] to prevent accidental
/// exposure in logs or debug output.
pub struct StripeWebhookHandler<S: BillingStore> {
    store: S,
    webhook_secret: SecretString,
    tolerance_seconds: i64,
}

impl<S: BillingStore> StripeWebhookHandler<S> {
    /// Create a new webhook handler with the default 300 second tolerance.
    #[must_use]
    pub fn new(store: S, webhook_secret: impl Into<SecretString>) -> Self {
        Self {
            store,
            webhook_secret: webhook_secret.into(),
            tolerance_seconds: DEFAULT_TOLERANCE_SECONDS,
        }
    }

    /// Override the allowed timestamp skew.
    #[must_use]
    pub fn with_tolerance(mut self, seconds: i64) -> Self {
        self.tolerance_seconds = seconds;
        self
    }

    /// Verify the signature header and parse the event.
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<StripeEvent> {
        self.verify_signature_at(payload, signature, Utc::now())
    }

    /// Verify against an explicit clock.
    ///
    /// Any verification failure surfaces as `SignatureInvalid`; a payload that
    /// verifies but does not parse is `InvalidInput`.
    pub fn verify_signature_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<StripeEvent> {
        let parts = parse_signature_header(signature)?;

        if (now.timestamp() - parts.timestamp).abs() > self.tolerance_seconds {
            return Err(invalid_signature("timestamp outside tolerance"));
        }

        let expected = compute_signature(
            self.webhook_secret.expose_secret(),
            parts.timestamp,
            payload,
        )?;

        // Several v1 entries appear while a secret is being rolled.
        let matched = parts.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|provided| expected.ct_eq(&provided).into())
                .unwrap_or(false)
        });
        if !matched {
            return Err(invalid_signature("signature mismatch"));
        }

        StripeEvent::parse(payload)
    }

    /// Verify and handle in one step.
    pub async fn process(&self, payload: &[u8], signature: &str) -> Result<WebhookOutcome> {
        let event = self.verify_signature(payload, signature)?;
        self.handle_event(event).await
    }

    /// Process a verified webhook event.
    ///
    /// The event id is remembered only after a successful mutation, so a
    /// failed delivery is retried by the gateway. Unknown types are
    /// acknowledged without being remembered.
    pub async fn handle_event(&self, event: StripeEvent) -> Result<WebhookOutcome> {
        if self.store.is_event_processed(&event.id).await? {
            tracing::debug!(target: TARGET, event_id = %event.id, "Skipping already processed event");
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let outcome = match &event.kind {
            StripeEventKind::PaymentIntentUpdated(intent) => {
                let reported = PaymentStatus::from_intent_status(&intent.status);
                self.handle_payment_intent(&event, intent, reported).await?
            }
            StripeEventKind::PaymentIntentFailed(intent) => {
                self.handle_payment_intent(&event, intent, PaymentStatus::Failed).await?
            }
            StripeEventKind::SubscriptionUpdated(object) => {
                self.handle_subscription_updated(&event, object).await?
            }
            StripeEventKind::SubscriptionDeleted(object) => {
                self.handle_subscription_deleted(&event, object).await?
            }
            StripeEventKind::InvoicePaid(object) => self.handle_invoice_paid(&event, object).await?,
            StripeEventKind::InvoicePaymentFailed(object) => {
                self.handle_invoice_payment_failed(&event, object).await?
            }
            StripeEventKind::Unhandled => {
                tracing::info!(
                    target: TARGET,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Unhandled webhook event type"
                );
                WebhookOutcome::Ignored
            }
        };

        if !matches!(outcome, WebhookOutcome::Ignored) {
            self.store.mark_event_processed(&event.id).await?;
        }

        tracing::info!(
            target: TARGET,
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = ?outcome,
            "Webhook event handled"
        );

        Ok(outcome)
    }

    async fn handle_payment_intent(
        &self,
        event: &StripeEvent,
        intent: &PaymentIntentObject,
        reported: PaymentStatus,
    ) -> Result<WebhookOutcome> {
        let Some(mut payment) = self.store.get_payment_by_intent_id(&intent.id).await? else {
            tracing::debug!(
                target: TARGET,
                event_id = %event.id,
                payment_intent_id = %intent.id,
                "No local payment for intent"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        if !payment.status.can_advance_to(reported) {
            return Ok(WebhookOutcome::Processed);
        }

        let now = Utc::now();
        if reported == PaymentStatus::Succeeded {
            // Conditional on the status we just read; a racing settlement makes this a no-op.
            if let Some(settlement) = self
                .store
                .settle_payment(&payment.id, payment.status, now)
                .await?
            {
                tracing::info!(
                    target: TARGET,
                    payment_id = %settlement.payment.id,
                    invoice_id = ?settlement.invoice.as_ref().map(|i| i.id.as_str()),
                    "Payment settled from webhook"
                );
            }
            return Ok(WebhookOutcome::Processed);
        }

        let expected_version = payment.version;
        payment.status = reported;
        payment.updated_at = now;
        if reported == PaymentStatus::Failed {
            payment.failure_reason = intent
                .last_payment_error
                .as_ref()
                .and_then(|e| e.message.clone())
                .or_else(|| Some("payment failed".to_string()));
        }
        if !self.store.compare_and_save_payment(&payment, expected_version).await? {
            return Err(BillingError::ConcurrentModification {
                entity: "payment",
                id: payment.id,
            }
            .into());
        }

        Ok(WebhookOutcome::Processed)
    }

    async fn handle_subscription_updated(
        &self,
        event: &StripeEvent,
        object: &SubscriptionObject,
    ) -> Result<WebhookOutcome> {
        let Some(mut sub) = self.store.get_subscription_by_gateway_id(&object.id).await? else {
            tracing::debug!(
                target: TARGET,
                event_id = %event.id,
                gateway_subscription_id = %object.id,
                "No local subscription for gateway subscription"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        // Canceled is terminal locally; a late update must not revive it.
        if sub.is_canceled() {
            return Ok(WebhookOutcome::Processed);
        }

        let expected_version = sub.version;
        adopt_gateway_state(&mut sub, &object.to_gateway());
        sub.record_event("synced_from", event.event_type.clone());
        self.save_subscription(&sub, expected_version).await?;

        tracing::info!(
            target: TARGET,
            subscription_id = %sub.id,
            status = %sub.status.as_str(),
            "Subscription synced from webhook"
        );
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_subscription_deleted(
        &self,
        event: &StripeEvent,
        object: &SubscriptionObject,
    ) -> Result<WebhookOutcome> {
        let Some(mut sub) = self.store.get_subscription_by_gateway_id(&object.id).await? else {
            tracing::debug!(
                target: TARGET,
                event_id = %event.id,
                gateway_subscription_id = %object.id,
                "No local subscription for deleted gateway subscription"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        if sub.is_canceled() {
            return Ok(WebhookOutcome::Processed);
        }

        let expected_version = sub.version;
        let now = Utc::now();
        let ended = object.ended_at.or(object.canceled_at).unwrap_or(now);
        sub.status = SubscriptionStatus::Canceled;
        sub.cancel_at_period_end = false;
        sub.canceled_at = Some(sub.canceled_at.unwrap_or(ended));
        sub.ended_at = Some(ended);
        sub.record_event("canceled_at", ended.to_rfc3339());
        self.save_subscription(&sub, expected_version).await?;

        tracing::info!(target: TARGET, subscription_id = %sub.id, "Subscription canceled from webhook");
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_invoice_paid(
        &self,
        event: &StripeEvent,
        object: &InvoiceObject,
    ) -> Result<WebhookOutcome> {
        let Some(mut invoice) = self.store.get_invoice_by_gateway_id(&object.id).await? else {
            tracing::debug!(
                target: TARGET,
                event_id = %event.id,
                gateway_invoice_id = %object.id,
                "No local invoice for gateway invoice"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        if !invoice.status.is_collectible() {
            return Ok(WebhookOutcome::Processed);
        }

        let expected_version = invoice.version;
        invoice.mark_paid(Utc::now());
        self.save_invoice(&invoice, expected_version).await?;

        tracing::info!(target: TARGET, invoice_id = %invoice.id, "Invoice marked paid from webhook");
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_invoice_payment_failed(
        &self,
        event: &StripeEvent,
        object: &InvoiceObject,
    ) -> Result<WebhookOutcome> {
        let Some(mut invoice) = self.store.get_invoice_by_gateway_id(&object.id).await? else {
            tracing::debug!(
                target: TARGET,
                event_id = %event.id,
                gateway_invoice_id = %object.id,
                "No local invoice for gateway invoice"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        if invoice.status != InvoiceStatus::Open {
            return Ok(WebhookOutcome::Processed);
        }

        let expected_version = invoice.version;
        invoice.status = InvoiceStatus::PastDue;
        self.save_invoice(&invoice, expected_version).await?;

        tracing::warn!(target: TARGET, invoice_id = %invoice.id, "Invoice payment failed");
        Ok(WebhookOutcome::Processed)
    }

    async fn save_subscription(
        &self,
        sub: &super::model::Subscription,
        expected_version: u64,
    ) -> Result<()> {
        if self.store.compare_and_save_subscription(sub, expected_version).await? {
            Ok(())
        } else {
            Err(BillingError::ConcurrentModification {
                entity: "subscription",
                id: sub.id.clone(),
            }
            .into())
        }
    }

    async fn save_invoice(&self, invoice: &super::model::Invoice, expected_version: u64) -> Result<()> {
        if self.store.compare_and_save_invoice(invoice, expected_version).await? {
            Ok(())
        } else {
            Err(BillingError::ConcurrentModification {
                entity: "invoice",
                id: invoice.id.clone(),
            }
            .into())
        }
    }
}

/// Outcome of handling a webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event was applied (possibly as a no-op against current state).
    Processed,
    /// Event type is not handled or refers to nothing local.
    Ignored,
    /// Event id was already handled.
    AlreadyProcessed,
}

/// A verified payment gateway event.
#[derive(Debug, Clone)]
pub struct StripeEvent {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub kind: StripeEventKind,
}

/// Typed event payloads, keyed on the event type string.
#[derive(Debug, Clone)]
pub enum StripeEventKind {
    /// `payment_intent.succeeded`, `.processing`, `.canceled`, `.requires_action`.
    PaymentIntentUpdated(PaymentIntentObject),
    /// `payment_intent.payment_failed`; the intent itself reports
    /// `requires_payment_method`, so the failure comes from the event type.
    PaymentIntentFailed(PaymentIntentObject),
    /// `customer.subscription.created` and `.updated`.
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    InvoicePaid(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),
    Unhandled,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

impl StripeEvent {
    /// Parse a raw event body into its typed form.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw: RawEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(target: TARGET, error = %e, "Failed to parse webhook payload");
            malformed("malformed JSON payload")
        })?;

        let object = raw.data.object;
        let kind = match raw.event_type.as_str() {
            "payment_intent.succeeded"
            | "payment_intent.processing"
            | "payment_intent.canceled"
            | "payment_intent.requires_action" => {
                StripeEventKind::PaymentIntentUpdated(typed_object(object, &raw.event_type)?)
            }
            "payment_intent.payment_failed" => {
                StripeEventKind::PaymentIntentFailed(typed_object(object, &raw.event_type)?)
            }
            "customer.subscription.created" | "customer.subscription.updated" => {
                StripeEventKind::SubscriptionUpdated(typed_object(object, &raw.event_type)?)
            }
            "customer.subscription.deleted" => {
                StripeEventKind::SubscriptionDeleted(typed_object(object, &raw.event_type)?)
            }
            "invoice.paid" => StripeEventKind::InvoicePaid(typed_object(object, &raw.event_type)?),
            "invoice.payment_failed" => {
                StripeEventKind::InvoicePaymentFailed(typed_object(object, &raw.event_type)?)
            }
            _ => StripeEventKind::Unhandled,
        };

        Ok(Self {
            id: raw.id,
            event_type: raw.event_type,
            created: raw.created,
            kind,
        })
    }
}

fn typed_object<T: serde::de::DeserializeOwned>(
    object: serde_json::Value,
    event_type: &str,
) -> Result<T> {
    serde_json::from_value(object).map_err(|e| {
        tracing::warn!(target: TARGET, event_type, error = %e, "Webhook object has unexpected shape");
        malformed(format!("unexpected object for {}", event_type))
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub last_payment_error: Option<PaymentErrorObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentErrorObject {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: String,
    pub status: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub current_period_start: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub current_period_end: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub trial_start: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub trial_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub canceled_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items: SubscriptionItemList,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItemObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItemObject {
    pub id: String,
    pub price: PriceRef,
    #[serde(default)]
    pub quantity: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceRef {
    pub id: String,
}

impl SubscriptionObject {
    fn to_gateway(&self) -> GatewaySubscription {
        GatewaySubscription {
            id: self.id.clone(),
            customer_id: self.customer.clone(),
            status: self.status.clone(),
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            trial_start: self.trial_start,
            trial_end: self.trial_end,
            cancel_at_period_end: self.cancel_at_period_end,
            canceled_at: self.canceled_at,
            items: self
                .items
                .data
                .iter()
                .map(|item| GatewaySubscriptionItem {
                    id: item.id.clone(),
                    price_id: item.price.id.clone(),
                    quantity: item.quantity.unwrap_or(1),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

fn invalid_signature(reason: &str) -> BillflowError {
    BillingError::InvalidWebhookSignature {
        reason: reason.to_string(),
    }
    .into()
}

fn malformed(message: impl Into<String>) -> BillflowError {
    BillingError::InvalidWebhookPayload {
        message: message.into(),
    }
    .into()
}

/// Parsed signature header parts.
struct SignatureParts {
    timestamp: i64,
    signatures: Vec<String>,
}

/// Parse the `t=<ts>,v1=<hex>[,v1=<hex>]` signature header.
fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| invalid_signature("invalid signature header format"))?;

        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {} // Ignore other schemes
        }
    }

    let timestamp = timestamp.ok_or_else(|| invalid_signature("missing timestamp"))?;
    if signatures.is_empty() {
        return Err(invalid_signature("missing v1 signature"));
    }

    Ok(SignatureParts { timestamp, signatures })
}

/// Compute HMAC-SHA256 over `"<timestamp>.<payload>"` using the raw bytes.
fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> Result<Vec<u8>> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillflowError::internal("HMAC error"))?;

    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    Ok(mac.finalize().into_bytes().to_vec())
}

/// Build a valid `stripe-signature` header for a payload (for tests and
/// local tooling that replays events).
#[must_use]
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let signature = compute_signature(secret, timestamp, payload)
        .map(hex::encode)
        .unwrap_or_default();
    format!("t={},v1={}", timestamp, signature)
}
