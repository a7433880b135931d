//! Inbound webhook endpoints.
//!
//! Both endpoints read the raw body so signatures are checked against the
//! exact bytes the vendor signed. Any verified delivery is acknowledged with
//! `200 {received: true}`, including event types nobody handles. Signature
//! failures answer 401. Processing failures answer 500 so the vendor
//! redelivers.

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
};
use serde::Serialize;

use super::routes::RouteModule;
use super::state::AppState;
use crate::billing::{BillingStore, PaymentGateway};
use crate::error::{BillflowError, Result};

const TARGET: &str = "billflow::http::webhooks";

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
pub const RAMP_SIGNATURE_HEADER: &str = "x-ramp-signature";

/// Acknowledgement body.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Received {
    pub received: bool,
}

const RECEIVED: Received = Received { received: true };

pub struct WebhookRoutes;

impl<S, G> RouteModule<AppState<S, G>> for WebhookRoutes
where
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    fn routes(&self) -> Router<AppState<S, G>> {
        Router::new()
            .route("/stripe", post(stripe_webhook::<S, G>))
            .route("/ramp", post(ramp_webhook::<S, G>))
    }

    fn prefix(&self) -> Option<&str> {
        Some("/webhooks")
    }
}

fn signature_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| BillflowError::signature_invalid(format!("missing {} header", name)))
}

/// Keep signature failures as 401; everything else becomes a 500.
fn delivery_failed(source: &'static str, err: BillflowError) -> BillflowError {
    match err {
        BillflowError::SignatureInvalid(_) => {
            tracing::warn!(target: TARGET, source, error = %err, "Rejected webhook signature");
            err
        }
        other => {
            tracing::error!(target: TARGET, source, error = %other, "Webhook processing failed");
            BillflowError::internal(format!("{} webhook processing failed: {}", source, other))
        }
    }
}

async fn stripe_webhook<S, G>(
    State(state): State<AppState<S, G>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Received>>
where
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    let signature = signature_header(&headers, STRIPE_SIGNATURE_HEADER)
        .map_err(|e| delivery_failed("stripe", e))?;

    let outcome = state
        .stripe_webhooks
        .process(&body, signature)
        .await
        .map_err(|e| delivery_failed("stripe", e))?;

    tracing::debug!(target: TARGET, ?outcome, "Stripe webhook acknowledged");
    Ok(Json(RECEIVED))
}

async fn ramp_webhook<S, G>(
    State(state): State<AppState<S, G>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Received>>
where
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    let signature = signature_header(&headers, RAMP_SIGNATURE_HEADER)
        .map_err(|e| delivery_failed("ramp", e))?;

    let outcome = state
        .ledger_webhooks
        .process(&body, signature)
        .await
        .map_err(|e| delivery_failed("ramp", e))?;

    tracing::debug!(target: TARGET, ?outcome, "Ramp webhook acknowledged");
    Ok(Json(RECEIVED))
}
