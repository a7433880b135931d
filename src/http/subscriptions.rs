//! Subscription lifecycle endpoints.

use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;

use super::query::{PaginationQuery, Query};
use super::response::{ApiResponse, JsonResponse};
use super::routes::RouteModule;
use super::state::AppState;
use crate::billing::{BillingStore, CreateSubscription, PaymentGateway, Subscription};
use crate::error::Result;

/// `POST /subscriptions` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionBody {
    pub customer_id: String,
    pub plan_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    pub trial_days: Option<u32>,
    pub payment_method_id: Option<String>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub coupon_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_quantity() -> u32 {
    1
}

impl From<CreateSubscriptionBody> for CreateSubscription {
    fn from(body: CreateSubscriptionBody) -> Self {
        let mut request = CreateSubscription::new(body.customer_id, body.plan_id)
            .quantity(body.quantity)
            .cancel_at_period_end(body.cancel_at_period_end);
        if let Some(days) = body.trial_days {
            request = request.trial_days(days);
        }
        if let Some(payment_method_id) = body.payment_method_id {
            request = request.payment_method(payment_method_id);
        }
        if let Some(coupon_id) = body.coupon_id {
            request = request.coupon(coupon_id);
        }
        for (key, value) in body.metadata {
            request = request.metadata(key, value);
        }
        request
    }
}

/// `?immediate=true` ends the subscription now instead of at period end.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    pub immediate: bool,
}

pub struct SubscriptionRoutes;

impl<S, G> RouteModule<AppState<S, G>> for SubscriptionRoutes
where
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    fn routes(&self) -> Router<AppState<S, G>> {
        Router::new()
            .route("/subscriptions", post(create_subscription::<S, G>))
            .route("/subscriptions/{id}", get(get_subscription::<S, G>))
            .route("/subscriptions/{id}/cancel", post(cancel_subscription::<S, G>))
            .route("/subscriptions/{id}/resume", post(resume_subscription::<S, G>))
            .route(
                "/customers/{customer_id}/subscriptions",
                get(list_customer_subscriptions::<S, G>),
            )
    }
}

async fn create_subscription<S, G>(
    State(state): State<AppState<S, G>>,
    Json(body): Json<CreateSubscriptionBody>,
) -> Result<impl IntoResponse>
where
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    let subscription = state.subscriptions.create(body.into()).await?;
    let location = format!("/subscriptions/{}", subscription.id);
    Ok(ApiResponse::created(subscription, location))
}

async fn get_subscription<S, G>(
    State(state): State<AppState<S, G>>,
    Path(id): Path<String>,
) -> JsonResponse<Subscription>
where
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    Ok(ApiResponse::success(state.subscriptions.get(&id).await?))
}

async fn cancel_subscription<S, G>(
    State(state): State<AppState<S, G>>,
    Path(id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> JsonResponse<Subscription>
where
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    Ok(ApiResponse::success(
        state.subscriptions.cancel(&id, query.immediate).await?,
    ))
}

async fn resume_subscription<S, G>(
    State(state): State<AppState<S, G>>,
    Path(id): Path<String>,
) -> JsonResponse<Subscription>
where
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    Ok(ApiResponse::success(state.subscriptions.resume(&id).await?))
}

async fn list_customer_subscriptions<S, G>(
    State(state): State<AppState<S, G>>,
    Path(customer_id): Path<String>,
    Query(page): Query<PaginationQuery>,
) -> JsonResponse<Vec<Subscription>>
where
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    page.validate()?;
    let all = state.subscriptions.list_for_customer(&customer_id).await?;
    let total = all.len() as u64;
    Ok(ApiResponse::paginated(
        page.slice(&all),
        total,
        page.page,
        page.limit,
    ))
}
