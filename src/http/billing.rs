//! Billing reporting endpoints.

use axum::{
    Router,
    extract::State,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::query::{CurrencyQuery, Query};
use super::response::{ApiResponse, JsonResponse};
use super::routes::RouteModule;
use super::state::AppState;
use crate::billing::{BillingOverview, BillingStore, DateRange, PaymentGateway, RevenueBreakdown};
use crate::error::BillflowError;

/// `?from=...&to=...&currency=usd` with RFC 3339 timestamps.
#[derive(Debug, Clone, Deserialize)]
pub struct RevenueQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "usd".to_string()
}

pub struct BillingRoutes;

impl<S, G> RouteModule<AppState<S, G>> for BillingRoutes
where
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    fn routes(&self) -> Router<AppState<S, G>> {
        Router::new()
            .route("/overview", get(billing_overview::<S, G>))
            .route("/revenue", get(revenue_breakdown::<S, G>))
    }

    fn prefix(&self) -> Option<&str> {
        Some("/billing")
    }
}

async fn billing_overview<S, G>(
    State(state): State<AppState<S, G>>,
    Query(query): Query<CurrencyQuery>,
) -> JsonResponse<BillingOverview>
where
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    let overview = state.billing.get_billing_overview(&query.currency).await?;
    Ok(ApiResponse::success(overview))
}

async fn revenue_breakdown<S, G>(
    State(state): State<AppState<S, G>>,
    Query(query): Query<RevenueQuery>,
) -> JsonResponse<RevenueBreakdown>
where
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    if query.from >= query.to {
        return Err(BillflowError::invalid_input("'from' must precede 'to'"));
    }
    let breakdown = state
        .billing
        .get_revenue_breakdown(DateRange::new(query.from, query.to), &query.currency)
        .await?;
    Ok(ApiResponse::success(breakdown))
}
