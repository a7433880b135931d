//! Payment gateway collaborator.
//!
//! The engines talk to the payments/subscription provider only through
//! [`PaymentGateway`]. Vendor request shaping (minor units, field names,
//! idempotency headers) belongs to the adapter implementing the trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use super::model::PauseBehavior;
use super::period::BillingInterval;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayCustomer {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CustomerParams {
    pub email: Option<String>,
    pub name: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySubscriptionItem {
    pub id: String,
    pub price_id: String,
    pub quantity: u32,
}

/// Subscription state as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySubscription {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub items: Vec<GatewaySubscriptionItem>,
}

impl GatewaySubscription {
    /// First subscription item; plan and quantity changes target it.
    #[must_use]
    pub fn primary_item(&self) -> Option<&GatewaySubscriptionItem> {
        self.items.first()
    }
}

#[derive(Debug, Clone)]
pub struct CreateSubscriptionParams {
    pub customer_id: String,
    pub price_id: String,
    pub quantity: u32,
    pub trial_days: Option<u32>,
    pub payment_method_id: Option<String>,
    pub cancel_at_period_end: bool,
    pub coupon_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Trial end override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialEnd {
    /// End the trial immediately.
    Now,
    /// End the trial at the given instant.
    At(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationBehavior {
    CreateProrations,
    None,
    AlwaysInvoice,
}

impl ProrationBehavior {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateProrations => "create_prorations",
            Self::None => "none",
            Self::AlwaysInvoice => "always_invoice",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionItemUpdate {
    pub item_id: String,
    pub price_id: Option<String>,
    pub quantity: Option<u32>,
}

/// Partial subscription update pushed to the gateway.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSubscriptionParams {
    pub items: Vec<SubscriptionItemUpdate>,
    pub cancel_at_period_end: Option<bool>,
    pub trial_end: Option<TrialEnd>,
    /// `Some(None)` clears an existing pause.
    pub pause_collection: Option<Option<PauseBehavior>>,
    pub proration_behavior: Option<ProrationBehavior>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayInvoice {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    pub total: Decimal,
    pub amount_paid: Decimal,
    pub amount_due: Decimal,
}

#[derive(Debug, Clone)]
pub struct CreateInvoiceParams {
    pub customer_id: String,
    pub currency: String,
    pub subscription_id: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateInvoiceItemParams {
    pub customer_id: String,
    pub invoice_id: String,
    pub description: String,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayInvoiceItem {
    pub id: String,
    pub invoice_id: String,
    pub amount: Decimal,
}

/// Payment intent as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPaymentIntent {
    pub id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub customer_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatePaymentIntentParams {
    pub amount: Decimal,
    pub currency: String,
    pub customer_id: Option<String>,
    pub payment_method_id: Option<String>,
    /// Confirm immediately with the given payment method.
    pub confirm: bool,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub id: String,
    pub payment_intent_id: String,
    pub amount: Decimal,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct CreateRefundParams {
    pub payment_intent_id: String,
    pub amount: Decimal,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPaymentMethod {
    pub id: String,
    pub kind: String,
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayProduct {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPrice {
    pub id: String,
    pub product_id: String,
    pub unit_amount: Decimal,
    pub currency: String,
    pub interval: Option<BillingInterval>,
    pub interval_count: u32,
}

#[derive(Debug, Clone)]
pub struct CreatePriceParams {
    pub product_id: String,
    pub unit_amount: Decimal,
    pub currency: String,
    pub interval: Option<BillingInterval>,
    pub interval_count: u32,
}

#[derive(Debug, Clone)]
pub struct UsageRecordParams {
    pub subscription_item_id: String,
    pub quantity: u64,
    pub action: super::model::UsageAction,
    pub timestamp: DateTime<Utc>,
}

/// Operations required from the payments/subscription provider.
///
/// Every failure surfaces as [`crate::BillflowError::Gateway`] with the
/// vendor error kept as its cause.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    // Customers
    async fn create_customer(&self, params: CustomerParams) -> Result<GatewayCustomer>;
    async fn get_customer(&self, customer_id: &str) -> Result<GatewayCustomer>;
    async fn update_customer(&self, customer_id: &str, params: CustomerParams) -> Result<GatewayCustomer>;
    async fn delete_customer(&self, customer_id: &str) -> Result<()>;

    // Subscriptions
    async fn create_subscription(&self, params: CreateSubscriptionParams) -> Result<GatewaySubscription>;
    async fn get_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription>;
    async fn update_subscription(
        &self,
        subscription_id: &str,
        params: UpdateSubscriptionParams,
    ) -> Result<GatewaySubscription>;
    /// Hard-cancel immediately.
    async fn cancel_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription>;
    /// Clear a scheduled cancellation.
    async fn resume_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription>;
    async fn list_subscriptions(&self, customer_id: &str) -> Result<Vec<GatewaySubscription>>;

    // Invoices
    async fn create_invoice(&self, params: CreateInvoiceParams) -> Result<GatewayInvoice>;
    async fn create_invoice_item(&self, params: CreateInvoiceItemParams) -> Result<GatewayInvoiceItem>;
    async fn delete_invoice_item(&self, item_id: &str) -> Result<()>;
    async fn finalize_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice>;
    async fn pay_invoice(&self, invoice_id: &str, payment_method_id: Option<&str>) -> Result<GatewayInvoice>;
    async fn void_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice>;

    // Payment intents
    async fn create_payment_intent(&self, params: CreatePaymentIntentParams) -> Result<GatewayPaymentIntent>;
    async fn get_payment_intent(&self, intent_id: &str) -> Result<GatewayPaymentIntent>;
    async fn confirm_payment_intent(
        &self,
        intent_id: &str,
        payment_method_id: Option<&str>,
    ) -> Result<GatewayPaymentIntent>;
    async fn capture_payment_intent(&self, intent_id: &str) -> Result<GatewayPaymentIntent>;
    async fn cancel_payment_intent(&self, intent_id: &str) -> Result<GatewayPaymentIntent>;

    // Refunds
    async fn create_refund(&self, params: CreateRefundParams) -> Result<GatewayRefund>;
    async fn get_refund(&self, refund_id: &str) -> Result<GatewayRefund>;

    // Payment methods
    async fn attach_payment_method(&self, payment_method_id: &str, customer_id: &str) -> Result<GatewayPaymentMethod>;
    async fn detach_payment_method(&self, payment_method_id: &str) -> Result<GatewayPaymentMethod>;
    async fn list_payment_methods(&self, customer_id: &str) -> Result<Vec<GatewayPaymentMethod>>;

    // Catalog
    async fn create_product(&self, name: &str) -> Result<GatewayProduct>;
    async fn get_product(&self, product_id: &str) -> Result<GatewayProduct>;
    async fn create_price(&self, params: CreatePriceParams) -> Result<GatewayPrice>;
    async fn get_price(&self, price_id: &str) -> Result<GatewayPrice>;

    // Metering
    async fn create_usage_record(&self, params: UsageRecordParams) -> Result<()>;
}
