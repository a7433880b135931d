//! Billing domain entities.
//!
//! Customers, plans, subscriptions, invoices, payments, refunds and usage
//! records as persisted through the store traits in [`super::storage`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::money::round_money;
use super::period::BillingInterval;

/// Customer account status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerStatus {
    Active,
    Inactive,
    Suspended,
    Pending,
}

/// A billable customer.
///
/// Gateway identities are optional: a customer without a payment-gateway id
/// is billed locally only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub status: CustomerStatus,
    /// Payment gateway customer id (`cus_...`).
    pub gateway_customer_id: Option<String>,
    /// Ledger gateway business id.
    pub ledger_business_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Customer {
    #[must_use]
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            name: None,
            status: CustomerStatus::Active,
            gateway_customer_id: None,
            ledger_business_id: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_gateway_customer_id(mut self, id: impl Into<String>) -> Self {
        self.gateway_customer_id = Some(id.into());
        self
    }
}

/// Pricing template for subscriptions.
///
/// Immutable once referenced by a live subscription, apart from `active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// Price per unit per period, in major units.
    pub amount: Decimal,
    pub currency: String,
    pub interval: BillingInterval,
    pub interval_count: u32,
    pub trial_days: Option<u32>,
    /// Price per metered unit, if the plan bills usage.
    pub usage_unit_amount: Option<Decimal>,
    /// Deactivation blocks new subscriptions only.
    pub active: bool,
    /// Payment gateway price id (`price_...`).
    pub gateway_price_id: Option<String>,
}

impl Plan {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
        interval: BillingInterval,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            amount,
            currency: super::money::normalize_currency(&currency.into()),
            interval,
            interval_count: 1,
            trial_days: None,
            usage_unit_amount: None,
            active: true,
            gateway_price_id: None,
        }
    }

    #[must_use]
    pub fn with_trial_days(mut self, days: u32) -> Self {
        self.trial_days = Some(days);
        self
    }

    #[must_use]
    pub fn with_interval_count(mut self, count: u32) -> Self {
        self.interval_count = count;
        self
    }

    #[must_use]
    pub fn with_usage_unit_amount(mut self, amount: Decimal) -> Self {
        self.usage_unit_amount = Some(amount);
        self
    }

    #[must_use]
    pub fn with_gateway_price_id(mut self, id: impl Into<String>) -> Self {
        self.gateway_price_id = Some(id.into());
        self
    }

    /// End of a period that starts at `start`.
    #[must_use]
    pub fn period_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        super::period::advance(start, self.interval, self.interval_count)
    }
}

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Paused,
    /// Terminal.
    Canceled,
    IncompleteExpired,
}

impl SubscriptionStatus {
    /// Parse a status string reported by the payment gateway.
    #[must_use]
    pub fn from_gateway(status: &str) -> Self {
        match status {
            "trialing" => Self::Trialing,
            "active" => Self::Active,
            "past_due" => Self::PastDue,
            "unpaid" => Self::Unpaid,
            "paused" => Self::Paused,
            "canceled" => Self::Canceled,
            "incomplete_expired" => Self::IncompleteExpired,
            _ => Self::Incomplete,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
            Self::Paused => "paused",
            Self::Canceled => "canceled",
            Self::IncompleteExpired => "incomplete_expired",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the payment gateway treats invoices generated while paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseBehavior {
    KeepAsDraft,
    MarkUncollectible,
    Void,
}

impl PauseBehavior {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeepAsDraft => "keep_as_draft",
            Self::MarkUncollectible => "mark_uncollectible",
            Self::Void => "void",
        }
    }
}

/// The central mutable billing entity.
///
/// `current_period_end > current_period_start` always holds. `version` is
/// bumped by the store on every successful compare-and-save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub customer_id: String,
    pub plan_id: String,
    pub quantity: u32,
    pub currency: String,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub pause_behavior: Option<PauseBehavior>,
    pub resumes_at: Option<DateTime<Utc>>,
    /// Payment gateway subscription id (`sub_...`).
    pub gateway_subscription_id: Option<String>,
    /// Append-only audit trail of lifecycle events.
    pub metadata: BTreeMap<String, String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record a lifecycle event in the metadata trail.
    ///
    /// Keys are never overwritten; a repeated event gets a numeric suffix.
    pub fn record_event(&mut self, event: &str, value: impl Into<String>) {
        let mut key = event.to_string();
        let mut n = 1;
        while self.metadata.contains_key(&key) {
            n += 1;
            key = format!("{}.{}", event, n);
        }
        self.metadata.insert(key, value.into());
    }

    /// Shallow-merge caller metadata.
    pub fn merge_metadata(&mut self, metadata: BTreeMap<String, String>) {
        self.metadata.extend(metadata);
    }

    /// Recurring amount per period (`plan.amount x quantity`).
    #[must_use]
    pub fn period_amount(&self, plan: &Plan) -> Decimal {
        plan.amount * Decimal::from(self.quantity)
    }
}

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
    PastDue,
}

impl InvoiceStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Open => "open",
            Self::Paid => "paid",
            Self::Void => "void",
            Self::Uncollectible => "uncollectible",
            Self::PastDue => "past_due",
        }
    }

    /// Whether the invoice still expects money.
    #[must_use]
    pub fn is_collectible(&self) -> bool {
        matches!(self, Self::Open | Self::PastDue)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a line item bills for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemKind {
    Subscription,
    Usage,
    Proration,
    OneTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub id: String,
    pub description: String,
    pub kind: LineItemKind,
    pub quantity: Decimal,
    pub unit_amount: Decimal,
    /// `round(quantity x unit_amount)`.
    pub amount: Decimal,
    pub gateway_item_id: Option<String>,
}

impl InvoiceLineItem {
    #[must_use]
    pub fn new(
        description: impl Into<String>,
        kind: LineItemKind,
        quantity: Decimal,
        unit_amount: Decimal,
    ) -> Self {
        Self {
            id: format!("li_{}", uuid::Uuid::new_v4().simple()),
            description: description.into(),
            kind,
            quantity,
            unit_amount,
            amount: round_money(quantity * unit_amount),
            gateway_item_id: None,
        }
    }
}

/// Invoice with running balance.
///
/// `amount_paid + amount_due == total` after every mutation and
/// `amount_due` never drops below zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub status: InvoiceStatus,
    pub currency: String,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub amount_paid: Decimal,
    pub amount_due: Decimal,
    /// Portion of `amount_paid` settled from customer credit.
    pub credit_applied: Decimal,
    pub line_items: Vec<InvoiceLineItem>,
    pub due_date: Option<DateTime<Utc>>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub gateway_invoice_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    /// New empty draft invoice.
    #[must_use]
    pub fn draft(customer_id: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            id: format!("inv_{}", uuid::Uuid::new_v4().simple()),
            customer_id: customer_id.into(),
            subscription_id: None,
            status: InvoiceStatus::Draft,
            currency: super::money::normalize_currency(&currency.into()),
            subtotal: Decimal::ZERO,
            tax: Decimal::ZERO,
            total: Decimal::ZERO,
            amount_paid: Decimal::ZERO,
            amount_due: Decimal::ZERO,
            credit_applied: Decimal::ZERO,
            line_items: Vec::new(),
            due_date: None,
            period_start: None,
            period_end: None,
            gateway_invoice_id: None,
            paid_at: None,
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// Recompute subtotal, total and amount due from the line items.
    pub fn recalculate(&mut self) {
        self.subtotal = round_money(self.line_items.iter().map(|li| li.amount).sum());
        self.total = round_money(self.subtotal + self.tax);
        self.amount_due = (self.total - self.amount_paid).max(Decimal::ZERO);
    }

    /// Apply a payment, clamped to the amount due. Returns the applied amount.
    ///
    /// Flips the invoice to `paid` when the balance reaches exactly zero.
    pub fn apply_payment(&mut self, amount: Decimal, at: DateTime<Utc>) -> Decimal {
        let applied = round_money(amount.min(self.amount_due).max(Decimal::ZERO));
        self.amount_paid += applied;
        self.amount_due -= applied;
        if self.amount_due.is_zero() && self.status != InvoiceStatus::Paid {
            self.status = InvoiceStatus::Paid;
            self.paid_at = Some(at);
        }
        applied
    }

    /// Settle the whole remaining balance.
    pub fn mark_paid(&mut self, at: DateTime<Utc>) {
        self.amount_paid = self.total;
        self.amount_due = Decimal::ZERO;
        self.status = InvoiceStatus::Paid;
        self.paid_at.get_or_insert(at);
    }
}

/// Internal payment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    /// Map a payment-intent status reported by the gateway.
    #[must_use]
    pub fn from_intent_status(status: &str) -> Self {
        match status {
            "succeeded" => Self::Succeeded,
            "processing" => Self::Processing,
            "requires_payment_method" | "requires_confirmation" | "requires_action" => {
                Self::Pending
            }
            "canceled" => Self::Canceled,
            _ => Self::Failed,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Refunded => "refunded",
            Self::PartiallyRefunded => "partially_refunded",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Succeeded | Self::Failed | Self::Canceled => 2,
            Self::PartiallyRefunded => 3,
            Self::Refunded => 4,
        }
    }

    /// Whether a gateway-reported status may replace this one.
    ///
    /// Statuses only move forward. A failed payment only leaves `failed`
    /// through an explicit retry, which is not a gateway report.
    #[must_use]
    pub fn can_advance_to(&self, next: PaymentStatus) -> bool {
        if *self == next {
            return false;
        }
        match self {
            Self::Pending | Self::Processing => next.rank() > self.rank(),
            Self::Succeeded => matches!(next, Self::PartiallyRefunded | Self::Refunded),
            Self::PartiallyRefunded => next == Self::Refunded,
            Self::Failed | Self::Canceled | Self::Refunded => false,
        }
    }

    /// Whether money was captured (possibly later refunded).
    #[must_use]
    pub fn is_captured(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallyRefunded | Self::Refunded)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A payment against a customer, optionally settling an invoice.
///
/// `refunded_amount <= amount` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub customer_id: String,
    pub invoice_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub refunded_amount: Decimal,
    /// Payment gateway intent id (`pi_...`).
    pub gateway_payment_intent_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub failure_reason: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    #[must_use]
    pub fn new(customer_id: impl Into<String>, amount: Decimal, currency: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("pay_{}", uuid::Uuid::new_v4().simple()),
            customer_id: customer_id.into(),
            invoice_id: None,
            amount: round_money(amount),
            currency: super::money::normalize_currency(&currency.into()),
            status: PaymentStatus::Pending,
            refunded_amount: Decimal::ZERO,
            gateway_payment_intent_id: None,
            payment_method_id: None,
            failure_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Amount still refundable.
    #[must_use]
    pub fn refundable_amount(&self) -> Decimal {
        (self.amount - self.refunded_amount).max(Decimal::ZERO)
    }

    /// Captured amount net of refunds.
    #[must_use]
    pub fn net_amount(&self) -> Decimal {
        if self.status.is_captured() {
            self.refundable_amount()
        } else {
            Decimal::ZERO
        }
    }
}

/// An immutable refund of (part of) a payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub payment_id: String,
    pub customer_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub reason: Option<String>,
    pub gateway_refund_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Whether a usage quantity adds to or replaces the running total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageAction {
    Increment,
    Set,
}

/// Append-only metering event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub subscription_id: String,
    pub quantity: u64,
    pub action: UsageAction,
    pub timestamp: DateTime<Utc>,
    /// Caller-supplied key; duplicates are rejected when present.
    pub idempotency_key: Option<String>,
}

/// Total metered quantity for an ordered sequence of usage records.
///
/// `set` replaces the running total, `increment` adds to it.
#[must_use]
pub fn total_usage<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> u64 {
    let mut sorted: Vec<&UsageRecord> = records.into_iter().collect();
    sorted.sort_by_key(|r| r.timestamp);
    sorted.into_iter().fold(0u64, |total, r| match r.action {
        UsageAction::Increment => total.saturating_add(r.quantity),
        UsageAction::Set => r.quantity,
    })
}
