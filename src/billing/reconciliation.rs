//! Billing reconciliation engine.
//!
//! Closes billing periods into invoices, aggregates revenue metrics, applies
//! customer credit and retries failed invoice payments.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use super::error::BillingError;
use super::gateway::{CreatePaymentIntentParams, PaymentGateway};
use super::model::{
    CustomerStatus, Invoice, InvoiceLineItem, InvoiceStatus, LineItemKind, Payment, PaymentStatus,
    Plan, Subscription, SubscriptionStatus, total_usage,
};
use super::money::{normalize_currency, round_money};
use super::period::monthly_amount;
use super::proration::{calculate_proration, clamp_to_period, ProratedAmount};
use super::storage::BillingStore;

const TARGET: &str = "billflow::billing::reconciliation";
const CHURN_WINDOW_DAYS: i64 = 30;

/// Headline billing metrics for one currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingOverview {
    pub currency: String,
    /// Captured payments net of refunds.
    pub total_revenue: Decimal,
    /// Amount due on open invoices.
    pub total_outstanding: Decimal,
    pub active_subscriptions: usize,
    pub mrr: Decimal,
    pub arr: Decimal,
    /// Percent of subscriptions active 30 days ago that ended since.
    pub churn_rate: Decimal,
    pub average_revenue_per_customer: Decimal,
}

/// Half-open time window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateRange {
    #[must_use]
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at < self.to
    }
}

/// Revenue split by source over a window.
///
/// `refunds` is reported as a negative figure; `total` already has it
/// subtracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueBreakdown {
    pub currency: String,
    pub subscriptions: Decimal,
    pub one_time: Decimal,
    pub usage: Decimal,
    pub refunds: Decimal,
    pub total: Decimal,
}

/// Counts from a renewal sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalSweepResult {
    pub invoiced: usize,
    pub failed: usize,
}

/// Billing reconciliation operations.
pub struct BillingEngine<S: BillingStore, G: PaymentGateway> {
    store: S,
    gateway: G,
}

impl<S: BillingStore, G: PaymentGateway> BillingEngine<S, G> {
    /// Create a new billing engine.
    #[must_use]
    pub fn new(store: S, gateway: G) -> Self {
        Self { store, gateway }
    }

    /// Invoice the current period of an active subscription and open the next one.
    ///
    /// Returns `None` without side effects if the subscription is not active.
    /// The invoice and the period advance are committed together; a
    /// subscription flagged to cancel at period end is ended instead of
    /// advanced.
    pub async fn process_end_of_period_billing(&self, subscription_id: &str) -> Result<Option<Invoice>> {
        let sub = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound {
                subscription_id: subscription_id.to_string(),
            })?;
        if sub.status != SubscriptionStatus::Active {
            tracing::debug!(
                target: TARGET,
                subscription_id = %sub.id,
                status = %sub.status,
                "Skipping end-of-period billing for inactive subscription"
            );
            return Ok(None);
        }
        let plan = self.load_plan(&sub.plan_id).await?;

        let usage = self
            .store
            .list_usage(&sub.id, sub.current_period_start, sub.current_period_end)
            .await?;
        let invoice = build_period_invoice(&sub, &plan, total_usage(&usage));

        let mut next = sub.clone();
        next.record_event("period_invoiced", invoice.id.clone());
        if sub.cancel_at_period_end {
            next.status = SubscriptionStatus::Canceled;
            next.ended_at = Some(sub.current_period_end);
            next.canceled_at.get_or_insert(sub.current_period_end);
            next.cancel_at_period_end = false;
        } else {
            next.current_period_start = sub.current_period_end;
            next.current_period_end = plan.period_end(sub.current_period_end);
        }

        if !self.store.close_period(&invoice, &next, sub.version).await? {
            return Err(BillingError::ConcurrentModification {
                entity: "subscription",
                id: sub.id,
            }
            .into());
        }

        tracing::info!(
            target: TARGET,
            subscription_id = %sub.id,
            invoice_id = %invoice.id,
            total = %invoice.total,
            ended = sub.cancel_at_period_end,
            "Billing period closed"
        );
        Ok(Some(invoice))
    }

    /// Close every active period that ended at or before `now`.
    pub async fn process_due_renewals_at(&self, now: DateTime<Utc>) -> Result<RenewalSweepResult> {
        let due: Vec<Subscription> = self
            .store
            .list_subscriptions_by_status(SubscriptionStatus::Active)
            .await?
            .into_iter()
            .filter(|s| s.current_period_end <= now)
            .collect();

        let mut result = RenewalSweepResult::default();
        for sub in due {
            match self.process_end_of_period_billing(&sub.id).await {
                Ok(Some(_)) => result.invoiced += 1,
                Ok(None) => {}
                Err(error) => {
                    result.failed += 1;
                    tracing::warn!(
                        target: TARGET,
                        subscription_id = %sub.id,
                        error = %error,
                        "Failed to close billing period"
                    );
                }
            }
        }
        Ok(result)
    }

    /// Headline metrics for `currency`.
    pub async fn get_billing_overview(&self, currency: &str) -> Result<BillingOverview> {
        self.get_billing_overview_at(currency, Utc::now()).await
    }

    /// [`Self::get_billing_overview`] with an explicit clock.
    pub async fn get_billing_overview_at(&self, currency: &str, now: DateTime<Utc>) -> Result<BillingOverview> {
        let currency = normalize_currency(currency);
        let (payments, invoices, subscriptions, plans, customers) = tokio::try_join!(
            self.store.list_payments(),
            self.store.list_invoices(),
            self.store.list_subscriptions(),
            self.store.list_plans(),
            self.store.list_customers(),
        )?;
        let plans: HashMap<String, Plan> = plans.into_iter().map(|p| (p.id.clone(), p)).collect();

        let total_revenue: Decimal = payments
            .iter()
            .filter(|p| p.currency == currency)
            .map(Payment::net_amount)
            .sum();

        let total_outstanding: Decimal = invoices
            .iter()
            .filter(|i| i.currency == currency && i.status == InvoiceStatus::Open)
            .map(|i| i.amount_due)
            .sum();

        let subscriptions: Vec<Subscription> = subscriptions
            .into_iter()
            .filter(|s| s.currency == currency)
            .collect();

        let active: Vec<&Subscription> = subscriptions
            .iter()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .collect();

        let mrr: Decimal = active
            .iter()
            .filter_map(|s| {
                plans
                    .get(&s.plan_id)
                    .map(|plan| monthly_amount(s.period_amount(plan), plan.interval, plan.interval_count))
            })
            .sum();
        let mrr = round_money(mrr);

        let cutoff = now - Duration::days(CHURN_WINDOW_DAYS);
        let canceled_recently = subscriptions
            .iter()
            .filter(|s| s.is_canceled() && ended_at(s).is_some_and(|at| at >= cutoff && at <= now))
            .count();
        let active_at_cutoff = subscriptions
            .iter()
            .filter(|s| s.created_at <= cutoff && !ended_at(s).is_some_and(|at| at < cutoff))
            .count();
        let churn_rate = if active_at_cutoff == 0 {
            Decimal::ZERO
        } else {
            round_money(
                Decimal::from(canceled_recently) / Decimal::from(active_at_cutoff) * Decimal::from(100),
            )
        };

        let active_customers = customers
            .iter()
            .filter(|c| c.status == CustomerStatus::Active)
            .count();
        let average_revenue_per_customer = if active_customers == 0 {
            Decimal::ZERO
        } else {
            round_money(total_revenue / Decimal::from(active_customers))
        };

        Ok(BillingOverview {
            currency,
            total_revenue: round_money(total_revenue),
            total_outstanding: round_money(total_outstanding),
            active_subscriptions: active.len(),
            mrr,
            arr: round_money(mrr * Decimal::from(12)),
            churn_rate,
            average_revenue_per_customer,
        })
    }

    /// Revenue by source over `range`.
    ///
    /// Paid invoices are attributed by `paid_at`: usage lines to `usage`,
    /// other lines on subscription invoices to `subscriptions`, the rest to
    /// `one_time`. Captured payments without an invoice count as one-time.
    pub async fn get_revenue_breakdown(&self, range: DateRange, currency: &str) -> Result<RevenueBreakdown> {
        let currency = normalize_currency(currency);
        let (invoices, payments, refunds) = tokio::try_join!(
            self.store.list_invoices(),
            self.store.list_payments(),
            self.store.list_refunds(),
        )?;

        let mut subscriptions = Decimal::ZERO;
        let mut one_time = Decimal::ZERO;
        let mut usage = Decimal::ZERO;

        for invoice in invoices.iter().filter(|i| {
            i.currency == currency
                && i.status == InvoiceStatus::Paid
                && i.paid_at.is_some_and(|at| range.contains(at))
        }) {
            for line in &invoice.line_items {
                match line.kind {
                    LineItemKind::Usage => usage += line.amount,
                    _ if invoice.subscription_id.is_some() => subscriptions += line.amount,
                    _ => one_time += line.amount,
                }
            }
        }

        one_time += payments
            .iter()
            .filter(|p| {
                p.currency == currency
                    && p.invoice_id.is_none()
                    && p.status.is_captured()
                    && range.contains(p.created_at)
            })
            .map(|p| p.amount)
            .sum::<Decimal>();

        let refunded: Decimal = refunds
            .iter()
            .filter(|r| r.currency == currency && range.contains(r.created_at))
            .map(|r| r.amount)
            .sum();

        let subscriptions = round_money(subscriptions);
        let one_time = round_money(one_time);
        let usage = round_money(usage);
        let refunded = round_money(refunded);

        Ok(RevenueBreakdown {
            currency,
            subscriptions,
            one_time,
            usage,
            refunds: -refunded,
            total: subscriptions + one_time + usage - refunded,
        })
    }

    /// Prorate moving a subscription to `new_plan_id` at `at` (default now).
    pub async fn calculate_proration(
        &self,
        subscription_id: &str,
        new_plan_id: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<ProratedAmount> {
        let sub = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound {
                subscription_id: subscription_id.to_string(),
            })?;
        let (current_plan, new_plan) =
            tokio::try_join!(self.load_plan(&sub.plan_id), self.load_plan(new_plan_id))?;

        let at = clamp_to_period(
            at.unwrap_or_else(Utc::now),
            sub.current_period_start,
            sub.current_period_end,
        );
        calculate_proration(
            sub.current_period_start,
            sub.current_period_end,
            sub.period_amount(&current_plan),
            sub.period_amount(&new_plan),
            at,
        )
    }

    /// Charge the outstanding balance of an unpaid invoice.
    ///
    /// A new confirmed payment intent is created at the gateway. The local
    /// payment only becomes `succeeded` once the gateway confirms, and the
    /// invoice is settled in the same store operation.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the invoice is paid, void, uncollectible or still a draft.
    pub async fn retry_failed_payment(&self, invoice_id: &str, payment_method_id: Option<&str>) -> Result<Payment> {
        let invoice = self.load_invoice(invoice_id).await?;
        if invoice.status == InvoiceStatus::Paid {
            return Err(BillingError::InvoiceAlreadyPaid {
                invoice_id: invoice.id,
            }
            .into());
        }
        if !invoice.status.is_collectible() {
            return Err(BillingError::InvoiceTransitionNotAllowed {
                invoice_id: invoice.id,
                status: invoice.status.to_string(),
                action: "retry payment for",
            }
            .into());
        }
        let customer = self
            .store
            .get_customer(&invoice.customer_id)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound {
                customer_id: invoice.customer_id.clone(),
            })?;

        let mut metadata = BTreeMap::new();
        metadata.insert("invoice_id".to_string(), invoice.id.clone());
        let intent = self
            .gateway
            .create_payment_intent(CreatePaymentIntentParams {
                amount: invoice.amount_due,
                currency: invoice.currency.clone(),
                customer_id: customer.gateway_customer_id.clone(),
                payment_method_id: payment_method_id.map(str::to_string),
                confirm: true,
                metadata,
            })
            .await?;
        let reported = PaymentStatus::from_intent_status(&intent.status);

        let mut payment = Payment::new(&invoice.customer_id, invoice.amount_due, &invoice.currency);
        payment.invoice_id = Some(invoice.id.clone());
        payment.gateway_payment_intent_id = Some(intent.id.clone());
        payment.payment_method_id = intent.payment_method_id.clone();

        if reported != PaymentStatus::Succeeded {
            payment.status = reported;
            payment.failure_reason = intent.last_error.clone();
            self.store.insert_payment(&payment).await?;
            tracing::warn!(
                target: TARGET,
                invoice_id = %invoice.id,
                payment_id = %payment.id,
                status = %reported,
                "Invoice payment retry did not succeed"
            );
            return Ok(payment);
        }

        self.store.insert_payment(&payment).await?;
        let settled = self
            .store
            .settle_payment(&payment.id, PaymentStatus::Pending, Utc::now())
            .await?
            .map(|s| s.payment)
            .unwrap_or(payment);

        tracing::info!(
            target: TARGET,
            invoice_id = %invoice.id,
            payment_id = %settled.id,
            amount = %settled.amount,
            "Invoice payment retry succeeded"
        );
        Ok(settled)
    }

    /// Grant customer credit.
    pub async fn add_credits(&self, customer_id: &str, amount: Decimal) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount {
                message: "credit must be positive".to_string(),
            }
            .into());
        }
        self.store.add_credits(customer_id, round_money(amount)).await
    }

    /// Settle as much of an invoice as the customer's credit covers.
    ///
    /// Applies `min(available credit, amount due)`; returns the invoice
    /// unchanged when that is zero.
    pub async fn apply_credits(&self, customer_id: &str, invoice_id: &str) -> Result<Invoice> {
        let invoice = self.load_invoice(invoice_id).await?;
        if invoice.customer_id != customer_id {
            return Err(BillingError::InvoiceNotFound {
                invoice_id: invoice_id.to_string(),
            }
            .into());
        }

        if !invoice.status.is_collectible() {
            return Err(BillingError::InvoiceTransitionNotAllowed {
                invoice_id: invoice.id,
                status: invoice.status.to_string(),
                action: "apply credit to",
            }
            .into());
        }

        let available = self.store.available_credits(customer_id).await?;
        let credit = available.min(invoice.amount_due);
        if credit <= Decimal::ZERO {
            return Ok(invoice);
        }

        let updated = self.store.apply_credit(customer_id, invoice_id, credit).await?;
        tracing::info!(
            target: TARGET,
            customer_id,
            invoice_id,
            credit = %credit,
            "Customer credit applied"
        );
        Ok(updated)
    }

    async fn load_plan(&self, plan_id: &str) -> Result<Plan> {
        self.store.get_plan(plan_id).await?.ok_or_else(|| {
            BillingError::PlanNotFound {
                plan_id: plan_id.to_string(),
            }
            .into()
        })
    }

    async fn load_invoice(&self, invoice_id: &str) -> Result<Invoice> {
        self.store.get_invoice(invoice_id).await?.ok_or_else(|| {
            BillingError::InvoiceNotFound {
                invoice_id: invoice_id.to_string(),
            }
            .into()
        })
    }
}

/// When a subscription stopped, if it has.
fn ended_at(sub: &Subscription) -> Option<DateTime<Utc>> {
    sub.ended_at.or(sub.canceled_at.filter(|_| sub.is_canceled()))
}

/// Open invoice for one period: the recurring line plus metered usage.
fn build_period_invoice(sub: &Subscription, plan: &Plan, usage_quantity: u64) -> Invoice {
    let mut invoice = Invoice::draft(&sub.customer_id, &sub.currency);
    invoice.subscription_id = Some(sub.id.clone());
    invoice.period_start = Some(sub.current_period_start);
    invoice.period_end = Some(sub.current_period_end);
    invoice.due_date = Some(sub.current_period_end);

    invoice.line_items.push(InvoiceLineItem::new(
        format!("{} ({} x {})", plan.name, sub.quantity, plan.amount),
        LineItemKind::Subscription,
        Decimal::from(sub.quantity),
        plan.amount,
    ));
    if let Some(unit_amount) = plan.usage_unit_amount {
        if usage_quantity > 0 {
            invoice.line_items.push(InvoiceLineItem::new(
                format!("Usage ({} units)", usage_quantity),
                LineItemKind::Usage,
                Decimal::from(usage_quantity),
                unit_amount,
            ));
        }
    }

    invoice.recalculate();
    invoice.status = InvoiceStatus::Open;
    if invoice.total.is_zero() {
        invoice.mark_paid(sub.current_period_end);
    }
    invoice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::model::{Customer, UsageAction, UsageRecord};
    use crate::billing::period::BillingInterval;
    use crate::billing::storage::memory::InMemoryBillingStore;
    use crate::billing::storage::{CreditStore, InvoiceStore, PaymentStore, SubscriptionStore, UsageStore};
    use crate::error::BillflowError;
    use crate::testing::MockPaymentGateway;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn subscription(id: &str, plan: &Plan, status: SubscriptionStatus) -> Subscription {
        Subscription {
            id: id.to_string(),
            customer_id: "cus_1".to_string(),
            plan_id: plan.id.clone(),
            quantity: 2,
            currency: "usd".to_string(),
            status,
            current_period_start: t0(),
            current_period_end: plan.period_end(t0()),
            cancel_at_period_end: false,
            canceled_at: None,
            ended_at: None,
            trial_start: None,
            trial_end: None,
            pause_behavior: None,
            resumes_at: None,
            gateway_subscription_id: None,
            metadata: BTreeMap::new(),
            version: 0,
            created_at: t0() - Duration::days(60),
        }
    }

    async fn setup() -> (BillingEngine<InMemoryBillingStore, MockPaymentGateway>, InMemoryBillingStore, Plan) {
        let store = InMemoryBillingStore::new();
        let plan = Plan::new("pro", Decimal::from(25), "usd", BillingInterval::Month)
            .with_usage_unit_amount(Decimal::new(10, 2));
        store
            .seed(
                vec![Customer::new("cus_1", "a@example.com")],
                vec![
                    plan.clone(),
                    Plan::new("yearly", Decimal::from(120), "usd", BillingInterval::Year),
                ],
            )
            .await;
        (BillingEngine::new(store.clone(), MockPaymentGateway::new()), store, plan)
    }

    #[tokio::test]
    async fn test_end_of_period_invoice_and_advance() {
        let (engine, store, plan) = setup().await;
        let sub = subscription("sub_1", &plan, SubscriptionStatus::Active);
        store.insert_subscription(&sub).await.unwrap();
        for (q, key) in [(100u64, "a"), (50, "b")] {
            store
                .record_usage(&UsageRecord {
                    id: key.to_string(),
                    subscription_id: sub.id.clone(),
                    quantity: q,
                    action: UsageAction::Increment,
                    timestamp: t0() + Duration::days(3),
                    idempotency_key: None,
                })
                .await
                .unwrap();
        }

        let invoice = engine.process_end_of_period_billing(&sub.id).await.unwrap().unwrap();
        // 2 x 25 + 150 x 0.10
        assert_eq!(invoice.total, Decimal::from(65));
        assert_eq!(invoice.status, InvoiceStatus::Open);
        assert_eq!(invoice.amount_paid + invoice.amount_due, invoice.total);
        assert_eq!(invoice.line_items.len(), 2);

        let advanced = store.get_subscription(&sub.id).await.unwrap().unwrap();
        assert_eq!(advanced.current_period_start, sub.current_period_end);
        assert!(advanced.current_period_end > sub.current_period_end);
        assert_eq!(advanced.version, sub.version + 1);
    }

    #[tokio::test]
    async fn test_end_of_period_skips_inactive() {
        let (engine, store, plan) = setup().await;
        let sub = subscription("sub_paused", &plan, SubscriptionStatus::Paused);
        store.insert_subscription(&sub).await.unwrap();
        assert!(engine.process_end_of_period_billing(&sub.id).await.unwrap().is_none());
        assert!(store.list_invoices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_of_period_ends_scheduled_cancellation() {
        let (engine, store, plan) = setup().await;
        let mut sub = subscription("sub_1", &plan, SubscriptionStatus::Active);
        sub.cancel_at_period_end = true;
        store.insert_subscription(&sub).await.unwrap();

        engine.process_end_of_period_billing(&sub.id).await.unwrap().unwrap();
        let ended = store.get_subscription(&sub.id).await.unwrap().unwrap();
        assert_eq!(ended.status, SubscriptionStatus::Canceled);
        assert_eq!(ended.ended_at, Some(sub.current_period_end));
        assert!(engine.process_end_of_period_billing(&sub.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renewal_sweep() {
        let (engine, store, plan) = setup().await;
        store
            .insert_subscription(&subscription("sub_due", &plan, SubscriptionStatus::Active))
            .await
            .unwrap();
        let mut later = subscription("sub_later", &plan, SubscriptionStatus::Active);
        later.current_period_end = t0() + Duration::days(365);
        store.insert_subscription(&later).await.unwrap();

        let result = engine.process_due_renewals_at(t0() + Duration::days(40)).await.unwrap();
        assert_eq!(result, RenewalSweepResult { invoiced: 1, failed: 0 });
    }

    #[tokio::test]
    async fn test_billing_overview() {
        let (engine, store, plan) = setup().await;
        let now = t0() + Duration::days(10);

        store
            .insert_subscription(&subscription("sub_a", &plan, SubscriptionStatus::Active))
            .await
            .unwrap();
        let mut yearly = subscription("sub_y", &plan, SubscriptionStatus::Active);
        yearly.plan_id = "yearly".to_string();
        yearly.quantity = 1;
        store.insert_subscription(&yearly).await.unwrap();
        let mut churned = subscription("sub_c", &plan, SubscriptionStatus::Canceled);
        churned.ended_at = Some(now - Duration::days(5));
        store.insert_subscription(&churned).await.unwrap();

        let mut paid = Payment::new("cus_1", Decimal::from(100), "usd");
        paid.status = PaymentStatus::Succeeded;
        store.insert_payment(&paid).await.unwrap();
        let mut failed = Payment::new("cus_1", Decimal::from(40), "usd");
        failed.status = PaymentStatus::Failed;
        store.insert_payment(&failed).await.unwrap();

        let mut open = Invoice::draft("cus_1", "usd");
        open.status = InvoiceStatus::Open;
        open.total = Decimal::from(30);
        open.amount_due = Decimal::from(30);
        store.insert_invoice(&open).await.unwrap();

        let overview = engine.get_billing_overview_at("USD", now).await.unwrap();
        assert_eq!(overview.total_revenue, Decimal::from(100));
        assert_eq!(overview.total_outstanding, Decimal::from(30));
        assert_eq!(overview.active_subscriptions, 2);
        // 2 x 25 monthly + 120 / 12
        assert_eq!(overview.mrr, Decimal::from(60));
        assert_eq!(overview.arr, Decimal::from(720));
        // 1 of 3 subscriptions alive 30 days ago ended since
        assert_eq!(overview.churn_rate, Decimal::new(3333, 2));
        assert_eq!(overview.average_revenue_per_customer, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_overview_empty_denominators() {
        let (engine, _, _) = setup().await;
        let overview = engine.get_billing_overview("eur").await.unwrap();
        assert_eq!(overview.churn_rate, Decimal::ZERO);
        assert_eq!(overview.mrr, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_revenue_breakdown() {
        let (engine, store, plan) = setup().await;
        let sub = subscription("sub_1", &plan, SubscriptionStatus::Active);
        store.insert_subscription(&sub).await.unwrap();
        store
            .record_usage(&UsageRecord {
                id: "u1".to_string(),
                subscription_id: sub.id.clone(),
                quantity: 100,
                action: UsageAction::Set,
                timestamp: t0() + Duration::days(1),
                idempotency_key: None,
            })
            .await
            .unwrap();
        let mut invoice = engine.process_end_of_period_billing(&sub.id).await.unwrap().unwrap();
        invoice.mark_paid(t0() + Duration::days(31));
        assert!(store.compare_and_save_invoice(&invoice, invoice.version).await.unwrap());

        let mut one_off = Payment::new("cus_1", Decimal::from(15), "usd");
        one_off.status = PaymentStatus::Succeeded;
        one_off.created_at = t0() + Duration::days(5);
        store.insert_payment(&one_off).await.unwrap();
        store
            .apply_refund(&crate::billing::model::Refund {
                id: "re_1".to_string(),
                payment_id: one_off.id.clone(),
                customer_id: "cus_1".to_string(),
                amount: Decimal::from(5),
                currency: "usd".to_string(),
                reason: None,
                gateway_refund_id: None,
                created_at: t0() + Duration::days(6),
            })
            .await
            .unwrap();

        let range = DateRange::new(t0(), t0() + Duration::days(60));
        let breakdown = engine.get_revenue_breakdown(range, "usd").await.unwrap();
        assert_eq!(breakdown.subscriptions, Decimal::from(50));
        assert_eq!(breakdown.usage, Decimal::from(10));
        assert_eq!(breakdown.one_time, Decimal::from(15));
        assert_eq!(breakdown.refunds, Decimal::from(-5));
        assert_eq!(breakdown.total, Decimal::from(70));
    }

    #[tokio::test]
    async fn test_retry_failed_payment_settles_invoice() {
        let (engine, store, _) = setup().await;
        let mut invoice = Invoice::draft("cus_1", "usd");
        invoice.status = InvoiceStatus::PastDue;
        invoice.total = Decimal::from(40);
        invoice.amount_due = Decimal::from(40);
        store.insert_invoice(&invoice).await.unwrap();

        let payment = engine.retry_failed_payment(&invoice.id, Some("pm_card")).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        let settled = store.get_invoice(&invoice.id).await.unwrap().unwrap();
        assert_eq!(settled.status, InvoiceStatus::Paid);
        assert_eq!(settled.amount_due, Decimal::ZERO);

        let err = engine.retry_failed_payment(&invoice.id, None).await.unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_apply_credits() {
        let (engine, store, _) = setup().await;
        let mut invoice = Invoice::draft("cus_1", "usd");
        invoice.status = InvoiceStatus::Open;
        invoice.total = Decimal::from(80);
        invoice.amount_due = Decimal::from(80);
        store.insert_invoice(&invoice).await.unwrap();

        let unchanged = engine.apply_credits("cus_1", &invoice.id).await.unwrap();
        assert_eq!(unchanged.amount_due, Decimal::from(80));

        engine.add_credits("cus_1", Decimal::from(100)).await.unwrap();
        let updated = engine.apply_credits("cus_1", &invoice.id).await.unwrap();
        assert_eq!(updated.status, InvoiceStatus::Paid);
        assert_eq!(updated.credit_applied, Decimal::from(80));
        assert_eq!(store.available_credits("cus_1").await.unwrap(), Decimal::from(20));
    }

    #[tokio::test]
    async fn test_apply_credits_requires_collectible_invoice() {
        let (engine, store, _) = setup().await;
        let mut draft = Invoice::draft("cus_1", "usd");
        draft.total = Decimal::from(80);
        draft.amount_due = Decimal::from(80);
        store.insert_invoice(&draft).await.unwrap();
        engine.add_credits("cus_1", Decimal::from(100)).await.unwrap();

        let err = engine.apply_credits("cus_1", &draft.id).await.unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));
        let stored = store.get_invoice(&draft.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Draft);
        assert_eq!(store.available_credits("cus_1").await.unwrap(), Decimal::from(100));
    }

    #[tokio::test]
    async fn test_calculate_proration_delegates() {
        let (engine, store, plan) = setup().await;
        let mut sub = subscription("sub_1", &plan, SubscriptionStatus::Active);
        sub.quantity = 1;
        store.insert_subscription(&sub).await.unwrap();

        let at_start = engine
            .calculate_proration(&sub.id, "yearly", Some(sub.current_period_start))
            .await
            .unwrap();
        assert_eq!(at_start.credit, Decimal::from(25));
        let past_end = engine
            .calculate_proration(&sub.id, "yearly", Some(sub.current_period_end + Duration::days(3)))
            .await
            .unwrap();
        assert_eq!(past_end.credit, Decimal::ZERO);
    }
}
