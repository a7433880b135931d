//! Storage traits for billing data.
//!
//! Implement these traits to persist billing state to your database. The
//! engines never lock records themselves; every read-modify-write goes
//! through a compare-and-save on the record's `version`, and the multi-record
//! operations (`close_period`, `settle_payment`, `apply_refund`,
//! `apply_credit`) must commit as one unit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::Result;
use super::model::{
    Customer, Invoice, Payment, PaymentStatus, Plan, Refund, Subscription, SubscriptionStatus,
    UsageRecord,
};

#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn get_customer(&self, customer_id: &str) -> Result<Option<Customer>>;
    async fn save_customer(&self, customer: &Customer) -> Result<()>;
    async fn list_customers(&self) -> Result<Vec<Customer>>;
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>>;
    async fn save_plan(&self, plan: &Plan) -> Result<()>;
    async fn list_plans(&self) -> Result<Vec<Plan>>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>>;

    async fn get_subscription_by_gateway_id(
        &self,
        gateway_subscription_id: &str,
    ) -> Result<Option<Subscription>>;

    /// Insert a new subscription. Fails with `InvalidState` if the id exists.
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Save only if the stored version still equals `expected_version`.
    ///
    /// On success the stored copy carries `expected_version + 1`. Returns
    /// `Ok(false)` on a version mismatch and leaves the record untouched.
    async fn compare_and_save_subscription(
        &self,
        subscription: &Subscription,
        expected_version: u64,
    ) -> Result<bool>;

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;

    async fn list_subscriptions_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .list_subscriptions()
            .await?
            .into_iter()
            .filter(|s| s.status == status)
            .collect())
    }

    async fn list_subscriptions_for_customer(&self, customer_id: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .list_subscriptions()
            .await?
            .into_iter()
            .filter(|s| s.customer_id == customer_id)
            .collect())
    }
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>>;
    async fn get_invoice_by_gateway_id(&self, gateway_invoice_id: &str) -> Result<Option<Invoice>>;
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<()>;

    /// Versioned save, same contract as [`SubscriptionStore::compare_and_save_subscription`].
    async fn compare_and_save_invoice(&self, invoice: &Invoice, expected_version: u64) -> Result<bool>;

    async fn list_invoices(&self) -> Result<Vec<Invoice>>;

    /// Close a billing period: insert `invoice` and save `subscription` (the
    /// advanced or ended record) as one unit.
    ///
    /// Returns `Ok(false)` without writing anything if the subscription
    /// version moved, so a replay after a crash can never double-bill.
    async fn close_period(
        &self,
        invoice: &Invoice,
        subscription: &Subscription,
        expected_version: u64,
    ) -> Result<bool>;
}

/// Result of [`PaymentStore::settle_payment`].
#[derive(Debug, Clone)]
pub struct Settlement {
    pub payment: Payment,
    /// The linked invoice after the payment was applied, if it was collectible.
    pub invoice: Option<Invoice>,
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>>;
    async fn get_payment_by_intent_id(&self, intent_id: &str) -> Result<Option<Payment>>;
    async fn insert_payment(&self, payment: &Payment) -> Result<()>;
    async fn compare_and_save_payment(&self, payment: &Payment, expected_version: u64) -> Result<bool>;
    async fn list_payments(&self) -> Result<Vec<Payment>>;

    /// Move a payment from `expected_status` to `succeeded` and apply its
    /// amount to the linked invoice (clamped at the amount due), as one unit.
    /// Only an open or past-due invoice is touched; the payment still settles
    /// against a draft, void or uncollectible one and `invoice` is `None`.
    ///
    /// Returns `Ok(None)` if the payment is no longer in `expected_status`;
    /// that makes duplicate settlement a no-op.
    async fn settle_payment(
        &self,
        payment_id: &str,
        expected_status: PaymentStatus,
        settled_at: DateTime<Utc>,
    ) -> Result<Option<Settlement>>;

    /// Record a refund and increment `refunded_amount` as one unit.
    ///
    /// Fails with `InvalidState` and changes nothing if the refund exceeds
    /// `amount - refunded_amount` at commit time.
    async fn apply_refund(&self, refund: &Refund) -> Result<Payment>;

    async fn list_refunds(&self) -> Result<Vec<Refund>>;

    async fn list_refunds_for_payment(&self, payment_id: &str) -> Result<Vec<Refund>> {
        Ok(self
            .list_refunds()
            .await?
            .into_iter()
            .filter(|r| r.payment_id == payment_id)
            .collect())
    }
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Append a usage record.
    ///
    /// Fails with `InvalidState` if the record carries an idempotency key
    /// already recorded for the same subscription.
    async fn record_usage(&self, record: &UsageRecord) -> Result<()>;

    /// Drop a recorded usage record and free its idempotency key.
    ///
    /// Returns `false` if no record has that id.
    async fn remove_usage(&self, record_id: &str) -> Result<bool>;

    /// Usage records for a subscription with `from <= timestamp < to`.
    async fn list_usage(
        &self,
        subscription_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>>;
}

#[async_trait]
pub trait CreditStore: Send + Sync {
    async fn available_credits(&self, customer_id: &str) -> Result<Decimal>;
    async fn add_credits(&self, customer_id: &str, amount: Decimal) -> Result<Decimal>;

    /// Apply `amount` of customer credit to an invoice and deduct it from
    /// the credit balance as one unit. Returns the updated invoice.
    async fn apply_credit(&self, customer_id: &str, invoice_id: &str, amount: Decimal) -> Result<Invoice>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Check if a webhook event has already been processed.
    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    /// Mark a webhook event as processed.
    async fn mark_event_processed(&self, event_id: &str) -> Result<()>;

    /// Clean up old processed events (default: no-op).
    async fn cleanup_old_events(&self, _older_than_days: u32) -> Result<usize> {
        Ok(0)
    }
}

/// Everything the billing engines need from persistence.
pub trait BillingStore:
    CustomerStore + PlanStore + SubscriptionStore + InvoiceStore + PaymentStore + UsageStore + CreditStore + EventStore
{
}

impl<T> BillingStore for T where
    T: CustomerStore
        + PlanStore
        + SubscriptionStore
        + InvoiceStore
        + PaymentStore
        + UsageStore
        + CreditStore
        + EventStore
{
}

pub mod memory {
    //! In-memory billing store.
    //!
    //! All tables sit behind one lock, so the multi-record operations are
    //! trivially atomic. Intended for tests and local development.

    use super::*;
    use crate::billing::error::BillingError;
    use crate::error::BillflowError;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    /// In-memory billing store.
    ///
    /// Wraps data in Arc for cheap cloning.
    #[derive(Default, Clone)]
    pub struct InMemoryBillingStore {
        inner: Arc<RwLock<Tables>>,
    }

    #[derive(Default)]
    struct Tables {
        customers: HashMap<String, Customer>,
        plans: HashMap<String, Plan>,
        subscriptions: HashMap<String, Subscription>,
        invoices: HashMap<String, Invoice>,
        payments: HashMap<String, Payment>,
        refunds: Vec<Refund>,
        usage: Vec<UsageRecord>,
        usage_keys: HashSet<(String, String)>,
        credits: HashMap<String, Decimal>,
        processed_events: HashMap<String, DateTime<Utc>>,
    }

    impl InMemoryBillingStore {
        /// Create a new in-memory store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed customers and plans (for testing).
        pub async fn seed(&self, customers: Vec<Customer>, plans: Vec<Plan>) {
            let mut tables = self.inner.write().await;
            for customer in customers {
                tables.customers.insert(customer.id.clone(), customer);
            }
            for plan in plans {
                tables.plans.insert(plan.id.clone(), plan);
            }
        }

        /// Get all processed event ids (for testing).
        pub async fn processed_events(&self) -> Vec<String> {
            self.inner.read().await.processed_events.keys().cloned().collect()
        }

        /// Overwrite a subscription without a version check (for test setup).
        pub async fn put_subscription(&self, subscription: Subscription) {
            self.inner
                .write()
                .await
                .subscriptions
                .insert(subscription.id.clone(), subscription);
        }
    }

    fn versioned<T: Clone>(record: &T, version: u64, set: impl FnOnce(&mut T, u64)) -> T {
        let mut next = record.clone();
        set(&mut next, version);
        next
    }

    #[async_trait]
    impl CustomerStore for InMemoryBillingStore {
        async fn get_customer(&self, customer_id: &str) -> Result<Option<Customer>> {
            Ok(self.inner.read().await.customers.get(customer_id).cloned())
        }

        async fn save_customer(&self, customer: &Customer) -> Result<()> {
            self.inner
                .write()
                .await
                .customers
                .insert(customer.id.clone(), customer.clone());
            Ok(())
        }

        async fn list_customers(&self) -> Result<Vec<Customer>> {
            Ok(self.inner.read().await.customers.values().cloned().collect())
        }
    }

    #[async_trait]
    impl PlanStore for InMemoryBillingStore {
        async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>> {
            Ok(self.inner.read().await.plans.get(plan_id).cloned())
        }

        async fn save_plan(&self, plan: &Plan) -> Result<()> {
            self.inner.write().await.plans.insert(plan.id.clone(), plan.clone());
            Ok(())
        }

        async fn list_plans(&self) -> Result<Vec<Plan>> {
            let mut plans: Vec<Plan> = self.inner.read().await.plans.values().cloned().collect();
            plans.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(plans)
        }
    }

    #[async_trait]
    impl SubscriptionStore for InMemoryBillingStore {
        async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>> {
            Ok(self.inner.read().await.subscriptions.get(subscription_id).cloned())
        }

        async fn get_subscription_by_gateway_id(
            &self,
            gateway_subscription_id: &str,
        ) -> Result<Option<Subscription>> {
            Ok(self
                .inner
                .read()
                .await
                .subscriptions
                .values()
                .find(|s| s.gateway_subscription_id.as_deref() == Some(gateway_subscription_id))
                .cloned())
        }

        async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
            let mut tables = self.inner.write().await;
            if tables.subscriptions.contains_key(&subscription.id) {
                return Err(BillflowError::invalid_state(format!(
                    "Subscription '{}' already exists",
                    subscription.id
                )));
            }
            tables
                .subscriptions
                .insert(subscription.id.clone(), subscription.clone());
            Ok(())
        }

        async fn compare_and_save_subscription(
            &self,
            subscription: &Subscription,
            expected_version: u64,
        ) -> Result<bool> {
            let mut tables = self.inner.write().await;
            match tables.subscriptions.get(&subscription.id) {
                Some(current) if current.version == expected_version => {}
                _ => return Ok(false),
            }
            let next = versioned(subscription, expected_version + 1, |s, v| s.version = v);
            tables.subscriptions.insert(next.id.clone(), next);
            Ok(true)
        }

        async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
            let mut subs: Vec<Subscription> =
                self.inner.read().await.subscriptions.values().cloned().collect();
            subs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            Ok(subs)
        }
    }

    #[async_trait]
    impl InvoiceStore for InMemoryBillingStore {
        async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>> {
            Ok(self.inner.read().await.invoices.get(invoice_id).cloned())
        }

        async fn get_invoice_by_gateway_id(&self, gateway_invoice_id: &str) -> Result<Option<Invoice>> {
            Ok(self
                .inner
                .read()
                .await
                .invoices
                .values()
                .find(|i| i.gateway_invoice_id.as_deref() == Some(gateway_invoice_id))
                .cloned())
        }

        async fn insert_invoice(&self, invoice: &Invoice) -> Result<()> {
            let mut tables = self.inner.write().await;
            if tables.invoices.contains_key(&invoice.id) {
                return Err(BillflowError::invalid_state(format!(
                    "Invoice '{}' already exists",
                    invoice.id
                )));
            }
            tables.invoices.insert(invoice.id.clone(), invoice.clone());
            Ok(())
        }

        async fn compare_and_save_invoice(&self, invoice: &Invoice, expected_version: u64) -> Result<bool> {
            let mut tables = self.inner.write().await;
            match tables.invoices.get(&invoice.id) {
                Some(current) if current.version == expected_version => {}
                _ => return Ok(false),
            }
            let next = versioned(invoice, expected_version + 1, |i, v| i.version = v);
            tables.invoices.insert(next.id.clone(), next);
            Ok(true)
        }

        async fn list_invoices(&self) -> Result<Vec<Invoice>> {
            let mut invoices: Vec<Invoice> = self.inner.read().await.invoices.values().cloned().collect();
            invoices.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            Ok(invoices)
        }

        async fn close_period(
            &self,
            invoice: &Invoice,
            subscription: &Subscription,
            expected_version: u64,
        ) -> Result<bool> {
            let mut tables = self.inner.write().await;
            match tables.subscriptions.get(&subscription.id) {
                Some(current) if current.version == expected_version => {}
                _ => return Ok(false),
            }
            if tables.invoices.contains_key(&invoice.id) {
                return Err(BillflowError::invalid_state(format!(
                    "Invoice '{}' already exists",
                    invoice.id
                )));
            }
            tables.invoices.insert(invoice.id.clone(), invoice.clone());
            let next = versioned(subscription, expected_version + 1, |s, v| s.version = v);
            tables.subscriptions.insert(next.id.clone(), next);
            Ok(true)
        }
    }

    #[async_trait]
    impl PaymentStore for InMemoryBillingStore {
        async fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>> {
            Ok(self.inner.read().await.payments.get(payment_id).cloned())
        }

        async fn get_payment_by_intent_id(&self, intent_id: &str) -> Result<Option<Payment>> {
            Ok(self
                .inner
                .read()
                .await
                .payments
                .values()
                .find(|p| p.gateway_payment_intent_id.as_deref() == Some(intent_id))
                .cloned())
        }

        async fn insert_payment(&self, payment: &Payment) -> Result<()> {
            let mut tables = self.inner.write().await;
            if tables.payments.contains_key(&payment.id) {
                return Err(BillflowError::invalid_state(format!(
                    "Payment '{}' already exists",
                    payment.id
                )));
            }
            tables.payments.insert(payment.id.clone(), payment.clone());
            Ok(())
        }

        async fn compare_and_save_payment(&self, payment: &Payment, expected_version: u64) -> Result<bool> {
            let mut tables = self.inner.write().await;
            match tables.payments.get(&payment.id) {
                Some(current) if current.version == expected_version => {}
                _ => return Ok(false),
            }
            let next = versioned(payment, expected_version + 1, |p, v| p.version = v);
            tables.payments.insert(next.id.clone(), next);
            Ok(true)
        }

        async fn list_payments(&self) -> Result<Vec<Payment>> {
            let mut payments: Vec<Payment> = self.inner.read().await.payments.values().cloned().collect();
            payments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            Ok(payments)
        }

        async fn settle_payment(
            &self,
            payment_id: &str,
            expected_status: PaymentStatus,
            settled_at: DateTime<Utc>,
        ) -> Result<Option<Settlement>> {
            let mut tables = self.inner.write().await;
            let Some(current) = tables.payments.get(payment_id).cloned() else {
                return Err(BillingError::PaymentNotFound {
                    payment_id: payment_id.to_string(),
                }
                .into());
            };
            if current.status != expected_status {
                return Ok(None);
            }

            let mut invoice = None;
            if let Some(invoice_id) = current.invoice_id.as_deref() {
                if let Some(stored) = tables.invoices.get(invoice_id).filter(|i| i.status.is_collectible()) {
                    let mut updated = stored.clone();
                    updated.apply_payment(current.amount, settled_at);
                    updated.version += 1;
                    tables.invoices.insert(updated.id.clone(), updated.clone());
                    invoice = Some(updated);
                }
            }

            let mut payment = current;
            payment.status = PaymentStatus::Succeeded;
            payment.failure_reason = None;
            payment.updated_at = settled_at;
            payment.version += 1;
            tables.payments.insert(payment.id.clone(), payment.clone());

            Ok(Some(Settlement { payment, invoice }))
        }

        async fn apply_refund(&self, refund: &Refund) -> Result<Payment> {
            let mut tables = self.inner.write().await;
            let Some(current) = tables.payments.get(&refund.payment_id).cloned() else {
                return Err(BillingError::PaymentNotFound {
                    payment_id: refund.payment_id.clone(),
                }
                .into());
            };
            let available = current.refundable_amount();
            if refund.amount > available {
                return Err(BillingError::RefundExceedsAvailable {
                    payment_id: current.id.clone(),
                    requested: refund.amount,
                    available,
                }
                .into());
            }

            let mut payment = current;
            payment.refunded_amount += refund.amount;
            payment.status = if payment.refunded_amount >= payment.amount {
                PaymentStatus::Refunded
            } else {
                PaymentStatus::PartiallyRefunded
            };
            payment.updated_at = refund.created_at;
            payment.version += 1;
            tables.payments.insert(payment.id.clone(), payment.clone());
            tables.refunds.push(refund.clone());
            Ok(payment)
        }

        async fn list_refunds(&self) -> Result<Vec<Refund>> {
            Ok(self.inner.read().await.refunds.clone())
        }
    }

    #[async_trait]
    impl UsageStore for InMemoryBillingStore {
        async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
            let mut tables = self.inner.write().await;
            if let Some(key) = record.idempotency_key.as_deref() {
                if !tables
                    .usage_keys
                    .insert((record.subscription_id.clone(), key.to_string()))
                {
                    return Err(BillingError::DuplicateUsageRecord {
                        idempotency_key: key.to_string(),
                    }
                    .into());
                }
            }
            tables.usage.push(record.clone());
            Ok(())
        }

        async fn remove_usage(&self, record_id: &str) -> Result<bool> {
            let mut tables = self.inner.write().await;
            let Some(index) = tables.usage.iter().position(|r| r.id == record_id) else {
                return Ok(false);
            };
            let removed = tables.usage.remove(index);
            if let Some(key) = removed.idempotency_key {
                tables.usage_keys.remove(&(removed.subscription_id, key));
            }
            Ok(true)
        }

        async fn list_usage(
            &self,
            subscription_id: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<UsageRecord>> {
            Ok(self
                .inner
                .read()
                .await
                .usage
                .iter()
                .filter(|r| r.subscription_id == subscription_id && r.timestamp >= from && r.timestamp < to)
                .cloned()
                .collect())
        }
    }

    #[async_trait]
    impl CreditStore for InMemoryBillingStore {
        async fn available_credits(&self, customer_id: &str) -> Result<Decimal> {
            Ok(self
                .inner
                .read()
                .await
                .credits
                .get(customer_id)
                .copied()
                .unwrap_or(Decimal::ZERO))
        }

        async fn add_credits(&self, customer_id: &str, amount: Decimal) -> Result<Decimal> {
            let mut tables = self.inner.write().await;
            let balance = tables.credits.entry(customer_id.to_string()).or_insert(Decimal::ZERO);
            *balance += amount;
            Ok(*balance)
        }

        async fn apply_credit(&self, customer_id: &str, invoice_id: &str, amount: Decimal) -> Result<Invoice> {
            let mut tables = self.inner.write().await;
            let available = tables.credits.get(customer_id).copied().unwrap_or(Decimal::ZERO);
            if amount > available {
                return Err(BillingError::InsufficientCredits {
                    customer_id: customer_id.to_string(),
                    requested: amount,
                    available,
                }
                .into());
            }
            let Some(stored) = tables.invoices.get(invoice_id) else {
                return Err(BillingError::InvoiceNotFound {
                    invoice_id: invoice_id.to_string(),
                }
                .into());
            };
            if !stored.status.is_collectible() {
                return Err(BillingError::InvoiceTransitionNotAllowed {
                    invoice_id: invoice_id.to_string(),
                    status: stored.status.to_string(),
                    action: "apply credit to",
                }
                .into());
            }
            if amount > stored.amount_due {
                return Err(BillflowError::invalid_state(format!(
                    "Credit of {} exceeds amount due {} on invoice '{}'",
                    amount, stored.amount_due, invoice_id
                )));
            }

            let mut invoice = stored.clone();
            let applied = invoice.apply_payment(amount, Utc::now());
            invoice.credit_applied += applied;
            invoice.version += 1;
            tables.invoices.insert(invoice.id.clone(), invoice.clone());
            tables.credits.insert(customer_id.to_string(), available - applied);
            Ok(invoice)
        }
    }

    #[async_trait]
    impl EventStore for InMemoryBillingStore {
        async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
            Ok(self.inner.read().await.processed_events.contains_key(event_id))
        }

        async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
            self.inner
                .write()
                .await
                .processed_events
                .insert(event_id.to_string(), Utc::now());
            Ok(())
        }

        async fn cleanup_old_events(&self, older_than_days: u32) -> Result<usize> {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
            let mut tables = self.inner.write().await;
            let before = tables.processed_events.len();
            tables.processed_events.retain(|_, processed_at| *processed_at >= cutoff);
            Ok(before - tables.processed_events.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryBillingStore;
    use super::*;
    use crate::billing::model::{InvoiceStatus, PaymentStatus};
    use crate::error::BillflowError;

    fn payment(amount: i64) -> Payment {
        let mut p = Payment::new("cus_1", Decimal::from(amount), "usd");
        p.status = PaymentStatus::Succeeded;
        p
    }

    fn refund(payment_id: &str, amount: i64) -> Refund {
        Refund {
            id: uuid::Uuid::new_v4().to_string(),
            payment_id: payment_id.to_string(),
            customer_id: "cus_1".to_string(),
            amount: Decimal::from(amount),
            currency: "usd".to_string(),
            reason: None,
            gateway_refund_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_apply_refund_bound() {
        let store = InMemoryBillingStore::new();
        let p = payment(100);
        store.insert_payment(&p).await.unwrap();

        let updated = store.apply_refund(&refund(&p.id, 40)).await.unwrap();
        assert_eq!(updated.status, PaymentStatus::PartiallyRefunded);
        assert_eq!(updated.refunded_amount, Decimal::from(40));

        let err = store.apply_refund(&refund(&p.id, 61)).await.unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));

        let unchanged = store.get_payment(&p.id).await.unwrap().unwrap();
        assert_eq!(unchanged.refunded_amount, Decimal::from(40));
        assert_eq!(store.list_refunds_for_payment(&p.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_settle_payment_is_one_shot() {
        let store = InMemoryBillingStore::new();
        let mut invoice = Invoice::draft("cus_1", "usd");
        invoice.status = InvoiceStatus::Open;
        invoice.total = Decimal::from(100);
        invoice.amount_due = Decimal::from(100);
        store.insert_invoice(&invoice).await.unwrap();

        let mut p = Payment::new("cus_1", Decimal::from(100), "usd");
        p.invoice_id = Some(invoice.id.clone());
        store.insert_payment(&p).await.unwrap();

        let first = store
            .settle_payment(&p.id, PaymentStatus::Pending, Utc::now())
            .await
            .unwrap()
            .unwrap();
        let settled_invoice = first.invoice.unwrap();
        assert_eq!(settled_invoice.status, InvoiceStatus::Paid);
        assert_eq!(settled_invoice.amount_paid, Decimal::from(100));

        let second = store
            .settle_payment(&p.id, PaymentStatus::Pending, Utc::now())
            .await
            .unwrap();
        assert!(second.is_none());
        let stored = store.get_invoice(&invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.amount_paid, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_usage_idempotency_key() {
        let store = InMemoryBillingStore::new();
        let record = UsageRecord {
            id: "ur_1".to_string(),
            subscription_id: "sub_1".to_string(),
            quantity: 5,
            action: crate::billing::model::UsageAction::Increment,
            timestamp: Utc::now(),
            idempotency_key: Some("req-1".to_string()),
        };
        store.record_usage(&record).await.unwrap();
        let err = store.record_usage(&record).await.unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));

        let other_subscription = UsageRecord {
            id: "ur_2".to_string(),
            subscription_id: "sub_2".to_string(),
            ..record.clone()
        };
        store.record_usage(&other_subscription).await.unwrap();

        assert!(store.remove_usage("ur_1").await.unwrap());
        assert!(!store.remove_usage("ur_1").await.unwrap());
        store.record_usage(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_credit_deducts_exactly() {
        let store = InMemoryBillingStore::new();
        let mut invoice = Invoice::draft("cus_1", "usd");
        invoice.status = InvoiceStatus::Open;
        invoice.total = Decimal::from(80);
        invoice.amount_due = Decimal::from(80);
        store.insert_invoice(&invoice).await.unwrap();
        store.add_credits("cus_1", Decimal::from(50)).await.unwrap();

        let updated = store.apply_credit("cus_1", &invoice.id, Decimal::from(50)).await.unwrap();
        assert_eq!(updated.amount_due, Decimal::from(30));
        assert_eq!(updated.credit_applied, Decimal::from(50));
        assert_eq!(updated.amount_paid + updated.amount_due, updated.total);
        assert_eq!(store.available_credits("cus_1").await.unwrap(), Decimal::ZERO);

        let err = store.apply_credit("cus_1", &invoice.id, Decimal::ONE).await.unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_settlement_skips_non_collectible_invoices() {
        let store = InMemoryBillingStore::new();
        for status in [InvoiceStatus::Draft, InvoiceStatus::Void, InvoiceStatus::Uncollectible] {
            let mut invoice = Invoice::draft("cus_1", "usd");
            invoice.status = status;
            invoice.total = Decimal::from(100);
            invoice.amount_due = Decimal::from(100);
            store.insert_invoice(&invoice).await.unwrap();

            let mut p = Payment::new("cus_1", Decimal::from(100), "usd");
            p.invoice_id = Some(invoice.id.clone());
            store.insert_payment(&p).await.unwrap();

            let settlement = store
                .settle_payment(&p.id, PaymentStatus::Pending, Utc::now())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(settlement.payment.status, PaymentStatus::Succeeded);
            assert!(settlement.invoice.is_none());

            let stored = store.get_invoice(&invoice.id).await.unwrap().unwrap();
            assert_eq!(stored.status, status);
            assert_eq!(stored.amount_paid, Decimal::ZERO);
            assert_eq!(stored.version, invoice.version);
        }
    }

    #[tokio::test]
    async fn test_credit_rejected_on_draft_and_void_invoices() {
        let store = InMemoryBillingStore::new();
        store.add_credits("cus_1", Decimal::from(500)).await.unwrap();
        for status in [InvoiceStatus::Draft, InvoiceStatus::Void] {
            let mut invoice = Invoice::draft("cus_1", "usd");
            invoice.status = status;
            invoice.total = Decimal::from(100);
            invoice.amount_due = Decimal::from(100);
            store.insert_invoice(&invoice).await.unwrap();

            let err = store
                .apply_credit("cus_1", &invoice.id, Decimal::from(100))
                .await
                .unwrap_err();
            assert!(matches!(err, BillflowError::InvalidState(_)));
            let stored = store.get_invoice(&invoice.id).await.unwrap().unwrap();
            assert_eq!(stored.status, status);
            assert_eq!(stored.credit_applied, Decimal::ZERO);
        }
        assert_eq!(store.available_credits("cus_1").await.unwrap(), Decimal::from(500));
    }

    #[tokio::test]
    async fn test_cleanup_old_events() {
        let store = InMemoryBillingStore::new();
        store.mark_event_processed("evt_1").await.unwrap();
        assert!(store.is_event_processed("evt_1").await.unwrap());
        assert_eq!(store.cleanup_old_events(1).await.unwrap(), 0);
        assert_eq!(store.processed_events().await, vec!["evt_1".to_string()]);
    }
}
