//! In-memory payment gateway double.
//!
//! Behaves like a well-mannered payments provider: ids are generated,
//! subscriptions get a 30-day period, confirmed payment intents succeed
//! unless a different outcome was scripted. Every call is counted and any
//! operation can be made to fail once with [`MockPaymentGateway::fail_next`].

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::billing::gateway::*;
use crate::billing::model::UsageAction;
use crate::error::{BillflowError, GatewayKind, Result};

#[derive(Default)]
struct State {
    customers: HashMap<String, GatewayCustomer>,
    subscriptions: HashMap<String, GatewaySubscription>,
    invoices: HashMap<String, GatewayInvoice>,
    invoice_items: HashMap<String, GatewayInvoiceItem>,
    intents: HashMap<String, GatewayPaymentIntent>,
    refunds: HashMap<String, GatewayRefund>,
    payment_methods: HashMap<String, GatewayPaymentMethod>,
    products: HashMap<String, GatewayProduct>,
    prices: HashMap<String, GatewayPrice>,
    usage: Vec<UsageRecordParams>,
    calls: HashMap<&'static str, usize>,
    fail_next: HashSet<&'static str>,
    confirm_outcome: Option<String>,
}

/// Mock payment gateway.
#[derive(Default, Clone)]
pub struct MockPaymentGateway {
    state: Arc<Mutex<State>>,
}

fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

fn missing(operation: &str, id: &str) -> BillflowError {
    BillflowError::gateway(GatewayKind::Payment, operation, format!("No such object: {}", id))
}

impl MockPaymentGateway {
    /// Create a new mock gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `operation` fail with a gateway error.
    pub async fn fail_next(&self, operation: &'static str) {
        self.state.lock().await.fail_next.insert(operation);
    }

    /// Status reported by subsequent intent confirmations (default `succeeded`).
    pub async fn set_confirm_outcome(&self, status: impl Into<String>) {
        self.state.lock().await.confirm_outcome = Some(status.into());
    }

    /// Number of calls made to `operation`.
    pub async fn calls(&self, operation: &str) -> usize {
        self.state.lock().await.calls.get(operation).copied().unwrap_or(0)
    }

    /// Change a subscription's status behind the engine's back.
    pub async fn set_subscription_status(&self, subscription_id: &str, status: &str) {
        if let Some(sub) = self.state.lock().await.subscriptions.get_mut(subscription_id) {
            sub.status = status.to_string();
        }
    }

    /// Register a payment intent as if it had been created elsewhere.
    pub async fn insert_payment_intent(&self, intent: GatewayPaymentIntent) {
        self.state.lock().await.intents.insert(intent.id.clone(), intent);
    }

    /// Usage records pushed so far.
    pub async fn usage_records(&self) -> Vec<UsageRecordParams> {
        self.state.lock().await.usage.clone()
    }

    /// Count the call and apply a scripted failure.
    async fn enter(&self, operation: &'static str) -> Result<tokio::sync::MutexGuard<'_, State>> {
        let mut state = self.state.lock().await;
        *state.calls.entry(operation).or_insert(0) += 1;
        if state.fail_next.remove(operation) {
            return Err(BillflowError::gateway(
                GatewayKind::Payment,
                operation,
                "scripted failure",
            ));
        }
        Ok(state)
    }
}

fn update_intent(
    state: &mut State,
    operation: &'static str,
    intent_id: &str,
    status: &str,
) -> Result<GatewayPaymentIntent> {
    let intent = state
        .intents
        .get_mut(intent_id)
        .ok_or_else(|| missing(operation, intent_id))?;
    intent.status = status.to_string();
    Ok(intent.clone())
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_customer(&self, params: CustomerParams) -> Result<GatewayCustomer> {
        let mut state = self.enter("create_customer").await?;
        let customer = GatewayCustomer {
            id: new_id("gcus"),
            email: params.email.unwrap_or_default(),
            name: params.name,
        };
        state.customers.insert(customer.id.clone(), customer.clone());
        Ok(customer)
    }

    async fn get_customer(&self, customer_id: &str) -> Result<GatewayCustomer> {
        let state = self.enter("get_customer").await?;
        state
            .customers
            .get(customer_id)
            .cloned()
            .ok_or_else(|| missing("get_customer", customer_id))
    }

    async fn update_customer(&self, customer_id: &str, params: CustomerParams) -> Result<GatewayCustomer> {
        let mut state = self.enter("update_customer").await?;
        let customer = state
            .customers
            .get_mut(customer_id)
            .ok_or_else(|| missing("update_customer", customer_id))?;
        if let Some(email) = params.email {
            customer.email = email;
        }
        if params.name.is_some() {
            customer.name = params.name;
        }
        Ok(customer.clone())
    }

    async fn delete_customer(&self, customer_id: &str) -> Result<()> {
        let mut state = self.enter("delete_customer").await?;
        state
            .customers
            .remove(customer_id)
            .map(|_| ())
            .ok_or_else(|| missing("delete_customer", customer_id))
    }

    async fn create_subscription(&self, params: CreateSubscriptionParams) -> Result<GatewaySubscription> {
        let mut state = self.enter("create_subscription").await?;
        let now = Utc::now();
        let trial_end = params.trial_days.map(|days| now + Duration::days(i64::from(days)));
        let sub = GatewaySubscription {
            id: new_id("gsub"),
            customer_id: params.customer_id,
            status: if trial_end.is_some() { "trialing" } else { "active" }.to_string(),
            current_period_start: now,
            current_period_end: now + Duration::days(30),
            trial_start: trial_end.map(|_| now),
            trial_end,
            cancel_at_period_end: params.cancel_at_period_end,
            canceled_at: None,
            items: vec![GatewaySubscriptionItem {
                id: new_id("si"),
                price_id: params.price_id,
                quantity: params.quantity,
            }],
        };
        state.subscriptions.insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription> {
        let state = self.enter("get_subscription").await?;
        state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| missing("get_subscription", subscription_id))
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        params: UpdateSubscriptionParams,
    ) -> Result<GatewaySubscription> {
        let mut state = self.enter("update_subscription").await?;
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| missing("update_subscription", subscription_id))?;

        for update in params.items {
            if let Some(item) = sub.items.iter_mut().find(|i| i.id == update.item_id) {
                if let Some(price_id) = update.price_id {
                    item.price_id = price_id;
                }
                if let Some(quantity) = update.quantity {
                    item.quantity = quantity;
                }
            }
        }
        if let Some(cancel) = params.cancel_at_period_end {
            sub.cancel_at_period_end = cancel;
        }
        match params.trial_end {
            Some(TrialEnd::Now) => {
                sub.trial_end = None;
                if sub.status == "trialing" {
                    sub.status = "active".to_string();
                }
            }
            Some(TrialEnd::At(at)) => sub.trial_end = Some(at),
            None => {}
        }
        match params.pause_collection {
            Some(Some(_)) => sub.status = "paused".to_string(),
            Some(None) if sub.status == "paused" => sub.status = "active".to_string(),
            _ => {}
        }
        Ok(sub.clone())
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription> {
        let mut state = self.enter("cancel_subscription").await?;
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| missing("cancel_subscription", subscription_id))?;
        sub.status = "canceled".to_string();
        sub.canceled_at = Some(Utc::now());
        Ok(sub.clone())
    }

    async fn resume_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription> {
        let mut state = self.enter("resume_subscription").await?;
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| missing("resume_subscription", subscription_id))?;
        sub.cancel_at_period_end = false;
        sub.canceled_at = None;
        Ok(sub.clone())
    }

    async fn list_subscriptions(&self, customer_id: &str) -> Result<Vec<GatewaySubscription>> {
        let state = self.enter("list_subscriptions").await?;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn create_invoice(&self, params: CreateInvoiceParams) -> Result<GatewayInvoice> {
        let mut state = self.enter("create_invoice").await?;
        let invoice = GatewayInvoice {
            id: new_id("gin"),
            customer_id: params.customer_id,
            status: "draft".to_string(),
            total: Decimal::ZERO,
            amount_paid: Decimal::ZERO,
            amount_due: Decimal::ZERO,
        };
        state.invoices.insert(invoice.id.clone(), invoice.clone());
        Ok(invoice)
    }

    async fn create_invoice_item(&self, params: CreateInvoiceItemParams) -> Result<GatewayInvoiceItem> {
        let mut state = self.enter("create_invoice_item").await?;
        let invoice = state
            .invoices
            .get_mut(&params.invoice_id)
            .ok_or_else(|| missing("create_invoice_item", &params.invoice_id))?;
        invoice.total += params.amount;
        invoice.amount_due += params.amount;
        let item = GatewayInvoiceItem {
            id: new_id("gii"),
            invoice_id: params.invoice_id,
            amount: params.amount,
        };
        state.invoice_items.insert(item.id.clone(), item.clone());
        Ok(item)
    }

    async fn delete_invoice_item(&self, item_id: &str) -> Result<()> {
        let mut state = self.enter("delete_invoice_item").await?;
        let item = state
            .invoice_items
            .remove(item_id)
            .ok_or_else(|| missing("delete_invoice_item", item_id))?;
        if let Some(invoice) = state.invoices.get_mut(&item.invoice_id) {
            invoice.total -= item.amount;
            invoice.amount_due -= item.amount;
        }
        Ok(())
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice> {
        let mut state = self.enter("finalize_invoice").await?;
        let invoice = state
            .invoices
            .get_mut(invoice_id)
            .ok_or_else(|| missing("finalize_invoice", invoice_id))?;
        invoice.status = "open".to_string();
        Ok(invoice.clone())
    }

    async fn pay_invoice(&self, invoice_id: &str, _payment_method_id: Option<&str>) -> Result<GatewayInvoice> {
        let mut state = self.enter("pay_invoice").await?;
        let invoice = state
            .invoices
            .get_mut(invoice_id)
            .ok_or_else(|| missing("pay_invoice", invoice_id))?;
        invoice.status = "paid".to_string();
        invoice.amount_paid = invoice.total;
        invoice.amount_due = Decimal::ZERO;
        Ok(invoice.clone())
    }

    async fn void_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice> {
        let mut state = self.enter("void_invoice").await?;
        let invoice = state
            .invoices
            .get_mut(invoice_id)
            .ok_or_else(|| missing("void_invoice", invoice_id))?;
        invoice.status = "void".to_string();
        Ok(invoice.clone())
    }

    async fn create_payment_intent(&self, params: CreatePaymentIntentParams) -> Result<GatewayPaymentIntent> {
        let mut state = self.enter("create_payment_intent").await?;
        let status = if params.confirm {
            state.confirm_outcome.clone().unwrap_or_else(|| "succeeded".to_string())
        } else {
            "requires_confirmation".to_string()
        };
        let intent = GatewayPaymentIntent {
            id: new_id("pi"),
            amount: params.amount,
            currency: params.currency,
            status,
            customer_id: params.customer_id,
            payment_method_id: params.payment_method_id,
            last_error: None,
        };
        state.intents.insert(intent.id.clone(), intent.clone());
        Ok(intent)
    }

    async fn get_payment_intent(&self, intent_id: &str) -> Result<GatewayPaymentIntent> {
        let state = self.enter("get_payment_intent").await?;
        state
            .intents
            .get(intent_id)
            .cloned()
            .ok_or_else(|| missing("get_payment_intent", intent_id))
    }

    async fn confirm_payment_intent(
        &self,
        intent_id: &str,
        payment_method_id: Option<&str>,
    ) -> Result<GatewayPaymentIntent> {
        let mut state = self.enter("confirm_payment_intent").await?;
        let outcome = state.confirm_outcome.clone().unwrap_or_else(|| "succeeded".to_string());
        let intent = update_intent(&mut state, "confirm_payment_intent", intent_id, &outcome)?;
        if let Some(pm) = payment_method_id {
            if let Some(stored) = state.intents.get_mut(intent_id) {
                stored.payment_method_id = Some(pm.to_string());
                return Ok(stored.clone());
            }
        }
        Ok(intent)
    }

    async fn capture_payment_intent(&self, intent_id: &str) -> Result<GatewayPaymentIntent> {
        let mut state = self.enter("capture_payment_intent").await?;
        update_intent(&mut state, "capture_payment_intent", intent_id, "succeeded")
    }

    async fn cancel_payment_intent(&self, intent_id: &str) -> Result<GatewayPaymentIntent> {
        let mut state = self.enter("cancel_payment_intent").await?;
        update_intent(&mut state, "cancel_payment_intent", intent_id, "canceled")
    }

    async fn create_refund(&self, params: CreateRefundParams) -> Result<GatewayRefund> {
        let mut state = self.enter("create_refund").await?;
        if !state.intents.contains_key(&params.payment_intent_id) {
            return Err(missing("create_refund", &params.payment_intent_id));
        }
        let refund = GatewayRefund {
            id: new_id("re"),
            payment_intent_id: params.payment_intent_id,
            amount: params.amount,
            status: "succeeded".to_string(),
        };
        state.refunds.insert(refund.id.clone(), refund.clone());
        Ok(refund)
    }

    async fn get_refund(&self, refund_id: &str) -> Result<GatewayRefund> {
        let state = self.enter("get_refund").await?;
        state
            .refunds
            .get(refund_id)
            .cloned()
            .ok_or_else(|| missing("get_refund", refund_id))
    }

    async fn attach_payment_method(&self, payment_method_id: &str, customer_id: &str) -> Result<GatewayPaymentMethod> {
        let mut state = self.enter("attach_payment_method").await?;
        let method = state
            .payment_methods
            .entry(payment_method_id.to_string())
            .or_insert_with(|| GatewayPaymentMethod {
                id: payment_method_id.to_string(),
                kind: "card".to_string(),
                customer_id: None,
            });
        method.customer_id = Some(customer_id.to_string());
        Ok(method.clone())
    }

    async fn detach_payment_method(&self, payment_method_id: &str) -> Result<GatewayPaymentMethod> {
        let mut state = self.enter("detach_payment_method").await?;
        let method = state
            .payment_methods
            .get_mut(payment_method_id)
            .ok_or_else(|| missing("detach_payment_method", payment_method_id))?;
        method.customer_id = None;
        Ok(method.clone())
    }

    async fn list_payment_methods(&self, customer_id: &str) -> Result<Vec<GatewayPaymentMethod>> {
        let state = self.enter("list_payment_methods").await?;
        Ok(state
            .payment_methods
            .values()
            .filter(|m| m.customer_id.as_deref() == Some(customer_id))
            .cloned()
            .collect())
    }

    async fn create_product(&self, name: &str) -> Result<GatewayProduct> {
        let mut state = self.enter("create_product").await?;
        let product = GatewayProduct {
            id: new_id("prod"),
            name: name.to_string(),
        };
        state.products.insert(product.id.clone(), product.clone());
        Ok(product)
    }

    async fn get_product(&self, product_id: &str) -> Result<GatewayProduct> {
        let state = self.enter("get_product").await?;
        state
            .products
            .get(product_id)
            .cloned()
            .ok_or_else(|| missing("get_product", product_id))
    }

    async fn create_price(&self, params: CreatePriceParams) -> Result<GatewayPrice> {
        let mut state = self.enter("create_price").await?;
        let price = GatewayPrice {
            id: new_id("price"),
            product_id: params.product_id,
            unit_amount: params.unit_amount,
            currency: params.currency,
            interval: params.interval,
            interval_count: params.interval_count,
        };
        state.prices.insert(price.id.clone(), price.clone());
        Ok(price)
    }

    async fn get_price(&self, price_id: &str) -> Result<GatewayPrice> {
        let state = self.enter("get_price").await?;
        state
            .prices
            .get(price_id)
            .cloned()
            .ok_or_else(|| missing("get_price", price_id))
    }

    async fn create_usage_record(&self, params: UsageRecordParams) -> Result<()> {
        let mut state = self.enter("create_usage_record").await?;
        let known = state
            .subscriptions
            .values()
            .any(|s| s.items.iter().any(|i| i.id == params.subscription_item_id));
        if !known {
            return Err(missing("create_usage_record", &params.subscription_item_id));
        }
        if params.action == UsageAction::Set {
            state
                .usage
                .retain(|r| r.subscription_item_id != params.subscription_item_id);
        }
        state.usage.push(params);
        Ok(())
    }
}
