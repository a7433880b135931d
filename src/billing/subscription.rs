//! Subscription lifecycle engine.
//!
//! Owns the subscription state machine: creation, plan and quantity changes
//! with proration, pause/resume, cancellation, trial expiry and usage
//! metering. When the customer is linked to the payment gateway, the gateway
//! is the source of truth for status, period and trial fields and the local
//! record adopts what it reports.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::error::{BillflowError, GatewayKind, Result};
use super::error::BillingError;
use super::gateway::{
    CreateSubscriptionParams, GatewaySubscription, PaymentGateway, ProrationBehavior,
    SubscriptionItemUpdate, TrialEnd, UpdateSubscriptionParams, UsageRecordParams,
};
use super::model::{
    Plan, PauseBehavior, Subscription, SubscriptionStatus, UsageAction, UsageRecord,
};
use super::proration::{calculate_proration, clamp_to_period, ProratedAmount};
use super::storage::BillingStore;

const TARGET: &str = "billflow::billing::subscription";

/// Request to create a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub customer_id: String,
    pub plan_id: String,
    pub quantity: u32,
    /// Overrides the plan's trial days.
    pub trial_days: Option<u32>,
    pub payment_method_id: Option<String>,
    pub cancel_at_period_end: bool,
    pub coupon_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl CreateSubscription {
    #[must_use]
    pub fn new(customer_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            plan_id: plan_id.into(),
            quantity: 1,
            trial_days: None,
            payment_method_id: None,
            cancel_at_period_end: false,
            coupon_id: None,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    #[must_use]
    pub fn trial_days(mut self, days: u32) -> Self {
        self.trial_days = Some(days);
        self
    }

    #[must_use]
    pub fn payment_method(mut self, payment_method_id: impl Into<String>) -> Self {
        self.payment_method_id = Some(payment_method_id.into());
        self
    }

    #[must_use]
    pub fn cancel_at_period_end(mut self, cancel: bool) -> Self {
        self.cancel_at_period_end = cancel;
        self
    }

    #[must_use]
    pub fn coupon(mut self, coupon_id: impl Into<String>) -> Self {
        self.coupon_id = Some(coupon_id.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Partial update of a subscription.
#[derive(Debug, Clone, Default)]
pub struct UpdateSubscription {
    pub plan_id: Option<String>,
    pub quantity: Option<u32>,
    pub cancel_at_period_end: Option<bool>,
    pub trial_end: Option<TrialEnd>,
    /// `Some(None)` clears an existing pause.
    pub pause_collection: Option<Option<PauseBehavior>>,
    /// Shallow-merged into the existing metadata.
    pub metadata: BTreeMap<String, String>,
}

/// Result of a plan or quantity change.
#[derive(Debug, Clone)]
pub struct ChangeResult {
    pub subscription: Subscription,
    /// Present when the change was prorated.
    pub proration: Option<ProratedAmount>,
}

/// Counts from a batch trial-expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrialSweepResult {
    pub processed: usize,
    pub failed: usize,
}

/// Result of a reconciliation check.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum ReconcileResult {
    /// No local subscription with this id.
    NoLocalSubscription,
    /// The subscription is billed locally only.
    NotLinked,
    /// The gateway does not know the subscription (may have been deleted).
    NotFoundInGateway,
    /// Local and gateway state agree.
    InSync,
    /// Local and gateway state have diverged.
    Diverged {
        differences: Vec<ReconcileDifference>,
        /// Whether local state was updated.
        updated_local: bool,
    },
}

/// A specific difference between local and gateway state.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileDifference {
    Status { local: String, remote: String },
    Quantity { local: u32, remote: u32 },
    PeriodEnd { local: DateTime<Utc>, remote: DateTime<Utc> },
    CancelAtPeriodEnd { local: bool, remote: bool },
}

/// Adopt gateway-reported state onto a local subscription.
///
/// Status, period window, trial window, cancel flag and quantity of the
/// primary item are copied. A period the gateway reports as empty is ignored
/// so the local `end > start` invariant holds.
pub(crate) fn adopt_gateway_state(sub: &mut Subscription, remote: &GatewaySubscription) {
    sub.status = SubscriptionStatus::from_gateway(&remote.status);
    if remote.current_period_end > remote.current_period_start {
        sub.current_period_start = remote.current_period_start;
        sub.current_period_end = remote.current_period_end;
    }
    sub.trial_start = remote.trial_start;
    sub.trial_end = remote.trial_end;
    sub.cancel_at_period_end = remote.cancel_at_period_end;
    if remote.canceled_at.is_some() {
        sub.canceled_at = remote.canceled_at;
    }
    if let Some(item) = remote.primary_item() {
        if item.quantity > 0 {
            sub.quantity = item.quantity;
        }
    }
    if sub.status == SubscriptionStatus::Canceled && sub.ended_at.is_none() {
        sub.ended_at = remote.canceled_at.or(Some(Utc::now()));
    }
    sub.gateway_subscription_id = Some(remote.id.clone());
}

/// Subscription lifecycle operations.
pub struct SubscriptionEngine<S: BillingStore, G: PaymentGateway> {
    store: S,
    gateway: G,
}

impl<S: BillingStore, G: PaymentGateway> SubscriptionEngine<S, G> {
    /// Create a new subscription engine.
    #[must_use]
    pub fn new(store: S, gateway: G) -> Self {
        Self { store, gateway }
    }

    /// Get a subscription by id.
    pub async fn get(&self, subscription_id: &str) -> Result<Subscription> {
        self.load(subscription_id).await
    }

    /// All subscriptions of a customer.
    pub async fn list_for_customer(&self, customer_id: &str) -> Result<Vec<Subscription>> {
        self.store.list_subscriptions_for_customer(customer_id).await
    }

    /// Create a subscription.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the customer or plan does not exist
    /// - `InvalidState` if the plan is inactive
    /// - `InvalidInput` if the quantity is zero
    pub async fn create(&self, request: CreateSubscription) -> Result<Subscription> {
        self.create_at(request, Utc::now()).await
    }

    /// [`Self::create`] with an explicit clock.
    pub async fn create_at(&self, request: CreateSubscription, now: DateTime<Utc>) -> Result<Subscription> {
        if request.quantity < 1 {
            return Err(BillingError::InvalidQuantity {
                quantity: i64::from(request.quantity),
            }
            .into());
        }

        let (customer, plan) = tokio::try_join!(
            self.store.get_customer(&request.customer_id),
            self.store.get_plan(&request.plan_id),
        )?;
        let customer = customer.ok_or_else(|| BillingError::CustomerNotFound {
            customer_id: request.customer_id.clone(),
        })?;
        let plan = plan.ok_or_else(|| BillingError::PlanNotFound {
            plan_id: request.plan_id.clone(),
        })?;
        if !plan.active {
            return Err(BillingError::PlanInactive { plan_id: plan.id }.into());
        }

        let trial_days = request.trial_days.or(plan.trial_days).filter(|d| *d > 0);

        let mut sub = Subscription {
            id: format!("sub_{}", uuid::Uuid::new_v4().simple()),
            customer_id: customer.id.clone(),
            plan_id: plan.id.clone(),
            quantity: request.quantity,
            currency: plan.currency.clone(),
            status: SubscriptionStatus::Active,
            current_period_start: now,
            current_period_end: plan.period_end(now),
            cancel_at_period_end: request.cancel_at_period_end,
            canceled_at: None,
            ended_at: None,
            trial_start: None,
            trial_end: None,
            pause_behavior: None,
            resumes_at: None,
            gateway_subscription_id: None,
            metadata: BTreeMap::new(),
            version: 0,
            created_at: now,
        };

        match (&customer.gateway_customer_id, &plan.gateway_price_id) {
            (Some(gateway_customer_id), Some(price_id)) => {
                let remote = self
                    .gateway
                    .create_subscription(CreateSubscriptionParams {
                        customer_id: gateway_customer_id.clone(),
                        price_id: price_id.clone(),
                        quantity: request.quantity,
                        trial_days,
                        payment_method_id: request.payment_method_id.clone(),
                        cancel_at_period_end: request.cancel_at_period_end,
                        coupon_id: request.coupon_id.clone(),
                        metadata: request.metadata.clone(),
                    })
                    .await?;
                adopt_gateway_state(&mut sub, &remote);
            }
            _ => {
                if let Some(days) = trial_days {
                    sub.status = SubscriptionStatus::Trialing;
                    sub.trial_start = Some(now);
                    sub.trial_end = Some(now + Duration::days(i64::from(days)));
                }
            }
        }

        sub.merge_metadata(request.metadata);
        sub.record_event("created_at", now.to_rfc3339());
        if let Some(coupon_id) = request.coupon_id {
            sub.record_event("coupon_id", coupon_id);
        }

        self.store.insert_subscription(&sub).await?;

        tracing::info!(
            target: TARGET,
            subscription_id = %sub.id,
            customer_id = %sub.customer_id,
            plan_id = %sub.plan_id,
            status = %sub.status,
            "Subscription created"
        );

        Ok(sub)
    }

    /// Apply a partial update.
    ///
    /// When a plan or quantity is supplied for a gateway-linked subscription,
    /// the gateway item id is re-resolved from the first subscription item
    /// before pushing the change.
    pub async fn update(&self, subscription_id: &str, update: UpdateSubscription) -> Result<Subscription> {
        self.update_at(subscription_id, update, Utc::now()).await
    }

    /// [`Self::update`] with an explicit clock.
    pub async fn update_at(
        &self,
        subscription_id: &str,
        update: UpdateSubscription,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let sub = self.load_mutable(subscription_id).await?;
        let expected_version = sub.version;

        if let Some(quantity) = update.quantity {
            if quantity < 1 {
                return Err(BillingError::InvalidQuantity {
                    quantity: i64::from(quantity),
                }
                .into());
            }
        }
        let new_plan = match &update.plan_id {
            Some(plan_id) => Some(self.load_active_plan(plan_id).await?),
            None => None,
        };

        let mut updated = sub.clone();

        if let Some(gateway_id) = sub.gateway_subscription_id.as_deref() {
            let mut params = UpdateSubscriptionParams {
                cancel_at_period_end: update.cancel_at_period_end,
                trial_end: update.trial_end,
                pause_collection: update.pause_collection,
                ..Default::default()
            };
            if new_plan.is_some() || update.quantity.is_some() {
                let item_id = self.primary_item_id(gateway_id).await?;
                params.items.push(SubscriptionItemUpdate {
                    item_id,
                    price_id: new_plan.as_ref().and_then(|p| p.gateway_price_id.clone()),
                    quantity: update.quantity,
                });
                params.proration_behavior = Some(ProrationBehavior::CreateProrations);
            }
            let remote = self.gateway.update_subscription(gateway_id, params).await?;
            adopt_gateway_state(&mut updated, &remote);
        } else {
            if let Some(trial_end) = update.trial_end {
                apply_trial_end(&mut updated, trial_end, now);
            }
            if let Some(pause) = update.pause_collection {
                apply_pause(&mut updated, pause, None);
            }
            if let Some(cancel) = update.cancel_at_period_end {
                updated.cancel_at_period_end = cancel;
            }
            if let Some(quantity) = update.quantity {
                updated.quantity = quantity;
            }
        }

        if let Some(plan) = &new_plan {
            updated.plan_id = plan.id.clone();
            updated.currency = plan.currency.clone();
        }
        if let Some(pause) = update.pause_collection {
            updated.pause_behavior = pause;
        }
        if matches!(update.trial_end, Some(TrialEnd::Now)) {
            updated.record_event("trial_ended_at", now.to_rfc3339());
        }
        updated.merge_metadata(update.metadata);
        updated.record_event("updated_at", now.to_rfc3339());

        self.save(updated, expected_version).await
    }

    /// Cancel a subscription.
    ///
    /// By default the subscription cancels at the end of the current period
    /// and its status is left untouched until the boundary is observed. Set
    /// `immediate` to cancel now.
    pub async fn cancel(&self, subscription_id: &str, immediate: bool) -> Result<Subscription> {
        self.cancel_at(subscription_id, immediate, Utc::now()).await
    }

    /// [`Self::cancel`] with an explicit clock.
    pub async fn cancel_at(
        &self,
        subscription_id: &str,
        immediate: bool,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let sub = self.load_mutable(subscription_id).await?;
        let expected_version = sub.version;
        let mut updated = sub.clone();

        if immediate {
            if let Some(gateway_id) = sub.gateway_subscription_id.as_deref() {
                self.gateway.cancel_subscription(gateway_id).await?;
            }
            updated.status = SubscriptionStatus::Canceled;
            updated.cancel_at_period_end = false;
            updated.canceled_at = Some(now);
            updated.ended_at = Some(now);
            updated.record_event("canceled_at", now.to_rfc3339());
        } else {
            if let Some(gateway_id) = sub.gateway_subscription_id.as_deref() {
                self.gateway
                    .update_subscription(
                        gateway_id,
                        UpdateSubscriptionParams {
                            cancel_at_period_end: Some(true),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            updated.cancel_at_period_end = true;
            updated.canceled_at = Some(now);
            updated.record_event("cancel_requested_at", now.to_rfc3339());
        }

        let saved = self.save(updated, expected_version).await?;
        tracing::info!(
            target: TARGET,
            subscription_id = %saved.id,
            immediate,
            "Subscription canceled"
        );
        Ok(saved)
    }

    /// Clear a scheduled cancellation.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the subscription is already canceled.
    pub async fn resume(&self, subscription_id: &str) -> Result<Subscription> {
        let sub = self.load_mutable(subscription_id).await?;
        let expected_version = sub.version;

        if let Some(gateway_id) = sub.gateway_subscription_id.as_deref() {
            self.gateway.resume_subscription(gateway_id).await?;
        }

        let mut updated = sub;
        updated.cancel_at_period_end = false;
        updated.canceled_at = None;
        updated.record_event("resumed_at", Utc::now().to_rfc3339());
        self.save(updated, expected_version).await
    }

    /// Pause collection.
    pub async fn pause(
        &self,
        subscription_id: &str,
        behavior: PauseBehavior,
        resumes_at: Option<DateTime<Utc>>,
    ) -> Result<Subscription> {
        let sub = self.load_mutable(subscription_id).await?;
        let expected_version = sub.version;

        if let Some(gateway_id) = sub.gateway_subscription_id.as_deref() {
            self.gateway
                .update_subscription(
                    gateway_id,
                    UpdateSubscriptionParams {
                        pause_collection: Some(Some(behavior)),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let mut updated = sub;
        apply_pause(&mut updated, Some(behavior), resumes_at);
        updated.record_event("paused_at", Utc::now().to_rfc3339());
        updated.record_event("pause_behavior", behavior.as_str());
        self.save(updated, expected_version).await
    }

    /// Resume collection on a paused subscription.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the subscription is not paused.
    pub async fn unpause(&self, subscription_id: &str) -> Result<Subscription> {
        let sub = self.load_mutable(subscription_id).await?;
        if sub.status != SubscriptionStatus::Paused {
            return Err(BillingError::SubscriptionNotPaused {
                subscription_id: sub.id,
            }
            .into());
        }
        let expected_version = sub.version;

        if let Some(gateway_id) = sub.gateway_subscription_id.as_deref() {
            self.gateway
                .update_subscription(
                    gateway_id,
                    UpdateSubscriptionParams {
                        pause_collection: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let mut updated = sub;
        apply_pause(&mut updated, None, None);
        updated.record_event("unpaused_at", Utc::now().to_rfc3339());
        self.save(updated, expected_version).await
    }

    /// Move a subscription to another plan.
    ///
    /// When `prorate` is set, the credit for the unused part of the current
    /// plan and the charge for the rest of the period on the new plan are
    /// computed before committing. The local plan and currency always change,
    /// gateway or not.
    pub async fn change_plan(&self, subscription_id: &str, new_plan_id: &str, prorate: bool) -> Result<ChangeResult> {
        self.change_plan_at(subscription_id, new_plan_id, prorate, Utc::now()).await
    }

    /// [`Self::change_plan`] with an explicit clock.
    pub async fn change_plan_at(
        &self,
        subscription_id: &str,
        new_plan_id: &str,
        prorate: bool,
        now: DateTime<Utc>,
    ) -> Result<ChangeResult> {
        let sub = self.load_mutable(subscription_id).await?;
        let new_plan = self.load_active_plan(new_plan_id).await?;
        let current_plan = self.load_plan(&sub.plan_id).await?;
        let expected_version = sub.version;

        let proration = if prorate {
            Some(self.prorate(
                &sub,
                sub.period_amount(&current_plan),
                sub.period_amount(&new_plan),
                now,
            )?)
        } else {
            None
        };

        let mut updated = sub.clone();
        if let (Some(gateway_id), Some(price_id)) =
            (sub.gateway_subscription_id.as_deref(), new_plan.gateway_price_id.as_ref())
        {
            let item_id = self.primary_item_id(gateway_id).await?;
            let remote = self
                .gateway
                .update_subscription(
                    gateway_id,
                    UpdateSubscriptionParams {
                        items: vec![SubscriptionItemUpdate {
                            item_id,
                            price_id: Some(price_id.clone()),
                            quantity: None,
                        }],
                        proration_behavior: Some(proration_behavior(prorate)),
                        ..Default::default()
                    },
                )
                .await?;
            adopt_gateway_state(&mut updated, &remote);
        }

        updated.plan_id = new_plan.id.clone();
        updated.currency = new_plan.currency.clone();
        updated.record_event("plan_changed", format!("{}->{}", current_plan.id, new_plan.id));

        let subscription = self.save(updated, expected_version).await?;
        tracing::info!(
            target: TARGET,
            subscription_id = %subscription.id,
            from_plan = %current_plan.id,
            to_plan = %new_plan.id,
            net_amount = ?proration.map(|p| p.net_amount),
            "Subscription plan changed"
        );
        Ok(ChangeResult { subscription, proration })
    }

    /// Change the subscribed quantity.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `quantity < 1`.
    pub async fn update_quantity(&self, subscription_id: &str, quantity: u32, prorate: bool) -> Result<ChangeResult> {
        self.update_quantity_at(subscription_id, quantity, prorate, Utc::now()).await
    }

    /// [`Self::update_quantity`] with an explicit clock.
    pub async fn update_quantity_at(
        &self,
        subscription_id: &str,
        quantity: u32,
        prorate: bool,
        now: DateTime<Utc>,
    ) -> Result<ChangeResult> {
        if quantity < 1 {
            return Err(BillingError::InvalidQuantity {
                quantity: i64::from(quantity),
            }
            .into());
        }

        let sub = self.load_mutable(subscription_id).await?;
        let plan = self.load_plan(&sub.plan_id).await?;
        let expected_version = sub.version;

        let proration = if prorate {
            Some(self.prorate(
                &sub,
                sub.period_amount(&plan),
                plan.amount * Decimal::from(quantity),
                now,
            )?)
        } else {
            None
        };

        let mut updated = sub.clone();
        if let Some(gateway_id) = sub.gateway_subscription_id.as_deref() {
            let item_id = self.primary_item_id(gateway_id).await?;
            let remote = self
                .gateway
                .update_subscription(
                    gateway_id,
                    UpdateSubscriptionParams {
                        items: vec![SubscriptionItemUpdate {
                            item_id,
                            price_id: None,
                            quantity: Some(quantity),
                        }],
                        proration_behavior: Some(proration_behavior(prorate)),
                        ..Default::default()
                    },
                )
                .await?;
            adopt_gateway_state(&mut updated, &remote);
        }
        updated.quantity = quantity;
        updated.record_event("quantity_changed", format!("{}->{}", sub.quantity, quantity));

        let subscription = self.save(updated, expected_version).await?;
        Ok(ChangeResult { subscription, proration })
    }

    /// Append a usage record.
    ///
    /// Without an idempotency key the record is always appended. With a key,
    /// a second record under the same key for this subscription fails with
    /// `InvalidState`. If the gateway rejects the usage the local record is
    /// dropped, so the same key can be retried.
    pub async fn record_usage(
        &self,
        subscription_id: &str,
        quantity: u64,
        action: UsageAction,
        idempotency_key: Option<String>,
    ) -> Result<UsageRecord> {
        self.record_usage_at(subscription_id, quantity, action, idempotency_key, Utc::now())
            .await
    }

    /// [`Self::record_usage`] with an explicit timestamp.
    pub async fn record_usage_at(
        &self,
        subscription_id: &str,
        quantity: u64,
        action: UsageAction,
        idempotency_key: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<UsageRecord> {
        let sub = self.load(subscription_id).await?;

        let record = UsageRecord {
            id: format!("ur_{}", uuid::Uuid::new_v4().simple()),
            subscription_id: sub.id.clone(),
            quantity,
            action,
            timestamp,
            idempotency_key,
        };
        // Reserving the key first keeps concurrent duplicates off the gateway.
        self.store.record_usage(&record).await?;

        if let Some(gateway_id) = sub.gateway_subscription_id.as_deref() {
            if let Err(err) = self.push_usage(gateway_id, quantity, action, timestamp).await {
                self.store.remove_usage(&record.id).await?;
                tracing::warn!(
                    target: TARGET,
                    subscription_id = %sub.id,
                    error = %err,
                    "Usage not accepted by gateway, local record released"
                );
                return Err(err);
            }
        }

        tracing::debug!(
            target: TARGET,
            subscription_id = %sub.id,
            quantity,
            action = ?action,
            "Usage recorded"
        );
        Ok(record)
    }

    async fn push_usage(
        &self,
        gateway_subscription_id: &str,
        quantity: u64,
        action: UsageAction,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let subscription_item_id = self.primary_item_id(gateway_subscription_id).await?;
        self.gateway
            .create_usage_record(UsageRecordParams {
                subscription_item_id,
                quantity,
                action,
                timestamp,
            })
            .await
    }

    /// Flip trialing subscriptions whose trial has ended to `active`.
    pub async fn process_expired_trials(&self) -> Result<TrialSweepResult> {
        self.process_expired_trials_at(Utc::now()).await
    }

    /// [`Self::process_expired_trials`] with an explicit clock.
    ///
    /// One subscription failing does not stop the sweep; it is logged and
    /// counted in `failed`.
    pub async fn process_expired_trials_at(&self, now: DateTime<Utc>) -> Result<TrialSweepResult> {
        let trialing = self
            .store
            .list_subscriptions_by_status(SubscriptionStatus::Trialing)
            .await?;

        let mut result = TrialSweepResult::default();
        for sub in trialing {
            if !sub.trial_end.is_some_and(|end| end <= now) {
                continue;
            }
            let expected_version = sub.version;
            let mut updated = sub;
            updated.status = SubscriptionStatus::Active;
            updated.trial_end = None;
            updated.record_event("trial_expired_at", now.to_rfc3339());

            let id = updated.id.clone();
            match self.save(updated, expected_version).await {
                Ok(_) => result.processed += 1,
                Err(error) => {
                    result.failed += 1;
                    tracing::warn!(
                        target: TARGET,
                        subscription_id = %id,
                        error = %error,
                        "Failed to expire trial"
                    );
                }
            }
        }

        tracing::info!(
            target: TARGET,
            processed = result.processed,
            failed = result.failed,
            "Trial expiry sweep finished"
        );
        Ok(result)
    }

    /// Compare local state with the gateway and optionally adopt it.
    ///
    /// Useful to detect and recover from missed webhooks.
    pub async fn reconcile(&self, subscription_id: &str, update_local: bool) -> Result<ReconcileResult> {
        let Some(stored) = self.store.get_subscription(subscription_id).await? else {
            return Ok(ReconcileResult::NoLocalSubscription);
        };
        let Some(gateway_id) = stored.gateway_subscription_id.clone() else {
            return Ok(ReconcileResult::NotLinked);
        };

        let remote = match self.gateway.get_subscription(&gateway_id).await {
            Ok(remote) => remote,
            Err(error) => {
                tracing::debug!(
                    target: TARGET,
                    subscription_id = %stored.id,
                    error = %error,
                    "Gateway subscription lookup failed during reconcile"
                );
                return Ok(ReconcileResult::NotFoundInGateway);
            }
        };

        let mut differences = Vec::new();
        let remote_status = SubscriptionStatus::from_gateway(&remote.status);
        if stored.status != remote_status {
            differences.push(ReconcileDifference::Status {
                local: stored.status.as_str().to_string(),
                remote: remote.status.clone(),
            });
        }
        if let Some(item) = remote.primary_item() {
            if item.quantity != stored.quantity {
                differences.push(ReconcileDifference::Quantity {
                    local: stored.quantity,
                    remote: item.quantity,
                });
            }
        }
        if stored.current_period_end != remote.current_period_end {
            differences.push(ReconcileDifference::PeriodEnd {
                local: stored.current_period_end,
                remote: remote.current_period_end,
            });
        }
        if stored.cancel_at_period_end != remote.cancel_at_period_end {
            differences.push(ReconcileDifference::CancelAtPeriodEnd {
                local: stored.cancel_at_period_end,
                remote: remote.cancel_at_period_end,
            });
        }

        if differences.is_empty() {
            return Ok(ReconcileResult::InSync);
        }

        if update_local {
            let expected_version = stored.version;
            let mut updated = stored;
            adopt_gateway_state(&mut updated, &remote);
            updated.record_event("reconciled_at", Utc::now().to_rfc3339());
            self.save(updated, expected_version).await?;
        }

        Ok(ReconcileResult::Diverged {
            differences,
            updated_local: update_local,
        })
    }

    async fn load(&self, subscription_id: &str) -> Result<Subscription> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::SubscriptionNotFound {
                    subscription_id: subscription_id.to_string(),
                }
                .into()
            })
    }

    /// Load a subscription that may still change; canceled is terminal.
    async fn load_mutable(&self, subscription_id: &str) -> Result<Subscription> {
        let sub = self.load(subscription_id).await?;
        if sub.is_canceled() {
            return Err(BillingError::SubscriptionCanceled {
                subscription_id: sub.id,
            }
            .into());
        }
        Ok(sub)
    }

    async fn load_plan(&self, plan_id: &str) -> Result<Plan> {
        self.store.get_plan(plan_id).await?.ok_or_else(|| {
            BillingError::PlanNotFound {
                plan_id: plan_id.to_string(),
            }
            .into()
        })
    }

    async fn load_active_plan(&self, plan_id: &str) -> Result<Plan> {
        let plan = self.load_plan(plan_id).await?;
        if !plan.active {
            return Err(BillingError::PlanInactive { plan_id: plan.id }.into());
        }
        Ok(plan)
    }

    async fn primary_item_id(&self, gateway_subscription_id: &str) -> Result<String> {
        let remote = self.gateway.get_subscription(gateway_subscription_id).await?;
        remote.primary_item().map(|item| item.id.clone()).ok_or_else(|| {
            BillflowError::gateway(
                GatewayKind::Payment,
                "get_subscription",
                format!("subscription {} has no items", gateway_subscription_id),
            )
        })
    }

    fn prorate(
        &self,
        sub: &Subscription,
        current_amount: Decimal,
        new_amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ProratedAmount> {
        let at = clamp_to_period(now, sub.current_period_start, sub.current_period_end);
        calculate_proration(
            sub.current_period_start,
            sub.current_period_end,
            current_amount,
            new_amount,
            at,
        )
    }

    async fn save(&self, mut sub: Subscription, expected_version: u64) -> Result<Subscription> {
        if !self
            .store
            .compare_and_save_subscription(&sub, expected_version)
            .await?
        {
            return Err(BillingError::ConcurrentModification {
                entity: "subscription",
                id: sub.id,
            }
            .into());
        }
        sub.version = expected_version + 1;
        Ok(sub)
    }
}

fn proration_behavior(prorate: bool) -> ProrationBehavior {
    if prorate {
        ProrationBehavior::CreateProrations
    } else {
        ProrationBehavior::None
    }
}

fn apply_trial_end(sub: &mut Subscription, trial_end: TrialEnd, now: DateTime<Utc>) {
    match trial_end {
        TrialEnd::At(at) if at > now => {
            sub.trial_end = Some(at);
        }
        TrialEnd::Now | TrialEnd::At(_) => {
            sub.trial_end = None;
            if sub.status == SubscriptionStatus::Trialing {
                sub.status = SubscriptionStatus::Active;
            }
        }
    }
}

fn apply_pause(sub: &mut Subscription, behavior: Option<PauseBehavior>, resumes_at: Option<DateTime<Utc>>) {
    match behavior {
        Some(behavior) => {
            sub.status = SubscriptionStatus::Paused;
            sub.pause_behavior = Some(behavior);
            sub.resumes_at = resumes_at;
        }
        None => {
            if sub.status == SubscriptionStatus::Paused {
                sub.status = SubscriptionStatus::Active;
            }
            sub.pause_behavior = None;
            sub.resumes_at = None;
        }
    }
}
