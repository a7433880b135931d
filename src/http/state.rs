use std::sync::Arc;

use crate::billing::{
    BillingEngine, BillingStore, PaymentGateway, StripeWebhookHandler, SubscriptionEngine,
};
use crate::config::WebhookConfig;
use crate::ledger::LedgerWebhookProcessor;
use crate::webhooks::MemoryIdempotencyStore;

const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Shared state for every route: the engines, built once over one store and
/// one gateway.
pub struct AppState<S: BillingStore, G: PaymentGateway> {
    pub subscriptions: Arc<SubscriptionEngine<S, G>>,
    pub billing: Arc<BillingEngine<S, G>>,
    pub stripe_webhooks: Arc<StripeWebhookHandler<S>>,
    pub ledger_webhooks: Arc<LedgerWebhookProcessor<MemoryIdempotencyStore>>,
    pub max_body_size: usize,
}

impl<S, G> AppState<S, G>
where
    S: BillingStore + Clone,
    G: PaymentGateway + Clone,
{
    pub fn new(store: S, gateway: G, webhooks: &WebhookConfig) -> Self {
        Self {
            subscriptions: Arc::new(SubscriptionEngine::new(store.clone(), gateway.clone())),
            billing: Arc::new(BillingEngine::new(store.clone(), gateway)),
            stripe_webhooks: Arc::new(
                StripeWebhookHandler::new(store, webhooks.stripe_secret.clone())
                    .with_tolerance(webhooks.tolerance_seconds),
            ),
            ledger_webhooks: Arc::new(LedgerWebhookProcessor::new(
                webhooks.ramp_secret.clone(),
                MemoryIdempotencyStore::new(),
            )),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl<S: BillingStore, G: PaymentGateway> AppState<S, G> {
    /// Maximum accepted request body, in bytes.
    #[must_use]
    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }
}

impl<S: BillingStore, G: PaymentGateway> Clone for AppState<S, G> {
    fn clone(&self) -> Self {
        Self {
            subscriptions: Arc::clone(&self.subscriptions),
            billing: Arc::clone(&self.billing),
            stripe_webhooks: Arc::clone(&self.stripe_webhooks),
            ledger_webhooks: Arc::clone(&self.ledger_webhooks),
            max_body_size: self.max_body_size,
        }
    }
}
