//! Billing core: subscriptions, proration, invoices, payments and
//! reconciliation against the payment gateway.
//!
//! Engines are generic over a [`BillingStore`] and a [`PaymentGateway`] and
//! are constructed once with their collaborators injected.
//!
//! # Example
//!
//! ```rust,ignore
//! use billflow::billing::{
//!     BillingEngine, CreateSubscription, InMemoryBillingStore, SubscriptionEngine,
//! };
//!
//! let store = InMemoryBillingStore::new();
//! let subscriptions = SubscriptionEngine::new(store.clone(), gateway.clone());
//! let billing = BillingEngine::new(store.clone(), gateway);
//!
//! let sub = subscriptions
//!     .create(CreateSubscription::new("cus_1", "pro").quantity(3))
//!     .await?;
//!
//! // At period end
//! let invoice = billing.process_end_of_period_billing(&sub.id).await?;
//! ```

pub mod error;
pub mod gateway;
pub mod invoice;
pub mod model;
pub mod money;
pub mod payment;
pub mod period;
pub mod proration;
pub mod reconciliation;
pub mod storage;
pub mod subscription;
pub mod webhook;

// Model exports
pub use model::{
    Customer, CustomerStatus, Invoice, InvoiceLineItem, InvoiceStatus, LineItemKind,
    PauseBehavior, Payment, PaymentStatus, Plan, Refund, Subscription, SubscriptionStatus,
    UsageAction, UsageRecord,
};

// Money and period exports
pub use money::{from_minor_units, normalize_currency, round_money, to_minor_units};
pub use period::{BillingInterval, advance, days_between, monthly_amount};

// Gateway exports
pub use gateway::{PaymentGateway, ProrationBehavior, TrialEnd};

// Storage exports
pub use storage::{
    BillingStore, CreditStore, CustomerStore, EventStore, InvoiceStore, PaymentStore, PlanStore,
    Settlement, SubscriptionStore, UsageStore,
};
pub use storage::memory::InMemoryBillingStore;

// Engine exports
pub use invoice::{InvoiceManager, NewLineItem};
pub use payment::{CreatePayment, PaymentManager, RefundOutcome};
pub use proration::{ProratedAmount, calculate_proration};
pub use reconciliation::{
    BillingEngine, BillingOverview, DateRange, RenewalSweepResult, RevenueBreakdown,
};
pub use subscription::{
    ChangeResult, CreateSubscription, ReconcileDifference, ReconcileResult, SubscriptionEngine,
    TrialSweepResult, UpdateSubscription,
};

// Webhook exports
pub use webhook::{StripeEvent, StripeEventKind, StripeWebhookHandler, WebhookOutcome};

// Error exports
pub use error::BillingError;
