//! Billing-specific error types.
//!
//! Carries structured context for billing failures and converts into
//! [`BillflowError`] for HTTP responses.

use rust_decimal::Decimal;
use std::fmt;

use crate::error::BillflowError;

/// Billing-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Lookup errors
    /// The customer was not found.
    CustomerNotFound { customer_id: String },
    /// The plan was not found.
    PlanNotFound { plan_id: String },
    /// The subscription was not found.
    SubscriptionNotFound { subscription_id: String },
    /// The invoice was not found.
    InvoiceNotFound { invoice_id: String },
    /// The payment was not found.
    PaymentNotFound { payment_id: String },
    /// The invoice line item was not found.
    LineItemNotFound { invoice_id: String, line_item_id: String },

    // State errors
    /// The plan is deactivated and cannot back new subscriptions.
    PlanInactive { plan_id: String },
    /// The subscription is canceled (terminal).
    SubscriptionCanceled { subscription_id: String },
    /// The subscription is not paused.
    SubscriptionNotPaused { subscription_id: String },
    /// Only draft invoices can be edited or finalized.
    InvoiceNotDraft { invoice_id: String, status: String },
    /// The invoice is already paid.
    InvoiceAlreadyPaid { invoice_id: String },
    /// The invoice cannot take this transition from its current status.
    InvoiceTransitionNotAllowed { invoice_id: String, status: String, action: &'static str },
    /// The payment cannot take this transition from its current status.
    PaymentTransitionNotAllowed { payment_id: String, status: String, action: &'static str },
    /// The refund would exceed the refundable amount.
    RefundExceedsAvailable { payment_id: String, requested: Decimal, available: Decimal },
    /// The usage record idempotency key was already used.
    DuplicateUsageRecord { idempotency_key: String },
    /// Not enough customer credit for the requested application.
    InsufficientCredits { customer_id: String, requested: Decimal, available: Decimal },
    /// The record changed since it was read; retry the operation.
    ConcurrentModification { entity: &'static str, id: String },

    // Input errors
    /// Quantity must be at least one.
    InvalidQuantity { quantity: i64 },
    /// Amount must be positive.
    InvalidAmount { message: String },

    // Webhook errors
    /// Webhook signature is invalid.
    InvalidWebhookSignature { reason: String },
    /// Webhook event data is malformed.
    InvalidWebhookPayload { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CustomerNotFound { customer_id } => {
                write!(f, "Customer not found: {}", customer_id)
            }
            Self::PlanNotFound { plan_id } => write!(f, "Plan not found: {}", plan_id),
            Self::SubscriptionNotFound { subscription_id } => {
                write!(f, "Subscription not found: {}", subscription_id)
            }
            Self::InvoiceNotFound { invoice_id } => write!(f, "Invoice not found: {}", invoice_id),
            Self::PaymentNotFound { payment_id } => write!(f, "Payment not found: {}", payment_id),
            Self::LineItemNotFound { invoice_id, line_item_id } => {
                write!(f, "Line item '{}' not found on invoice '{}'", line_item_id, invoice_id)
            }
            Self::PlanInactive { plan_id } => write!(f, "Plan '{}' is not active", plan_id),
            Self::SubscriptionCanceled { subscription_id } => {
                write!(f, "Subscription '{}' is canceled", subscription_id)
            }
            Self::SubscriptionNotPaused { subscription_id } => {
                write!(f, "Subscription '{}' is not paused", subscription_id)
            }
            Self::InvoiceNotDraft { invoice_id, status } => {
                write!(f, "Invoice '{}' is {}, expected draft", invoice_id, status)
            }
            Self::InvoiceAlreadyPaid { invoice_id } => {
                write!(f, "Invoice '{}' is already paid", invoice_id)
            }
            Self::InvoiceTransitionNotAllowed { invoice_id, status, action } => {
                write!(f, "Cannot {} invoice '{}' in status {}", action, invoice_id, status)
            }
            Self::PaymentTransitionNotAllowed { payment_id, status, action } => {
                write!(f, "Cannot {} payment '{}' in status {}", action, payment_id, status)
            }
            Self::RefundExceedsAvailable { payment_id, requested, available } => write!(
                f,
                "Refund of {} exceeds refundable amount {} for payment '{}'",
                requested, available, payment_id
            ),
            Self::DuplicateUsageRecord { idempotency_key } => {
                write!(f, "Usage record with key '{}' already recorded", idempotency_key)
            }
            Self::InsufficientCredits { customer_id, requested, available } => write!(
                f,
                "Customer '{}' has {} credit available, {} requested",
                customer_id, available, requested
            ),
            Self::ConcurrentModification { entity, id } => {
                write!(f, "Concurrent modification detected for {} '{}', please retry", entity, id)
            }
            Self::InvalidQuantity { quantity } => {
                write!(f, "Quantity must be at least 1, got {}", quantity)
            }
            Self::InvalidAmount { message } => write!(f, "Invalid amount: {}", message),
            Self::InvalidWebhookSignature { reason } => {
                write!(f, "Invalid webhook signature: {}", reason)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for BillflowError {
    fn from(err: BillingError) -> Self {
        match &err {
            BillingError::CustomerNotFound { .. }
            | BillingError::PlanNotFound { .. }
            | BillingError::SubscriptionNotFound { .. }
            | BillingError::InvoiceNotFound { .. }
            | BillingError::PaymentNotFound { .. }
            | BillingError::LineItemNotFound { .. } => BillflowError::NotFound(err.to_string()),

            BillingError::PlanInactive { .. }
            | BillingError::SubscriptionCanceled { .. }
            | BillingError::SubscriptionNotPaused { .. }
            | BillingError::InvoiceNotDraft { .. }
            | BillingError::InvoiceAlreadyPaid { .. }
            | BillingError::InvoiceTransitionNotAllowed { .. }
            | BillingError::PaymentTransitionNotAllowed { .. }
            | BillingError::RefundExceedsAvailable { .. }
            | BillingError::DuplicateUsageRecord { .. }
            | BillingError::InsufficientCredits { .. } => {
                BillflowError::InvalidState(err.to_string())
            }

            BillingError::ConcurrentModification { .. } => {
                BillflowError::ConcurrentModification(err.to_string())
            }

            BillingError::InvalidQuantity { .. }
            | BillingError::InvalidAmount { .. }
            | BillingError::InvalidWebhookPayload { .. } => {
                BillflowError::InvalidInput(err.to_string())
            }

            BillingError::InvalidWebhookSignature { .. } => {
                BillflowError::SignatureInvalid(err.to_string())
            }
        }
    }
}

impl BillingError {
    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::ConcurrentModification { .. })
    }

    /// Check if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}
