//! Payment management.
//!
//! Payments wrap a gateway payment intent. Status only moves forward, with
//! one exception: a failed payment can be retried, which attaches a new
//! gateway intent and puts it back to `pending`.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::error::Result;
use super::error::BillingError;
use super::gateway::{CreatePaymentIntentParams, CreateRefundParams, PaymentGateway};
use super::model::{Payment, PaymentStatus, Refund};
use super::money::round_money;
use super::storage::BillingStore;

const TARGET: &str = "billflow::billing::payment";

/// Request to create a payment.
#[derive(Debug, Clone)]
pub struct CreatePayment {
    pub customer_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub invoice_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl CreatePayment {
    #[must_use]
    pub fn new(customer_id: impl Into<String>, amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            amount,
            currency: currency.into(),
            invoice_id: None,
            payment_method_id: None,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn for_invoice(mut self, invoice_id: impl Into<String>) -> Self {
        self.invoice_id = Some(invoice_id.into());
        self
    }

    #[must_use]
    pub fn payment_method(mut self, payment_method_id: impl Into<String>) -> Self {
        self.payment_method_id = Some(payment_method_id.into());
        self
    }
}

/// A refund together with the payment it was taken from.
#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub refund: Refund,
    pub payment: Payment,
}

/// Payment operations.
pub struct PaymentManager<S: BillingStore, G: PaymentGateway> {
    store: S,
    gateway: G,
}

impl<S: BillingStore, G: PaymentGateway> PaymentManager<S, G> {
    /// Create a new payment manager.
    #[must_use]
    pub fn new(store: S, gateway: G) -> Self {
        Self { store, gateway }
    }

    pub async fn get(&self, payment_id: &str) -> Result<Payment> {
        self.load(payment_id).await
    }

    pub async fn list_for_customer(&self, customer_id: &str) -> Result<Vec<Payment>> {
        Ok(self
            .store
            .list_payments()
            .await?
            .into_iter()
            .filter(|p| p.customer_id == customer_id)
            .collect())
    }

    /// Create a payment and its gateway intent (unconfirmed).
    pub async fn create(&self, request: CreatePayment) -> Result<Payment> {
        if request.amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount {
                message: format!("payment amount must be positive, got {}", request.amount),
            }
            .into());
        }
        let customer = self
            .store
            .get_customer(&request.customer_id)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound {
                customer_id: request.customer_id.clone(),
            })?;
        if let Some(invoice_id) = request.invoice_id.as_deref() {
            let invoice = self.store.get_invoice(invoice_id).await?;
            if invoice.is_none_or(|i| i.customer_id != customer.id) {
                return Err(BillingError::InvoiceNotFound {
                    invoice_id: invoice_id.to_string(),
                }
                .into());
            }
        }

        let mut payment = Payment::new(&customer.id, request.amount, &request.currency);
        payment.invoice_id = request.invoice_id.clone();
        payment.payment_method_id = request.payment_method_id.clone();

        let mut metadata = request.metadata;
        metadata.insert("payment_id".to_string(), payment.id.clone());
        if let Some(invoice_id) = &request.invoice_id {
            metadata.insert("invoice_id".to_string(), invoice_id.clone());
        }
        let intent = self
            .gateway
            .create_payment_intent(CreatePaymentIntentParams {
                amount: payment.amount,
                currency: payment.currency.clone(),
                customer_id: customer.gateway_customer_id.clone(),
                payment_method_id: request.payment_method_id,
                confirm: false,
                metadata,
            })
            .await?;
        payment.gateway_payment_intent_id = Some(intent.id);

        self.store.insert_payment(&payment).await?;
        tracing::info!(
            target: TARGET,
            payment_id = %payment.id,
            customer_id = %payment.customer_id,
            amount = %payment.amount,
            "Payment created"
        );
        Ok(payment)
    }

    /// Confirm a pending payment at the gateway.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the payment already succeeded or is otherwise final.
    pub async fn confirm(&self, payment_id: &str, payment_method_id: Option<&str>) -> Result<Payment> {
        let payment = self.load_in_flight(payment_id, "confirm").await?;
        let intent_id = intent_id(&payment)?;

        let intent = self
            .gateway
            .confirm_payment_intent(&intent_id, payment_method_id)
            .await?;
        let reported = PaymentStatus::from_intent_status(&intent.status);

        let mut updated = payment;
        if let Some(pm) = intent
            .payment_method_id
            .filter(|pm| updated.payment_method_id.as_deref() != Some(pm.as_str()))
        {
            let expected_version = updated.version;
            updated.payment_method_id = Some(pm);
            updated = self.save(updated, expected_version).await?;
        }
        if reported != PaymentStatus::Succeeded {
            updated.failure_reason = intent.last_error;
        }
        self.advance(updated, reported).await
    }

    /// Capture an authorized payment.
    pub async fn capture(&self, payment_id: &str) -> Result<Payment> {
        let payment = self.load_in_flight(payment_id, "capture").await?;
        let intent_id = intent_id(&payment)?;

        let intent = self.gateway.capture_payment_intent(&intent_id).await?;
        let reported = PaymentStatus::from_intent_status(&intent.status);
        self.advance(payment, reported).await
    }

    /// Cancel a payment that has not completed.
    pub async fn cancel(&self, payment_id: &str) -> Result<Payment> {
        let payment = self.load_in_flight(payment_id, "cancel").await?;
        let intent_id = intent_id(&payment)?;

        self.gateway.cancel_payment_intent(&intent_id).await?;
        self.advance(payment, PaymentStatus::Canceled).await
    }

    /// Refund all or part of a captured payment.
    ///
    /// `amount` defaults to everything still refundable. The refundable
    /// amount is re-checked when the refund is committed, so concurrent
    /// refunds can never exceed the payment.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the payment has not succeeded or the amount
    /// exceeds what is still refundable.
    pub async fn refund_payment(
        &self,
        payment_id: &str,
        amount: Option<Decimal>,
        reason: Option<String>,
    ) -> Result<RefundOutcome> {
        let payment = self.load(payment_id).await?;
        if !matches!(
            payment.status,
            PaymentStatus::Succeeded | PaymentStatus::PartiallyRefunded
        ) {
            return Err(BillingError::PaymentTransitionNotAllowed {
                payment_id: payment.id,
                status: payment.status.to_string(),
                action: "refund",
            }
            .into());
        }

        let available = payment.refundable_amount();
        let amount = round_money(amount.unwrap_or(available));
        if amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount {
                message: format!("refund amount must be positive, got {}", amount),
            }
            .into());
        }
        if amount > available {
            return Err(BillingError::RefundExceedsAvailable {
                payment_id: payment.id,
                requested: amount,
                available,
            }
            .into());
        }

        let gateway_refund_id = match payment.gateway_payment_intent_id.as_deref() {
            Some(intent_id) => Some(
                self.gateway
                    .create_refund(CreateRefundParams {
                        payment_intent_id: intent_id.to_string(),
                        amount,
                        reason: reason.clone(),
                    })
                    .await?
                    .id,
            ),
            None => None,
        };

        let refund = Refund {
            id: format!("re_{}", uuid::Uuid::new_v4().simple()),
            payment_id: payment.id.clone(),
            customer_id: payment.customer_id.clone(),
            amount,
            currency: payment.currency.clone(),
            reason,
            gateway_refund_id,
            created_at: Utc::now(),
        };
        let payment = self.store.apply_refund(&refund).await?;

        tracing::info!(
            target: TARGET,
            payment_id = %payment.id,
            refund_id = %refund.id,
            amount = %refund.amount,
            status = %payment.status,
            "Payment refunded"
        );
        Ok(RefundOutcome { refund, payment })
    }

    /// Retry a failed payment with a fresh gateway intent.
    ///
    /// Moves the payment from `failed` back to `pending`; confirm it again
    /// afterwards.
    pub async fn retry_payment(&self, payment_id: &str, payment_method_id: Option<&str>) -> Result<Payment> {
        let payment = self.load(payment_id).await?;
        if payment.status != PaymentStatus::Failed {
            return Err(BillingError::PaymentTransitionNotAllowed {
                payment_id: payment.id,
                status: payment.status.to_string(),
                action: "retry",
            }
            .into());
        }
        let customer = self.store.get_customer(&payment.customer_id).await?;

        let mut metadata = BTreeMap::new();
        metadata.insert("payment_id".to_string(), payment.id.clone());
        metadata.insert(
            "retry_of".to_string(),
            payment.gateway_payment_intent_id.clone().unwrap_or_default(),
        );
        let intent = self
            .gateway
            .create_payment_intent(CreatePaymentIntentParams {
                amount: payment.amount,
                currency: payment.currency.clone(),
                customer_id: customer.and_then(|c| c.gateway_customer_id),
                payment_method_id: payment_method_id
                    .map(str::to_string)
                    .or_else(|| payment.payment_method_id.clone()),
                confirm: false,
                metadata,
            })
            .await?;

        let expected_version = payment.version;
        let mut updated = payment;
        updated.status = PaymentStatus::Pending;
        updated.gateway_payment_intent_id = Some(intent.id);
        updated.failure_reason = None;
        if let Some(pm) = payment_method_id {
            updated.payment_method_id = Some(pm.to_string());
        }
        updated.updated_at = Utc::now();
        let saved = self.save(updated, expected_version).await?;

        tracing::info!(target: TARGET, payment_id = %saved.id, "Failed payment queued for retry");
        Ok(saved)
    }

    /// Move a payment to a gateway-reported status.
    ///
    /// Success goes through the store's settlement so the linked invoice is
    /// credited exactly once.
    async fn advance(&self, payment: Payment, reported: PaymentStatus) -> Result<Payment> {
        if reported == PaymentStatus::Succeeded {
            let settled = self
                .store
                .settle_payment(&payment.id, payment.status, Utc::now())
                .await?;
            return match settled {
                Some(settlement) => Ok(settlement.payment),
                None => self.load(&payment.id).await,
            };
        }
        if !payment.status.can_advance_to(reported) {
            return Ok(payment);
        }

        let expected_version = payment.version;
        let mut updated = payment;
        updated.status = reported;
        updated.updated_at = Utc::now();
        self.save(updated, expected_version).await
    }

    async fn load(&self, payment_id: &str) -> Result<Payment> {
        self.store.get_payment(payment_id).await?.ok_or_else(|| {
            BillingError::PaymentNotFound {
                payment_id: payment_id.to_string(),
            }
            .into()
        })
    }

    /// Load a payment that has not reached a final status.
    async fn load_in_flight(&self, payment_id: &str, action: &'static str) -> Result<Payment> {
        let payment = self.load(payment_id).await?;
        if !matches!(payment.status, PaymentStatus::Pending | PaymentStatus::Processing) {
            return Err(BillingError::PaymentTransitionNotAllowed {
                payment_id: payment.id,
                status: payment.status.to_string(),
                action,
            }
            .into());
        }
        Ok(payment)
    }

    async fn save(&self, mut payment: Payment, expected_version: u64) -> Result<Payment> {
        if !self
            .store
            .compare_and_save_payment(&payment, expected_version)
            .await?
        {
            return Err(BillingError::ConcurrentModification {
                entity: "payment",
                id: payment.id,
            }
            .into());
        }
        payment.version = expected_version + 1;
        Ok(payment)
    }
}

fn intent_id(payment: &Payment) -> Result<String> {
    payment.gateway_payment_intent_id.clone().ok_or_else(|| {
        crate::error::BillflowError::invalid_state(format!(
            "Payment '{}' has no gateway payment intent",
            payment.id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::model::{Customer, Invoice, InvoiceStatus};
    use crate::billing::storage::memory::InMemoryBillingStore;
    use crate::billing::storage::{InvoiceStore, PaymentStore};
    use crate::error::BillflowError;
    use crate::testing::MockPaymentGateway;

    async fn setup() -> (PaymentManager<InMemoryBillingStore, MockPaymentGateway>, InMemoryBillingStore, MockPaymentGateway) {
        let store = InMemoryBillingStore::new();
        store
            .seed(vec![Customer::new("cus_1", "a@example.com").with_gateway_customer_id("gcus_1")], vec![])
            .await;
        let gateway = MockPaymentGateway::new();
        (PaymentManager::new(store.clone(), gateway.clone()), store, gateway)
    }

    async fn succeeded_payment(manager: &PaymentManager<InMemoryBillingStore, MockPaymentGateway>, amount: i64) -> Payment {
        let payment = manager
            .create(CreatePayment::new("cus_1", Decimal::from(amount), "usd"))
            .await
            .unwrap();
        manager.confirm(&payment.id, Some("pm_card")).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_confirm() {
        let (manager, _, _) = setup().await;
        let payment = manager
            .create(CreatePayment::new("cus_1", Decimal::from(100), "USD"))
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.currency, "usd");

        let confirmed = manager.confirm(&payment.id, Some("pm_card")).await.unwrap();
        assert_eq!(confirmed.status, PaymentStatus::Succeeded);
        assert_eq!(confirmed.payment_method_id.as_deref(), Some("pm_card"));

        let err = manager.confirm(&payment.id, None).await.unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let (manager, _, _) = setup().await;
        let err = manager
            .create(CreatePayment::new("cus_1", Decimal::ZERO, "usd"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillflowError::InvalidInput(_)));

        let err = manager
            .create(CreatePayment::new("nobody", Decimal::ONE, "usd"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_confirm_settles_linked_invoice() {
        let (manager, store, _) = setup().await;
        let mut invoice = Invoice::draft("cus_1", "usd");
        invoice.status = InvoiceStatus::Open;
        invoice.total = Decimal::from(60);
        invoice.amount_due = Decimal::from(60);
        store.insert_invoice(&invoice).await.unwrap();

        let payment = manager
            .create(CreatePayment::new("cus_1", Decimal::from(60), "usd").for_invoice(&invoice.id))
            .await
            .unwrap();
        manager.confirm(&payment.id, None).await.unwrap();

        let paid = store.get_invoice(&invoice.id).await.unwrap().unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert_eq!(paid.amount_paid, Decimal::from(60));
    }

    #[tokio::test]
    async fn test_full_refund_then_nothing_left() {
        let (manager, _, _) = setup().await;
        let payment = succeeded_payment(&manager, 100).await;

        let outcome = manager.refund_payment(&payment.id, None, None).await.unwrap();
        assert_eq!(outcome.payment.status, PaymentStatus::Refunded);
        assert_eq!(outcome.payment.refunded_amount, Decimal::from(100));

        let err = manager
            .refund_payment(&payment.id, Some(Decimal::ONE), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_partial_refunds_bounded() {
        let (manager, store, _) = setup().await;
        let payment = succeeded_payment(&manager, 100).await;

        let outcome = manager
            .refund_payment(&payment.id, Some(Decimal::from(30)), Some("requested_by_customer".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome.payment.status, PaymentStatus::PartiallyRefunded);

        let err = manager
            .refund_payment(&payment.id, Some(Decimal::from(71)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));

        let stored = store.get_payment(&payment.id).await.unwrap().unwrap();
        assert_eq!(stored.refunded_amount, Decimal::from(30));
        assert!(stored.refunded_amount <= stored.amount);
    }

    #[tokio::test]
    async fn test_refund_requires_success() {
        let (manager, _, _) = setup().await;
        let payment = manager
            .create(CreatePayment::new("cus_1", Decimal::from(10), "usd"))
            .await
            .unwrap();
        let err = manager.refund_payment(&payment.id, None, None).await.unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_failed_payment_retry_creates_new_intent() {
        let (manager, _, gateway) = setup().await;
        gateway.set_confirm_outcome("requires_capture").await;
        let payment = manager
            .create(CreatePayment::new("cus_1", Decimal::from(25), "usd"))
            .await
            .unwrap();
        let failed = manager.confirm(&payment.id, None).await.unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);

        let retried = manager.retry_payment(&payment.id, Some("pm_new")).await.unwrap();
        assert_eq!(retried.status, PaymentStatus::Pending);
        assert_ne!(retried.gateway_payment_intent_id, payment.gateway_payment_intent_id);
        assert_eq!(gateway.calls("create_payment_intent").await, 2);

        let err = manager.retry_payment(&payment.id, None).await.unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let (manager, _, _) = setup().await;
        let payment = manager
            .create(CreatePayment::new("cus_1", Decimal::from(10), "usd"))
            .await
            .unwrap();
        let canceled = manager.cancel(&payment.id).await.unwrap();
        assert_eq!(canceled.status, PaymentStatus::Canceled);
        assert!(manager.capture(&payment.id).await.is_err());
    }
}
