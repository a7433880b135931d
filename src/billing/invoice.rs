//! Invoice management.
//!
//! Draft invoices are editable. Finalizing is one-way (draft to open) and
//! pushes the invoice to the payment gateway when the customer is linked.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::error::Result;
use super::error::BillingError;
use super::gateway::{CreateInvoiceItemParams, CreateInvoiceParams, PaymentGateway};
use super::model::{Invoice, InvoiceLineItem, InvoiceStatus, LineItemKind};
use super::storage::BillingStore;

const TARGET: &str = "billflow::billing::invoice";

/// A line item to add to a draft.
#[derive(Debug, Clone)]
pub struct NewLineItem {
    pub description: String,
    pub kind: LineItemKind,
    pub quantity: Decimal,
    pub unit_amount: Decimal,
}

impl NewLineItem {
    #[must_use]
    pub fn one_time(description: impl Into<String>, amount: Decimal) -> Self {
        Self {
            description: description.into(),
            kind: LineItemKind::OneTime,
            quantity: Decimal::ONE,
            unit_amount: amount,
        }
    }
}

/// Invoice operations.
pub struct InvoiceManager<S: BillingStore, G: PaymentGateway> {
    store: S,
    gateway: G,
}

impl<S: BillingStore, G: PaymentGateway> InvoiceManager<S, G> {
    /// Create a new invoice manager.
    #[must_use]
    pub fn new(store: S, gateway: G) -> Self {
        Self { store, gateway }
    }

    pub async fn get(&self, invoice_id: &str) -> Result<Invoice> {
        self.load(invoice_id).await
    }

    pub async fn list_for_customer(&self, customer_id: &str) -> Result<Vec<Invoice>> {
        Ok(self
            .store
            .list_invoices()
            .await?
            .into_iter()
            .filter(|i| i.customer_id == customer_id)
            .collect())
    }

    /// Start an empty draft.
    pub async fn create_draft(
        &self,
        customer_id: &str,
        currency: &str,
        subscription_id: Option<&str>,
    ) -> Result<Invoice> {
        if self.store.get_customer(customer_id).await?.is_none() {
            return Err(BillingError::CustomerNotFound {
                customer_id: customer_id.to_string(),
            }
            .into());
        }
        let mut invoice = Invoice::draft(customer_id, currency);
        invoice.subscription_id = subscription_id.map(str::to_string);
        self.store.insert_invoice(&invoice).await?;
        Ok(invoice)
    }

    /// Add a line item to a draft.
    pub async fn add_line_item(&self, invoice_id: &str, item: NewLineItem) -> Result<Invoice> {
        if item.quantity <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount {
                message: format!("line item quantity must be positive, got {}", item.quantity),
            }
            .into());
        }
        let invoice = self.load_draft(invoice_id).await?;
        let expected_version = invoice.version;

        let mut updated = invoice;
        updated.line_items.push(InvoiceLineItem::new(
            item.description,
            item.kind,
            item.quantity,
            item.unit_amount,
        ));
        updated.recalculate();
        self.save(updated, expected_version).await
    }

    /// Remove a line item from a draft.
    pub async fn remove_line_item(&self, invoice_id: &str, line_item_id: &str) -> Result<Invoice> {
        let invoice = self.load_draft(invoice_id).await?;
        let expected_version = invoice.version;

        let mut updated = invoice;
        let before = updated.line_items.len();
        updated.line_items.retain(|li| li.id != line_item_id);
        if updated.line_items.len() == before {
            return Err(BillingError::LineItemNotFound {
                invoice_id: updated.id,
                line_item_id: line_item_id.to_string(),
            }
            .into());
        }
        updated.recalculate();
        self.save(updated, expected_version).await
    }

    /// Finalize a draft (draft to open).
    ///
    /// When the customer is linked to the payment gateway the invoice and its
    /// line items are created there first.
    pub async fn finalize(&self, invoice_id: &str) -> Result<Invoice> {
        let invoice = self.load_draft(invoice_id).await?;
        let expected_version = invoice.version;
        let customer = self.store.get_customer(&invoice.customer_id).await?;

        let mut updated = invoice;
        if let Some(gateway_customer_id) = customer.and_then(|c| c.gateway_customer_id) {
            let mut metadata = BTreeMap::new();
            metadata.insert("invoice_id".to_string(), updated.id.clone());
            let remote = self
                .gateway
                .create_invoice(CreateInvoiceParams {
                    customer_id: gateway_customer_id.clone(),
                    currency: updated.currency.clone(),
                    subscription_id: None,
                    due_date: updated.due_date,
                    metadata,
                })
                .await?;
            for line in &mut updated.line_items {
                let item = self
                    .gateway
                    .create_invoice_item(CreateInvoiceItemParams {
                        customer_id: gateway_customer_id.clone(),
                        invoice_id: remote.id.clone(),
                        description: line.description.clone(),
                        amount: line.amount,
                        currency: updated.currency.clone(),
                    })
                    .await?;
                line.gateway_item_id = Some(item.id);
            }
            self.gateway.finalize_invoice(&remote.id).await?;
            updated.gateway_invoice_id = Some(remote.id);
        }

        updated.recalculate();
        updated.status = InvoiceStatus::Open;
        if updated.total.is_zero() {
            updated.mark_paid(Utc::now());
        }
        let saved = self.save(updated, expected_version).await?;

        tracing::info!(
            target: TARGET,
            invoice_id = %saved.id,
            total = %saved.total,
            gateway_invoice_id = ?saved.gateway_invoice_id,
            "Invoice finalized"
        );
        Ok(saved)
    }

    /// Void an invoice.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the invoice is paid or already void.
    pub async fn void(&self, invoice_id: &str) -> Result<Invoice> {
        let invoice = self.load(invoice_id).await?;
        match invoice.status {
            InvoiceStatus::Paid => {
                return Err(BillingError::InvoiceAlreadyPaid {
                    invoice_id: invoice.id,
                }
                .into());
            }
            InvoiceStatus::Void => {
                return Err(transition_error(&invoice, "void"));
            }
            _ => {}
        }
        if let Some(gateway_invoice_id) = invoice.gateway_invoice_id.as_deref() {
            self.gateway.void_invoice(gateway_invoice_id).await?;
        }
        self.set_status(invoice, InvoiceStatus::Void).await
    }

    /// Give up collecting an open or past-due invoice.
    pub async fn mark_uncollectible(&self, invoice_id: &str) -> Result<Invoice> {
        let invoice = self.load(invoice_id).await?;
        if !invoice.status.is_collectible() {
            return Err(transition_error(&invoice, "mark uncollectible"));
        }
        self.set_status(invoice, InvoiceStatus::Uncollectible).await
    }

    /// Flag an open invoice whose payment failed.
    pub async fn mark_past_due(&self, invoice_id: &str) -> Result<Invoice> {
        let invoice = self.load(invoice_id).await?;
        if invoice.status != InvoiceStatus::Open {
            return Err(transition_error(&invoice, "mark past due"));
        }
        self.set_status(invoice, InvoiceStatus::PastDue).await
    }

    /// Record money received outside the payment flow.
    ///
    /// The amount is clamped to the balance; the invoice flips to `paid` when
    /// nothing is left due.
    pub async fn record_payment(&self, invoice_id: &str, amount: Decimal) -> Result<Invoice> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount {
                message: format!("payment amount must be positive, got {}", amount),
            }
            .into());
        }
        let invoice = self.load(invoice_id).await?;
        if !invoice.status.is_collectible() {
            return Err(transition_error(&invoice, "record payment on"));
        }
        let expected_version = invoice.version;
        let mut updated = invoice;
        updated.apply_payment(amount, Utc::now());
        self.save(updated, expected_version).await
    }

    async fn set_status(&self, invoice: Invoice, status: InvoiceStatus) -> Result<Invoice> {
        let expected_version = invoice.version;
        let mut updated = invoice;
        updated.status = status;
        let saved = self.save(updated, expected_version).await?;
        tracing::info!(target: TARGET, invoice_id = %saved.id, status = %status, "Invoice status changed");
        Ok(saved)
    }

    async fn load(&self, invoice_id: &str) -> Result<Invoice> {
        self.store.get_invoice(invoice_id).await?.ok_or_else(|| {
            BillingError::InvoiceNotFound {
                invoice_id: invoice_id.to_string(),
            }
            .into()
        })
    }

    async fn load_draft(&self, invoice_id: &str) -> Result<Invoice> {
        let invoice = self.load(invoice_id).await?;
        if invoice.status != InvoiceStatus::Draft {
            return Err(BillingError::InvoiceNotDraft {
                invoice_id: invoice.id,
                status: invoice.status.to_string(),
            }
            .into());
        }
        Ok(invoice)
    }

    async fn save(&self, mut invoice: Invoice, expected_version: u64) -> Result<Invoice> {
        if !self
            .store
            .compare_and_save_invoice(&invoice, expected_version)
            .await?
        {
            return Err(BillingError::ConcurrentModification {
                entity: "invoice",
                id: invoice.id,
            }
            .into());
        }
        invoice.version = expected_version + 1;
        Ok(invoice)
    }
}

fn transition_error(invoice: &Invoice, action: &'static str) -> crate::error::BillflowError {
    BillingError::InvoiceTransitionNotAllowed {
        invoice_id: invoice.id.clone(),
        status: invoice.status.to_string(),
        action,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::model::Customer;
    use crate::billing::storage::memory::InMemoryBillingStore;
    use crate::error::BillflowError;
    use crate::testing::MockPaymentGateway;

    async fn setup() -> (InvoiceManager<InMemoryBillingStore, MockPaymentGateway>, MockPaymentGateway) {
        let store = InMemoryBillingStore::new();
        store
            .seed(
                vec![
                    Customer::new("cus_local", "a@example.com"),
                    Customer::new("cus_linked", "b@example.com").with_gateway_customer_id("gcus_1"),
                ],
                vec![],
            )
            .await;
        let gateway = MockPaymentGateway::new();
        (InvoiceManager::new(store, gateway.clone()), gateway)
    }

    #[tokio::test]
    async fn test_draft_editing() {
        let (manager, _) = setup().await;
        let invoice = manager.create_draft("cus_local", "usd", None).await.unwrap();

        let invoice = manager
            .add_line_item(&invoice.id, NewLineItem::one_time("Setup fee", Decimal::from(50)))
            .await
            .unwrap();
        let invoice = manager
            .add_line_item(
                &invoice.id,
                NewLineItem {
                    description: "Seats".to_string(),
                    kind: LineItemKind::Subscription,
                    quantity: Decimal::from(3),
                    unit_amount: Decimal::new(999, 2),
                },
            )
            .await
            .unwrap();
        assert_eq!(invoice.total, Decimal::new(7997, 2));

        let setup_fee = invoice.line_items[0].id.clone();
        let invoice = manager.remove_line_item(&invoice.id, &setup_fee).await.unwrap();
        assert_eq!(invoice.total, Decimal::new(2997, 2));
        assert_eq!(invoice.amount_paid + invoice.amount_due, invoice.total);

        let err = manager.remove_line_item(&invoice.id, "li_missing").await.unwrap_err();
        assert!(matches!(err, BillflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_finalize_is_one_way() {
        let (manager, _) = setup().await;
        let invoice = manager.create_draft("cus_local", "usd", None).await.unwrap();
        manager
            .add_line_item(&invoice.id, NewLineItem::one_time("Consulting", Decimal::from(200)))
            .await
            .unwrap();

        let open = manager.finalize(&invoice.id).await.unwrap();
        assert_eq!(open.status, InvoiceStatus::Open);
        assert!(open.gateway_invoice_id.is_none());

        let err = manager
            .add_line_item(&invoice.id, NewLineItem::one_time("Extra", Decimal::ONE))
            .await
            .unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));
        assert!(manager.finalize(&invoice.id).await.is_err());
    }

    #[tokio::test]
    async fn test_finalize_pushes_to_gateway() {
        let (manager, gateway) = setup().await;
        let invoice = manager.create_draft("cus_linked", "usd", None).await.unwrap();
        manager
            .add_line_item(&invoice.id, NewLineItem::one_time("Consulting", Decimal::from(200)))
            .await
            .unwrap();

        let open = manager.finalize(&invoice.id).await.unwrap();
        assert!(open.gateway_invoice_id.is_some());
        assert!(open.line_items[0].gateway_item_id.is_some());
        assert_eq!(gateway.calls("finalize_invoice").await, 1);
    }

    #[tokio::test]
    async fn test_record_payment_and_void_rules() {
        let (manager, _) = setup().await;
        let invoice = manager.create_draft("cus_local", "usd", None).await.unwrap();
        manager
            .add_line_item(&invoice.id, NewLineItem::one_time("Consulting", Decimal::from(100)))
            .await
            .unwrap();
        manager.finalize(&invoice.id).await.unwrap();

        let partial = manager.record_payment(&invoice.id, Decimal::from(40)).await.unwrap();
        assert_eq!(partial.amount_due, Decimal::from(60));
        assert_eq!(partial.status, InvoiceStatus::Open);

        let paid = manager.record_payment(&invoice.id, Decimal::from(500)).await.unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert_eq!(paid.amount_paid, paid.total);

        let err = manager.void(&invoice.id).await.unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_past_due_and_uncollectible() {
        let (manager, _) = setup().await;
        let invoice = manager.create_draft("cus_local", "usd", None).await.unwrap();
        manager
            .add_line_item(&invoice.id, NewLineItem::one_time("Consulting", Decimal::from(100)))
            .await
            .unwrap();

        assert!(manager.mark_past_due(&invoice.id).await.is_err());
        manager.finalize(&invoice.id).await.unwrap();
        let past_due = manager.mark_past_due(&invoice.id).await.unwrap();
        assert_eq!(past_due.status, InvoiceStatus::PastDue);
        let written_off = manager.mark_uncollectible(&invoice.id).await.unwrap();
        assert_eq!(written_off.status, InvoiceStatus::Uncollectible);
        let voided = manager.void(&invoice.id).await.unwrap();
        assert_eq!(voided.status, InvoiceStatus::Void);
    }
}
