//! Test fixtures for billing and ledger records
//!
//! Builders return valid records with generated ids; tests override the
//! fields they care about with struct update syntax.

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::billing::{BillingInterval, Customer, Plan};
use crate::ledger::{Bill, LedgerAmount, LedgerTransaction, Reimbursement};

/// Helper functions for generating fake test data
pub mod fake {
    use super::*;

    /// Generate a fake email address
    pub fn email() -> String {
        format!("test-{}@example.com", Uuid::new_v4().simple())
    }

    /// Generate a prefixed id such as `cus_1a2b3c4d`
    pub fn id(prefix: &str) -> String {
        format!("{}_{}", prefix, &Uuid::new_v4().simple().to_string()[..8])
    }

    /// Generate a random amount between `min` and `max` whole units, with cents
    pub fn amount(min: i64, max: i64) -> Decimal {
        Decimal::new(fastrand::i64(min * 100..=max * 100), 2)
    }
}

/// A customer with a generated email.
pub fn customer(id: &str) -> Customer {
    Customer::new(id, fake::email())
}

/// A monthly USD plan.
pub fn monthly_plan(id: &str, amount: i64) -> Plan {
    Plan::new(id, Decimal::from(amount), "usd", BillingInterval::Month)
}

/// A valid USD card transaction.
pub fn transaction(id: &str) -> LedgerTransaction {
    LedgerTransaction {
        id: id.to_string(),
        amount: Some(Decimal::new(1250, 2)),
        currency_code: Some("USD".to_string()),
        merchant_name: Some("Coffee Shop".to_string()),
        card_id: Some("card_1".to_string()),
        user_id: Some("user_1".to_string()),
        state: Some("CLEARED".to_string()),
        memo: None,
        sk_category_name: Some("Meals".to_string()),
        user_transaction_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single(),
        settlement_date: None,
    }
}

/// A valid open bill.
pub fn bill(id: &str) -> Bill {
    Bill {
        id: id.to_string(),
        amount: Some(LedgerAmount {
            amount: Decimal::from(250),
            currency_code: "USD".to_string(),
        }),
        vendor_id: Some("vendor_1".to_string()),
        invoice_number: Some(format!("INV-{}", id)),
        status: Some("OPEN".to_string()),
        due_at: None,
        issued_at: None,
        paid_at: None,
        memo: None,
    }
}

/// A valid pending reimbursement.
pub fn reimbursement(id: &str) -> Reimbursement {
    Reimbursement {
        id: id.to_string(),
        amount: Some(Decimal::new(4200, 2)),
        currency: Some("USD".to_string()),
        user_id: Some("user_1".to_string()),
        merchant: Some("Taxi".to_string()),
        state: Some("PENDING".to_string()),
        memo: None,
        transaction_date: None,
        created_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_are_valid() {
        assert!(transaction("txn_1").validate().is_ok());
        assert!(bill("bill_1").validate().is_ok());
        assert!(reimbursement("re_1").validate().is_ok());
    }

    #[test]
    fn test_fake_values() {
        assert!(fake::email().ends_with("@example.com"));
        assert!(fake::id("cus").starts_with("cus_"));

        let amount = fake::amount(1, 10);
        assert!(amount >= Decimal::ONE && amount <= Decimal::TEN);
        assert_eq!(amount.scale(), 2);
    }
}
