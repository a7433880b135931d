//! Ledger gateway resource types.
//!
//! Fields that the platform may omit are optional; `validate` on synced
//! resources rejects records that cannot be stored.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The business that owns the ledger account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Business {
    pub id: String,
    pub business_name_legal: Option<String>,
    pub business_name_on_card: Option<String>,
    #[serde(default)]
    pub active: bool,
    pub created_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<String>,
    pub status: Option<String>,
    pub department_id: Option<String>,
    pub location_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub display_name: Option<String>,
    pub last_four: Option<String>,
    pub cardholder_id: Option<String>,
    pub card_program_id: Option<String>,
    pub state: Option<String>,
    #[serde(default)]
    pub is_physical: bool,
}

/// A card transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: String,
    pub amount: Option<Decimal>,
    pub currency_code: Option<String>,
    pub merchant_name: Option<String>,
    pub card_id: Option<String>,
    pub user_id: Option<String>,
    pub state: Option<String>,
    pub memo: Option<String>,
    pub sk_category_name: Option<String>,
    pub user_transaction_time: Option<DateTime<Utc>>,
    pub settlement_date: Option<DateTime<Utc>>,
}

impl LedgerTransaction {
    /// Check the fields a stored transaction needs.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("transaction has no id".to_string());
        }
        if self.amount.is_none() {
            return Err("missing amount".to_string());
        }
        if self.currency_code.as_deref().is_none_or(|c| c.trim().is_empty()) {
            return Err("missing currency".to_string());
        }
        if self.user_transaction_time.is_none() {
            return Err("missing transaction time".to_string());
        }
        Ok(())
    }
}

/// Amount with currency, as bills and reimbursements report it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAmount {
    pub amount: Decimal,
    pub currency_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub id: String,
    pub amount: Option<LedgerAmount>,
    pub vendor_id: Option<String>,
    pub invoice_number: Option<String>,
    pub status: Option<String>,
    pub due_at: Option<NaiveDate>,
    pub issued_at: Option<NaiveDate>,
    pub paid_at: Option<DateTime<Utc>>,
    pub memo: Option<String>,
}

impl Bill {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("bill has no id".to_string());
        }
        match &self.amount {
            None => Err("missing amount".to_string()),
            Some(amount) if amount.currency_code.trim().is_empty() => {
                Err("missing currency".to_string())
            }
            Some(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reimbursement {
    pub id: String,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub user_id: Option<String>,
    pub merchant: Option<String>,
    pub state: Option<String>,
    pub memo: Option<String>,
    pub transaction_date: Option<NaiveDate>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Reimbursement {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("reimbursement has no id".to_string());
        }
        if self.amount.is_none() {
            return Err("missing amount".to_string());
        }
        if self.user_id.as_deref().is_none_or(|u| u.trim().is_empty()) {
            return Err("missing user".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Department {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardProgram {
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendProgram {
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub is_shareable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction() -> LedgerTransaction {
        serde_json::from_value(serde_json::json!({
            "id": "txn_1",
            "amount": "42.50",
            "currency_code": "USD",
            "merchant_name": "Coffee",
            "user_transaction_time": "2024-03-01T12:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn test_transaction_validation() {
        let txn = transaction();
        assert!(txn.validate().is_ok());
        assert_eq!(txn.amount, Some(Decimal::new(4250, 2)));

        let missing_amount = LedgerTransaction { amount: None, ..transaction() };
        assert_eq!(missing_amount.validate().unwrap_err(), "missing amount");

        let blank_currency = LedgerTransaction {
            currency_code: Some(" ".to_string()),
            ..transaction()
        };
        assert!(blank_currency.validate().is_err());
    }

    #[test]
    fn test_bill_and_reimbursement_validation() {
        let bill: Bill = serde_json::from_value(serde_json::json!({
            "id": "bill_1",
            "amount": { "amount": "100", "currency_code": "USD" },
            "due_at": "2024-04-01"
        }))
        .unwrap();
        assert!(bill.validate().is_ok());

        let bill = Bill { amount: None, ..bill };
        assert!(bill.validate().is_err());

        let reimbursement: Reimbursement = serde_json::from_value(serde_json::json!({
            "id": "re_1",
            "amount": "12.00",
            "currency": "USD"
        }))
        .unwrap();
        assert_eq!(reimbursement.validate().unwrap_err(), "missing user");
    }
}
