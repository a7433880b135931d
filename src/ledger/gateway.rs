//! Ledger gateway collaborator trait and pagination types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use super::types::{
    Bill, Business, Card, CardProgram, Department, LedgerTransaction, Location, Reimbursement,
    SpendProgram, User, Vendor,
};

/// Largest page the ledger API serves.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Cursor pagination request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub start_cursor: Option<String>,
    pub page_size: Option<u32>,
    /// Inclusive lower bound on the resource's own timestamp.
    pub from_date: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub to_date: Option<DateTime<Utc>>,
}

impl PageRequest {
    #[must_use]
    pub fn first(page_size: u32) -> Self {
        Self {
            page_size: Some(page_size.clamp(1, MAX_PAGE_SIZE)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.start_cursor = cursor;
        self
    }

    #[must_use]
    pub fn with_window(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from_date = from;
        self.to_date = to;
        self
    }

    /// Query string pairs in the ledger API's parameter names.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(cursor) = &self.start_cursor {
            pairs.push(("start", cursor.clone()));
        }
        if let Some(size) = self.page_size {
            pairs.push(("page_size", size.to_string()));
        }
        if let Some(from) = self.from_date {
            pairs.push(("from_date", from.to_rfc3339()));
        }
        if let Some(to) = self.to_date {
            pairs.push(("to_date", to.to_rfc3339()));
        }
        pairs
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub page: PageInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub next: Option<String>,
}

impl<T> Page<T> {
    #[must_use]
    pub fn new(data: Vec<T>, next: Option<String>) -> Self {
        Self {
            data,
            page: PageInfo { next },
        }
    }

    /// The cursor for the following page; empty strings end pagination.
    #[must_use]
    pub fn next_cursor(&self) -> Option<&str> {
        self.page.next.as_deref().filter(|c| !c.is_empty())
    }
}

/// The card/expense platform API.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    async fn get_business(&self) -> Result<Business>;

    async fn list_users(&self, request: &PageRequest) -> Result<Page<User>>;
    async fn get_user(&self, user_id: &str) -> Result<User>;

    async fn list_cards(&self, request: &PageRequest) -> Result<Page<Card>>;
    async fn get_card(&self, card_id: &str) -> Result<Card>;

    async fn list_transactions(&self, request: &PageRequest) -> Result<Page<LedgerTransaction>>;
    async fn get_transaction(&self, transaction_id: &str) -> Result<LedgerTransaction>;

    async fn list_reimbursements(&self, request: &PageRequest) -> Result<Page<Reimbursement>>;
    async fn list_bills(&self, request: &PageRequest) -> Result<Page<Bill>>;
    async fn list_vendors(&self, request: &PageRequest) -> Result<Page<Vendor>>;
    async fn list_departments(&self, request: &PageRequest) -> Result<Page<Department>>;
    async fn list_locations(&self, request: &PageRequest) -> Result<Page<Location>>;
    async fn list_card_programs(&self, request: &PageRequest) -> Result<Page<CardProgram>>;
    async fn list_spend_programs(&self, request: &PageRequest) -> Result<Page<SpendProgram>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_clamped() {
        assert_eq!(PageRequest::first(500).page_size, Some(MAX_PAGE_SIZE));
        assert_eq!(PageRequest::first(0).page_size, Some(1));
    }

    #[test]
    fn test_query_pairs() {
        let request = PageRequest::first(50).with_cursor(Some("abc".to_string()));
        assert_eq!(
            request.query_pairs(),
            vec![("start", "abc".to_string()), ("page_size", "50".to_string())]
        );
    }

    #[test]
    fn test_empty_next_ends_pagination() {
        let page: Page<String> = serde_json::from_value(serde_json::json!({
            "data": ["a"],
            "page": { "next": "" }
        }))
        .unwrap();
        assert_eq!(page.next_cursor(), None);

        let page: Page<String> = serde_json::from_value(serde_json::json!({ "data": [] })).unwrap();
        assert_eq!(page.next_cursor(), None);

        let page = Page::new(vec![1], Some("c2".to_string()));
        assert_eq!(page.next_cursor(), Some("c2"));
    }
}
