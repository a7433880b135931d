//! Scriptable in-memory [`LedgerGateway`].
//!
//! Resources are served as fixed pages with cursors `page_2`, `page_3`, ...
//! Page fetches can be scripted to fail a number of times before succeeding.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{BillflowError, GatewayKind, Result};
use crate::ledger::{
    Bill, Business, Card, CardProgram, Department, LedgerGateway, LedgerTransaction, Location,
    Page, PageRequest, Reimbursement, SpendProgram, User, Vendor,
};

struct Paged<T> {
    pages: Vec<Vec<T>>,
    /// page number (1-based) -> remaining scripted failures
    failures: HashMap<usize, usize>,
    fetches: usize,
}

impl<T> Default for Paged<T> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            failures: HashMap::new(),
            fetches: 0,
        }
    }
}

impl<T: Clone> Paged<T> {
    fn serve(&mut self, operation: &str, request: &PageRequest) -> Result<Page<T>> {
        self.fetches += 1;
        let number = page_number(request.start_cursor.as_deref())?;

        if let Some(remaining) = self.failures.get_mut(&number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BillflowError::gateway(
                    GatewayKind::Ledger,
                    operation,
                    format!("HTTP 503: page {} unavailable", number),
                ));
            }
        }

        let data = self.pages.get(number - 1).cloned().unwrap_or_default();
        let next = (number < self.pages.len()).then(|| format!("page_{}", number + 1));
        Ok(Page::new(data, next))
    }
}

fn page_number(cursor: Option<&str>) -> Result<usize> {
    match cursor {
        None => Ok(1),
        Some(cursor) => cursor
            .strip_prefix("page_")
            .and_then(|n| n.parse().ok())
            .filter(|n: &usize| *n >= 1)
            .ok_or_else(|| {
                BillflowError::gateway(GatewayKind::Ledger, "list", format!("unknown cursor '{}'", cursor))
            }),
    }
}

#[derive(Default)]
struct State {
    business: Option<Business>,
    users: Vec<User>,
    cards: Vec<Card>,
    transactions: Paged<LedgerTransaction>,
    bills: Paged<Bill>,
    reimbursements: Paged<Reimbursement>,
    stuck_transaction_cursor: Option<String>,
    requests: Vec<PageRequest>,
}

/// In-memory ledger gateway for tests.
#[derive(Clone, Default)]
pub struct MockLedgerGateway {
    state: Arc<Mutex<State>>,
}

impl MockLedgerGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_business(&self, business: Business) {
        self.state.lock().await.business = Some(business);
    }

    pub async fn set_users(&self, users: Vec<User>) {
        self.state.lock().await.users = users;
    }

    pub async fn set_cards(&self, cards: Vec<Card>) {
        self.state.lock().await.cards = cards;
    }

    pub async fn set_transaction_pages(&self, pages: Vec<Vec<LedgerTransaction>>) {
        self.state.lock().await.transactions.pages = pages;
    }

    pub async fn set_bill_pages(&self, pages: Vec<Vec<Bill>>) {
        self.state.lock().await.bills.pages = pages;
    }

    pub async fn set_reimbursement_pages(&self, pages: Vec<Vec<Reimbursement>>) {
        self.state.lock().await.reimbursements.pages = pages;
    }

    /// Fail the next `times` fetches of transaction page `page` (1-based).
    pub async fn fail_transaction_page(&self, page: usize, times: usize) {
        self.state.lock().await.transactions.failures.insert(page, times);
    }

    pub async fn fail_bill_page(&self, page: usize, times: usize) {
        self.state.lock().await.bills.failures.insert(page, times);
    }

    pub async fn fail_reimbursement_page(&self, page: usize, times: usize) {
        self.state.lock().await.reimbursements.failures.insert(page, times);
    }

    /// Serve transaction pages that always point at the same next cursor.
    pub async fn set_stuck_transaction_cursor(&self, cursor: impl Into<String>) {
        self.state.lock().await.stuck_transaction_cursor = Some(cursor.into());
    }

    /// Number of transaction page fetches, failed ones included.
    pub async fn transaction_fetches(&self) -> usize {
        self.state.lock().await.transactions.fetches
    }

    /// Every list request received, in order.
    pub async fn requests(&self) -> Vec<PageRequest> {
        self.state.lock().await.requests.clone()
    }
}

fn single_page<T: Clone>(items: &[T]) -> Page<T> {
    Page::new(items.to_vec(), None)
}

fn find<T: Clone>(items: &[T], id: &str, key: impl Fn(&T) -> &str, kind: &str) -> Result<T> {
    items
        .iter()
        .find(|item| key(item) == id)
        .cloned()
        .ok_or_else(|| BillflowError::not_found(format!("{} '{}' not found", kind, id)))
}

#[async_trait]
impl LedgerGateway for MockLedgerGateway {
    async fn get_business(&self) -> Result<Business> {
        self.state
            .lock()
            .await
            .business
            .clone()
            .ok_or_else(|| BillflowError::not_found("business not configured"))
    }

    async fn list_users(&self, request: &PageRequest) -> Result<Page<User>> {
        let mut state = self.state.lock().await;
        state.requests.push(request.clone());
        Ok(single_page(&state.users))
    }

    async fn get_user(&self, user_id: &str) -> Result<User> {
        let state = self.state.lock().await;
        find(&state.users, user_id, |u| u.id.as_str(), "user")
    }

    async fn list_cards(&self, request: &PageRequest) -> Result<Page<Card>> {
        let mut state = self.state.lock().await;
        state.requests.push(request.clone());
        Ok(single_page(&state.cards))
    }

    async fn get_card(&self, card_id: &str) -> Result<Card> {
        let state = self.state.lock().await;
        find(&state.cards, card_id, |c| c.id.as_str(), "card")
    }

    async fn list_transactions(&self, request: &PageRequest) -> Result<Page<LedgerTransaction>> {
        let mut state = self.state.lock().await;
        state.requests.push(request.clone());
        if let Some(cursor) = state.stuck_transaction_cursor.clone() {
            state.transactions.fetches += 1;
            return Ok(Page::new(Vec::new(), Some(cursor)));
        }
        state.transactions.serve("list_transactions", request)
    }

    async fn get_transaction(&self, transaction_id: &str) -> Result<LedgerTransaction> {
        let state = self.state.lock().await;
        let all: Vec<LedgerTransaction> = state.transactions.pages.iter().flatten().cloned().collect();
        find(&all, transaction_id, |t| t.id.as_str(), "transaction")
    }

    async fn list_reimbursements(&self, request: &PageRequest) -> Result<Page<Reimbursement>> {
        let mut state = self.state.lock().await;
        state.requests.push(request.clone());
        state.reimbursements.serve("list_reimbursements", request)
    }

    async fn list_bills(&self, request: &PageRequest) -> Result<Page<Bill>> {
        let mut state = self.state.lock().await;
        state.requests.push(request.clone());
        state.bills.serve("list_bills", request)
    }

    async fn list_vendors(&self, _request: &PageRequest) -> Result<Page<Vendor>> {
        Ok(Page::new(Vec::new(), None))
    }

    async fn list_departments(&self, _request: &PageRequest) -> Result<Page<Department>> {
        Ok(Page::new(Vec::new(), None))
    }

    async fn list_locations(&self, _request: &PageRequest) -> Result<Page<Location>> {
        Ok(Page::new(Vec::new(), None))
    }

    async fn list_card_programs(&self, _request: &PageRequest) -> Result<Page<CardProgram>> {
        Ok(Page::new(Vec::new(), None))
    }

    async fn list_spend_programs(&self, _request: &PageRequest) -> Result<Page<SpendProgram>> {
        Ok(Page::new(Vec::new(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::transaction;

    #[tokio::test]
    async fn test_pages_are_linked_by_cursor() {
        let ledger = MockLedgerGateway::new();
        ledger
            .set_transaction_pages(vec![vec![transaction("a")], vec![transaction("b")]])
            .await;

        let first = ledger.list_transactions(&PageRequest::first(10)).await.unwrap();
        assert_eq!(first.next_cursor(), Some("page_2"));

        let second = ledger
            .list_transactions(&PageRequest::first(10).with_cursor(Some("page_2".to_string())))
            .await
            .unwrap();
        assert_eq!(second.data[0].id, "b");
        assert_eq!(second.next_cursor(), None);
    }

    #[tokio::test]
    async fn test_scripted_failures_run_out() {
        let ledger = MockLedgerGateway::new();
        ledger.set_transaction_pages(vec![vec![transaction("a")]]).await;
        ledger.fail_transaction_page(1, 1).await;

        assert!(ledger.list_transactions(&PageRequest::first(10)).await.is_err());
        assert!(ledger.list_transactions(&PageRequest::first(10)).await.is_ok());
        assert_eq!(ledger.transaction_fetches().await, 2);
    }

    #[tokio::test]
    async fn test_empty_resource_is_one_empty_page() {
        let ledger = MockLedgerGateway::new();
        let page = ledger.list_bills(&PageRequest::first(10)).await.unwrap();
        assert!(page.data.is_empty());
        assert_eq!(page.next_cursor(), None);
    }
}
