//! Query parameter extractors and helpers

use serde::{Deserialize, Serialize};

use crate::error::{BillflowError, Result};

const MAX_LIMIT: u32 = 100;

/// Query parameter extractor
pub use axum::extract::Query;

/// Pagination query parameters (`?page=2&limit=20`)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PaginationQuery {
    /// Page number (1-indexed)
    #[serde(default = "default_page")]
    pub page: u32,

    /// Number of items per page
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

impl Default for PaginationQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl PaginationQuery {
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.page == 0 {
            return Err(BillflowError::invalid_input("page must be >= 1"));
        }
        if self.limit == 0 || self.limit > MAX_LIMIT {
            return Err(BillflowError::invalid_input(format!(
                "limit must be between 1 and {}",
                MAX_LIMIT
            )));
        }
        Ok(())
    }

    /// The slice of `items` this page covers.
    pub fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip(self.offset())
            .take(self.limit as usize)
            .cloned()
            .collect()
    }
}

/// `?currency=usd` for reporting endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyQuery {
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "usd".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(PaginationQuery::default().validate().is_ok());
        assert!(PaginationQuery { page: 0, limit: 10 }.validate().is_err());
        assert!(PaginationQuery { page: 1, limit: 0 }.validate().is_err());
        assert!(PaginationQuery { page: 1, limit: 101 }.validate().is_err());
    }

    #[test]
    fn test_slice() {
        let items: Vec<u32> = (1..=7).collect();
        let page = PaginationQuery { page: 2, limit: 3 };
        assert_eq!(page.slice(&items), vec![4, 5, 6]);

        let past_end = PaginationQuery { page: 5, limit: 3 };
        assert!(past_end.slice(&items).is_empty());
    }
}
