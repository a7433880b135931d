use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Standard `{success, data}` JSON envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationMeta>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
            pagination: None,
        }
    }

    /// Create a paginated response
    pub fn paginated(data: T, total: u64, page: u32, limit: u32) -> Self {
        Self {
            success: true,
            data,
            pagination: Some(PaginationMeta::new(total, page, limit)),
        }
    }

    /// Create a 201 Created response
    pub fn created(data: T, location: impl Into<String>) -> CreatedResponse<T> {
        CreatedResponse {
            body: Self::success(data),
            location: location.into(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Pagination metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PaginationMeta {
    pub fn new(total: u64, page: u32, limit: u32) -> Self {
        let total_pages = if limit == 0 {
            0
        } else {
            total.div_ceil(u64::from(limit)) as u32
        };
        Self {
            page,
            limit,
            total,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

/// 201 Created response carrying the envelope and a `Location` header
#[derive(Debug)]
pub struct CreatedResponse<T: Serialize> {
    pub body: ApiResponse<T>,
    pub location: String,
}

impl<T: Serialize> IntoResponse for CreatedResponse<T> {
    fn into_response(self) -> Response {
        let mut response = (StatusCode::CREATED, Json(self.body)).into_response();
        if let Ok(location) = self.location.parse() {
            response
                .headers_mut()
                .insert(axum::http::header::LOCATION, location);
        } else {
            tracing::warn!(location = %self.location, "Invalid Location header value in CreatedResponse");
        }
        response
    }
}

/// Convenience type alias for envelope responses
pub type JsonResponse<T> = Result<ApiResponse<T>, crate::error::BillflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_meta() {
        let meta = PaginationMeta::new(45, 2, 20);
        assert_eq!(meta.total_pages, 3);
        assert!(meta.has_next);
        assert!(meta.has_prev);

        let last = PaginationMeta::new(45, 3, 20);
        assert!(!last.has_next);

        let empty = PaginationMeta::new(0, 1, 20);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next);
        assert!(!empty.has_prev);
    }

    #[test]
    fn test_pagination_meta_is_camel_case() {
        let body = serde_json::to_value(ApiResponse::paginated(vec![1, 2], 2, 1, 10)).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["pagination"]["totalPages"], 1);
        assert_eq!(body["pagination"]["hasNext"], false);
        assert_eq!(body["pagination"]["hasPrev"], false);
    }

    #[test]
    fn test_created_sets_location() {
        let response = ApiResponse::created("sub_1", "/subscriptions/sub_1").into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(axum::http::header::LOCATION).unwrap(),
            "/subscriptions/sub_1"
        );
    }
}
