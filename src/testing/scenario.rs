//! Alba-style endpoint testing for the billing router
//!
//! Requests are driven through the router with `oneshot`, no server needed.
//! The response body is buffered once, so every assertion is synchronous and
//! a failing status assertion prints the `{success, error}` envelope.
//!
//! # Example
//!
//! ```rust,ignore
//! use billflow::testing;
//!
//! testing::post(app, "/webhooks/stripe")
//!     .header("stripe-signature", &signature)
//!     .raw_body(payload)
//!     .execute()
//!     .await
//!     .assert_ok()
//!     .assert_json_path("received", serde_json::json!(true));
//! ```

use axum::{
    Router,
    body::{Body, Bytes},
    http::{HeaderMap, Method, Request, StatusCode, header},
};
use serde::{Serialize, de::DeserializeOwned};
use tower::ServiceExt;

/// A request against the application router.
pub struct Scenario {
    app: Router,
    method: Method,
    path: String,
    query: Vec<String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Scenario {
    fn new(app: Router, method: Method, path: &str) -> Self {
        Self {
            app,
            method,
            path: path.to_string(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Add a request header, e.g. a webhook signature.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Append url-encoded query parameters.
    pub fn with_query(mut self, params: &[(&str, &str)]) -> Self {
        self.query.extend(
            params
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))),
        );
        self
    }

    /// Serialize `body` as the JSON request body.
    pub fn json_body<T: Serialize>(self, body: &T) -> Self {
        let bytes = serde_json::to_vec(body).unwrap();
        self.raw_body(bytes)
    }

    /// Send these exact bytes as a JSON body. Signed webhook payloads must
    /// reach the handler unmodified.
    pub fn raw_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Run the request and buffer the response.
    pub async fn execute(self) -> ScenarioAssert {
        let uri = if self.query.is_empty() {
            self.path
        } else {
            format!("{}?{}", self.path, self.query.join("&"))
        };

        let mut builder = Request::builder().method(self.method).uri(uri);
        if !self.body.is_empty() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder.body(Body::from(self.body)).unwrap();

        let response = self.app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();

        ScenarioAssert { status, headers, body }
    }
}

/// A buffered response with chainable assertions.
pub struct ScenarioAssert {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ScenarioAssert {
    fn expect_status(self, expected: StatusCode) -> Self {
        assert_eq!(
            self.status,
            expected,
            "unexpected status, body: {}",
            String::from_utf8_lossy(&self.body)
        );
        self
    }

    pub fn assert_ok(self) -> Self {
        self.expect_status(StatusCode::OK)
    }

    pub fn assert_created(self) -> Self {
        self.expect_status(StatusCode::CREATED)
    }

    pub fn assert_bad_request(self) -> Self {
        self.expect_status(StatusCode::BAD_REQUEST)
    }

    pub fn assert_unauthorized(self) -> Self {
        self.expect_status(StatusCode::UNAUTHORIZED)
    }

    pub fn assert_not_found(self) -> Self {
        self.expect_status(StatusCode::NOT_FOUND)
    }

    pub fn assert_conflict(self) -> Self {
        self.expect_status(StatusCode::CONFLICT)
    }

    pub fn assert_server_error(self) -> Self {
        self.expect_status(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Assert a JSON content type.
    pub fn assert_json(self) -> Self {
        let content_type = self
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(
            content_type.starts_with("application/json"),
            "expected a JSON response, got content type {:?}",
            content_type
        );
        self
    }

    /// Deserialize the body.
    pub fn json<T: DeserializeOwned>(self) -> T {
        serde_json::from_slice(&self.body).unwrap()
    }

    /// Assert the value at a dotted path, e.g. `data.id` or `errors.0.id`.
    pub fn assert_json_path(self, path: &str, expected: serde_json::Value) -> Self {
        let body: serde_json::Value = serde_json::from_slice(&self.body).unwrap();
        let actual = path.split('.').try_fold(&body, |value, part| match part.parse::<usize>() {
            Ok(index) => value.get(index),
            Err(_) => value.get(part),
        });
        assert_eq!(actual, Some(&expected), "at '{}' in {}", path, body);
        self
    }

    /// Assert a `{success: true, data}` envelope.
    pub fn assert_success(self) -> Self {
        self.assert_json_path("success", serde_json::Value::Bool(true))
    }

    /// Assert a `{success: false, error: {code}}` envelope.
    pub fn assert_error_code(self, code: &str) -> Self {
        self.assert_json_path("success", serde_json::Value::Bool(false))
            .assert_json_path("error.code", serde_json::Value::String(code.to_string()))
    }
}

pub fn get(app: Router, path: &str) -> Scenario {
    Scenario::new(app, Method::GET, path)
}

pub fn post(app: Router, path: &str) -> Scenario {
    Scenario::new(app, Method::POST, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BillflowError, Result};
    use axum::{Json, extract::Query, routing};
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn body_length(headers: HeaderMap, body: Bytes) -> Json<serde_json::Value> {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Json(json!({"success": true, "data": {"length": body.len(), "contentType": content_type}}))
    }

    async fn echo_query(Query(params): Query<BTreeMap<String, String>>) -> Json<serde_json::Value> {
        Json(json!({"success": true, "data": params}))
    }

    async fn missing_subscription() -> Result<Json<serde_json::Value>> {
        Err(BillflowError::not_found("Subscription sub_404"))
    }

    #[tokio::test]
    async fn test_raw_body_is_sent_verbatim() {
        let app = Router::new().route("/len", routing::post(body_length));

        post(app, "/len")
            .raw_body(b"{ \"spaced\" : 1 }".to_vec())
            .execute()
            .await
            .assert_ok()
            .assert_json()
            .assert_success()
            .assert_json_path("data.length", json!(16))
            .assert_json_path("data.contentType", json!("application/json"));
    }

    #[tokio::test]
    async fn test_query_params_are_encoded() {
        let app = Router::new().route("/echo", routing::get(echo_query));

        let body: serde_json::Value = get(app, "/echo")
            .with_query(&[("currency", "usd"), ("from", "2024-01-01T00:00:00+00:00")])
            .execute()
            .await
            .assert_ok()
            .json();
        assert_eq!(body["data"]["currency"], "usd");
        assert_eq!(body["data"]["from"], "2024-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_error_envelope_assertions() {
        let app = Router::new().route("/subscriptions/sub_404", routing::get(missing_subscription));

        get(app, "/subscriptions/sub_404")
            .execute()
            .await
            .assert_not_found()
            .assert_error_code("NOT_FOUND");
    }

    #[tokio::test]
    #[should_panic(expected = "unexpected status")]
    async fn test_status_mismatch_reports_body() {
        let app = Router::new().route("/subscriptions/sub_404", routing::get(missing_subscription));

        get(app, "/subscriptions/sub_404").execute().await.assert_ok();
    }
}
