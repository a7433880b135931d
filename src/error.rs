use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which external platform a gateway failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    /// The payments/subscription provider.
    Payment,
    /// The card/expense-management provider.
    Ledger,
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Payment => write!(f, "payment gateway"),
            Self::Ledger => write!(f, "ledger gateway"),
        }
    }
}

/// The main error type for billflow operations
#[derive(Debug, thiserror::Error)]
pub enum BillflowError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{gateway} error during '{operation}': {message}")]
    Gateway {
        gateway: GatewayKind,
        operation: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Error body in the `{success: false, error: {code, message}}` envelope.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: ErrorBody,
}

impl BillflowError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn signature_invalid(msg: impl Into<String>) -> Self {
        Self::SignatureInvalid(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Gateway failure without an underlying error value.
    pub fn gateway(
        gateway: GatewayKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Gateway {
            gateway,
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Gateway failure that keeps the original error as its cause.
    pub fn gateway_source<E>(gateway: GatewayKind, operation: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Gateway {
            gateway,
            operation: operation.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Machine-readable error code used in API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Gateway { .. } => "GATEWAY_ERROR",
            Self::SignatureInvalid(_) => "INVALID_SIGNATURE",
            Self::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            Self::Internal(_) | Self::Anyhow(_) => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState(_) | Self::ConcurrentModification(_) => StatusCode::CONFLICT,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::SignatureInvalid(_) => StatusCode::UNAUTHORIZED,
            Self::Gateway { .. } | Self::Internal(_) | Self::Anyhow(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns a message that is safe to show to API clients.
    ///
    /// Client errors (4xx) carry their real message. Server errors (5xx)
    /// collapse to a generic message; the details only reach the server log.
    fn safe_message(&self) -> String {
        match self {
            Self::NotFound(_)
            | Self::InvalidState(_)
            | Self::InvalidInput(_)
            | Self::ConcurrentModification(_) => self.to_string(),
            Self::SignatureInvalid(_) => "Invalid webhook signature".to_string(),
            Self::Gateway { .. } => "Upstream gateway error".to_string(),
            Self::Internal(_) | Self::Anyhow(_) => "Internal server error".to_string(),
        }
    }

    /// Returns true if the caller is at fault (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl IntoResponse for BillflowError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            let cause = std::error::Error::source(&self).map(ToString::to_string);
            tracing::error!(
                status = status.as_u16(),
                code = self.code(),
                error = %self,
                cause = cause.as_deref().unwrap_or("none"),
                "Request failed"
            );
        } else {
            tracing::debug!(status = status.as_u16(), code = self.code(), error = %self, "Request rejected");
        }

        let body = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: self.code(),
                message: self.safe_message(),
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for billflow operations
pub type Result<T> = std::result::Result<T, BillflowError>;

impl From<serde_json::Error> for BillflowError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            BillflowError::InvalidInput(format!("JSON error: {}", err))
        } else {
            BillflowError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}
