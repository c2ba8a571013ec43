//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use classpulse_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Resource conflict: {0}")]
    Conflict(String),
    #[error("No organization found")]
    NoOrganization,

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::NoOrganization => (
                StatusCode::BAD_REQUEST,
                "NO_ORGANIZATION",
                "No organization found. Please create an organization first.".to_string(),
            ),

            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    // PostgreSQL unique violation
                    if code == "23505" {
                        return ApiError::Conflict("Resource already exists".to_string());
                    }
                }
                ApiError::Database(db_err.to_string())
            }
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidQuantity(_)
            | BillingError::InvalidInput(_)
            | BillingError::MissingExternalIds
            | BillingError::WebhookSignatureInvalid => ApiError::BadRequest(err.to_string()),

            BillingError::QuantityUnchanged(_)
            | BillingError::SubscriptionNotActive(_)
            | BillingError::PlanNotActive(_)
            | BillingError::InvalidStateTransition(_) => ApiError::Conflict(err.to_string()),

            BillingError::InsufficientPermissions(_)
            | BillingError::OrganizationMismatch(_) => ApiError::Forbidden,

            BillingError::PlanNotFound(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::InvoiceNotFound(_)
            | BillingError::CustomerNotFound(_) => ApiError::NotFound,

            BillingError::NoPricingTiers { .. } | BillingError::TierNotFound { .. } => {
                // Tier gaps are configuration incidents, but the caller still
                // gets a concrete reason rather than a generic failure.
                ApiError::Conflict(err.to_string())
            }

            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::StripeApi(_)
            | BillingError::ReconciliationGap(_)
            | BillingError::SubscriptionIdMissing(_)
            | BillingError::Config(_)
            | BillingError::Internal(_) => {
                tracing::error!(error = %err, "Billing operation failed");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
