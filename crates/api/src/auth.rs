//! Access-token validation
//!
//! The platform's auth service issues HS256 tokens; this middleware only
//! validates them and exposes the caller as an `AuthUser` extension.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Claims carried by platform-issued access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: Uuid,
    /// Organization ID
    pub org_id: Option<Uuid>,
    /// User role within the organization
    pub role: Option<String>,
    /// Email
    pub email: Option<String>,
    /// Expiration
    pub exp: i64,
}

/// The authenticated caller, inserted as a request extension.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub org_id: Option<Uuid>,
    pub role: Option<String>,
    pub email: Option<String>,
}

/// Validate the bearer token and attach `AuthUser` to the request.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    // Explicit algorithm prevents algorithm-confusion attacks
    let validation = Validation::new(Algorithm::HS256);
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| {
        tracing::debug!(error = %e, "Token validation failed");
        ApiError::InvalidToken
    })?;

    let claims = decoded.claims;
    request.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        org_id: claims.org_id,
        role: claims.role,
        email: claims.email,
    });

    Ok(next.run(request).await)
}
