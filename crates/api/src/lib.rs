//! Classpulse API Library
//!
//! HTTP surface for the billing subsystem: the payment-processor webhook
//! endpoint and the organization-facing subscription routes.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
