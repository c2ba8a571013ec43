//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Customer not found for organization: {0}")]
    CustomerNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Subscription is not active: {0}")]
    SubscriptionNotActive(String),

    #[error("Subscription does not belong to organization: {0}")]
    OrganizationMismatch(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Quantity must be between 1 and 20, got {0}")]
    InvalidQuantity(i32),

    #[error("Quantity unchanged: subscription already at {0}")]
    QuantityUnchanged(i32),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Plan is not active: {0}")]
    PlanNotActive(String),

    #[error("No pricing tiers configured for plan {plan_id} ({billing_period})")]
    NoPricingTiers {
        plan_id: String,
        billing_period: String,
    },

    #[error("No pricing tier covers quantity {quantity} for plan {plan_id}")]
    TierNotFound { plan_id: String, quantity: i32 },

    #[error("Invoice not found: {0}")]
    InvoiceNotFound(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload missing subscription reference (event {0})")]
    SubscriptionIdMissing(String),

    #[error("Insufficient permissions: user {0} may not manage billing")]
    InsufficientPermissions(String),

    #[error("External subscription id and customer id are both required")]
    MissingExternalIds,

    #[error("Internal and external billing state diverged: {0}")]
    ReconciliationGap(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
