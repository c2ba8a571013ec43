//! Stripe client configuration

use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Base URL for portal return redirects
    pub app_base_url: String,
    /// Currency for standalone charges
    pub currency: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            currency: std::env::var("BILLING_CURRENCY").unwrap_or_else(|_| "usd".to_string()),
        })
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
