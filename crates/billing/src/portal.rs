//! Billing portal sessions

use std::sync::Arc;

use uuid::Uuid;

use crate::client::StripeConfig;
use crate::error::BillingResult;
use crate::gateway::PaymentGateway;

/// Portal service for self-serve payment management sessions.
#[derive(Clone)]
pub struct PortalService {
    gateway: Arc<dyn PaymentGateway>,
    app_base_url: String,
}

impl PortalService {
    pub fn new(gateway: Arc<dyn PaymentGateway>, config: &StripeConfig) -> Self {
        Self {
            gateway,
            app_base_url: config.app_base_url.clone(),
        }
    }

    /// Create a billing portal session for an organization's customer.
    pub async fn create_portal_session(
        &self,
        org_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<String> {
        let return_url = format!("{}/billing", self.app_base_url);
        let url = self
            .gateway
            .create_portal_session(customer_id, &return_url)
            .await?;

        tracing::info!(
            org_id = %org_id,
            "Created billing portal session"
        );

        Ok(url)
    }
}

/// Response for creating a portal session
#[derive(Debug, serde::Serialize)]
pub struct PortalResponse {
    pub url: String,
}
