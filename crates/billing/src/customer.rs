//! Payment-processor customer management
//!
//! Each organization maps to one external customer. The id is cached on the
//! organizations row so repeat operations skip the gateway round trip.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;

/// Customer service for resolving an organization's external customer.
#[derive(Clone)]
pub struct CustomerService {
    pool: PgPool,
    gateway: Arc<dyn PaymentGateway>,
}

impl CustomerService {
    pub fn new(pool: PgPool, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { pool, gateway }
    }

    /// Get the organization's external customer id, creating the customer
    /// on first use.
    pub async fn get_or_create_customer(
        &self,
        org_id: Uuid,
        email: &str,
        name: &str,
    ) -> BillingResult<String> {
        if let Some(existing) = self.find_customer_id(org_id).await? {
            return Ok(existing);
        }

        let customer = self.gateway.create_customer(org_id, email, name).await?;

        sqlx::query(
            "UPDATE organizations SET stripe_customer_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(&customer.id)
        .bind(org_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            org_id = %org_id,
            customer_id = %customer.id,
            "Linked organization to payment customer"
        );

        Ok(customer.id)
    }

    /// The cached external customer id, if the organization has one.
    pub async fn find_customer_id(&self, org_id: Uuid) -> BillingResult<Option<String>> {
        let result: Option<(Option<String>,)> =
            sqlx::query_as("SELECT stripe_customer_id FROM organizations WHERE id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(result.and_then(|(id,)| id))
    }

    /// Like `find_customer_id` but failing when absent.
    pub async fn get_customer_id(&self, org_id: Uuid) -> BillingResult<String> {
        self.find_customer_id(org_id)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound(org_id.to_string()))
    }
}
