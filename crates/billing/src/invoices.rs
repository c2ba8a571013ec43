//! Invoice ledger
//!
//! One row per external billing document. Reconciliation upserts on the
//! unique external id, so replayed webhook deliveries never duplicate rows.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Invoice status vocabulary, mirroring the processor's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Open => "open",
            Self::Paid => "paid",
            Self::Void => "void",
            Self::Uncollectible => "uncollectible",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "open" => Some(Self::Open),
            "paid" => Some(Self::Paid),
            "void" => Some(Self::Void),
            "uncollectible" => Some(Self::Uncollectible),
            _ => None,
        }
    }
}

/// A stored invoice.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub org_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub stripe_invoice_id: String,
    pub stripe_customer_id: Option<String>,
    pub invoice_number: Option<String>,
    pub amount_cents: i64,
    pub tax_cents: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub pdf_url: Option<String>,
    pub hosted_url: Option<String>,
    pub issued_at: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Fields reconciliation writes for an external invoice.
#[derive(Debug, Clone)]
pub struct InvoiceUpsert {
    pub user_id: Option<Uuid>,
    pub org_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub stripe_invoice_id: String,
    pub stripe_customer_id: Option<String>,
    pub invoice_number: Option<String>,
    pub amount_cents: i64,
    pub tax_cents: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub pdf_url: Option<String>,
    pub hosted_url: Option<String>,
    pub issued_at: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
}

/// Store for the invoice ledger.
#[derive(Clone)]
pub struct InvoiceStore {
    pool: PgPool,
}

impl InvoiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create-or-update by external invoice id. Amount, status, URLs and
    /// paid timestamp always take the external payload's values.
    pub async fn upsert(&self, invoice: InvoiceUpsert) -> BillingResult<Invoice> {
        let stored: Invoice = sqlx::query_as(
            r#"
            INSERT INTO invoices (
                user_id, org_id, subscription_id, stripe_invoice_id,
                stripe_customer_id, invoice_number, amount_cents, tax_cents,
                currency, status, pdf_url, hosted_url, issued_at, paid_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (stripe_invoice_id) DO UPDATE SET
                subscription_id = COALESCE(EXCLUDED.subscription_id, invoices.subscription_id),
                invoice_number = COALESCE(EXCLUDED.invoice_number, invoices.invoice_number),
                amount_cents = EXCLUDED.amount_cents,
                tax_cents = EXCLUDED.tax_cents,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                pdf_url = COALESCE(EXCLUDED.pdf_url, invoices.pdf_url),
                hosted_url = COALESCE(EXCLUDED.hosted_url, invoices.hosted_url),
                issued_at = COALESCE(EXCLUDED.issued_at, invoices.issued_at),
                paid_at = COALESCE(EXCLUDED.paid_at, invoices.paid_at)
            RETURNING id, user_id, org_id, subscription_id, stripe_invoice_id,
                      stripe_customer_id, invoice_number, amount_cents, tax_cents,
                      currency, status, pdf_url, hosted_url, issued_at, paid_at,
                      created_at
            "#,
        )
        .bind(invoice.user_id)
        .bind(invoice.org_id)
        .bind(invoice.subscription_id)
        .bind(&invoice.stripe_invoice_id)
        .bind(&invoice.stripe_customer_id)
        .bind(&invoice.invoice_number)
        .bind(invoice.amount_cents)
        .bind(invoice.tax_cents)
        .bind(&invoice.currency)
        .bind(invoice.status)
        .bind(&invoice.pdf_url)
        .bind(&invoice.hosted_url)
        .bind(invoice.issued_at)
        .bind(invoice.paid_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(stored)
    }

    pub async fn find_by_stripe_id(
        &self,
        stripe_invoice_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        let invoice: Option<Invoice> = sqlx::query_as(
            r#"
            SELECT id, user_id, org_id, subscription_id, stripe_invoice_id,
                   stripe_customer_id, invoice_number, amount_cents, tax_cents,
                   currency, status, pdf_url, hosted_url, issued_at, paid_at,
                   created_at
            FROM invoices
            WHERE stripe_invoice_id = $1
            "#,
        )
        .bind(stripe_invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(invoice)
    }

    /// Invoices for an organization, newest first.
    pub async fn list_for_org(&self, org_id: Uuid, limit: i64) -> BillingResult<Vec<Invoice>> {
        let invoices: Vec<Invoice> = sqlx::query_as(
            r#"
            SELECT id, user_id, org_id, subscription_id, stripe_invoice_id,
                   stripe_customer_id, invoice_number, amount_cents, tax_cents,
                   currency, status, pdf_url, hosted_url, issued_at, paid_at,
                   created_at
            FROM invoices
            WHERE org_id = $1
            ORDER BY COALESCE(issued_at, created_at) DESC
            LIMIT $2
            "#,
        )
        .bind(org_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(invoices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_status_round_trip() {
        for status in [
            InvoiceStatus::Draft,
            InvoiceStatus::Open,
            InvoiceStatus::Paid,
            InvoiceStatus::Void,
            InvoiceStatus::Uncollectible,
        ] {
            assert_eq!(InvoiceStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(InvoiceStatus::from_str("deleted"), None);
    }
}
