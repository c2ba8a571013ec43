//! Email notifications for billing events
//!
//! Sends transactional emails via the Resend API. Delivery failures are
//! non-fatal: a billing state change must never roll back because the
//! confirmation email bounced.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Cross-cutting notifications emitted by the reconciliation engine.
/// Consumers must tolerate at-least-once delivery.
#[derive(Debug, Clone)]
pub enum BillingNotification {
    SubscriptionActivated {
        org_id: Uuid,
        subscription_id: Uuid,
        quantity: i32,
        period_end: Option<OffsetDateTime>,
    },
    QuantityUpgraded {
        org_id: Uuid,
        subscription_id: Uuid,
        previous_quantity: i32,
        new_quantity: i32,
    },
    TrialEnding {
        org_id: Uuid,
        trial_end: OffsetDateTime,
    },
}

/// Sink for billing notifications. The production implementation emails the
/// organization's billing contact; tests swap in a recorder.
#[async_trait]
pub trait BillingNotifier: Send + Sync {
    /// Deliver a notification. `Ok(false)` means delivery was skipped or
    /// failed non-fatally; callers log and continue either way.
    async fn notify(&self, notification: BillingNotification) -> BillingResult<bool>;
}

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Dashboard URL
    pub dashboard_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Classpulse <noreply@classpulse.app>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Classpulse".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://classpulse.app".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Billing email notification service
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    pool: PgPool,
    client: reqwest::Client,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig, pool: PgPool) -> Self {
        Self {
            config,
            pool,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env(pool: PgPool) -> Self {
        Self::new(EmailConfig::from_env(), pool)
    }

    /// Send an email via Resend API
    ///
    /// Returns `Ok(true)` if the email was sent successfully,
    /// `Ok(false)` if sending failed (non-fatal - doesn't propagate error),
    /// `Err` only for critical configuration issues.
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> BillingResult<bool> {
        if !self.config.is_enabled() {
            tracing::warn!(
                to = %to,
                subject = %subject,
                "Email not configured, skipping"
            );
            return Ok(false);
        }

        #[allow(clippy::disallowed_methods)]
        // json! macro uses unwrap internally, safe for primitive types
        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Billing email sent");
                Ok(true)
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
        }
    }

    fn footer(&self) -> String {
        format!(
            r#"<p style="color:#888;font-size:12px">Manage your subscription at <a href="{url}/billing">{url}/billing</a>.</p>"#,
            url = self.config.dashboard_url
        )
    }
}

#[async_trait]
impl BillingNotifier for BillingEmailService {
    async fn notify(&self, notification: BillingNotification) -> BillingResult<bool> {
        let (to, subject, html) = match &notification {
            BillingNotification::SubscriptionActivated {
                org_id, quantity, ..
            } => (
                self.billing_contact(*org_id).await,
                format!("{} subscription confirmed", self.config.app_name),
                format!(
                    "<h2>Your subscription is active</h2>\
                     <p>Payment received. Your organization now has {} class{} enabled.</p>{}",
                    quantity,
                    if *quantity == 1 { "" } else { "es" },
                    self.footer()
                ),
            ),
            BillingNotification::QuantityUpgraded {
                org_id,
                previous_quantity,
                new_quantity,
                ..
            } => (
                self.billing_contact(*org_id).await,
                format!("{} plan updated", self.config.app_name),
                format!(
                    "<h2>Plan updated</h2>\
                     <p>Your class count changed from {} to {}.</p>{}",
                    previous_quantity,
                    new_quantity,
                    self.footer()
                ),
            ),
            BillingNotification::TrialEnding { org_id, trial_end } => (
                self.billing_contact(*org_id).await,
                format!("{} trial ending soon", self.config.app_name),
                format!(
                    "<h2>Your trial ends {}</h2>\
                     <p>Add a payment method to keep your classes running.</p>{}",
                    trial_end
                        .format(&time::format_description::well_known::Rfc3339)
                        .unwrap_or_default(),
                    self.footer()
                ),
            ),
        };

        let Some(to) = to else {
            tracing::warn!(
                notification = ?notification,
                "No billing contact email found, skipping notification"
            );
            return Ok(false);
        };

        self.send_email(&to, &subject, &html).await
    }
}

impl BillingEmailService {
    /// The organization's billing contact: the owner, or the first admin.
    /// Lookup is deliberately soft; a missing address means the notification
    /// is skipped, never an error.
    async fn billing_contact(&self, org_id: Uuid) -> Option<String> {
        let result: Result<Option<(String,)>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT u.email
            FROM organization_members m
            JOIN users u ON u.id = m.user_id
            WHERE m.org_id = $1 AND m.role IN ('owner', 'admin')
            ORDER BY CASE m.role WHEN 'owner' THEN 0 ELSE 1 END, m.created_at ASC
            LIMIT 1
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(row) => row.map(|(email,)| email),
            Err(e) => {
                tracing::error!(
                    org_id = %org_id,
                    error = %e,
                    "Failed to resolve billing contact - skipping notification"
                );
                None
            }
        }
    }
}
