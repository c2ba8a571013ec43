//! Billing routes for Stripe integration

use axum::{
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use classpulse_billing::{BillingError, CreateSubscriptionParams, Subscription, TierSummary};
use classpulse_shared::types::BillingPeriod;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Request to create a subscription
#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub plan_id: Uuid,
    /// Billing period (monthly or annual)
    pub billing_period: Option<String>,
    pub quantity: i32,
}

/// Request to change the billable class count
#[derive(Debug, Deserialize)]
pub struct UpdateQuantityRequest {
    pub new_quantity: i32,
}

/// Request to cancel the subscription
#[derive(Debug, Deserialize, Default)]
pub struct CancelSubscriptionRequest {
    /// Terminate now instead of at period end
    #[serde(default)]
    pub immediate: bool,
}

/// Subscription info response
#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub status: String,
    pub plan_id: String,
    pub billing_period: String,
    pub quantity: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_quantity: Option<i32>,
    pub current_period_start: Option<String>,
    pub current_period_end: Option<String>,
    pub cancel_at_period_end: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_end: Option<String>,
}

impl From<&Subscription> for SubscriptionInfo {
    fn from(sub: &Subscription) -> Self {
        Self {
            id: sub.id().to_string(),
            status: sub.status().as_str().to_string(),
            plan_id: sub.plan_id().to_string(),
            billing_period: sub.billing_period().as_str().to_string(),
            quantity: sub.quantity(),
            pending_quantity: sub.pending_quantity(),
            current_period_start: sub.current_period_start().map(fmt_ts),
            current_period_end: sub.current_period_end().map(fmt_ts),
            cancel_at_period_end: sub.cancellation_scheduled(),
            trial_end: sub.trial_end().map(fmt_ts),
        }
    }
}

/// Response for a quantity change
#[derive(Debug, Serialize)]
pub struct QuantityChangeResponse {
    pub previous_quantity: i32,
    pub new_quantity: i32,
    pub is_upgrade: bool,
    pub requires_payment: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_due_cents: Option<i64>,
    pub effective_date: String,
}

/// Query params for proration preview
#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub new_quantity: i32,
}

/// Query params for plan tier listing
#[derive(Debug, Deserialize)]
pub struct TiersQuery {
    pub billing_period: Option<String>,
}

/// Query params for invoice listing
#[derive(Debug, Deserialize)]
pub struct InvoicesQuery {
    pub limit: Option<i64>,
}

/// Invoice list entry
#[derive(Debug, Serialize)]
pub struct InvoiceInfo {
    pub id: String,
    pub invoice_number: Option<String>,
    pub amount_cents: i64,
    pub tax_cents: i64,
    pub currency: String,
    pub status: String,
    pub pdf_url: Option<String>,
    pub hosted_url: Option<String>,
    pub issued_at: Option<String>,
    pub paid_at: Option<String>,
}

/// Response from creating a portal session
#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub portal_url: String,
}

fn fmt_ts(ts: time::OffsetDateTime) -> String {
    ts.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

fn parse_period(raw: Option<&str>) -> Result<BillingPeriod, ApiError> {
    match raw {
        None => Ok(BillingPeriod::Monthly),
        Some(s) => BillingPeriod::from_str(s)
            .ok_or_else(|| ApiError::Validation(format!("unknown billing period: {}", s))),
    }
}

/// Get current subscription info
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let org_id = auth_user.org_id.ok_or(ApiError::NoOrganization)?;

    let sub = billing
        .subscriptions
        .get_current(org_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(SubscriptionInfo::from(&sub)))
}

/// Create a subscription for the caller's organization
pub async fn create_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let org_id = auth_user.org_id.ok_or(ApiError::NoOrganization)?;
    let billing_period = parse_period(req.billing_period.as_deref())?;

    // The external customer is labelled with the organization name.
    let org_name: Option<(String,)> =
        sqlx::query_as("SELECT name FROM organizations WHERE id = $1")
            .bind(org_id)
            .fetch_optional(&state.pool)
            .await?;
    let org_name = org_name.map(|(name,)| name).ok_or(ApiError::NoOrganization)?;

    let sub = billing
        .subscriptions
        .create_subscription(CreateSubscriptionParams {
            user_id: auth_user.user_id,
            org_id,
            plan_id: req.plan_id,
            billing_period,
            quantity: req.quantity,
            email: auth_user.email.clone().unwrap_or_default(),
            name: org_name,
        })
        .await?;

    tracing::info!(
        org_id = %org_id,
        subscription_id = %sub.id(),
        status = %sub.status(),
        "Subscription created via API"
    );

    Ok(Json(SubscriptionInfo::from(&sub)))
}

/// Change the billable class count
pub async fn update_quantity(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<UpdateQuantityRequest>,
) -> Result<Json<QuantityChangeResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let org_id = auth_user.org_id.ok_or(ApiError::NoOrganization)?;

    let sub = billing
        .subscriptions
        .get_current(org_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let outcome = billing
        .quantity
        .change_quantity(sub.id(), req.new_quantity, org_id, auth_user.user_id)
        .await?;

    tracing::info!(
        org_id = %org_id,
        subscription_id = %sub.id(),
        previous_quantity = outcome.previous_quantity,
        new_quantity = outcome.new_quantity,
        requires_payment = outcome.requires_payment,
        "Quantity change requested"
    );

    Ok(Json(QuantityChangeResponse {
        previous_quantity: outcome.previous_quantity,
        new_quantity: outcome.new_quantity,
        is_upgrade: outcome.is_upgrade,
        requires_payment: outcome.requires_payment,
        amount_due_cents: outcome.amount_due_cents,
        effective_date: fmt_ts(outcome.effective_date),
    }))
}

/// Preview the proration for a quantity change
pub async fn preview_quantity(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<classpulse_billing::ProrationPreview>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let org_id = auth_user.org_id.ok_or(ApiError::NoOrganization)?;

    let preview = billing
        .quantity
        .preview_change(org_id, query.new_quantity)
        .await?;

    Ok(Json(preview))
}

/// Cancel subscription (at period end by default)
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CancelSubscriptionRequest>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let org_id = auth_user.org_id.ok_or(ApiError::NoOrganization)?;

    let sub = billing
        .subscriptions
        .cancel_subscription(org_id, auth_user.user_id, req.immediate)
        .await?;

    Ok(Json(SubscriptionInfo::from(&sub)))
}

/// List the organization's invoices
pub async fn list_invoices(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<InvoicesQuery>,
) -> Result<Json<Vec<InvoiceInfo>>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let org_id = auth_user.org_id.ok_or(ApiError::NoOrganization)?;
    let limit = query.limit.unwrap_or(24).clamp(1, 100);

    let invoices = billing.invoices.list_for_org(org_id, limit).await?;

    Ok(Json(
        invoices
            .into_iter()
            .map(|inv| InvoiceInfo {
                id: inv.stripe_invoice_id,
                invoice_number: inv.invoice_number,
                amount_cents: inv.amount_cents,
                tax_cents: inv.tax_cents,
                currency: inv.currency,
                status: inv.status.as_str().to_string(),
                pdf_url: inv.pdf_url,
                hosted_url: inv.hosted_url,
                issued_at: inv.issued_at.map(fmt_ts),
                paid_at: inv.paid_at.map(fmt_ts),
            })
            .collect(),
    ))
}

/// Create a billing portal session
pub async fn create_portal_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<PortalResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let org_id = auth_user.org_id.ok_or(ApiError::NoOrganization)?;

    let customer_id = billing.customers.get_customer_id(org_id).await?;
    let url = billing
        .portal
        .create_portal_session(org_id, &customer_id)
        .await?;

    Ok(Json(PortalResponse { portal_url: url }))
}

/// List pricing tiers for a plan
pub async fn get_plan_tiers(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
    Query(query): Query<TiersQuery>,
) -> Result<Json<Vec<TierSummary>>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let billing_period = parse_period(query.billing_period.as_deref())?;

    let tiers = billing.pricing.get_tiers(plan_id, billing_period).await?;

    Ok(Json(tiers.iter().map(TierSummary::from).collect()))
}

/// Handle Stripe webhook events
///
/// Only signature failures are the sender's problem (400). Anything that
/// goes wrong after verification is acknowledged with 200 and logged, so
/// the sender does not retry events we already received.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = match billing.webhooks.verify_event(&body, signature) {
        Ok(event) => event,
        Err(BillingError::WebhookSignatureInvalid) => {
            tracing::warn!("Stripe webhook signature verification failed");
            return Err(ApiError::BadRequest("Invalid webhook signature".to_string()));
        }
        Err(e) => {
            // Authentic but unparseable payload: acknowledge and move on.
            tracing::error!(error = %e, "Verified webhook body could not be parsed");
            return Ok(StatusCode::OK);
        }
    };

    tracing::info!(
        event_type = %event.event_type,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    match billing.webhooks.handle_event(event).await {
        Ok(outcome) => {
            tracing::info!(outcome = ?outcome, "Stripe webhook processed");
        }
        Err(e) => {
            tracing::error!(error = %e, "Webhook handling failed; acknowledging receipt");
        }
    }

    Ok(StatusCode::OK)
}
