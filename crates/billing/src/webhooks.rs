//! Webhook reconciliation dispatcher
//!
//! Receives verified payment-processor events and applies them idempotently
//! to the internal ledger. Invoices upsert on their unique external id;
//! subscriptions re-derive status from the payload instead of incrementing
//! anything, so duplicate delivery is harmless.
//!
//! Signature verification is done by hand against the raw body (HMAC-SHA256
//! over `"{timestamp}.{body}"`) because the vendored SDK's webhook module
//! tracks a different API version than our account.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use classpulse_shared::types::{is_valid_quantity, SubscriptionStatus};

use crate::email::{BillingNotification, BillingNotifier};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::gateway::{GatewaySubscription, PaymentGateway, ProrationMode};
use crate::invoices::{InvoiceStatus, InvoiceStore, InvoiceUpsert};
use crate::pricing::PricingService;
use crate::quantity::QUANTITY_UPDATE_KIND;
use crate::store::SubscriptionStore;
use crate::subscription::{map_external_status, ExternalSubscriptionState, Subscription};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted age of a signed webhook timestamp.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

// =============================================================================
// Event envelope and payloads
// =============================================================================

/// A verified webhook event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// How the dispatcher answered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Valid but unrecognized event type; acknowledged without side effects.
    Ignored,
}

/// Event types the dispatcher acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    InvoicePaid,
    PaymentSucceeded,
    PaymentFailed,
    PaymentCanceled,
    SubscriptionUpdated,
    SubscriptionDeleted,
    Unknown,
}

fn classify(event_type: &str) -> EventKind {
    match event_type {
        "invoice.paid" | "invoice.payment_succeeded" => EventKind::InvoicePaid,
        "payment_intent.succeeded" => EventKind::PaymentSucceeded,
        "payment_intent.payment_failed" => EventKind::PaymentFailed,
        "payment_intent.canceled" => EventKind::PaymentCanceled,
        "customer.subscription.updated" => EventKind::SubscriptionUpdated,
        "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
        _ => EventKind::Unknown,
    }
}

#[derive(Debug, Clone, Deserialize)]
struct InvoicePayload {
    id: String,
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    subscription: Option<String>,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    total: Option<i64>,
    #[serde(default)]
    tax: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    invoice_pdf: Option<String>,
    #[serde(default)]
    hosted_invoice_url: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    status_transitions: Option<InvoiceStatusTransitions>,
    #[serde(default)]
    subscription_details: Option<InvoiceSubscriptionDetails>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct InvoiceStatusTransitions {
    #[serde(default)]
    paid_at: Option<i64>,
}

/// Subscription reference embedded in invoice payloads: carries the
/// subscription's metadata, including our internal id.
#[derive(Debug, Clone, Deserialize, Default)]
struct InvoiceSubscriptionDetails {
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionPayload {
    id: String,
    #[serde(default)]
    customer: Option<String>,
    status: String,
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    items: Option<SubscriptionItemsPayload>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct SubscriptionItemsPayload {
    #[serde(default)]
    data: Vec<SubscriptionItemPayload>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionItemPayload {
    #[serde(default)]
    quantity: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct PaymentIntentPayload {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

// =============================================================================
// Signature verification
// =============================================================================

/// Verify a webhook signature header of the form `t=<unix>,v1=<hex>` against
/// the raw, unparsed body.
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    if candidates.is_empty() {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now.unix_timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    let mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("webhook secret is empty".to_string()))?;

    for candidate in candidates {
        let Ok(sig_bytes) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = mac.clone();
        mac.update(signed_payload.as_bytes());
        if mac.verify_slice(&sig_bytes).is_ok() {
            return Ok(());
        }
    }

    Err(BillingError::WebhookSignatureInvalid)
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Applies verified external lifecycle events to internal state.
#[derive(Clone)]
pub struct WebhookService {
    store: SubscriptionStore,
    invoices: InvoiceStore,
    pricing: PricingService,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn BillingNotifier>,
    events: BillingEventLogger,
    webhook_secret: String,
}

impl WebhookService {
    pub fn new(
        store: SubscriptionStore,
        invoices: InvoiceStore,
        pricing: PricingService,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn BillingNotifier>,
        events: BillingEventLogger,
        webhook_secret: String,
    ) -> Self {
        Self {
            store,
            invoices,
            pricing,
            gateway,
            notifier,
            events,
            webhook_secret,
        }
    }

    /// Verify the signature over the raw body and parse the envelope.
    /// Must run before any business logic touches the payload.
    pub fn verify_event(&self, payload: &str, signature_header: &str) -> BillingResult<WebhookEvent> {
        verify_signature(
            payload,
            signature_header,
            &self.webhook_secret,
            OffsetDateTime::now_utc(),
        )?;

        serde_json::from_str(payload)
            .map_err(|e| BillingError::InvalidInput(format!("malformed webhook event: {}", e)))
    }

    /// Dispatch a verified event. Unknown types are acknowledged as ignored
    /// so the sender does not retry them.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        match classify(&event.event_type) {
            EventKind::InvoicePaid => self.handle_invoice_paid(&event).await,
            EventKind::PaymentSucceeded => self.handle_payment_succeeded(&event).await,
            EventKind::PaymentFailed | EventKind::PaymentCanceled => {
                self.handle_payment_not_completed(&event).await
            }
            EventKind::SubscriptionUpdated | EventKind::SubscriptionDeleted => {
                self.handle_subscription_changed(&event).await
            }
            EventKind::Unknown => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Webhook event type not handled, acknowledging"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// invoice.paid: upsert the invoice row; a paid first invoice activates
    /// a `pending` subscription.
    async fn handle_invoice_paid(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let payload: InvoicePayload = parse_object(event)?;

        let mut sub = self.resolve_invoice_subscription(event, &payload).await?;

        let status = payload
            .status
            .as_deref()
            .and_then(InvoiceStatus::from_str)
            .unwrap_or(InvoiceStatus::Open);

        let invoice = self
            .invoices
            .upsert(InvoiceUpsert {
                user_id: Some(sub.user_id()),
                org_id: sub.org_id(),
                subscription_id: Some(sub.id()),
                stripe_invoice_id: payload.id.clone(),
                stripe_customer_id: payload.customer.clone(),
                invoice_number: payload.number.clone(),
                amount_cents: payload.total.unwrap_or(0),
                tax_cents: payload.tax.unwrap_or(0),
                currency: payload.currency.clone().unwrap_or_else(|| "usd".to_string()),
                status,
                pdf_url: payload.invoice_pdf.clone(),
                hosted_url: payload.hosted_invoice_url.clone(),
                issued_at: payload.created.and_then(from_unix),
                paid_at: payload
                    .status_transitions
                    .as_ref()
                    .and_then(|t| t.paid_at)
                    .and_then(from_unix),
            })
            .await?;

        // Activation trigger: the sole mechanism that moves a first-payment
        // subscription out of `pending`.
        if status == InvoiceStatus::Paid && sub.status() == SubscriptionStatus::Pending {
            sub.activate()?;
            self.store.save(&sub).await?;

            self.events
                .log_event_soft(
                    BillingEventBuilder::new(sub.org_id(), BillingEventType::SubscriptionActivated)
                        .data(serde_json::json!({
                            "subscription_id": sub.id(),
                            "quantity": sub.quantity(),
                        }))
                        .stripe_event(&event.id)
                        .stripe_invoice(&payload.id)
                        .actor_type(ActorType::Stripe),
                )
                .await;

            // Confirmation email must never fail the reconciliation.
            let notify_result = self
                .notifier
                .notify(BillingNotification::SubscriptionActivated {
                    org_id: sub.org_id(),
                    subscription_id: sub.id(),
                    quantity: sub.quantity(),
                    period_end: sub.current_period_end(),
                })
                .await;
            if let Err(e) = notify_result {
                tracing::error!(
                    org_id = %sub.org_id(),
                    subscription_id = %sub.id(),
                    error = %e,
                    "Activation notification failed - continuing"
                );
            }

            tracing::info!(
                org_id = %sub.org_id(),
                subscription_id = %sub.id(),
                invoice_id = %invoice.id,
                "Subscription activated on first paid invoice"
            );
        }

        self.events
            .log_event_soft(
                BillingEventBuilder::new(sub.org_id(), BillingEventType::InvoicePaid)
                    .data(serde_json::json!({ "amount_cents": invoice.amount_cents }))
                    .stripe_event(&event.id)
                    .stripe_invoice(&payload.id)
                    .actor_type(ActorType::Stripe),
            )
            .await;

        Ok(WebhookOutcome::Processed)
    }

    /// payment_intent.succeeded: complete a quantity-change charge by
    /// re-asserting the external quantity (no further proration; this charge
    /// was the proration) and applying the internal upgrade.
    async fn handle_payment_succeeded(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let payload: PaymentIntentPayload = parse_object(event)?;

        if payload.metadata.get("type").map(String::as_str) != Some(QUANTITY_UPDATE_KIND) {
            tracing::debug!(
                event_id = %event.id,
                payment_intent_id = %payload.id,
                "Payment intent without quantity-update tag, nothing to reconcile"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        let subscription_id = payload
            .metadata
            .get("subscription_id")
            .and_then(|s| Uuid::parse_str(s).ok());
        let new_quantity = payload
            .metadata
            .get("new_quantity")
            .and_then(|s| s.parse::<i32>().ok());

        // The money has already moved; malformed metadata is logged and
        // skipped, never thrown.
        let (subscription_id, new_quantity) = match (subscription_id, new_quantity) {
            (Some(s), Some(q)) if is_valid_quantity(q) => (s, q),
            _ => {
                tracing::error!(
                    event_id = %event.id,
                    payment_intent_id = %payload.id,
                    metadata = ?payload.metadata,
                    "Quantity-update payment carries invalid metadata, skipping"
                );
                return Ok(WebhookOutcome::Processed);
            }
        };

        let mut sub = self.store.get_by_id(subscription_id).await.map_err(|e| {
            tracing::error!(
                event_id = %event.id,
                subscription_id = %subscription_id,
                error = %e,
                "Quantity-update payment references unknown subscription"
            );
            e
        })?;

        let quote = self
            .pricing
            .resolve_price(sub.plan_id(), sub.billing_period(), new_quantity)
            .await?;

        if let (Some(external_id), Some(price_id)) = (
            sub.stripe_subscription_id().map(str::to_string),
            quote.tier.stripe_price_id.clone(),
        ) {
            self.gateway
                .update_subscription_quantity(
                    &external_id,
                    &price_id,
                    new_quantity,
                    ProrationMode::None,
                )
                .await?;
        }

        let previous_quantity = sub.quantity();
        let apply = match sub.update_quantity(new_quantity, true) {
            Ok(()) => self.store.save(&sub).await,
            Err(e) => Err(e),
        };
        if let Err(e) = apply {
            // The processor is now ahead of the internal ledger.
            tracing::error!(
                event_id = %event.id,
                subscription_id = %sub.id(),
                new_quantity = new_quantity,
                error = %e,
                "Failed to apply paid quantity update; internal state is behind the processor"
            );
            self.events
                .log_event_soft(
                    BillingEventBuilder::new(sub.org_id(), BillingEventType::ReconciliationGap)
                        .data(serde_json::json!({
                            "reason": "paid_quantity_update_not_applied",
                            "subscription_id": sub.id(),
                            "new_quantity": new_quantity,
                            "error": e.to_string(),
                        }))
                        .stripe_event(&event.id)
                        .actor_type(ActorType::Stripe),
                )
                .await;
            return Err(e);
        }

        self.events
            .log_event_soft(
                BillingEventBuilder::new(sub.org_id(), BillingEventType::QuantityChangeCompleted)
                    .data(serde_json::json!({
                        "previous_quantity": previous_quantity,
                        "new_quantity": new_quantity,
                        "amount_cents": payload.amount,
                    }))
                    .stripe_event(&event.id)
                    .actor_type(ActorType::Stripe),
            )
            .await;

        if let Err(e) = self
            .notifier
            .notify(BillingNotification::QuantityUpgraded {
                org_id: sub.org_id(),
                subscription_id: sub.id(),
                previous_quantity,
                new_quantity,
            })
            .await
        {
            tracing::error!(
                org_id = %sub.org_id(),
                error = %e,
                "Quantity-upgrade notification failed - continuing"
            );
        }

        Ok(WebhookOutcome::Processed)
    }

    /// payment_intent.payment_failed / canceled: the attempted upgrade never
    /// took internal effect, so there is nothing to roll back.
    async fn handle_payment_not_completed(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookOutcome> {
        let payload: PaymentIntentPayload = parse_object(event)?;

        if payload.metadata.get("type").map(String::as_str) != Some(QUANTITY_UPDATE_KIND) {
            return Ok(WebhookOutcome::Ignored);
        }

        tracing::warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            payment_intent_id = %payload.id,
            status = ?payload.status,
            amount_cents = ?payload.amount,
            metadata = ?payload.metadata,
            "Quantity-update payment did not complete"
        );

        if let Some(org_id) = payload
            .metadata
            .get("org_id")
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            self.events
                .log_event_soft(
                    BillingEventBuilder::new(org_id, BillingEventType::PaymentFailed)
                        .data(serde_json::json!({
                            "payment_intent_id": payload.id,
                            "amount_cents": payload.amount,
                            "event_type": event.event_type,
                        }))
                        .stripe_event(&event.id)
                        .actor_type(ActorType::Stripe),
                )
                .await;
        }

        Ok(WebhookOutcome::Processed)
    }

    /// customer.subscription.updated / deleted: overwrite internal state
    /// from the external source of truth.
    async fn handle_subscription_changed(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookOutcome> {
        let payload: SubscriptionPayload = parse_object(event)?;

        let mut sub = match self.store.find_by_stripe_id(&payload.id).await? {
            Some(sub) => sub,
            None => {
                // First sight of this external id: fall back to the internal
                // id embedded in metadata at creation, then link.
                let internal_id = payload
                    .metadata
                    .get("subscription_id")
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| BillingError::SubscriptionNotFound(payload.id.clone()))?;
                let mut sub = self.store.get_by_id(internal_id).await?;
                let customer = payload
                    .customer
                    .clone()
                    .or_else(|| sub.stripe_customer_id().map(str::to_string))
                    .unwrap_or_default();
                sub.link_external(&payload.id, &customer)?;
                sub
            }
        };

        let ext = self.external_state_from_payload(&payload, &sub);
        sub.sync_from_external(&ext)?;
        self.store.save(&sub).await?;

        let event_type = if classify(&event.event_type) == EventKind::SubscriptionDeleted {
            BillingEventType::SubscriptionCanceled
        } else {
            BillingEventType::SubscriptionUpdated
        };
        self.events
            .log_event_soft(
                BillingEventBuilder::new(sub.org_id(), event_type)
                    .data(serde_json::json!({
                        "status": sub.status().as_str(),
                        "external_status": payload.status,
                        "cancel_at_period_end": payload.cancel_at_period_end,
                    }))
                    .stripe_event(&event.id)
                    .stripe_subscription(&payload.id)
                    .actor_type(ActorType::Stripe),
            )
            .await;

        tracing::info!(
            org_id = %sub.org_id(),
            subscription_id = %sub.id(),
            stripe_subscription_id = %payload.id,
            status = %sub.status(),
            "Synced subscription from webhook"
        );

        Ok(WebhookOutcome::Processed)
    }

    /// Re-apply an externally fetched subscription snapshot. Used by the
    /// scheduled expired-period sync, which covers missed webhook delivery.
    pub async fn apply_remote_state(
        &self,
        mut sub: Subscription,
        remote: &GatewaySubscription,
    ) -> BillingResult<Subscription> {
        let status = match map_external_status(&remote.status) {
            Some(status) => status,
            None => {
                tracing::warn!(
                    subscription_id = %sub.id(),
                    external_status = %remote.status,
                    "Unknown external status during resync, keeping current"
                );
                sub.status()
            }
        };

        let ext = ExternalSubscriptionState {
            status,
            period_start: remote.current_period_start,
            period_end: remote.current_period_end,
            cancel_at_period_end: remote.cancel_at_period_end,
            quantity: remote.quantity,
        };
        sub.sync_from_external(&ext)?;
        self.store.save(&sub).await?;

        self.events
            .log_event_soft(
                BillingEventBuilder::new(sub.org_id(), BillingEventType::ExternalSyncApplied)
                    .data(serde_json::json!({
                        "status": sub.status().as_str(),
                        "external_status": remote.status,
                    }))
                    .stripe_subscription(&remote.id)
                    .actor_type(ActorType::System),
            )
            .await;

        Ok(sub)
    }

    /// Resolve the subscription an invoice belongs to: embedded metadata
    /// first, then the invoice's own subscription pointer, then a gateway
    /// read-back when the payload carries neither.
    async fn resolve_invoice_subscription(
        &self,
        event: &WebhookEvent,
        payload: &InvoicePayload,
    ) -> BillingResult<Subscription> {
        let embedded_id = payload
            .metadata
            .get("subscription_id")
            .or_else(|| {
                payload
                    .subscription_details
                    .as_ref()
                    .and_then(|d| d.metadata.get("subscription_id"))
            })
            .and_then(|s| Uuid::parse_str(s).ok());
        if let Some(internal_id) = embedded_id {
            return self.store.get_by_id(internal_id).await;
        }

        if let Some(external_id) = payload.subscription.as_deref() {
            return self
                .store
                .find_by_stripe_id(external_id)
                .await?
                .ok_or_else(|| BillingError::SubscriptionNotFound(external_id.to_string()));
        }

        // Payload lacks the pointer; ask the processor for the invoice.
        let remote = self.gateway.retrieve_invoice(&payload.id).await?;
        let external_id = remote
            .subscription_id
            .ok_or_else(|| BillingError::SubscriptionIdMissing(event.id.clone()))?;
        self.store
            .find_by_stripe_id(&external_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(external_id))
    }

    fn external_state_from_payload(
        &self,
        payload: &SubscriptionPayload,
        sub: &Subscription,
    ) -> ExternalSubscriptionState {
        let status = match map_external_status(&payload.status) {
            Some(status) => status,
            None => {
                tracing::warn!(
                    subscription_id = %sub.id(),
                    external_status = %payload.status,
                    "Unknown external subscription status, keeping current"
                );
                sub.status()
            }
        };

        let now = OffsetDateTime::now_utc();
        let period_start = payload
            .current_period_start
            .and_then(from_unix)
            .or(sub.current_period_start())
            .unwrap_or(now);
        let period_end = payload
            .current_period_end
            .and_then(from_unix)
            .or(sub.current_period_end())
            .unwrap_or(period_start);

        let quantity = payload
            .items
            .as_ref()
            .and_then(|items| items.data.first())
            .and_then(|item| item.quantity)
            .map(|q| q as i32);

        ExternalSubscriptionState {
            status,
            period_start,
            period_end,
            cancel_at_period_end: payload.cancel_at_period_end,
            quantity,
        }
    }
}

fn parse_object<T: serde::de::DeserializeOwned>(event: &WebhookEvent) -> BillingResult<T> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        BillingError::InvalidInput(format!(
            "malformed {} payload in event {}: {}",
            event.event_type, event.id, e
        ))
    })
}

fn from_unix(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let signed = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={},v1={}", timestamp, sig)
    }

    #[test]
    fn test_verify_signature_accepts_valid_header() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let now = OffsetDateTime::now_utc();
        let header = sign(payload, "whsec_test", now.unix_timestamp());
        assert!(verify_signature(payload, &header, "whsec_test", now).is_ok());
    }

    #[test]
    fn test_verify_signature_rejects_tampered_body() {
        let now = OffsetDateTime::now_utc();
        let header = sign(r#"{"amount":100}"#, "whsec_test", now.unix_timestamp());
        let result = verify_signature(r#"{"amount":99999}"#, &header, "whsec_test", now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_verify_signature_rejects_wrong_secret() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = OffsetDateTime::now_utc();
        let header = sign(payload, "whsec_other", now.unix_timestamp());
        let result = verify_signature(payload, &header, "whsec_test", now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_verify_signature_rejects_stale_timestamp() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = OffsetDateTime::now_utc();
        let stale = now.unix_timestamp() - SIGNATURE_TOLERANCE_SECS - 1;
        let header = sign(payload, "whsec_test", stale);
        let result = verify_signature(payload, &header, "whsec_test", now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_verify_signature_rejects_malformed_header() {
        let now = OffsetDateTime::now_utc();
        for header in ["", "t=notanumber,v1=00", "v1=00", "t=123"] {
            let result = verify_signature("{}", header, "whsec_test", now);
            assert!(
                matches!(result, Err(BillingError::WebhookSignatureInvalid)),
                "header {:?} should be rejected",
                header
            );
        }
    }

    #[test]
    fn test_classify_known_and_unknown_types() {
        assert_eq!(classify("invoice.paid"), EventKind::InvoicePaid);
        assert_eq!(classify("invoice.payment_succeeded"), EventKind::InvoicePaid);
        assert_eq!(classify("payment_intent.succeeded"), EventKind::PaymentSucceeded);
        assert_eq!(
            classify("payment_intent.payment_failed"),
            EventKind::PaymentFailed
        );
        assert_eq!(classify("payment_intent.canceled"), EventKind::PaymentCanceled);
        assert_eq!(
            classify("customer.subscription.updated"),
            EventKind::SubscriptionUpdated
        );
        assert_eq!(
            classify("customer.subscription.deleted"),
            EventKind::SubscriptionDeleted
        );
        assert_eq!(classify("charge.refunded"), EventKind::Unknown);
        assert_eq!(classify(""), EventKind::Unknown);
    }

    #[test]
    fn test_event_envelope_parses() {
        let raw = r#"{
            "id": "evt_123",
            "type": "invoice.paid",
            "data": { "object": { "id": "in_1", "status": "paid", "total": 4500 } }
        }"#;
        let event: WebhookEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.id, "evt_123");
        assert_eq!(event.event_type, "invoice.paid");

        let payload: InvoicePayload = serde_json::from_value(event.data.object).unwrap();
        assert_eq!(payload.id, "in_1");
        assert_eq!(payload.status.as_deref(), Some("paid"));
        assert_eq!(payload.total, Some(4500));
        assert!(payload.metadata.is_empty());
    }

    #[test]
    fn test_invoice_payload_reads_embedded_subscription_metadata() {
        let raw = serde_json::json!({
            "id": "in_2",
            "status": "paid",
            "subscription": "sub_ext_1",
            "subscription_details": {
                "metadata": { "subscription_id": "5bb4f92e-4f10-44e7-a820-222222222222" }
            }
        });
        let payload: InvoicePayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.subscription.as_deref(), Some("sub_ext_1"));
        assert_eq!(
            payload
                .subscription_details
                .unwrap()
                .metadata
                .get("subscription_id")
                .map(String::as_str),
            Some("5bb4f92e-4f10-44e7-a820-222222222222")
        );
    }

    #[test]
    fn test_subscription_payload_parses_quantity_and_metadata() {
        let raw = serde_json::json!({
            "id": "sub_9",
            "customer": "cus_7",
            "status": "active",
            "current_period_start": 1700000000,
            "current_period_end": 1702592000,
            "cancel_at_period_end": true,
            "items": { "data": [ { "quantity": 12 } ] },
            "metadata": { "subscription_id": "0a0e8aa8-7a72-4b52-8aa1-111111111111" }
        });
        let payload: SubscriptionPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.id, "sub_9");
        assert!(payload.cancel_at_period_end);
        assert_eq!(
            payload.items.as_ref().unwrap().data[0].quantity,
            Some(12)
        );
        assert!(payload.metadata.contains_key("subscription_id"));
    }

    #[test]
    fn test_payment_intent_payload_defaults() {
        let payload: PaymentIntentPayload =
            serde_json::from_value(serde_json::json!({ "id": "pi_1" })).unwrap();
        assert_eq!(payload.id, "pi_1");
        assert!(payload.status.is_none());
        assert!(payload.metadata.is_empty());
    }
}
