//! Integration tests for the billing reconciliation engine
//!
//! These tests verify the webhook activation path, idempotent invoice
//! upserts, and the quantity-change lifecycle against a real database,
//! with the payment gateway replaced by an in-memory fake.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/classpulse_test"
//! cargo test -p classpulse-billing -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use classpulse_billing::{
    Billing, BillingNotification, BillingNotifier, BillingResult, CreateSubscriptionParams,
    GatewayCustomer, GatewayInvoice, GatewayPayment, GatewaySubscription, NewGatewayPayment,
    NewGatewaySubscription, PaymentGateway, ProrationMode, StripeConfig, WebhookEvent,
    WebhookOutcome,
};
use classpulse_shared::types::SubscriptionStatus;

// ============================================================================
// Test Doubles
// ============================================================================

/// In-memory payment gateway. Records every call so tests can assert on the
/// outbound traffic.
#[derive(Default)]
struct FakeGateway {
    counter: AtomicU32,
    subscriptions: Mutex<HashMap<String, GatewaySubscription>>,
    payments: Mutex<Vec<NewGatewayPayment>>,
}

impl FakeGateway {
    fn next(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst))
    }

    fn recorded_payments(&self) -> Vec<NewGatewayPayment> {
        self.payments.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_customer(
        &self,
        _org_id: Uuid,
        _email: &str,
        _name: &str,
    ) -> BillingResult<GatewayCustomer> {
        Ok(GatewayCustomer {
            id: self.next("cus_test"),
        })
    }

    async fn create_subscription(
        &self,
        params: NewGatewaySubscription,
    ) -> BillingResult<GatewaySubscription> {
        let now = OffsetDateTime::now_utc();
        let sub = GatewaySubscription {
            id: self.next("sub_test"),
            customer_id: params.customer_id,
            status: "incomplete".to_string(),
            current_period_start: now,
            current_period_end: now + Duration::days(30),
            cancel_at_period_end: false,
            quantity: Some(params.quantity),
        };
        self.subscriptions
            .lock()
            .unwrap()
            .insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    async fn update_subscription_quantity(
        &self,
        subscription_id: &str,
        _price_id: &str,
        quantity: i32,
        _proration: ProrationMode,
    ) -> BillingResult<GatewaySubscription> {
        let mut subs = self.subscriptions.lock().unwrap();
        let sub = subs
            .get_mut(subscription_id)
            .expect("unknown subscription in fake gateway");
        sub.quantity = Some(quantity);
        Ok(sub.clone())
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<GatewaySubscription> {
        let mut subs = self.subscriptions.lock().unwrap();
        let sub = subs
            .get_mut(subscription_id)
            .expect("unknown subscription in fake gateway");
        if at_period_end {
            sub.cancel_at_period_end = true;
        } else {
            sub.status = "canceled".to_string();
        }
        Ok(sub.clone())
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .expect("unknown subscription in fake gateway")
            .clone())
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<GatewayInvoice> {
        Ok(GatewayInvoice {
            id: invoice_id.to_string(),
            subscription_id: None,
        })
    }

    async fn create_payment(&self, params: NewGatewayPayment) -> BillingResult<GatewayPayment> {
        let amount_cents = params.amount_cents;
        self.payments.lock().unwrap().push(params);
        Ok(GatewayPayment {
            id: self.next("pi_test"),
            status: "succeeded".to_string(),
            amount_cents,
        })
    }

    async fn create_portal_session(
        &self,
        _customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        Ok(format!("https://billing.example.com/session?return={return_url}"))
    }
}

/// Notifier that records instead of sending.
#[derive(Default)]
struct RecordingNotifier {
    notifications: Mutex<Vec<BillingNotification>>,
}

impl RecordingNotifier {
    fn activated_count(&self) -> usize {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|n| matches!(n, BillingNotification::SubscriptionActivated { .. }))
            .count()
    }
}

#[async_trait]
impl BillingNotifier for RecordingNotifier {
    async fn notify(&self, notification: BillingNotification) -> BillingResult<bool> {
        self.notifications.lock().unwrap().push(notification);
        Ok(true)
    }
}

// ============================================================================
// Test Utilities
// ============================================================================

struct TestContext {
    pool: PgPool,
    billing: Billing,
    gateway: Arc<FakeGateway>,
    notifier: Arc<RecordingNotifier>,
    org_id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
}

async fn setup() -> TestContext {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    classpulse_shared::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let config = StripeConfig {
        secret_key: "sk_test_fake".to_string(),
        webhook_secret: "whsec_test_secret".to_string(),
        app_base_url: "http://localhost:3000".to_string(),
        currency: "usd".to_string(),
    };

    let gateway = Arc::new(FakeGateway::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let billing = Billing::with_collaborators(
        config,
        pool.clone(),
        gateway.clone(),
        notifier.clone(),
    );

    let (org_id, user_id) = create_test_org(&pool).await;
    let plan_id = create_test_plan(&pool).await;

    TestContext {
        pool,
        billing,
        gateway,
        notifier,
        org_id,
        user_id,
        plan_id,
    }
}

async fn create_test_org(pool: &PgPool) -> (Uuid, Uuid) {
    let org_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();

    sqlx::query("INSERT INTO organizations (id, name, slug) VALUES ($1, $2, $3)")
        .bind(org_id)
        .bind("Test School")
        .bind(format!("test-school-{}", org_id))
        .execute(pool)
        .await
        .expect("Failed to create test organization");

    sqlx::query("INSERT INTO users (id, email, name) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(format!("owner-{}@example.com", user_id))
        .bind("Test Owner")
        .execute(pool)
        .await
        .expect("Failed to create test user");

    sqlx::query(
        "INSERT INTO organization_members (org_id, user_id, role) VALUES ($1, $2, 'owner')",
    )
    .bind(org_id)
    .bind(user_id)
    .execute(pool)
    .await
    .expect("Failed to create membership");

    (org_id, user_id)
}

async fn create_test_plan(pool: &PgPool) -> Uuid {
    let plan_id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO subscription_plans (id, name, is_free, is_active, trial_period_days)
        VALUES ($1, 'Standard', FALSE, TRUE, 0)
        "#,
    )
    .bind(plan_id)
    .execute(pool)
    .await
    .expect("Failed to create test plan");

    // Gap-free tiers covering [1, 20]
    for (min, max, unit) in [(1, 5, 900_i64), (6, 10, 800), (11, 20, 700)] {
        sqlx::query(
            r#"
            INSERT INTO pricing_tiers
                (plan_id, billing_period, min_classes, max_classes,
                 price_per_unit_cents, stripe_price_id)
            VALUES ($1, 'monthly', $2, $3, $4, $5)
            "#,
        )
        .bind(plan_id)
        .bind(min)
        .bind(max)
        .bind(unit)
        .bind(format!("price_test_{min}_{max}"))
        .execute(pool)
        .await
        .expect("Failed to create pricing tier");
    }

    plan_id
}

async fn cleanup(ctx: &TestContext) {
    // Delete in order to respect foreign key constraints
    for query in [
        "DELETE FROM billing_events WHERE org_id = $1",
        "DELETE FROM invoices WHERE org_id = $1",
        "DELETE FROM subscriptions WHERE org_id = $1",
        "DELETE FROM organization_members WHERE org_id = $1",
        "DELETE FROM organizations WHERE id = $1",
    ] {
        sqlx::query(query)
            .bind(ctx.org_id)
            .execute(&ctx.pool)
            .await
            .ok();
    }
    sqlx::query("DELETE FROM pricing_tiers WHERE plan_id = $1")
        .bind(ctx.plan_id)
        .execute(&ctx.pool)
        .await
        .ok();
    sqlx::query("DELETE FROM subscription_plans WHERE id = $1")
        .bind(ctx.plan_id)
        .execute(&ctx.pool)
        .await
        .ok();
    sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(ctx.user_id)
        .execute(&ctx.pool)
        .await
        .ok();
}

fn invoice_paid_event(subscription_id: Uuid, stripe_invoice_id: &str) -> WebhookEvent {
    serde_json::from_value(serde_json::json!({
        "id": format!("evt_{}", stripe_invoice_id),
        "type": "invoice.paid",
        "data": {
            "object": {
                "id": stripe_invoice_id,
                "customer": "cus_test_0",
                "status": "paid",
                "total": 4500,
                "tax": 0,
                "currency": "usd",
                "metadata": { "subscription_id": subscription_id.to_string() }
            }
        }
    }))
    .expect("valid event json")
}

async fn create_pending_subscription(ctx: &TestContext, quantity: i32) -> Uuid {
    let sub = ctx
        .billing
        .subscriptions
        .create_subscription(CreateSubscriptionParams {
            user_id: ctx.user_id,
            org_id: ctx.org_id,
            plan_id: ctx.plan_id,
            billing_period: classpulse_shared::types::BillingPeriod::Monthly,
            quantity,
            email: "owner@example.com".to_string(),
            name: "Test Owner".to_string(),
        })
        .await
        .expect("Failed to create subscription");
    assert_eq!(sub.status(), SubscriptionStatus::Pending);
    assert!(sub.stripe_subscription_id().is_some());
    sub.id()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_invoice_paid_activates_pending_subscription_idempotently() {
    let ctx = setup().await;
    let sub_id = create_pending_subscription(&ctx, 5).await;

    let event = invoice_paid_event(sub_id, "in_test_activation");
    let outcome = ctx
        .billing
        .webhooks
        .handle_event(event.clone())
        .await
        .expect("webhook handling failed");
    assert_eq!(outcome, WebhookOutcome::Processed);

    let sub = ctx.billing.store.get_by_id(sub_id).await.unwrap();
    assert_eq!(sub.status(), SubscriptionStatus::Active);
    assert!(sub.current_period_start().is_some());
    assert!(sub.current_period_end().is_some());

    // Replay the identical event: still one invoice row, still one
    // activation notification.
    ctx.billing
        .webhooks
        .handle_event(event)
        .await
        .expect("replay failed");

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM invoices WHERE stripe_invoice_id = $1")
            .bind("in_test_activation")
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    assert_eq!(count, 1);

    let sub = ctx.billing.store.get_by_id(sub_id).await.unwrap();
    assert_eq!(sub.status(), SubscriptionStatus::Active);
    assert_eq!(ctx.notifier.activated_count(), 1);

    cleanup(&ctx).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_upgrade_charges_prorated_amount_and_applies_immediately() {
    let ctx = setup().await;
    let sub_id = create_pending_subscription(&ctx, 5).await;
    ctx.billing
        .webhooks
        .handle_event(invoice_paid_event(sub_id, "in_test_upgrade"))
        .await
        .expect("activation failed");

    let outcome = ctx
        .billing
        .quantity
        .change_quantity(sub_id, 10, ctx.org_id, ctx.user_id)
        .await
        .expect("quantity change failed");

    assert!(outcome.is_upgrade);
    assert!(outcome.requires_payment);
    assert_eq!(outcome.previous_quantity, 5);
    assert_eq!(outcome.new_quantity, 10);
    let amount = outcome.amount_due_cents.expect("amount due");
    // 5x900 -> 10x800: delta 3500 cents, charged (almost) in full right
    // after renewal.
    assert!(amount > 0 && amount <= 3500);

    let payments = ctx.gateway.recorded_payments();
    assert_eq!(payments.len(), 1);
    assert_eq!(
        payments[0].metadata.get("type").map(String::as_str),
        Some("quantity_update")
    );
    assert_eq!(
        payments[0].metadata.get("new_quantity").map(String::as_str),
        Some("10")
    );

    let sub = ctx.billing.store.get_by_id(sub_id).await.unwrap();
    assert_eq!(sub.quantity(), 10);
    assert_eq!(sub.pending_quantity(), None);

    cleanup(&ctx).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_downgrade_stages_quantity_until_renewal() {
    let ctx = setup().await;
    let sub_id = create_pending_subscription(&ctx, 10).await;
    ctx.billing
        .webhooks
        .handle_event(invoice_paid_event(sub_id, "in_test_downgrade"))
        .await
        .expect("activation failed");

    let outcome = ctx
        .billing
        .quantity
        .change_quantity(sub_id, 5, ctx.org_id, ctx.user_id)
        .await
        .expect("downgrade failed");

    assert!(!outcome.is_upgrade);
    assert!(!outcome.requires_payment);
    assert_eq!(outcome.amount_due_cents, None);

    let sub = ctx.billing.store.get_by_id(sub_id).await.unwrap();
    assert_eq!(sub.quantity(), 10);
    assert_eq!(sub.pending_quantity(), Some(5));
    assert_eq!(
        Some(outcome.effective_date),
        sub.current_period_end(),
        "downgrade takes effect at period end"
    );
    assert!(ctx.gateway.recorded_payments().is_empty());

    // Force the period to lapse and run the renewal path.
    sqlx::query(
        "UPDATE subscriptions SET current_period_end = NOW() - INTERVAL '1 day' WHERE id = $1",
    )
    .bind(sub_id)
    .execute(&ctx.pool)
    .await
    .unwrap();

    let due = ctx
        .billing
        .store
        .find_pending_quantity_due(OffsetDateTime::now_utc(), 10)
        .await
        .unwrap();
    let mut sub = due
        .into_iter()
        .find(|s| s.id() == sub_id)
        .expect("subscription should be due for renewal");
    sub.renew_period().unwrap();
    ctx.billing.store.save(&sub).await.unwrap();

    let sub = ctx.billing.store.get_by_id(sub_id).await.unwrap();
    assert_eq!(sub.quantity(), 5);
    assert_eq!(sub.pending_quantity(), None);
    assert!(sub.current_period_end().unwrap() > OffsetDateTime::now_utc());

    cleanup(&ctx).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_non_admin_cannot_change_quantity() {
    let ctx = setup().await;
    let sub_id = create_pending_subscription(&ctx, 5).await;
    ctx.billing
        .webhooks
        .handle_event(invoice_paid_event(sub_id, "in_test_authz"))
        .await
        .expect("activation failed");

    let teacher_id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, email, name) VALUES ($1, $2, 'Teacher')")
        .bind(teacher_id)
        .bind(format!("teacher-{}@example.com", teacher_id))
        .execute(&ctx.pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO organization_members (org_id, user_id, role) VALUES ($1, $2, 'teacher')",
    )
    .bind(ctx.org_id)
    .bind(teacher_id)
    .execute(&ctx.pool)
    .await
    .unwrap();

    let result = ctx
        .billing
        .quantity
        .change_quantity(sub_id, 10, ctx.org_id, teacher_id)
        .await;
    assert!(matches!(
        result,
        Err(classpulse_billing::BillingError::InsufficientPermissions(_))
    ));

    let sub = ctx.billing.store.get_by_id(sub_id).await.unwrap();
    assert_eq!(sub.quantity(), 5);

    sqlx::query("DELETE FROM organization_members WHERE user_id = $1")
        .bind(teacher_id)
        .execute(&ctx.pool)
        .await
        .ok();
    sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(teacher_id)
        .execute(&ctx.pool)
        .await
        .ok();
    cleanup(&ctx).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_unknown_event_type_is_acknowledged_without_side_effects() {
    let ctx = setup().await;

    let event: WebhookEvent = serde_json::from_value(serde_json::json!({
        "id": "evt_unknown",
        "type": "charge.refunded",
        "data": { "object": { "id": "ch_1" } }
    }))
    .unwrap();

    let outcome = ctx.billing.webhooks.handle_event(event).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Ignored);

    let (invoices,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM invoices WHERE org_id = $1")
        .bind(ctx.org_id)
        .fetch_one(&ctx.pool)
        .await
        .unwrap();
    assert_eq!(invoices, 0);

    cleanup(&ctx).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_subscription_updated_webhook_syncs_period_and_cancellation() {
    let ctx = setup().await;
    let sub_id = create_pending_subscription(&ctx, 5).await;
    ctx.billing
        .webhooks
        .handle_event(invoice_paid_event(sub_id, "in_test_sync"))
        .await
        .expect("activation failed");

    let sub = ctx.billing.store.get_by_id(sub_id).await.unwrap();
    let external_id = sub.stripe_subscription_id().unwrap().to_string();

    let period_start = OffsetDateTime::now_utc().unix_timestamp();
    let period_end = period_start + 30 * 86_400;
    let event: WebhookEvent = serde_json::from_value(serde_json::json!({
        "id": "evt_sub_updated",
        "type": "customer.subscription.updated",
        "data": {
            "object": {
                "id": external_id,
                "customer": "cus_test_0",
                "status": "active",
                "current_period_start": period_start,
                "current_period_end": period_end,
                "cancel_at_period_end": true,
                "items": { "data": [ { "quantity": 5 } ] }
            }
        }
    }))
    .unwrap();

    ctx.billing.webhooks.handle_event(event).await.unwrap();

    let sub = ctx.billing.store.get_by_id(sub_id).await.unwrap();
    assert_eq!(sub.status(), SubscriptionStatus::Active);
    assert!(sub.cancellation_scheduled());
    assert_eq!(
        sub.current_period_end().unwrap().unix_timestamp(),
        period_end
    );

    cleanup(&ctx).await;
}
