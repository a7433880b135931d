use axum::Router;
use billflow::WebhookConfig;
use billflow::billing::webhook::sign_payload;
use billflow::billing::{
    InMemoryBillingStore, Invoice, InvoiceLineItem, InvoiceStatus, InvoiceStore, LineItemKind,
    Payment, PaymentStatus, PaymentStore,
};
use billflow::http::{AppState, RAMP_SIGNATURE_HEADER, STRIPE_SIGNATURE_HEADER, router};
use billflow::testing::{self, MockPaymentGateway};
use billflow::webhooks::HmacSha256Verifier;
use chrono::Utc;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde_json::json;

const STRIPE_SECRET: &str = "whsec_http_test";
const RAMP_SECRET: &str = "ramp_http_test";

async fn app() -> (Router, InMemoryBillingStore) {
    let store = InMemoryBillingStore::new();
    store
        .seed(
            vec![testing::customer("cus_a"), testing::customer("cus_b")],
            vec![testing::monthly_plan("pro", 50)],
        )
        .await;

    let webhooks = WebhookConfig {
        stripe_secret: SecretString::from(STRIPE_SECRET.to_string()),
        ramp_secret: SecretString::from(RAMP_SECRET.to_string()),
        tolerance_seconds: 300,
    };
    let state = AppState::new(store.clone(), MockPaymentGateway::new(), &webhooks);
    (router(state), store)
}

fn stripe_event(id: &str, event_type: &str, object: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "type": event_type,
        "created": Utc::now().timestamp(),
        "data": { "object": object }
    }))
    .unwrap()
}

fn stripe_signature(payload: &[u8]) -> String {
    sign_payload(STRIPE_SECRET, Utc::now().timestamp(), payload)
}

fn ramp_signature(payload: &[u8]) -> String {
    HmacSha256Verifier::new_with_prefix(RAMP_SECRET.to_string(), "sha256=")
        .sign(payload)
        .unwrap()
}

async fn open_invoice_with_pending_payment(store: &InMemoryBillingStore) -> Invoice {
    let mut invoice = Invoice::draft("cus_a", "usd");
    invoice.line_items.push(InvoiceLineItem::new(
        "Pro plan",
        LineItemKind::Subscription,
        Decimal::ONE,
        Decimal::from(50),
    ));
    invoice.recalculate();
    invoice.status = InvoiceStatus::Open;
    store.insert_invoice(&invoice).await.unwrap();

    let mut payment = Payment::new("cus_a", Decimal::from(50), "usd");
    payment.invoice_id = Some(invoice.id.clone());
    payment.gateway_payment_intent_id = Some("pi_http".to_string());
    store.insert_payment(&payment).await.unwrap();

    invoice
}

#[tokio::test]
async fn test_stripe_webhook_acknowledges_unhandled_types() {
    let (app, _) = app().await;
    let payload = stripe_event("evt_unknown", "customer.tax_id.created", json!({"id": "txi_1"}));

    testing::post(app, "/webhooks/stripe")
        .header(STRIPE_SIGNATURE_HEADER, &stripe_signature(&payload))
        .raw_body(payload)
        .execute()
        .await
        .assert_ok()
        .assert_json()
        .assert_json_path("received", json!(true));
}

#[tokio::test]
async fn test_stripe_webhook_rejects_bad_signature() {
    let (app, store) = app().await;
    let invoice = open_invoice_with_pending_payment(&store).await;
    let payload = stripe_event(
        "evt_forged",
        "payment_intent.succeeded",
        json!({"id": "pi_http", "status": "succeeded"}),
    );
    let forged = sign_payload("whsec_attacker", Utc::now().timestamp(), &payload);

    testing::post(app.clone(), "/webhooks/stripe")
        .header(STRIPE_SIGNATURE_HEADER, &forged)
        .raw_body(payload.clone())
        .execute()
        .await
        .assert_unauthorized()
        .assert_error_code("INVALID_SIGNATURE");

    testing::post(app, "/webhooks/stripe")
        .raw_body(payload)
        .execute()
        .await
        .assert_unauthorized();

    let unchanged = store.get_invoice(&invoice.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, InvoiceStatus::Open);
    assert_eq!(unchanged.amount_paid, Decimal::ZERO);
}

#[tokio::test]
async fn test_duplicate_payment_succeeded_delivery_settles_once() {
    let (app, store) = app().await;
    let invoice = open_invoice_with_pending_payment(&store).await;
    let payload = stripe_event(
        "evt_paid",
        "payment_intent.succeeded",
        json!({"id": "pi_http", "status": "succeeded"}),
    );

    testing::post(app.clone(), "/webhooks/stripe")
        .header(STRIPE_SIGNATURE_HEADER, &stripe_signature(&payload))
        .raw_body(payload.clone())
        .execute()
        .await
        .assert_ok();
    let once = store.get_invoice(&invoice.id).await.unwrap().unwrap();
    assert_eq!(once.status, InvoiceStatus::Paid);
    assert_eq!(once.amount_paid, Decimal::from(50));

    testing::post(app, "/webhooks/stripe")
        .header(STRIPE_SIGNATURE_HEADER, &stripe_signature(&payload))
        .raw_body(payload)
        .execute()
        .await
        .assert_ok()
        .assert_json_path("received", json!(true));
    let twice = store.get_invoice(&invoice.id).await.unwrap().unwrap();
    assert_eq!(twice.status, once.status);
    assert_eq!(twice.amount_paid, once.amount_paid);
    assert_eq!(twice.amount_due, Decimal::ZERO);

    let payment = store.get_payment_by_intent_id("pi_http").await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);
}

#[tokio::test]
async fn test_payment_for_voided_invoice_does_not_reopen_it() {
    let (app, store) = app().await;
    let invoice = open_invoice_with_pending_payment(&store).await;
    let mut voided = invoice.clone();
    voided.status = InvoiceStatus::Void;
    assert!(store.compare_and_save_invoice(&voided, invoice.version).await.unwrap());

    let payload = stripe_event(
        "evt_paid_after_void",
        "payment_intent.succeeded",
        json!({"id": "pi_http", "status": "succeeded"}),
    );
    testing::post(app, "/webhooks/stripe")
        .header(STRIPE_SIGNATURE_HEADER, &stripe_signature(&payload))
        .raw_body(payload)
        .execute()
        .await
        .assert_ok();

    let stored = store.get_invoice(&invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Void);
    assert_eq!(stored.amount_paid, Decimal::ZERO);
    let payment = store.get_payment_by_intent_id("pi_http").await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);
}

#[tokio::test]
async fn test_malformed_signed_payload_is_a_server_error() {
    let (app, _) = app().await;
    let payload = br#"{"id": "evt_broken"}"#.to_vec();

    testing::post(app, "/webhooks/stripe")
        .header(STRIPE_SIGNATURE_HEADER, &stripe_signature(&payload))
        .raw_body(payload)
        .execute()
        .await
        .assert_server_error()
        .assert_error_code("INTERNAL_ERROR");
}

#[tokio::test]
async fn test_ramp_webhook_is_acknowledged_and_verified() {
    let (app, _) = app().await;
    let payload = br#"{"id":"revt_1","type":"transactions.cleared","object":{"id":"txn_1"}}"#.to_vec();

    testing::post(app.clone(), "/webhooks/ramp")
        .header(RAMP_SIGNATURE_HEADER, &ramp_signature(&payload))
        .raw_body(payload.clone())
        .execute()
        .await
        .assert_ok()
        .assert_json_path("received", json!(true));

    // redelivery is acknowledged too
    testing::post(app.clone(), "/webhooks/ramp")
        .header(RAMP_SIGNATURE_HEADER, &ramp_signature(&payload))
        .raw_body(payload.clone())
        .execute()
        .await
        .assert_ok();

    testing::post(app, "/webhooks/ramp")
        .header(RAMP_SIGNATURE_HEADER, "sha256=00")
        .raw_body(payload)
        .execute()
        .await
        .assert_unauthorized();
}

#[tokio::test]
async fn test_subscription_lifecycle_endpoints() {
    let (app, _) = app().await;

    let created: serde_json::Value = testing::post(app.clone(), "/subscriptions")
        .json_body(&json!({"customerId": "cus_a", "planId": "pro", "quantity": 2}))
        .execute()
        .await
        .assert_created()
        .json();
    assert_eq!(created["success"], true);
    assert_eq!(created["data"]["status"], "active");
    assert_eq!(created["data"]["quantity"], 2);
    let id = created["data"]["id"].as_str().unwrap().to_string();

    testing::get(app.clone(), &format!("/subscriptions/{}", id))
        .execute()
        .await
        .assert_ok()
        .assert_success()
        .assert_json_path("data.id", json!(id));

    testing::post(app.clone(), &format!("/subscriptions/{}/cancel", id))
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data.cancel_at_period_end", json!(true));

    testing::post(app.clone(), &format!("/subscriptions/{}/resume", id))
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data.cancel_at_period_end", json!(false));

    testing::post(app.clone(), &format!("/subscriptions/{}/cancel", id))
        .with_query(&[("immediate", "true")])
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data.status", json!("canceled"));

    testing::post(app, &format!("/subscriptions/{}/resume", id))
        .execute()
        .await
        .assert_conflict()
        .assert_error_code("INVALID_STATE");
}

#[tokio::test]
async fn test_subscription_errors_use_envelope() {
    let (app, _) = app().await;

    testing::get(app.clone(), "/subscriptions/sub_missing")
        .execute()
        .await
        .assert_not_found()
        .assert_error_code("NOT_FOUND");

    testing::post(app.clone(), "/subscriptions")
        .json_body(&json!({"customerId": "cus_nobody", "planId": "pro"}))
        .execute()
        .await
        .assert_not_found();

    testing::post(app, "/subscriptions")
        .json_body(&json!({"customerId": "cus_a", "planId": "pro", "quantity": 0}))
        .execute()
        .await
        .assert_bad_request()
        .assert_error_code("INVALID_INPUT");
}

#[tokio::test]
async fn test_customer_subscriptions_are_paginated() {
    let (app, _) = app().await;
    for _ in 0..3 {
        testing::post(app.clone(), "/subscriptions")
            .json_body(&json!({"customerId": "cus_b", "planId": "pro"}))
            .execute()
            .await
            .assert_created();
    }

    let body: serde_json::Value = testing::get(app.clone(), "/customers/cus_b/subscriptions")
        .with_query(&[("page", "2"), ("limit", "2")])
        .execute()
        .await
        .assert_ok()
        .json();
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["pagination"]["total"], 3);
    assert_eq!(body["pagination"]["totalPages"], 2);
    assert_eq!(body["pagination"]["hasNext"], false);
    assert_eq!(body["pagination"]["hasPrev"], true);

    testing::get(app, "/customers/cus_b/subscriptions")
        .with_query(&[("limit", "500")])
        .execute()
        .await
        .assert_bad_request();
}

#[tokio::test]
async fn test_billing_overview_endpoint() {
    let (app, _) = app().await;
    testing::post(app.clone(), "/subscriptions")
        .json_body(&json!({"customerId": "cus_a", "planId": "pro", "quantity": 3}))
        .execute()
        .await
        .assert_created();

    let body: serde_json::Value = testing::get(app, "/billing/overview")
        .with_query(&[("currency", "USD")])
        .execute()
        .await
        .assert_ok()
        .assert_success()
        .json();
    assert_eq!(body["data"]["currency"], "usd");
    assert_eq!(body["data"]["active_subscriptions"], 1);
    let decimal = |field: &str| body["data"][field].as_str().unwrap().parse::<Decimal>().unwrap();
    assert_eq!(decimal("mrr"), Decimal::from(150));
    assert_eq!(decimal("arr"), Decimal::from(1800));
}
