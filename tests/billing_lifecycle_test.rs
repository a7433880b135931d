use billflow::BillflowError;
use billflow::billing::{
    BillingEngine, BillingInterval, CreatePayment, CreateSubscription, InMemoryBillingStore,
    InvoiceManager, InvoiceStatus, NewLineItem, PaymentManager, PaymentStatus, Plan,
    SubscriptionEngine, SubscriptionStatus, calculate_proration,
};
use billflow::testing::{self, MockPaymentGateway};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

async fn seeded_store() -> InMemoryBillingStore {
    let store = InMemoryBillingStore::new();
    store
        .seed(
            vec![testing::customer("cus_a"), testing::customer("cus_b")],
            vec![
                testing::monthly_plan("pro", 9900),
                Plan::new("team", Decimal::from(60), "usd", BillingInterval::Month).with_trial_days(14),
            ],
        )
        .await;
    store
}

#[tokio::test]
async fn test_monthly_subscription_without_trial_is_active() {
    let store = seeded_store().await;
    let engine = SubscriptionEngine::new(store, MockPaymentGateway::new());

    let sub = engine
        .create_at(CreateSubscription::new("cus_a", "pro"), t0())
        .await
        .unwrap();

    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.current_period_start, t0());
    assert_eq!(
        sub.current_period_end,
        Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()
    );
    assert!(sub.trial_end.is_none());
}

#[tokio::test]
async fn test_full_refund_leaves_nothing_refundable() {
    let store = seeded_store().await;
    let payments = PaymentManager::new(store, MockPaymentGateway::new());

    let payment = payments
        .create(CreatePayment::new("cus_a", Decimal::from(100), "usd"))
        .await
        .unwrap();
    let payment = payments.confirm(&payment.id, Some("pm_card")).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);

    let outcome = payments
        .refund_payment(&payment.id, Some(Decimal::from(100)), None)
        .await
        .unwrap();
    assert_eq!(outcome.payment.status, PaymentStatus::Refunded);
    assert_eq!(outcome.payment.refunded_amount, Decimal::from(100));

    for amount in [Decimal::new(1, 2), Decimal::ONE, Decimal::from(100)] {
        let err = payments
            .refund_payment(&payment.id, Some(amount), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));
    }
}

#[tokio::test]
async fn test_refunds_never_exceed_payment() {
    let store = seeded_store().await;
    let payments = PaymentManager::new(store, MockPaymentGateway::new());

    let payment = payments
        .create(CreatePayment::new("cus_a", Decimal::from(80), "usd"))
        .await
        .unwrap();
    payments.confirm(&payment.id, None).await.unwrap();

    let mut refunded = Decimal::ZERO;
    for amount in [25, 40, 30, 15, 5] {
        let amount = Decimal::from(amount);
        let before = payments.get(&payment.id).await.unwrap();
        match payments.refund_payment(&payment.id, Some(amount), None).await {
            Ok(outcome) => {
                refunded += amount;
                assert_eq!(outcome.payment.refunded_amount, refunded);
            }
            Err(err) => {
                assert!(matches!(err, BillflowError::InvalidState(_)));
                let after = payments.get(&payment.id).await.unwrap();
                assert_eq!(after.refunded_amount, before.refunded_amount);
                assert_eq!(after.status, before.status);
            }
        }
        let current = payments.get(&payment.id).await.unwrap();
        assert!(current.refunded_amount <= current.amount);
    }

    // 25 + 40 + 15 fit, 30 and 5 do not
    assert_eq!(refunded, Decimal::from(80));
}

#[test]
fn test_proration_ten_of_thirty_days() {
    let start = t0();
    let end = start + Duration::days(30);
    let at = end - Duration::days(10);

    let prorated =
        calculate_proration(start, end, Decimal::from(30), Decimal::from(60), at).unwrap();

    assert_eq!(prorated.credit, Decimal::new(1000, 2));
    assert_eq!(prorated.charge, Decimal::new(2000, 2));
    assert_eq!(prorated.net_amount, Decimal::new(1000, 2));
}

#[test]
fn test_proration_period_boundaries() {
    let start = t0();
    let end = start + Duration::days(30);
    let current = Decimal::new(4550, 2);

    let at_start = calculate_proration(start, end, current, Decimal::from(90), start).unwrap();
    assert_eq!(at_start.credit, current);

    let at_end = calculate_proration(start, end, current, Decimal::from(90), end).unwrap();
    assert_eq!(at_end.credit, Decimal::ZERO);
    assert_eq!(at_end.charge, Decimal::ZERO);
}

#[tokio::test]
async fn test_expired_trials_flip_to_active() {
    let store = seeded_store().await;
    let engine = SubscriptionEngine::new(store, MockPaymentGateway::new());

    let expired_a = engine
        .create_at(CreateSubscription::new("cus_a", "team"), t0())
        .await
        .unwrap();
    let expired_b = engine
        .create_at(CreateSubscription::new("cus_b", "team"), t0() + Duration::days(2))
        .await
        .unwrap();
    let still_trialing = engine
        .create_at(CreateSubscription::new("cus_b", "team"), t0() + Duration::days(10))
        .await
        .unwrap();
    for sub in [&expired_a, &expired_b, &still_trialing] {
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
    }

    let result = engine
        .process_expired_trials_at(t0() + Duration::days(20))
        .await
        .unwrap();
    assert_eq!(result.processed, 2);
    assert_eq!(result.failed, 0);

    for id in [&expired_a.id, &expired_b.id] {
        let sub = engine.get(id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.trial_end.is_none());
    }
    let untouched = engine.get(&still_trialing.id).await.unwrap();
    assert_eq!(untouched.status, SubscriptionStatus::Trialing);
    assert_eq!(untouched.trial_end, still_trialing.trial_end);
    assert_eq!(untouched.version, still_trialing.version);
}

#[tokio::test]
async fn test_successive_periods_are_contiguous() {
    let store = seeded_store().await;
    let gateway = MockPaymentGateway::new();
    let subscriptions = SubscriptionEngine::new(store.clone(), gateway.clone());
    let billing = BillingEngine::new(store, gateway);

    let sub = subscriptions
        .create_at(CreateSubscription::new("cus_a", "pro").quantity(2), t0())
        .await
        .unwrap();

    let mut previous = sub;
    for _ in 0..4 {
        let invoice = billing
            .process_end_of_period_billing(&previous.id)
            .await
            .unwrap()
            .expect("active subscription is invoiced");
        assert_eq!(invoice.status, InvoiceStatus::Open);
        assert_eq!(invoice.total, Decimal::from(19800));
        assert_eq!(invoice.amount_paid + invoice.amount_due, invoice.total);

        let next = subscriptions.get(&previous.id).await.unwrap();
        assert_eq!(next.current_period_start, previous.current_period_end);
        assert!(next.current_period_end > previous.current_period_end);
        previous = next;
    }
}

#[tokio::test]
async fn test_invoice_balance_holds_after_every_mutation() {
    let store = seeded_store().await;
    let gateway = MockPaymentGateway::new();
    let invoices = InvoiceManager::new(store.clone(), gateway.clone());
    let billing = BillingEngine::new(store, gateway);

    let check = |invoice: &billflow::billing::Invoice| {
        assert_eq!(invoice.amount_paid + invoice.amount_due, invoice.total);
    };

    let draft = invoices.create_draft("cus_a", "usd", None).await.unwrap();
    check(&draft);
    let draft = invoices
        .add_line_item(&draft.id, NewLineItem::one_time("Setup", Decimal::from(120)))
        .await
        .unwrap();
    check(&draft);
    let draft = invoices
        .add_line_item(&draft.id, NewLineItem::one_time("Training", Decimal::new(3050, 2)))
        .await
        .unwrap();
    check(&draft);

    let open = invoices.finalize(&draft.id).await.unwrap();
    assert_eq!(open.status, InvoiceStatus::Open);
    assert_eq!(open.total, Decimal::new(15050, 2));
    check(&open);

    let partly = invoices.record_payment(&open.id, Decimal::from(50)).await.unwrap();
    check(&partly);

    billing.add_credits("cus_a", Decimal::from(40)).await.unwrap();
    let credited = billing.apply_credits("cus_a", &open.id).await.unwrap();
    assert_eq!(credited.amount_due, Decimal::new(6050, 2));
    check(&credited);

    let paid = invoices.record_payment(&open.id, Decimal::from(500)).await.unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);
    assert_eq!(paid.amount_due, Decimal::ZERO);
    check(&paid);
}

#[tokio::test]
async fn test_canceled_subscription_cannot_resume() {
    let store = seeded_store().await;
    let engine = SubscriptionEngine::new(store, MockPaymentGateway::new());

    let sub = engine.create(CreateSubscription::new("cus_a", "pro")).await.unwrap();
    let canceled = engine.cancel(&sub.id, true).await.unwrap();
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);

    for _ in 0..3 {
        let err = engine.resume(&sub.id).await.unwrap_err();
        assert!(matches!(err, BillflowError::InvalidState(_)));
    }
    assert_eq!(engine.get(&sub.id).await.unwrap().status, SubscriptionStatus::Canceled);
}
