//! Payment order creation and the client verify path.

mod common;

use booking_service::models::{AuditAction, BookingStatus, PaymentStatus, WalletKey};
use booking_service::services::reconciler::PaymentOutcome;
use common::{d, verify_request, MockGateway, TestContext};
use service_core::error::AppError;
use std::sync::atomic::Ordering;
use uuid::Uuid;

#[tokio::test]
async fn create_order_uses_minor_units_and_is_reused() {
    let ctx = TestContext::new();
    let (_, advertiser, booking) = ctx.approved_booking().await;

    let first = ctx
        .state
        .payments
        .create_order(advertiser, booking.booking_id)
        .await
        .unwrap();
    assert_eq!(first.amount, d("4071"));
    assert_eq!(first.amount_minor, 407_100);
    assert_eq!(first.currency, "INR");
    assert_eq!(first.key_id.as_deref(), Some("rzp_test_key"));
    assert!(!first.reused);

    let second = ctx
        .state
        .payments
        .create_order(advertiser, booking.booking_id)
        .await
        .unwrap();
    assert!(second.reused);
    assert_eq!(second.order_id, first.order_id);
    assert_eq!(ctx.gateway.orders_created(), 1);

    let stored = ctx.state.bookings.get(booking.booking_id).await.unwrap();
    assert_eq!(stored.gateway_order_id.as_deref(), Some(first.order_id.as_str()));
    assert_eq!(stored.order_amount, Some(d("4071")));
    assert_eq!(stored.payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn discount_after_order_makes_a_new_order() {
    let ctx = TestContext::new();
    let (billboard, advertiser, booking, first_order) = ctx.ordered_booking().await;

    ctx.state
        .bookings
        .apply_discount(billboard.owner_id, booking.booking_id, d("20"))
        .await
        .unwrap();

    let order = ctx
        .state
        .payments
        .create_order(advertiser, booking.booking_id)
        .await
        .unwrap();
    assert!(!order.reused);
    assert_ne!(order.order_id, first_order);
    assert_eq!(order.amount, d("3256.80"));
    assert_eq!(order.amount_minor, 325_680);
    assert_eq!(ctx.gateway.orders_created(), 2);
}

#[tokio::test]
async fn create_order_picks_up_new_settings_while_unpaid() {
    let ctx = TestContext::new();
    let (_, advertiser, booking) = ctx.approved_booking().await;

    ctx.state
        .settings
        .update(d("20"), d("18"), None)
        .await
        .unwrap();

    let order = ctx
        .state
        .payments
        .create_order(advertiser, booking.booking_id)
        .await
        .unwrap();
    // 3000 + 600 commission = 3600 taxable, + 648 GST.
    assert_eq!(order.amount, d("4248"));

    let trail = ctx.state.bookings.audit_trail(booking.booking_id).await.unwrap();
    assert!(trail.iter().any(|e| e.action == AuditAction::PriceRecalculated));
}

#[tokio::test]
async fn create_order_requires_approval_and_the_advertiser() {
    let ctx = TestContext::new();
    let billboard = ctx.seed_billboard("1000").await;
    let advertiser = ctx.advertiser().await;
    let start = common::future_monday(1);
    let pending = ctx
        .create_booking(advertiser, &billboard, start, start)
        .await
        .unwrap();

    let err = ctx
        .state
        .payments
        .create_order(advertiser, pending.booking_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BusinessRule(_)));

    ctx.state
        .bookings
        .approve(billboard.owner_id, pending.booking_id)
        .await
        .unwrap();
    let err = ctx
        .state
        .payments
        .create_order(Uuid::new_v4(), pending.booking_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
    assert_eq!(ctx.gateway.orders_created(), 0);
}

#[tokio::test]
async fn gateway_timeout_leaves_the_booking_unpaid() {
    let ctx = TestContext::new();
    let (_, advertiser, booking) = ctx.approved_booking().await;
    ctx.gateway.fail_orders.store(true, Ordering::SeqCst);

    let err = ctx
        .state
        .payments
        .create_order(advertiser, booking.booking_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::GatewayTimeout(_)));
    assert!(err.is_retryable());

    let stored = ctx.state.bookings.get(booking.booking_id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Approved);
    assert_eq!(stored.payment_status, PaymentStatus::Pending);
    assert!(stored.gateway_order_id.is_none());
}

#[tokio::test]
async fn verify_marks_paid_and_settles() {
    let ctx = TestContext::new();
    let (billboard, advertiser, booking, order_id) = ctx.ordered_booking().await;

    let outcome = ctx
        .state
        .payments
        .verify(Some(advertiser), verify_request(&order_id, "pay_001"))
        .await
        .unwrap();

    let PaymentOutcome::Paid { booking: paid, split } = outcome else {
        panic!("expected a fresh payment");
    };
    assert_eq!(paid.payment_status, PaymentStatus::Paid);
    assert_eq!(paid.gateway_payment_id.as_deref(), Some("pay_001"));
    assert_eq!(paid.locked_commission_percent, Some(d("15")));
    assert!(paid.paid_utc.is_some());

    assert_eq!(split.booking_id, booking.booking_id);
    assert_eq!(split.owner_amount, d("3000"));
    assert_eq!(split.platform_commission, d("450"));
    assert_eq!(split.gst_amount, d("621"));
    assert_eq!(split.total_amount, d("4071"));
    assert!(split.is_conserved());

    let owner = ctx
        .state
        .wallets
        .wallet(WalletKey::Owner(billboard.owner_id))
        .await
        .unwrap();
    let admin = ctx.state.wallets.wallet(WalletKey::Admin).await.unwrap();
    assert_eq!(owner.balance, d("3000"));
    assert_eq!(admin.balance, d("450"));
}

#[tokio::test]
async fn second_verify_is_a_no_op() {
    let ctx = TestContext::new();
    let (billboard, advertiser, booking, order_id) = ctx.ordered_booking().await;

    ctx.state
        .payments
        .verify(Some(advertiser), verify_request(&order_id, "pay_001"))
        .await
        .unwrap();
    let again = ctx
        .state
        .payments
        .verify(Some(advertiser), verify_request(&order_id, "pay_001"))
        .await
        .unwrap();
    assert!(matches!(again, PaymentOutcome::AlreadyPaid { .. }));

    let txns = ctx
        .state
        .wallets
        .transactions(WalletKey::Owner(billboard.owner_id))
        .await
        .unwrap();
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].reference, format!("BOOKING#{}", booking.booking_id));
}

#[tokio::test]
async fn bad_signature_records_a_failed_payment_that_can_be_retried() {
    let ctx = TestContext::new();
    let (billboard, advertiser, booking, order_id) = ctx.ordered_booking().await;

    let mut forged = verify_request(&order_id, "pay_001");
    forged.signature = MockGateway::sign_payment(&order_id, "pay_other");
    let err = ctx
        .state
        .payments
        .verify(Some(advertiser), forged)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidSignature(_)));

    let failed = ctx.state.bookings.get(booking.booking_id).await.unwrap();
    assert_eq!(failed.status, BookingStatus::Approved);
    assert_eq!(failed.payment_status, PaymentStatus::Failed);
    assert!(ctx
        .state
        .settlement
        .split(booking.booking_id)
        .await
        .unwrap()
        .is_none());

    let outcome = ctx
        .state
        .payments
        .verify(Some(advertiser), verify_request(&order_id, "pay_002"))
        .await
        .unwrap();
    assert_eq!(outcome.booking().payment_status, PaymentStatus::Paid);

    let owner = ctx
        .state
        .wallets
        .wallet(WalletKey::Owner(billboard.owner_id))
        .await
        .unwrap();
    assert_eq!(owner.balance, d("3000"));
}

#[tokio::test]
async fn verify_rejects_other_users_and_unknown_orders() {
    let ctx = TestContext::new();
    let (_, _, _, order_id) = ctx.ordered_booking().await;

    let err = ctx
        .state
        .payments
        .verify(Some(Uuid::new_v4()), verify_request(&order_id, "pay_001"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let err = ctx
        .state
        .payments
        .verify(None, verify_request("order_missing", "pay_001"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn commission_is_locked_at_payment() {
    let ctx = TestContext::new();
    let (_, _, booking) = ctx.paid_booking().await;

    ctx.state
        .settings
        .update(d("25"), d("18"), None)
        .await
        .unwrap();

    let stored = ctx
        .state
        .bookings
        .recalculate_if_unpaid(booking.booking_id)
        .await
        .unwrap();
    assert_eq!(stored.locked_commission_percent, Some(d("15")));
    assert_eq!(stored.commission_amount, d("450"));
    assert_eq!(stored.total_price, d("4071"));

    let split = ctx
        .state
        .settlement
        .split(booking.booking_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(split.platform_commission, d("450"));
}

#[tokio::test]
async fn concurrent_order_requests_settle_through_the_stored_order() {
    let ctx = TestContext::new();
    let (billboard, advertiser, booking) = ctx.approved_booking().await;
    ctx.gateway.gate_orders(2);

    let (first, second) = tokio::join!(
        ctx.state.payments.create_order(advertiser, booking.booking_id),
        ctx.state.payments.create_order(advertiser, booking.booking_id),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(ctx.gateway.orders_created(), 2);
    assert_eq!(first.order_id, second.order_id);
    assert_ne!(first.reused, second.reused);

    let stored = ctx.state.bookings.get(booking.booking_id).await.unwrap();
    assert_eq!(stored.gateway_order_id.as_deref(), Some(first.order_id.as_str()));

    let trail = ctx.state.bookings.audit_trail(booking.booking_id).await.unwrap();
    let orders = trail
        .iter()
        .filter(|e| e.action == AuditAction::OrderCreated)
        .count();
    assert_eq!(orders, 1);

    let outcome = ctx
        .state
        .payments
        .verify(Some(advertiser), verify_request(&second.order_id, "pay_race_1"))
        .await
        .unwrap();
    assert!(matches!(outcome, PaymentOutcome::Paid { .. }));

    let owner = ctx
        .state
        .wallets
        .wallet(WalletKey::Owner(billboard.owner_id))
        .await
        .unwrap();
    assert_eq!(owner.balance, d("3000"));
}
