//! Refunds and settlement reversal, including the shortfall path.

mod common;

use booking_service::models::{BookingStatus, PaymentStatus, RefundStatus, WalletKey};
use booking_service::services::reconciler::WebhookOutcome;
use common::{d, MockGateway, TestContext};
use service_core::error::AppError;
use std::sync::atomic::Ordering;
use uuid::Uuid;

#[tokio::test]
async fn refund_reverses_both_credits() {
    let ctx = TestContext::new();
    let (billboard, advertiser, booking) = ctx.paid_booking().await;

    let result = ctx
        .state
        .payments
        .refund(advertiser, booking.booking_id)
        .await
        .unwrap();
    assert!(!result.already_refunded);
    assert_eq!(result.booking.status, BookingStatus::Cancelled);
    assert_eq!(result.booking.payment_status, PaymentStatus::Refunded);
    let reversal = result.reversal.unwrap();
    assert!(reversal.owner_debited);
    assert!(reversal.admin_debited);
    assert!(reversal.shortfalls.is_empty());

    let owner_key = WalletKey::Owner(billboard.owner_id);
    let owner = ctx.state.wallets.wallet(owner_key).await.unwrap();
    let admin = ctx.state.wallets.wallet(WalletKey::Admin).await.unwrap();
    assert_eq!(owner.balance, d("0"));
    assert_eq!(owner.total_earned, d("0"));
    assert_eq!(admin.balance, d("0"));

    let txns = ctx.state.wallets.transactions(owner_key).await.unwrap();
    assert_eq!(txns.len(), 2);
    assert_eq!(txns[1].reference, format!("REFUND#BOOKING#{}", booking.booking_id));
    assert!(ctx.state.wallets.ledger_consistent(owner_key).await.unwrap());
    assert!(ctx.state.wallets.ledger_consistent(WalletKey::Admin).await.unwrap());

    let split = ctx
        .state
        .settlement
        .split(booking.booking_id)
        .await
        .unwrap()
        .unwrap();
    assert!(split.refunded);
    assert!(split.refunded_utc.is_some());

    let mut uow = ctx.store.begin().await.unwrap();
    let payment_id = result.booking.gateway_payment_id.clone().unwrap();
    let record = uow.payment_record(&payment_id).await.unwrap().unwrap();
    assert_eq!(record.refund_status, Some(RefundStatus::Refunded));
    assert_eq!(record.refund_id, result.refund_id);
}

#[tokio::test]
async fn refunding_twice_calls_the_gateway_once() {
    let ctx = TestContext::new();
    let (_, advertiser, booking) = ctx.paid_booking().await;

    ctx.state
        .payments
        .refund(advertiser, booking.booking_id)
        .await
        .unwrap();
    let again = ctx
        .state
        .payments
        .refund(advertiser, booking.booking_id)
        .await
        .unwrap();

    assert!(again.already_refunded);
    assert_eq!(ctx.gateway.refunds(), 1);
}

#[tokio::test]
async fn refund_shortfall_is_recorded_when_owner_already_withdrew() {
    let ctx = TestContext::new();
    let (billboard, advertiser, booking) = ctx.paid_booking().await;
    let owner_key = WalletKey::Owner(billboard.owner_id);

    ctx.state
        .wallets
        .request_payout(owner_key, d("3000"))
        .await
        .unwrap();
    let drained = ctx
        .state
        .wallets
        .complete_payout(owner_key, d("3000"), "UTR0001")
        .await
        .unwrap();
    assert_eq!(drained.balance, d("0"));

    let result = ctx
        .state
        .payments
        .refund(advertiser, booking.booking_id)
        .await
        .unwrap();
    assert_eq!(result.booking.payment_status, PaymentStatus::Refunded);

    let reversal = result.reversal.unwrap();
    assert!(!reversal.owner_debited);
    assert!(reversal.admin_debited);
    assert_eq!(reversal.shortfalls.len(), 1);

    let admin = ctx.state.wallets.wallet(WalletKey::Admin).await.unwrap();
    assert_eq!(admin.balance, d("0"));
    let owner = ctx.state.wallets.wallet(owner_key).await.unwrap();
    assert_eq!(owner.balance, d("0"));

    let shortfalls = ctx.state.settlement.open_shortfalls().await.unwrap();
    assert_eq!(shortfalls.len(), 1);
    assert_eq!(shortfalls[0].booking_id, booking.booking_id);
    assert_eq!(shortfalls[0].wallet_key, owner_key.as_key());
    assert_eq!(shortfalls[0].expected_amount, d("3000"));
    assert_eq!(shortfalls[0].available_balance, d("0"));
    assert!(!shortfalls[0].resolved);
}

#[tokio::test]
async fn refund_does_not_consume_funds_reserved_for_a_payout() {
    let ctx = TestContext::new();
    let (billboard, advertiser, booking) = ctx.paid_booking().await;
    let owner_key = WalletKey::Owner(billboard.owner_id);

    ctx.state
        .wallets
        .request_payout(owner_key, d("3000"))
        .await
        .unwrap();

    let result = ctx
        .state
        .payments
        .refund(advertiser, booking.booking_id)
        .await
        .unwrap();
    assert_eq!(result.booking.payment_status, PaymentStatus::Refunded);

    let reversal = result.reversal.unwrap();
    assert!(!reversal.owner_debited);
    assert!(reversal.admin_debited);
    assert_eq!(reversal.shortfalls.len(), 1);

    let owner = ctx.state.wallets.wallet(owner_key).await.unwrap();
    assert_eq!(owner.balance, d("3000"));
    assert_eq!(owner.pending_withdrawal, d("3000"));

    let shortfalls = ctx.state.settlement.open_shortfalls().await.unwrap();
    assert_eq!(shortfalls.len(), 1);
    assert_eq!(shortfalls[0].wallet_key, owner_key.as_key());
    assert_eq!(shortfalls[0].expected_amount, d("3000"));
    assert_eq!(shortfalls[0].available_balance, d("0"));

    let paid_out = ctx
        .state
        .wallets
        .complete_payout(owner_key, d("3000"), "UTR0002")
        .await
        .unwrap();
    assert_eq!(paid_out.balance, d("0"));
    assert_eq!(paid_out.pending_withdrawal, d("0"));
    assert!(ctx.state.wallets.ledger_consistent(owner_key).await.unwrap());
}

#[tokio::test]
async fn refund_needs_a_paid_booking_and_its_advertiser() {
    let ctx = TestContext::new();
    let (_, advertiser, booking) = ctx.approved_booking().await;

    let err = ctx
        .state
        .payments
        .refund(advertiser, booking.booking_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BusinessRule(_)));

    let (_, _, paid) = ctx.paid_booking().await;
    let err = ctx
        .state
        .payments
        .refund(Uuid::new_v4(), paid.booking_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
    assert_eq!(ctx.gateway.refunds(), 0);
}

#[tokio::test]
async fn gateway_refund_failure_leaves_the_booking_paid() {
    let ctx = TestContext::new();
    let (billboard, advertiser, booking) = ctx.paid_booking().await;
    ctx.gateway.fail_refunds.store(true, Ordering::SeqCst);

    let err = ctx
        .state
        .payments
        .refund(advertiser, booking.booking_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadGateway(_)));

    let stored = ctx.state.bookings.get(booking.booking_id).await.unwrap();
    assert_eq!(stored.payment_status, PaymentStatus::Paid);
    let owner = ctx
        .state
        .wallets
        .wallet(WalletKey::Owner(billboard.owner_id))
        .await
        .unwrap();
    assert_eq!(owner.balance, d("3000"));
}

#[tokio::test]
async fn cancelled_without_refund_can_still_be_refunded() {
    let ctx = TestContext::new();
    let (_, advertiser, booking) = ctx.paid_booking().await;
    ctx.state
        .bookings
        .cancel_after_payment(advertiser, booking.booking_id)
        .await
        .unwrap();

    let result = ctx
        .state
        .payments
        .refund(advertiser, booking.booking_id)
        .await
        .unwrap();
    assert_eq!(result.booking.status, BookingStatus::Cancelled);
    assert_eq!(result.booking.payment_status, PaymentStatus::Refunded);
}

#[tokio::test]
async fn refund_webhook_updates_the_payment_record() {
    let ctx = TestContext::new();
    let (_, _, booking) = ctx.paid_booking().await;
    let payment_id = booking.gateway_payment_id.clone().unwrap();

    let body = serde_json::json!({
        "event": "refund.processed",
        "payload": {
            "refund": {
                "entity": {
                    "id": "rfnd_external",
                    "payment_id": payment_id,
                    "status": "processed"
                }
            }
        }
    })
    .to_string()
    .into_bytes();

    let outcome = ctx
        .state
        .payments
        .handle_webhook(&body, Some(&MockGateway::sign_webhook(&body)))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::RefundRecorded {
            payment_id: payment_id.clone()
        }
    );

    let mut uow = ctx.store.begin().await.unwrap();
    let record = uow.payment_record(&payment_id).await.unwrap().unwrap();
    assert_eq!(record.refund_id.as_deref(), Some("rfnd_external"));
    assert_eq!(record.refund_status, Some(RefundStatus::Refunded));
}
