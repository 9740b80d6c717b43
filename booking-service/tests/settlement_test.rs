//! Settlement ledger: idempotency, conservation and the payout marker.

mod common;

use booking_service::models::WalletKey;
use booking_service::services::settlement::SettleOutcome;
use common::{d, TestContext};
use service_core::error::AppError;

#[tokio::test]
async fn settle_is_idempotent() {
    let ctx = TestContext::new();
    let (billboard, _, booking) = ctx.paid_booking().await;

    for _ in 0..5 {
        let outcome = ctx
            .state
            .settlement
            .settle(booking.booking_id)
            .await
            .unwrap();
        assert!(matches!(outcome, SettleOutcome::Existing(_)));
        assert!(!outcome.is_created());
    }

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
async fn split_conserves_the_total_with_a_discount() {
    let ctx = TestContext::new();
    let (billboard, advertiser, booking) = ctx.approved_booking().await;
    ctx.state
        .bookings
        .apply_discount(billboard.owner_id, booking.booking_id, d("15"))
        .await
        .unwrap();
    let order = ctx
        .state
        .payments
        .create_order(advertiser, booking.booking_id)
        .await
        .unwrap();
    ctx.state
        .payments
        .verify(Some(advertiser), common::verify_request(&order.order_id, "pay_x"))
        .await
        .unwrap();

    let split = ctx
        .state
        .settlement
        .split(booking.booking_id)
        .await
        .unwrap()
        .unwrap();
    // 3000 - 450 = 2550; commission 382.50; GST 18% of 2932.50 = 527.85.
    assert_eq!(split.owner_amount, d("2550"));
    assert_eq!(split.platform_commission, d("382.50"));
    assert_eq!(split.gst_amount, d("527.85"));
    assert_eq!(split.total_amount, d("3460.35"));
    assert!(split.is_conserved());
}

#[tokio::test]
async fn unpaid_booking_cannot_be_settled() {
    let ctx = TestContext::new();
    let (_, _, booking) = ctx.approved_booking().await;

    let err = ctx
        .state
        .settlement
        .settle(booking.booking_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BusinessRule(_)));
    assert!(ctx
        .state
        .settlement
        .split(booking.booking_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn mark_settled_is_idempotent_and_refuses_refunded_splits() {
    let ctx = TestContext::new();
    let (_, _, booking) = ctx.paid_booking().await;

    let split = ctx
        .state
        .settlement
        .mark_settled(booking.booking_id)
        .await
        .unwrap();
    assert!(split.settled);
    let settled_at = split.settled_utc;
    assert!(settled_at.is_some());

    let again = ctx
        .state
        .settlement
        .mark_settled(booking.booking_id)
        .await
        .unwrap();
    assert_eq!(again.settled_utc, settled_at);

    let (_, other_advertiser, refunded) = ctx.paid_booking().await;
    ctx.state
        .payments
        .refund(other_advertiser, refunded.booking_id)
        .await
        .unwrap();
    let err = ctx
        .state
        .settlement
        .mark_settled(refunded.booking_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BusinessRule(_)));
}
