//! Postgres store tests. Need a database:
//!
//! TEST_DATABASE_URL=postgres://... cargo test -p booking-service -- --ignored

mod common;

use std::sync::Arc;
use std::time::Duration;

use booking_service::models::{Billboard, PaymentStatus, WalletKey};
use booking_service::services::booking::CreateBooking;
use booking_service::services::reconciler::WebhookOutcome;
use booking_service::services::{PgStore, StaticKycDirectory, Store};
use booking_service::startup::AppState;
use common::{captured_webhook, d, future_monday, plus_days, verify_request, MockGateway};
use serial_test::serial;
use uuid::Uuid;

async fn pg_state() -> (AppState, Arc<dyn Store>, Arc<StaticKycDirectory>) {
    common::init_tracing();
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    let store = PgStore::connect(&url, 5, 1, Duration::from_secs(5))
        .await
        .expect("Failed to connect to PostgreSQL");
    store.run_migrations().await.expect("Failed to run migrations");

    let store: Arc<dyn Store> = Arc::new(store);
    let kyc = Arc::new(StaticKycDirectory::new());
    let state = AppState::new(
        store.clone(),
        Arc::new(MockGateway::default()),
        kyc.clone(),
        Duration::from_secs(0),
        false,
    );
    (state, store, kyc)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
#[serial]
async fn postgres_verify_and_webhook_settle_once() {
    let (state, store, kyc) = pg_state().await;

    let billboard = Billboard::new(Uuid::new_v4(), d("1000"));
    let mut uow = store.begin().await.unwrap();
    uow.upsert_billboard(&billboard).await.unwrap();
    uow.commit().await.unwrap();

    let advertiser = Uuid::new_v4();
    kyc.approve(advertiser).await;
    let start = future_monday(1);
    let booking = state
        .bookings
        .create(
            advertiser,
            CreateBooking {
                billboard_id: billboard.billboard_id,
                start_date: start,
                end_date: plus_days(start, 2),
            },
        )
        .await
        .unwrap();
    state
        .bookings
        .approve(billboard.owner_id, booking.booking_id)
        .await
        .unwrap();
    let order = state
        .payments
        .create_order(advertiser, booking.booking_id)
        .await
        .unwrap();

    let body = captured_webhook(&order.order_id, "pay_pg", order.amount_minor);
    let signature = MockGateway::sign_webhook(&body);
    let verify = {
        let payments = state.payments.clone();
        let request = verify_request(&order.order_id, "pay_pg");
        tokio::spawn(async move { payments.verify(Some(advertiser), request).await })
    };
    let webhook = {
        let payments = state.payments.clone();
        tokio::spawn(async move { payments.handle_webhook(&body, Some(&signature)).await })
    };
    let verify = verify.await.unwrap();
    let webhook = webhook.await.unwrap();

    // A loser that timed out on the row lock is fine; it must not have settled.
    let settled = usize::from(matches!(
        verify,
        Ok(booking_service::services::reconciler::PaymentOutcome::Paid { .. })
    )) + usize::from(matches!(webhook, Ok(WebhookOutcome::Settled { .. })));
    assert_eq!(settled, 1);

    let paid = state.bookings.get(booking.booking_id).await.unwrap();
    assert_eq!(paid.payment_status, PaymentStatus::Paid);

    let owner_txns = state
        .wallets
        .transactions(WalletKey::Owner(billboard.owner_id))
        .await
        .unwrap();
    assert_eq!(owner_txns.len(), 1);
    assert!(state
        .wallets
        .ledger_consistent(WalletKey::Owner(billboard.owner_id))
        .await
        .unwrap());
}

#[tokio::test]
#[ignore]
#[serial]
async fn postgres_settings_round_trip() {
    let (state, _, _) = pg_state().await;

    let updated = state
        .settings
        .update(d("12.5"), d("18"), Some("INR".to_string()))
        .await
        .unwrap();
    let read = state.settings.get_fresh().await.unwrap();
    assert_eq!(read.commission_percent, updated.commission_percent);

    state
        .settings
        .update(d("15"), d("18"), None)
        .await
        .unwrap();
}
