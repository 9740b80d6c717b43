//! Common test utilities for booking-service integration tests.
#![allow(dead_code)]

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use booking_service::models::{Billboard, Booking};
use booking_service::services::booking::CreateBooking;
use booking_service::services::gateway::{GatewayOrder, GatewayRefund, PaymentGateway};
use booking_service::services::reconciler::VerifyPayment;
use booking_service::services::{MemoryStore, StaticKycDirectory, Store};
use booking_service::startup::{AppState, Application};
use chrono::{Datelike, Days, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::utils::{hmac_sha256_hex, verify_hmac_sha256_hex};
use tokio::sync::Barrier;
use uuid::Uuid;

pub const KEY_SECRET: &str = "test_key_secret";
pub const WEBHOOK_SECRET: &str = "test_webhook_secret";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,booking_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// A Monday at least a week away, so bookings never start in the past and
/// weekday pricing applies.
pub fn future_monday(weeks_ahead: u64) -> NaiveDate {
    let today = Utc::now().date_naive();
    let to_monday = 7 - u64::from(today.weekday().num_days_from_monday());
    today
        .checked_add_days(Days::new(to_monday + 7 * weeks_ahead))
        .unwrap()
}

pub fn plus_days(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_add_days(Days::new(days)).unwrap()
}

/// Gateway double that signs and verifies exactly like Razorpay and counts calls.
#[derive(Default)]
pub struct MockGateway {
    pub orders_created: AtomicUsize,
    pub refunds: AtomicUsize,
    pub fail_orders: AtomicBool,
    pub fail_refunds: AtomicBool,
    /// When set, `create_order` waits here so concurrent callers overlap.
    order_gate: Mutex<Option<Arc<Barrier>>>,
}

impl MockGateway {
    pub fn sign_payment(order_id: &str, payment_id: &str) -> String {
        hmac_sha256_hex(KEY_SECRET, format!("{}|{}", order_id, payment_id).as_bytes()).unwrap()
    }

    pub fn sign_webhook(body: &[u8]) -> String {
        hmac_sha256_hex(WEBHOOK_SECRET, body).unwrap()
    }

    /// Hold every `create_order` call until `callers` of them are in flight.
    pub fn gate_orders(&self, callers: usize) {
        *self.order_gate.lock().unwrap() = Some(Arc::new(Barrier::new(callers)));
    }

    pub fn orders_created(&self) -> usize {
        self.orders_created.load(Ordering::SeqCst)
    }

    pub fn refunds(&self) -> usize {
        self.refunds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        _receipt: &str,
    ) -> Result<GatewayOrder, AppError> {
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(AppError::GatewayTimeout("create_order timed out".to_string()));
        }
        let gate = self.order_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        let n = self.orders_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(GatewayOrder {
            order_id: format!("order_test_{}_{}", n, Uuid::new_v4().simple()),
            amount_minor,
            currency: currency.to_string(),
        })
    }

    async fn refund(&self, payment_id: &str, _receipt: &str) -> Result<GatewayRefund, AppError> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(AppError::BadGateway("refund failed".to_string()));
        }
        self.refunds.fetch_add(1, Ordering::SeqCst);
        Ok(GatewayRefund {
            refund_id: format!("rfnd_{}", payment_id),
            status: "processed".to_string(),
        })
    }

    fn verify_payment_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        verify_hmac_sha256_hex(
            KEY_SECRET,
            format!("{}|{}", order_id, payment_id).as_bytes(),
            signature,
        )
        .unwrap_or(false)
    }

    fn verify_webhook_signature(&self, body: &[u8], signature: &str) -> bool {
        verify_hmac_sha256_hex(WEBHOOK_SECRET, body, signature).unwrap_or(false)
    }

    fn public_key_id(&self) -> Option<String> {
        Some("rzp_test_key".to_string())
    }
}

/// Services wired on an in-memory store, a mock gateway and a KYC directory.
pub struct TestContext {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<MockGateway>,
    pub kyc: Arc<StaticKycDirectory>,
    pub state: AppState,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_webhook_policy(false)
    }

    pub fn with_webhook_policy(require_webhook_signature: bool) -> Self {
        init_tracing();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::default());
        let kyc = Arc::new(StaticKycDirectory::new());
        let state = AppState::new(
            store.clone(),
            gateway.clone(),
            kyc.clone(),
            Duration::from_secs(60),
            require_webhook_signature,
        );
        Self {
            store,
            gateway,
            kyc,
            state,
        }
    }

    pub async fn seed_billboard(&self, price_per_day: &str) -> Billboard {
        let billboard = Billboard::new(Uuid::new_v4(), d(price_per_day));
        let mut uow = self.store.begin().await.unwrap();
        uow.upsert_billboard(&billboard).await.unwrap();
        uow.commit().await.unwrap();
        billboard
    }

    /// A new advertiser whose KYC is approved.
    pub async fn advertiser(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.kyc.approve(id).await;
        id
    }

    pub async fn create_booking(
        &self,
        advertiser: Uuid,
        billboard: &Billboard,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Booking, AppError> {
        self.state
            .bookings
            .create(
                advertiser,
                CreateBooking {
                    billboard_id: billboard.billboard_id,
                    start_date: start,
                    end_date: end,
                },
            )
            .await
    }

    /// A three-weekday booking at 1000/day (total 4071 on default settings), approved.
    pub async fn approved_booking(&self) -> (Billboard, Uuid, Booking) {
        let billboard = self.seed_billboard("1000").await;
        let advertiser = self.advertiser().await;
        let start = future_monday(1);
        let booking = self
            .create_booking(advertiser, &billboard, start, plus_days(start, 2))
            .await
            .unwrap();
        let booking = self
            .state
            .bookings
            .approve(billboard.owner_id, booking.booking_id)
            .await
            .unwrap();
        (billboard, advertiser, booking)
    }

    /// Approved booking with a live order. Returns the order id.
    pub async fn ordered_booking(&self) -> (Billboard, Uuid, Booking, String) {
        let (billboard, advertiser, booking) = self.approved_booking().await;
        let order = self
            .state
            .payments
            .create_order(advertiser, booking.booking_id)
            .await
            .unwrap();
        let booking = self.state.bookings.get(booking.booking_id).await.unwrap();
        (billboard, advertiser, booking, order.order_id)
    }

    /// Approved booking paid through the verify path.
    pub async fn paid_booking(&self) -> (Billboard, Uuid, Booking) {
        let (billboard, advertiser, _, order_id) = self.ordered_booking().await;
        let payment_id = format!("pay_{}", Uuid::new_v4().simple());
        let outcome = self
            .state
            .payments
            .verify(Some(advertiser), verify_request(&order_id, &payment_id))
            .await
            .unwrap();
        (billboard, advertiser, outcome.booking().clone())
    }
}

pub fn verify_request(order_id: &str, payment_id: &str) -> VerifyPayment {
    VerifyPayment {
        order_id: order_id.to_string(),
        payment_id: payment_id.to_string(),
        signature: MockGateway::sign_payment(order_id, payment_id),
    }
}

/// Razorpay-shaped `payment.captured` body.
pub fn captured_webhook(order_id: &str, payment_id: &str, amount_minor: i64) -> Vec<u8> {
    serde_json::json!({
        "entity": "event",
        "event": "payment.captured",
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "amount": amount_minor,
                    "currency": "INR",
                    "status": "captured",
                    "order_id": order_id
                }
            }
        }
    })
    .to_string()
    .into_bytes()
}

pub fn failed_webhook(order_id: &str, payment_id: &str) -> Vec<u8> {
    serde_json::json!({
        "event": "payment.failed",
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "amount": 0,
                    "status": "failed",
                    "order_id": order_id,
                    "error_description": "Card declined"
                }
            }
        }
    })
    .to_string()
    .into_bytes()
}

/// Spawn the HTTP application for `ctx` on a random port.
pub async fn spawn_app(ctx: &TestContext) -> String {
    let app = Application::build_with(
        ctx.state.clone(),
        "127.0.0.1:0",
        Duration::from_secs(3600),
    )
    .await
    .expect("Failed to build application");
    let address = format!("http://127.0.0.1:{}", app.port());
    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });
    address
}
