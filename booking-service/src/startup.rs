//! Application startup and lifecycle management.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use service_core::error::AppError;
use service_core::middleware::tracing::{make_request_span, request_id_middleware};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::BookingConfig;
use crate::handlers;
use crate::services::{
    init_metrics, AvailabilityChecker, BookingService, HttpKycCheck, KycCheck, PaymentGateway,
    PaymentService, PgStore, RazorpayClient, SettingsProvider, SettlementLedger,
    StaticKycDirectory, Store, WalletService,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub settings: Arc<SettingsProvider>,
    pub availability: Arc<AvailabilityChecker>,
    pub bookings: Arc<BookingService>,
    pub payments: Arc<PaymentService>,
    pub settlement: Arc<SettlementLedger>,
    pub wallets: Arc<WalletService>,
}

impl AppState {
    /// Wire every service on top of one store.
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        kyc: Arc<dyn KycCheck>,
        settings_cache_ttl: Duration,
        require_webhook_signature: bool,
    ) -> Self {
        let settings = Arc::new(SettingsProvider::new(store.clone(), settings_cache_ttl));
        Self {
            availability: Arc::new(AvailabilityChecker::new(store.clone())),
            bookings: Arc::new(BookingService::new(store.clone(), settings.clone(), kyc)),
            payments: Arc::new(PaymentService::new(
                store.clone(),
                gateway,
                require_webhook_signature,
            )),
            settlement: Arc::new(SettlementLedger::new(store.clone())),
            wallets: Arc::new(WalletService::new(store.clone())),
            settings,
            store,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::health::metrics))
        .route("/payments/orders", post(handlers::payments::create_order))
        .route("/payments/verify", post(handlers::payments::verify_payment))
        .route("/bookings/:id/refund", post(handlers::payments::refund_booking))
        .route(
            "/webhooks/razorpay",
            post(handlers::webhooks::razorpay_webhook),
        )
        .layer(
            TraceLayer::new_for_http().make_span_with(make_request_span::<axum::body::Body>),
        )
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    sweep_interval: Duration,
}

impl Application {
    /// Build the production application: Postgres store, Razorpay gateway and
    /// the identity service for KYC when one is configured.
    pub async fn build(config: BookingConfig) -> Result<Self, AppError> {
        init_metrics();

        let store = PgStore::connect(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
            config.database.lock_timeout,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;
        store.run_migrations().await?;

        let razorpay = RazorpayClient::new(config.razorpay.clone())?;
        if razorpay.is_configured() {
            tracing::info!("Razorpay client initialized");
        } else {
            tracing::warn!("Razorpay credentials not configured - payment features unavailable");
        }

        let kyc: Arc<dyn KycCheck> = match &config.kyc.service_url {
            Some(url) => Arc::new(HttpKycCheck::new(url.clone(), config.kyc.timeout)?),
            None => {
                tracing::warn!(
                    "KYC_SERVICE_URL not set - using an empty in-process directory, no advertiser is verified"
                );
                Arc::new(StaticKycDirectory::new())
            }
        };

        let state = AppState::new(
            Arc::new(store),
            Arc::new(razorpay),
            kyc,
            config.settings_cache_ttl,
            config.payments.webhook_require_signature,
        );

        Self::build_with(state, &config.common.address(), config.completion_sweep_interval).await
    }

    /// Bind `address` for an already wired state. Tests pass port 0.
    pub async fn build_with(
        state: AppState,
        address: &str,
        sweep_interval: Duration,
    ) -> Result<Self, AppError> {
        let listener = TcpListener::bind(address).await.map_err(|e| {
            tracing::error!(error = %e, addr = %address, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port, "Booking service listener bound");
        Ok(Self {
            port,
            listener,
            state,
            sweep_interval,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve HTTP and run the completion sweep until the server stops.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let sweep = tokio::spawn(completion_sweep(
            self.state.bookings.clone(),
            self.sweep_interval,
        ));

        tracing::info!(
            service = "booking-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.listener, router(self.state)).await;
        sweep.abort();

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

/// Periodically complete APPROVED bookings whose dates have passed.
async fn completion_sweep(bookings: Arc<BookingService>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let today = Utc::now().date_naive();
        if let Err(e) = bookings.complete_elapsed(today).await {
            tracing::warn!(error = %e, "Completion sweep failed");
        }
    }
}
