pub mod availability;
pub mod booking;
pub mod gateway;
pub mod kyc;
pub mod metrics;
pub mod payment;
pub mod pricing;
pub mod razorpay;
pub mod reconciler;
pub mod settings;
pub mod settlement;
pub mod store;
pub mod wallet;

pub use availability::AvailabilityChecker;
pub use booking::BookingService;
pub use gateway::PaymentGateway;
pub use kyc::{HttpKycCheck, KycCheck, StaticKycDirectory};
pub use metrics::{get_metrics, init_metrics};
pub use payment::PaymentService;
pub use razorpay::RazorpayClient;
pub use reconciler::PaymentReconciler;
pub use settings::SettingsProvider;
pub use settlement::SettlementLedger;
pub use store::{MemoryStore, PgStore, Store, UnitOfWork};
pub use wallet::WalletService;
