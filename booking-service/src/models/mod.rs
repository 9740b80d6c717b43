//! Domain models for booking-service.

mod audit;
mod billboard;
mod booking;
mod payment_record;
mod payment_split;
mod settings;
mod shortfall;
mod wallet;

pub use audit::{AuditAction, AuditEntry};
pub use billboard::Billboard;
pub use booking::{is_consistent, next_state, Booking, BookingStatus, PaymentStatus, Transition};
pub use payment_record::{PaymentRecord, PaymentSource, RefundStatus};
pub use payment_split::PaymentSplit;
pub use settings::PlatformSettings;
pub use shortfall::RefundShortfall;
pub use wallet::{replay_matches, TxnDirection, Wallet, WalletKey, WalletTransaction};
