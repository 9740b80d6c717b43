//! Storage abstraction. Every read and write happens inside a [`UnitOfWork`];
//! dropping one without calling [`UnitOfWork::commit`] discards its writes.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::NaiveDate;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    AuditEntry, Billboard, Booking, BookingStatus, PaymentRecord, PaymentSplit, PlatformSettings,
    RefundShortfall, Wallet, WalletKey, WalletTransaction,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

/// One atomic unit of work. `lock_*` methods additionally serialize concurrent
/// units on the same row until commit or drop.
#[async_trait]
pub trait UnitOfWork: Send {
    // Billboards
    async fn billboard(&mut self, billboard_id: Uuid) -> Result<Option<Billboard>, AppError>;
    /// Serializes booking creation per billboard.
    async fn lock_billboard(&mut self, billboard_id: Uuid) -> Result<Option<Billboard>, AppError>;
    async fn upsert_billboard(&mut self, billboard: &Billboard) -> Result<(), AppError>;

    // Bookings
    async fn booking(&mut self, booking_id: Uuid) -> Result<Option<Booking>, AppError>;
    async fn lock_booking(&mut self, booking_id: Uuid) -> Result<Option<Booking>, AppError>;
    async fn lock_booking_by_order(&mut self, order_id: &str)
    -> Result<Option<Booking>, AppError>;
    async fn insert_booking(&mut self, booking: &Booking) -> Result<(), AppError>;
    async fn update_booking(&mut self, booking: &Booking) -> Result<(), AppError>;
    /// Bookings on `billboard_id` in one of `statuses` whose range overlaps `[start, end]`.
    async fn overlapping_bookings(
        &mut self,
        billboard_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, AppError>;
    /// APPROVED bookings whose end date is before `today`.
    async fn elapsed_bookings(&mut self, today: NaiveDate) -> Result<Vec<Uuid>, AppError>;

    // Settlement
    async fn split_for_booking(&mut self, booking_id: Uuid)
    -> Result<Option<PaymentSplit>, AppError>;
    /// Fails with `Conflict` when a split already exists for the booking.
    async fn insert_split(&mut self, split: &PaymentSplit) -> Result<(), AppError>;
    async fn update_split(&mut self, split: &PaymentSplit) -> Result<(), AppError>;

    // Wallets
    /// Get-or-create, locked for the rest of the unit.
    async fn lock_wallet(&mut self, key: WalletKey) -> Result<Wallet, AppError>;
    async fn update_wallet(&mut self, wallet: &Wallet) -> Result<(), AppError>;
    async fn append_wallet_transaction(&mut self, txn: &WalletTransaction)
    -> Result<(), AppError>;
    /// Ledger entries in creation order.
    async fn wallet_transactions(&mut self, key: WalletKey)
    -> Result<Vec<WalletTransaction>, AppError>;

    // Settings
    /// The stored settings, creating the defaults on first read.
    async fn settings(&mut self) -> Result<PlatformSettings, AppError>;
    async fn save_settings(&mut self, settings: &PlatformSettings) -> Result<(), AppError>;

    // Payment records
    async fn payment_record(&mut self, payment_id: &str)
    -> Result<Option<PaymentRecord>, AppError>;
    async fn insert_payment_record(&mut self, record: &PaymentRecord) -> Result<(), AppError>;
    async fn update_payment_record(&mut self, record: &PaymentRecord) -> Result<(), AppError>;

    // Audit and reconciliation
    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), AppError>;
    async fn audit_trail(&mut self, booking_id: Uuid) -> Result<Vec<AuditEntry>, AppError>;
    async fn insert_shortfall(&mut self, shortfall: &RefundShortfall) -> Result<(), AppError>;
    async fn open_shortfalls(&mut self) -> Result<Vec<RefundShortfall>, AppError>;

    async fn commit(self: Box<Self>) -> Result<(), AppError>;
}
