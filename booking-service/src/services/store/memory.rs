//! In-process store. A unit of work holds the whole-state lock and edits a
//! private copy that replaces the shared state on commit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use service_core::error::AppError;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, UnitOfWork};
use crate::models::{
    AuditEntry, Billboard, Booking, BookingStatus, PaymentRecord, PaymentSplit, PlatformSettings,
    RefundShortfall, Wallet, WalletKey, WalletTransaction,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    billboards: HashMap<Uuid, Billboard>,
    bookings: HashMap<Uuid, Booking>,
    splits: HashMap<Uuid, PaymentSplit>,
    wallets: HashMap<String, Wallet>,
    wallet_transactions: Vec<WalletTransaction>,
    settings: Option<PlatformSettings>,
    payment_records: HashMap<String, PaymentRecord>,
    audit: Vec<AuditEntry>,
    shortfalls: Vec<RefundShortfall>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, AppError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork { guard, working }))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

fn not_found(what: &str, id: impl std::fmt::Display) -> AppError {
    AppError::NotFound(anyhow::anyhow!("{} {} not found", what, id))
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn billboard(&mut self, billboard_id: Uuid) -> Result<Option<Billboard>, AppError> {
        Ok(self.working.billboards.get(&billboard_id).cloned())
    }

    async fn lock_billboard(&mut self, billboard_id: Uuid) -> Result<Option<Billboard>, AppError> {
        self.billboard(billboard_id).await
    }

    async fn upsert_billboard(&mut self, billboard: &Billboard) -> Result<(), AppError> {
        self.working
            .billboards
            .insert(billboard.billboard_id, billboard.clone());
        Ok(())
    }

    async fn booking(&mut self, booking_id: Uuid) -> Result<Option<Booking>, AppError> {
        Ok(self.working.bookings.get(&booking_id).cloned())
    }

    async fn lock_booking(&mut self, booking_id: Uuid) -> Result<Option<Booking>, AppError> {
        self.booking(booking_id).await
    }

    async fn lock_booking_by_order(
        &mut self,
        order_id: &str,
    ) -> Result<Option<Booking>, AppError> {
        Ok(self
            .working
            .bookings
            .values()
            .find(|b| b.gateway_order_id.as_deref() == Some(order_id))
            .cloned())
    }

    async fn insert_booking(&mut self, booking: &Booking) -> Result<(), AppError> {
        if self.working.bookings.contains_key(&booking.booking_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Booking {} already exists",
                booking.booking_id
            )));
        }
        self.working
            .bookings
            .insert(booking.booking_id, booking.clone());
        Ok(())
    }

    async fn update_booking(&mut self, booking: &Booking) -> Result<(), AppError> {
        if let Some(order_id) = booking.gateway_order_id.as_deref() {
            let taken = self.working.bookings.values().any(|b| {
                b.booking_id != booking.booking_id
                    && b.gateway_order_id.as_deref() == Some(order_id)
            });
            if taken {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Order {} already belongs to another booking",
                    order_id
                )));
            }
        }
        match self.working.bookings.get_mut(&booking.booking_id) {
            Some(slot) => {
                *slot = booking.clone();
                Ok(())
            }
            None => Err(not_found("Booking", booking.booking_id)),
        }
    }

    async fn overlapping_bookings(
        &mut self,
        billboard_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, AppError> {
        let mut found: Vec<Booking> = self
            .working
            .bookings
            .values()
            .filter(|b| {
                b.billboard_id == billboard_id
                    && statuses.contains(&b.status)
                    && b.overlaps(start, end)
            })
            .cloned()
            .collect();
        found.sort_by_key(|b| (b.start_date, b.created_utc));
        Ok(found)
    }

    async fn elapsed_bookings(&mut self, today: NaiveDate) -> Result<Vec<Uuid>, AppError> {
        Ok(self
            .working
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Approved && b.has_ended(today))
            .map(|b| b.booking_id)
            .collect())
    }

    async fn split_for_booking(
        &mut self,
        booking_id: Uuid,
    ) -> Result<Option<PaymentSplit>, AppError> {
        Ok(self.working.splits.get(&booking_id).cloned())
    }

    async fn insert_split(&mut self, split: &PaymentSplit) -> Result<(), AppError> {
        if self.working.splits.contains_key(&split.booking_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment split already exists for booking {}",
                split.booking_id
            )));
        }
        self.working.splits.insert(split.booking_id, split.clone());
        Ok(())
    }

    async fn update_split(&mut self, split: &PaymentSplit) -> Result<(), AppError> {
        match self.working.splits.get_mut(&split.booking_id) {
            Some(slot) => {
                *slot = split.clone();
                Ok(())
            }
            None => Err(not_found("Payment split for booking", split.booking_id)),
        }
    }

    async fn lock_wallet(&mut self, key: WalletKey) -> Result<Wallet, AppError> {
        Ok(self
            .working
            .wallets
            .entry(key.as_key())
            .or_insert_with(|| Wallet::empty(key))
            .clone())
    }

    async fn update_wallet(&mut self, wallet: &Wallet) -> Result<(), AppError> {
        if wallet.balance < rust_decimal::Decimal::ZERO {
            return Err(AppError::InsufficientFunds(format!(
                "wallet {} would go negative",
                wallet.wallet_key
            )));
        }
        self.working
            .wallets
            .insert(wallet.wallet_key.clone(), wallet.clone());
        Ok(())
    }

    async fn append_wallet_transaction(
        &mut self,
        txn: &WalletTransaction,
    ) -> Result<(), AppError> {
        let duplicate = self
            .working
            .wallet_transactions
            .iter()
            .any(|t| t.wallet_key == txn.wallet_key && t.reference == txn.reference);
        if duplicate {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Wallet {} already has a transaction with reference {}",
                txn.wallet_key,
                txn.reference
            )));
        }
        self.working.wallet_transactions.push(txn.clone());
        Ok(())
    }

    async fn wallet_transactions(
        &mut self,
        key: WalletKey,
    ) -> Result<Vec<WalletTransaction>, AppError> {
        let key = key.as_key();
        Ok(self
            .working
            .wallet_transactions
            .iter()
            .filter(|t| t.wallet_key == key)
            .cloned()
            .collect())
    }

    async fn settings(&mut self) -> Result<PlatformSettings, AppError> {
        Ok(self
            .working
            .settings
            .get_or_insert_with(PlatformSettings::default)
            .clone())
    }

    async fn save_settings(&mut self, settings: &PlatformSettings) -> Result<(), AppError> {
        self.working.settings = Some(settings.clone());
        Ok(())
    }

    async fn payment_record(
        &mut self,
        payment_id: &str,
    ) -> Result<Option<PaymentRecord>, AppError> {
        Ok(self.working.payment_records.get(payment_id).cloned())
    }

    async fn insert_payment_record(&mut self, record: &PaymentRecord) -> Result<(), AppError> {
        if self
            .working
            .payment_records
            .contains_key(&record.gateway_payment_id)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment {} already recorded",
                record.gateway_payment_id
            )));
        }
        self.working
            .payment_records
            .insert(record.gateway_payment_id.clone(), record.clone());
        Ok(())
    }

    async fn update_payment_record(&mut self, record: &PaymentRecord) -> Result<(), AppError> {
        match self
            .working
            .payment_records
            .get_mut(&record.gateway_payment_id)
        {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(not_found("Payment", &record.gateway_payment_id)),
        }
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), AppError> {
        self.working.audit.push(entry.clone());
        Ok(())
    }

    async fn audit_trail(&mut self, booking_id: Uuid) -> Result<Vec<AuditEntry>, AppError> {
        Ok(self
            .working
            .audit
            .iter()
            .filter(|e| e.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn insert_shortfall(&mut self, shortfall: &RefundShortfall) -> Result<(), AppError> {
        self.working.shortfalls.push(shortfall.clone());
        Ok(())
    }

    async fn open_shortfalls(&mut self) -> Result<Vec<RefundShortfall>, AppError> {
        Ok(self
            .working
            .shortfalls
            .iter()
            .filter(|s| !s.resolved)
            .cloned()
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let MemoryUnitOfWork { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn dropped_unit_discards_writes() {
        let store = MemoryStore::new();
        let billboard = Billboard::new(Uuid::new_v4(), Decimal::from(500));

        {
            let mut uow = store.begin().await.unwrap();
            uow.upsert_billboard(&billboard).await.unwrap();
        }

        let mut uow = store.begin().await.unwrap();
        assert!(uow.billboard(billboard.billboard_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn committed_unit_is_visible() {
        let store = MemoryStore::new();
        let billboard = Billboard::new(Uuid::new_v4(), Decimal::from(500));

        let mut uow = store.begin().await.unwrap();
        uow.upsert_billboard(&billboard).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        assert!(uow.billboard(billboard.billboard_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_wallet_reference_rejected() {
        let store = MemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        let mut wallet = uow.lock_wallet(WalletKey::Admin).await.unwrap();
        wallet.credit(Decimal::from(10)).unwrap();

        let txn = WalletTransaction::new(
            &wallet,
            crate::models::TxnDirection::Credit,
            Decimal::from(10),
            "COMMISSION#BOOKING#1",
            None,
        );
        uow.append_wallet_transaction(&txn).await.unwrap();
        let mut again = txn.clone();
        again.transaction_id = Uuid::new_v4();
        assert!(matches!(
            uow.append_wallet_transaction(&again).await,
            Err(AppError::Conflict(_))
        ));
    }
}
