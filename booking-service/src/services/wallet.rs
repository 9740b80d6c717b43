//! Wallet reads and owner payouts.
//!
//! A payout is reserved first (`pending_withdrawal`), then either completed,
//! which debits the wallet, or cancelled, which releases the reservation.

use std::sync::Arc;

use rust_decimal::Decimal;
use service_core::error::AppError;
use tracing::{info, instrument, warn};

use crate::models::{replay_matches, TxnDirection, Wallet, WalletKey, WalletTransaction};
use crate::services::store::Store;

/// Smallest payout an owner can request, in currency units.
pub const MIN_PAYOUT: Decimal = Decimal::ONE_HUNDRED;

pub fn payout_reference(reference: &str) -> String {
    format!("PAYOUT#{}", reference)
}

pub struct WalletService {
    store: Arc<dyn Store>,
}

impl WalletService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn wallet(&self, key: WalletKey) -> Result<Wallet, AppError> {
        let mut uow = self.store.begin().await?;
        let wallet = uow.lock_wallet(key).await?;
        // Creating an empty wallet on first read is harmless to persist.
        uow.commit().await?;
        Ok(wallet)
    }

    pub async fn transactions(&self, key: WalletKey) -> Result<Vec<WalletTransaction>, AppError> {
        let mut uow = self.store.begin().await?;
        uow.wallet_transactions(key).await
    }

    /// Reserve `amount` for a payout.
    #[instrument(skip(self), fields(wallet = %key))]
    pub async fn request_payout(
        &self,
        key: WalletKey,
        amount: Decimal,
    ) -> Result<Wallet, AppError> {
        if amount < MIN_PAYOUT {
            return Err(AppError::business(format!(
                "Minimum payout is {}, requested {}",
                MIN_PAYOUT, amount
            )));
        }

        let mut uow = self.store.begin().await?;
        let mut wallet = uow.lock_wallet(key).await?;
        wallet.reserve(amount)?;
        uow.update_wallet(&wallet).await?;
        uow.commit().await?;

        info!(amount = %amount, pending = %wallet.pending_withdrawal, "Payout requested");
        Ok(wallet)
    }

    /// Pay out a reserved amount. `reference` identifies the bank transfer
    /// and may only be used once per wallet.
    #[instrument(skip(self), fields(wallet = %key))]
    pub async fn complete_payout(
        &self,
        key: WalletKey,
        amount: Decimal,
        reference: &str,
    ) -> Result<Wallet, AppError> {
        let mut uow = self.store.begin().await?;
        let mut wallet = uow.lock_wallet(key).await?;
        wallet.release(amount)?;
        wallet.debit(amount)?;

        let txn = WalletTransaction::new(
            &wallet,
            TxnDirection::Debit,
            amount,
            payout_reference(reference),
            None,
        );
        uow.update_wallet(&wallet).await?;
        uow.append_wallet_transaction(&txn).await?;
        uow.commit().await?;

        info!(amount = %amount, reference, balance = %wallet.balance, "Payout completed");
        Ok(wallet)
    }

    #[instrument(skip(self), fields(wallet = %key))]
    pub async fn cancel_payout(&self, key: WalletKey, amount: Decimal) -> Result<Wallet, AppError> {
        let mut uow = self.store.begin().await?;
        let mut wallet = uow.lock_wallet(key).await?;
        wallet.release(amount)?;
        uow.update_wallet(&wallet).await?;
        uow.commit().await?;

        info!(amount = %amount, "Payout cancelled");
        Ok(wallet)
    }

    /// Replay the ledger and compare it with the stored balance.
    pub async fn ledger_consistent(&self, key: WalletKey) -> Result<bool, AppError> {
        let mut uow = self.store.begin().await?;
        let wallet = uow.lock_wallet(key).await?;
        let entries = uow.wallet_transactions(key).await?;

        let consistent = wallet.is_balanced() && replay_matches(&wallet, &entries);
        if !consistent {
            warn!(
                wallet = %key,
                balance = %wallet.balance,
                entries = entries.len(),
                "Wallet ledger does not replay to its balance"
            );
        }
        Ok(consistent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payout_reference() {
        assert_eq!(payout_reference("UTR123"), "PAYOUT#UTR123");
    }
}
