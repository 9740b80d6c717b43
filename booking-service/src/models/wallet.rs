//! Owner and platform wallets plus their append-only ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

/// Identifies a wallet. Owners have one each; the platform has a single admin wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletKey {
    Owner(Uuid),
    Admin,
}

impl WalletKey {
    const ADMIN: &'static str = "ADMIN";
    const OWNER_PREFIX: &'static str = "OWNER:";

    pub fn as_key(&self) -> String {
        match self {
            Self::Owner(id) => format!("{}{}", Self::OWNER_PREFIX, id),
            Self::Admin => Self::ADMIN.to_string(),
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        if key == Self::ADMIN {
            return Some(Self::Admin);
        }
        key.strip_prefix(Self::OWNER_PREFIX)
            .and_then(|id| Uuid::parse_str(id).ok())
            .map(Self::Owner)
    }
}

impl std::fmt::Display for WalletKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnDirection {
    Credit,
    Debit,
}

impl TxnDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "CREDIT",
            Self::Debit => "DEBIT",
        }
    }
}

/// Wallet balances. `balance == total_earned - total_withdrawn` after every
/// operation and `balance` never goes negative.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_key: String,
    pub balance: Decimal,
    pub total_earned: Decimal,
    pub total_withdrawn: Decimal,
    pub pending_withdrawal: Decimal,
    pub updated_utc: DateTime<Utc>,
}

impl Wallet {
    pub fn empty(key: WalletKey) -> Self {
        Self {
            wallet_key: key.as_key(),
            balance: Decimal::ZERO,
            total_earned: Decimal::ZERO,
            total_withdrawn: Decimal::ZERO,
            pending_withdrawal: Decimal::ZERO,
            updated_utc: Utc::now(),
        }
    }

    /// Funds not reserved by a pending payout.
    pub fn available(&self) -> Decimal {
        self.balance - self.pending_withdrawal
    }

    pub fn credit(&mut self, amount: Decimal) -> Result<Decimal, AppError> {
        ensure_positive(amount)?;
        self.balance += amount;
        self.total_earned += amount;
        self.updated_utc = Utc::now();
        Ok(self.balance)
    }

    pub fn debit(&mut self, amount: Decimal) -> Result<Decimal, AppError> {
        ensure_positive(amount)?;
        if self.balance < amount {
            return Err(AppError::InsufficientFunds(format!(
                "wallet {} holds {} but {} was requested",
                self.wallet_key, self.balance, amount
            )));
        }
        self.balance -= amount;
        self.total_withdrawn += amount;
        self.updated_utc = Utc::now();
        Ok(self.balance)
    }

    /// Undo an earlier credit: the money was never really earned.
    ///
    /// Funds reserved for a pending payout are not touched, so the reservation
    /// can still complete.
    pub fn reverse_credit(&mut self, amount: Decimal) -> Result<Decimal, AppError> {
        ensure_positive(amount)?;
        if self.available() < amount {
            return Err(AppError::InsufficientFunds(format!(
                "wallet {} has {} available but reversal needs {}",
                self.wallet_key,
                self.available(),
                amount
            )));
        }
        self.balance -= amount;
        self.total_earned -= amount;
        self.updated_utc = Utc::now();
        Ok(self.balance)
    }

    pub fn reserve(&mut self, amount: Decimal) -> Result<(), AppError> {
        ensure_positive(amount)?;
        if self.available() < amount {
            return Err(AppError::InsufficientFunds(format!(
                "wallet {} has {} available but {} was requested",
                self.wallet_key,
                self.available(),
                amount
            )));
        }
        self.pending_withdrawal += amount;
        self.updated_utc = Utc::now();
        Ok(())
    }

    pub fn release(&mut self, amount: Decimal) -> Result<(), AppError> {
        ensure_positive(amount)?;
        if self.pending_withdrawal < amount {
            return Err(AppError::business(format!(
                "wallet {} has only {} reserved",
                self.wallet_key, self.pending_withdrawal
            )));
        }
        self.pending_withdrawal -= amount;
        self.updated_utc = Utc::now();
        Ok(())
    }

    pub fn is_balanced(&self) -> bool {
        self.balance == self.total_earned - self.total_withdrawn && self.balance >= Decimal::ZERO
    }
}

fn ensure_positive(amount: Decimal) -> Result<(), AppError> {
    if amount <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Wallet amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

/// Immutable ledger entry.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub transaction_id: Uuid,
    pub wallet_key: String,
    pub direction: TxnDirection,
    pub amount: Decimal,
    pub reference: String,
    pub booking_id: Option<Uuid>,
    pub balance_after: Decimal,
    pub created_utc: DateTime<Utc>,
}

impl WalletTransaction {
    pub fn new(
        wallet: &Wallet,
        direction: TxnDirection,
        amount: Decimal,
        reference: impl Into<String>,
        booking_id: Option<Uuid>,
    ) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            wallet_key: wallet.wallet_key.clone(),
            direction,
            amount,
            reference: reference.into(),
            booking_id,
            balance_after: wallet.balance,
            created_utc: Utc::now(),
        }
    }

    pub fn signed_amount(&self) -> Decimal {
        match self.direction {
            TxnDirection::Credit => self.amount,
            TxnDirection::Debit => -self.amount,
        }
    }
}

/// Replay `entries` (in creation order) and check they reproduce the stored balance.
pub fn replay_matches(wallet: &Wallet, entries: &[WalletTransaction]) -> bool {
    let mut running = Decimal::ZERO;
    for entry in entries {
        running += entry.signed_amount();
        if running < Decimal::ZERO || running != entry.balance_after {
            return false;
        }
    }
    running == wallet.balance
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn wallet_key_round_trips_through_storage_form() {
        let owner = Uuid::new_v4();
        assert_eq!(
            WalletKey::parse(&WalletKey::Owner(owner).as_key()),
            Some(WalletKey::Owner(owner))
        );
        assert_eq!(WalletKey::parse("ADMIN"), Some(WalletKey::Admin));
        assert_eq!(WalletKey::parse("OWNER:not-a-uuid"), None);
    }

    #[test]
    fn debit_never_overdraws() {
        let mut w = Wallet::empty(WalletKey::Admin);
        w.credit(d("100")).unwrap();
        assert!(matches!(w.debit(d("100.01")), Err(AppError::InsufficientFunds(_))));
        assert_eq!(w.balance, d("100"));
        assert_eq!(w.debit(d("40")).unwrap(), d("60"));
        assert!(w.is_balanced());
        assert_eq!(w.total_withdrawn, d("40"));
    }

    #[test]
    fn reversal_reduces_lifetime_earnings() {
        let mut w = Wallet::empty(WalletKey::Admin);
        w.credit(d("450")).unwrap();
        w.reverse_credit(d("450")).unwrap();
        assert_eq!(w.balance, Decimal::ZERO);
        assert_eq!(w.total_earned, Decimal::ZERO);
        assert!(w.is_balanced());
    }

    #[test]
    fn reversal_leaves_reserved_funds_alone() {
        let mut w = Wallet::empty(WalletKey::Owner(Uuid::new_v4()));
        w.credit(d("3000")).unwrap();
        w.reserve(d("3000")).unwrap();
        assert!(matches!(
            w.reverse_credit(d("3000")),
            Err(AppError::InsufficientFunds(_))
        ));
        assert_eq!(w.balance, d("3000"));
        assert_eq!(w.pending_withdrawal, d("3000"));

        w.release(d("1000")).unwrap();
        assert_eq!(w.reverse_credit(d("1000")).unwrap(), d("2000"));
        assert!(w.available() >= Decimal::ZERO);
    }

    #[test]
    fn reservation_limits_available_funds() {
        let mut w = Wallet::empty(WalletKey::Owner(Uuid::new_v4()));
        w.credit(d("500")).unwrap();
        w.reserve(d("300")).unwrap();
        assert_eq!(w.available(), d("200"));
        assert!(w.reserve(d("201")).is_err());
        w.release(d("300")).unwrap();
        assert_eq!(w.available(), d("500"));
    }

    #[test]
    fn non_positive_amounts_rejected() {
        let mut w = Wallet::empty(WalletKey::Admin);
        assert!(w.credit(Decimal::ZERO).is_err());
        assert!(w.credit(d("-5")).is_err());
    }

    #[test]
    fn replay_detects_tampering() {
        let mut w = Wallet::empty(WalletKey::Admin);
        w.credit(d("100")).unwrap();
        let t1 = WalletTransaction::new(&w, TxnDirection::Credit, d("100"), "BOOKING#1", None);
        w.debit(d("30")).unwrap();
        let t2 = WalletTransaction::new(&w, TxnDirection::Debit, d("30"), "PAYOUT#1", None);

        assert!(replay_matches(&w, &[t1.clone(), t2.clone()]));

        let mut forged = w.clone();
        forged.balance = d("80");
        assert!(!replay_matches(&forged, &[t1, t2]));
    }
}
