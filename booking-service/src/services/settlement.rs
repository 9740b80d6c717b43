//! Settlement ledger: one split and one credit per wallet per paid booking.
//!
//! The split row is the idempotency anchor. Every write happens inside the
//! caller's unit of work, so the split, both credits and their ledger entries
//! commit together or not at all.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    Booking, PaymentSplit, RefundShortfall, TxnDirection, WalletKey, WalletTransaction,
};
use crate::services::metrics::{REFUND_SHORTFALLS_TOTAL, SETTLEMENTS_TOTAL};
use crate::services::store::{Store, UnitOfWork};

pub fn owner_credit_reference(booking_id: Uuid) -> String {
    format!("BOOKING#{}", booking_id)
}

pub fn commission_credit_reference(booking_id: Uuid) -> String {
    format!("COMMISSION#BOOKING#{}", booking_id)
}

pub fn refund_reference(booking_id: Uuid) -> String {
    format!("REFUND#BOOKING#{}", booking_id)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "split", rename_all = "snake_case")]
pub enum SettleOutcome {
    Created(PaymentSplit),
    /// A split already existed; nothing was credited.
    Existing(PaymentSplit),
}

impl SettleOutcome {
    pub fn split(&self) -> &PaymentSplit {
        match self {
            Self::Created(s) | Self::Existing(s) => s,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReversalReport {
    pub owner_debited: bool,
    pub admin_debited: bool,
    pub shortfalls: Vec<RefundShortfall>,
}

enum Reversal {
    Debited,
    Skipped,
    Shortfall(RefundShortfall),
}

pub struct SettlementLedger {
    store: Arc<dyn Store>,
}

impl SettlementLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Settle a paid booking in its own unit of work.
    #[instrument(skip(self), fields(booking_id = %booking_id))]
    pub async fn settle(&self, booking_id: Uuid) -> Result<SettleOutcome, AppError> {
        let mut uow = self.store.begin().await?;
        let booking = uow.lock_booking(booking_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Booking {} not found", booking_id))
        })?;
        let outcome = Self::settle_in(uow.as_mut(), &booking).await?;
        uow.commit().await?;
        Ok(outcome)
    }

    pub async fn settle_in(
        uow: &mut dyn UnitOfWork,
        booking: &Booking,
    ) -> Result<SettleOutcome, AppError> {
        if let Some(existing) = uow.split_for_booking(booking.booking_id).await? {
            SETTLEMENTS_TOTAL.with_label_values(&["existing"]).inc();
            info!(booking_id = %booking.booking_id, "Split already exists, settlement skipped");
            return Ok(SettleOutcome::Existing(existing));
        }

        if !booking.is_paid() {
            return Err(AppError::business(format!(
                "Booking {} cannot be settled while payment is {}",
                booking.booking_id, booking.payment_status
            )));
        }

        let split = PaymentSplit::from_booking(booking);
        if !split.is_conserved() {
            return Err(AppError::InternalError(anyhow::anyhow!(
                "Booking {} snapshot does not add up: {} + {} + {} != {}",
                booking.booking_id,
                split.owner_amount,
                split.platform_commission,
                split.gst_amount,
                split.total_amount
            )));
        }

        uow.insert_split(&split).await?;
        credit(
            uow,
            WalletKey::Owner(booking.owner_id),
            split.owner_amount,
            owner_credit_reference(booking.booking_id),
            booking.booking_id,
        )
        .await?;
        credit(
            uow,
            WalletKey::Admin,
            split.platform_commission,
            commission_credit_reference(booking.booking_id),
            booking.booking_id,
        )
        .await?;

        SETTLEMENTS_TOTAL.with_label_values(&["created"]).inc();
        info!(
            booking_id = %booking.booking_id,
            owner_amount = %split.owner_amount,
            platform_commission = %split.platform_commission,
            gst_amount = %split.gst_amount,
            "Booking settled"
        );

        Ok(SettleOutcome::Created(split))
    }

    /// Undo a settlement for a refund. A wallet that can no longer cover its
    /// share is skipped and a shortfall record is written instead.
    pub async fn reverse_in(
        uow: &mut dyn UnitOfWork,
        booking: &Booking,
    ) -> Result<ReversalReport, AppError> {
        if !booking.is_paid() {
            return Err(AppError::business("Only PAID bookings can be reversed"));
        }

        let mut split = uow
            .split_for_booking(booking.booking_id)
            .await?
            .ok_or_else(|| {
                AppError::business(format!(
                    "Booking {} has no settlement to reverse",
                    booking.booking_id
                ))
            })?;
        if split.refunded {
            return Err(AppError::business(format!(
                "Settlement for booking {} is already refunded",
                booking.booking_id
            )));
        }

        let reference = refund_reference(booking.booking_id);
        let mut report = ReversalReport::default();

        match reverse(
            uow,
            WalletKey::Owner(booking.owner_id),
            split.owner_amount,
            &reference,
            booking.booking_id,
        )
        .await?
        {
            Reversal::Debited => report.owner_debited = true,
            Reversal::Skipped => {}
            Reversal::Shortfall(s) => {
                REFUND_SHORTFALLS_TOTAL.with_label_values(&["owner"]).inc();
                report.shortfalls.push(s);
            }
        }

        match reverse(
            uow,
            WalletKey::Admin,
            split.platform_commission,
            &reference,
            booking.booking_id,
        )
        .await?
        {
            Reversal::Debited => report.admin_debited = true,
            Reversal::Skipped => {}
            Reversal::Shortfall(s) => {
                REFUND_SHORTFALLS_TOTAL.with_label_values(&["admin"]).inc();
                report.shortfalls.push(s);
            }
        }

        split.refunded = true;
        split.refunded_utc = Some(Utc::now());
        uow.update_split(&split).await?;

        info!(
            booking_id = %booking.booking_id,
            owner_debited = report.owner_debited,
            admin_debited = report.admin_debited,
            shortfalls = report.shortfalls.len(),
            "Settlement reversed"
        );
        Ok(report)
    }

    /// Record that the owner's share has been paid out to their bank.
    #[instrument(skip(self), fields(booking_id = %booking_id))]
    pub async fn mark_settled(&self, booking_id: Uuid) -> Result<PaymentSplit, AppError> {
        let mut uow = self.store.begin().await?;
        let mut split = uow.split_for_booking(booking_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("No split for booking {}", booking_id))
        })?;
        if split.refunded {
            return Err(AppError::business("A refunded split cannot be paid out"));
        }
        if !split.settled {
            split.settled = true;
            split.settled_utc = Some(Utc::now());
            uow.update_split(&split).await?;
            uow.commit().await?;
        }
        Ok(split)
    }

    pub async fn split(&self, booking_id: Uuid) -> Result<Option<PaymentSplit>, AppError> {
        let mut uow = self.store.begin().await?;
        uow.split_for_booking(booking_id).await
    }

    pub async fn open_shortfalls(&self) -> Result<Vec<RefundShortfall>, AppError> {
        let mut uow = self.store.begin().await?;
        uow.open_shortfalls().await
    }
}

async fn credit(
    uow: &mut dyn UnitOfWork,
    key: WalletKey,
    amount: Decimal,
    reference: String,
    booking_id: Uuid,
) -> Result<(), AppError> {
    if amount.is_zero() {
        return Ok(());
    }
    let mut wallet = uow.lock_wallet(key).await?;
    wallet.credit(amount)?;
    let txn = WalletTransaction::new(
        &wallet,
        TxnDirection::Credit,
        amount,
        reference,
        Some(booking_id),
    );
    uow.update_wallet(&wallet).await?;
    uow.append_wallet_transaction(&txn).await?;
    Ok(())
}

async fn reverse(
    uow: &mut dyn UnitOfWork,
    key: WalletKey,
    amount: Decimal,
    reference: &str,
    booking_id: Uuid,
) -> Result<Reversal, AppError> {
    if amount.is_zero() {
        return Ok(Reversal::Skipped);
    }
    let mut wallet = uow.lock_wallet(key).await?;

    match wallet.reverse_credit(amount) {
        Ok(_) => {
            let txn = WalletTransaction::new(
                &wallet,
                TxnDirection::Debit,
                amount,
                reference,
                Some(booking_id),
            );
            uow.update_wallet(&wallet).await?;
            uow.append_wallet_transaction(&txn).await?;
            Ok(Reversal::Debited)
        }
        Err(AppError::InsufficientFunds(reason)) => {
            warn!(
                booking_id = %booking_id,
                wallet = %key,
                expected = %amount,
                balance = %wallet.balance,
                pending_withdrawal = %wallet.pending_withdrawal,
                reason = %reason,
                "Refund reversal skipped: insufficient available funds, reconciliation required"
            );
            let shortfall =
                RefundShortfall::new(booking_id, key.as_key(), amount, wallet.available());
            uow.insert_shortfall(&shortfall).await?;
            Ok(Reversal::Shortfall(shortfall))
        }
        Err(other) => Err(other),
    }
}
