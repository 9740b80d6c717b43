use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A refund reversal that could not be debited because the wallet had
/// already paid the money out. Needs manual reconciliation.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct RefundShortfall {
    pub shortfall_id: Uuid,
    pub booking_id: Uuid,
    pub wallet_key: String,
    pub expected_amount: Decimal,
    pub available_balance: Decimal,
    pub resolved: bool,
    pub created_utc: DateTime<Utc>,
}

impl RefundShortfall {
    pub fn new(
        booking_id: Uuid,
        wallet_key: String,
        expected_amount: Decimal,
        available_balance: Decimal,
    ) -> Self {
        Self {
            shortfall_id: Uuid::new_v4(),
            booking_id,
            wallet_key,
            expected_amount,
            available_balance,
            resolved: false,
            created_utc: Utc::now(),
        }
    }
}
