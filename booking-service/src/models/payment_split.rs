use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Booking;

/// How a paid booking's total divides between owner, platform and tax.
/// At most one exists per booking.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct PaymentSplit {
    pub split_id: Uuid,
    pub booking_id: Uuid,
    pub owner_id: Uuid,
    pub owner_amount: Decimal,
    pub platform_commission: Decimal,
    pub gst_amount: Decimal,
    pub total_amount: Decimal,
    /// Paid out to the owner's bank, distinct from the wallet credit.
    pub settled: bool,
    pub refunded: bool,
    pub created_utc: DateTime<Utc>,
    pub settled_utc: Option<DateTime<Utc>>,
    pub refunded_utc: Option<DateTime<Utc>>,
}

impl PaymentSplit {
    /// Copy the amounts from the booking's locked snapshot.
    pub fn from_booking(booking: &Booking) -> Self {
        Self {
            split_id: Uuid::new_v4(),
            booking_id: booking.booking_id,
            owner_id: booking.owner_id,
            owner_amount: booking.base_amount,
            platform_commission: booking.commission_amount,
            gst_amount: booking.gst_amount,
            total_amount: booking.total_price,
            settled: false,
            refunded: false,
            created_utc: Utc::now(),
            settled_utc: None,
            refunded_utc: None,
        }
    }

    pub fn is_conserved(&self) -> bool {
        self.owner_amount + self.platform_commission + self.gst_amount == self.total_amount
    }
}
