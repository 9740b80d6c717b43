//! Booking aggregate and its two-axis state machine.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

use crate::services::pricing::Terms;

/// Business state of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    CancelledNoRefund,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::CancelledNoRefund => "CANCELLED_NO_REFUND",
            Self::Completed => "COMPLETED",
        }
    }

    /// Statuses that hold the billboard's calendar.
    pub const RESERVING: [BookingStatus; 2] = [BookingStatus::Pending, BookingStatus::Approved];
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment sub-state, orthogonal to [`BookingStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    NotPaid,
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotPaid => "NOT_PAID",
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Every way a booking's state may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Approve,
    Reject,
    /// Discount or recalculation overwriting the price snapshot.
    Reprice,
    OrderCreated,
    PaymentFailed,
    MarkPaid,
    Cancel,
    CancelAfterPayment,
    Refund,
    Complete,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Reprice => "reprice",
            Self::OrderCreated => "order_created",
            Self::PaymentFailed => "payment_failed",
            Self::MarkPaid => "mark_paid",
            Self::Cancel => "cancel",
            Self::CancelAfterPayment => "cancel_after_payment",
            Self::Refund => "refund",
            Self::Complete => "complete",
        }
    }
}

/// Whether a (status, payment status) pair can ever be observed.
pub fn is_consistent(status: BookingStatus, payment: PaymentStatus) -> bool {
    use BookingStatus as S;
    use PaymentStatus as P;

    match status {
        S::Pending => payment == P::NotPaid,
        S::Approved | S::Completed => matches!(payment, P::Pending | P::Failed | P::Paid),
        S::Rejected => payment == P::Failed,
        S::Cancelled => matches!(payment, P::NotPaid | P::Pending | P::Failed | P::Refunded),
        S::CancelledNoRefund => payment == P::Paid,
    }
}

/// The single transition table. Returns the next state or the reason the
/// transition is not allowed from the current one.
pub fn next_state(
    status: BookingStatus,
    payment: PaymentStatus,
    transition: Transition,
) -> Result<(BookingStatus, PaymentStatus), AppError> {
    use BookingStatus as S;
    use PaymentStatus as P;

    let next = match (transition, status, payment) {
        (Transition::Approve, S::Pending, P::NotPaid) => (S::Approved, P::Pending),
        (Transition::Approve, _, _) => {
            return Err(AppError::business("Only PENDING bookings can be approved"));
        }

        (Transition::Reject, S::Pending, P::NotPaid) => (S::Rejected, P::Failed),
        (Transition::Reject, _, _) => {
            return Err(AppError::business("Only PENDING bookings can be rejected"));
        }

        (Transition::Reprice, _, P::Paid | P::Refunded) => {
            return Err(AppError::business(
                "Price is locked once the booking has been paid",
            ));
        }
        (Transition::Reprice, S::Pending | S::Approved, p) => (status, p),
        (Transition::Reprice, _, _) => {
            return Err(AppError::business(
                "Price can only change while the booking is PENDING or APPROVED",
            ));
        }

        (Transition::OrderCreated, _, P::Paid) => {
            return Err(AppError::business("Booking is already paid"));
        }
        (Transition::OrderCreated, S::Approved, P::Pending | P::Failed) => {
            (S::Approved, P::Pending)
        }
        (Transition::OrderCreated, _, _) => {
            return Err(AppError::business(
                "Payment is allowed only after the owner approves the booking",
            ));
        }

        (Transition::PaymentFailed, S::Approved, P::Pending | P::Failed) => {
            (S::Approved, P::Failed)
        }
        (Transition::PaymentFailed, _, _) => {
            return Err(AppError::business(
                "Only an unpaid APPROVED booking can record a failed payment",
            ));
        }

        (Transition::MarkPaid, _, P::Paid) => {
            return Err(AppError::business("Booking is already paid"));
        }
        (Transition::MarkPaid, S::Approved, P::Pending | P::Failed) => (S::Approved, P::Paid),
        (Transition::MarkPaid, _, _) => {
            return Err(AppError::business(
                "Only an APPROVED booking awaiting payment can be marked paid",
            ));
        }

        (Transition::Cancel, S::Pending | S::Approved, P::NotPaid | P::Pending | P::Failed) => {
            (S::Cancelled, payment)
        }
        (Transition::Cancel, _, P::Paid) => {
            return Err(AppError::business(
                "Paid bookings must be cancelled through refund or no-refund cancellation",
            ));
        }
        (Transition::Cancel, _, _) => {
            return Err(AppError::business(
                "Only PENDING or APPROVED bookings can be cancelled",
            ));
        }

        (Transition::CancelAfterPayment, S::Approved | S::Completed, P::Paid) => {
            (S::CancelledNoRefund, P::Paid)
        }
        (Transition::CancelAfterPayment, _, _) => {
            return Err(AppError::business(
                "Only an active paid booking can be cancelled without refund",
            ));
        }

        (Transition::Refund, _, P::Paid) => (S::Cancelled, P::Refunded),
        (Transition::Refund, _, _) => {
            return Err(AppError::business("Only PAID bookings can be refunded"));
        }

        (Transition::Complete, S::Approved, P::Pending | P::Failed | P::Paid) => {
            (S::Completed, payment)
        }
        (Transition::Complete, _, _) => {
            return Err(AppError::business("Only APPROVED bookings can be completed"));
        }
    };

    if !is_consistent(next.0, next.1) {
        return Err(AppError::InternalError(anyhow::anyhow!(
            "Transition {} from {}/{} produced inconsistent state {}/{}",
            transition.as_str(),
            status,
            payment,
            next.0,
            next.1
        )));
    }

    Ok(next)
}

/// Booking aggregate as persisted.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Booking {
    pub booking_id: Uuid,
    pub advertiser_id: Uuid,
    pub billboard_id: Uuid,
    pub owner_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,

    // Price snapshot, immutable once paid.
    pub original_base_amount: Decimal,
    pub discount_percent: Decimal,
    pub discount_amount: Decimal,
    pub base_amount: Decimal,
    pub commission_percent: Decimal,
    pub commission_amount: Decimal,
    pub gst_percent: Decimal,
    pub gst_amount: Decimal,
    pub total_price: Decimal,
    pub currency: String,

    pub locked_commission_percent: Option<Decimal>,
    pub price_per_day_at_booking: Decimal,

    pub gateway_order_id: Option<String>,
    /// Total the outstanding order was created for.
    pub order_amount: Option<Decimal>,
    pub gateway_payment_id: Option<String>,
    pub gateway_signature: Option<String>,
    pub paid_utc: Option<DateTime<Utc>>,

    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Booking {
    /// A fresh PENDING / NOT_PAID booking priced by `terms`.
    pub fn new(
        advertiser_id: Uuid,
        billboard_id: Uuid,
        owner_id: Uuid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        price_per_day: Decimal,
        terms: &Terms,
    ) -> Self {
        let now = Utc::now();
        let mut booking = Self {
            booking_id: Uuid::new_v4(),
            advertiser_id,
            billboard_id,
            owner_id,
            start_date,
            end_date,
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::NotPaid,
            original_base_amount: Decimal::ZERO,
            discount_percent: Decimal::ZERO,
            discount_amount: Decimal::ZERO,
            base_amount: Decimal::ZERO,
            commission_percent: Decimal::ZERO,
            commission_amount: Decimal::ZERO,
            gst_percent: Decimal::ZERO,
            gst_amount: Decimal::ZERO,
            total_price: Decimal::ZERO,
            currency: terms.currency.clone(),
            locked_commission_percent: None,
            price_per_day_at_booking: price_per_day,
            gateway_order_id: None,
            order_amount: None,
            gateway_payment_id: None,
            gateway_signature: None,
            paid_utc: None,
            created_utc: now,
            updated_utc: now,
        };
        booking.write_snapshot(terms);
        booking
    }

    /// Apply a transition through the table, mutating both axes together.
    pub fn apply(&mut self, transition: Transition) -> Result<(), AppError> {
        let (status, payment) = next_state(self.status, self.payment_status, transition)?;
        self.status = status;
        self.payment_status = payment;
        self.updated_utc = Utc::now();
        Ok(())
    }

    /// Overwrite the price snapshot. Only legal while [`Transition::Reprice`] is.
    pub fn reprice(&mut self, terms: &Terms) -> Result<(), AppError> {
        self.apply(Transition::Reprice)?;
        self.write_snapshot(terms);
        Ok(())
    }

    fn write_snapshot(&mut self, b: &Terms) {
        self.original_base_amount = b.original_base;
        self.discount_percent = b.discount_percent;
        self.discount_amount = b.discount_amount;
        self.base_amount = b.discounted_base;
        self.commission_percent = b.commission_percent;
        self.commission_amount = b.commission_amount;
        self.gst_percent = b.gst_percent;
        self.gst_amount = b.gst_amount;
        self.total_price = b.total;
        self.currency = b.currency.clone();
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
    }

    /// An order exists and was created for the current total.
    pub fn has_live_order(&self) -> bool {
        self.gateway_order_id.is_some() && self.order_amount == Some(self.total_price)
    }

    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.end_date >= start && self.start_date <= end
    }

    pub fn has_ended(&self, today: NaiveDate) -> bool {
        self.end_date < today
    }

    pub fn receipt(&self) -> String {
        format!("BOOKING_{}", self.booking_id)
    }
}
