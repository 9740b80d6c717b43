//! Calendar conflict detection and per-day availability.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{Booking, BookingStatus};
use crate::services::pricing;
use crate::services::store::{Store, UnitOfWork};

/// Longest range the daily view will expand.
pub const MAX_CALENDAR_DAYS: i64 = 366;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayStatus {
    Booked,
    Pending,
    Available,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub status: DayStatus,
    /// Single-day rent on this date, surges included.
    pub price: Decimal,
}

/// BOOKED wins over PENDING: one APPROVED booking covering the day is enough.
pub fn resolve_day(date: NaiveDate, bookings: &[Booking]) -> DayStatus {
    let covering = bookings.iter().filter(|b| b.overlaps(date, date));
    let mut status = DayStatus::Available;
    for booking in covering {
        match booking.status {
            BookingStatus::Approved => return DayStatus::Booked,
            BookingStatus::Pending => status = DayStatus::Pending,
            _ => {}
        }
    }
    status
}

/// Conflicting bookings, read through an open unit of work so the caller's
/// locks cover the check.
pub async fn conflicts_in(
    uow: &mut dyn UnitOfWork,
    billboard_id: Uuid,
    start: NaiveDate,
    end: NaiveDate,
    statuses: &[BookingStatus],
) -> Result<Vec<Booking>, AppError> {
    if end < start {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "End date {} is before start date {}",
            end,
            start
        )));
    }
    uow.overlapping_bookings(billboard_id, start, end, statuses)
        .await
}

pub struct AvailabilityChecker {
    store: Arc<dyn Store>,
}

impl AvailabilityChecker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn has_conflict(
        &self,
        billboard_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
        statuses: &[BookingStatus],
    ) -> Result<bool, AppError> {
        let mut uow = self.store.begin().await?;
        let conflicts = conflicts_in(uow.as_mut(), billboard_id, start, end, statuses).await?;
        Ok(!conflicts.is_empty())
    }

    pub async fn daily_availability(
        &self,
        billboard_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DayAvailability>, AppError> {
        let days = pricing::day_count(start, end)?;
        if days > MAX_CALENDAR_DAYS {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Calendar range is limited to {} days",
                MAX_CALENDAR_DAYS
            )));
        }

        let mut uow = self.store.begin().await?;
        let billboard = uow.billboard(billboard_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Billboard {} not found", billboard_id))
        })?;
        let bookings =
            conflicts_in(uow.as_mut(), billboard_id, start, end, &BookingStatus::RESERVING)
                .await?;
        drop(uow);

        let mut calendar = Vec::with_capacity(days as usize);
        for date in start.iter_days().take(days as usize) {
            let approved = bookings
                .iter()
                .filter(|b| b.status == BookingStatus::Approved && b.overlaps(date, date))
                .count();
            let price = pricing::surged_base(billboard.price_per_day, date, date, approved)?;
            calendar.push(DayAvailability {
                date,
                status: resolve_day(date, &bookings),
                price: price.original_base,
            });
        }
        Ok(calendar)
    }
}
