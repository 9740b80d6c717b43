//! Pricing engine. Pure functions only: the demand count is supplied by the caller.

use chrono::{Datelike, NaiveDate, Weekday};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

use crate::models::{Booking, PlatformSettings};

/// More APPROVED overlapping bookings than this triggers the demand surge.
pub const DEMAND_SURGE_THRESHOLD: usize = 5;

fn demand_multiplier() -> Decimal {
    Decimal::new(13, 1)
}

fn weekend_multiplier() -> Decimal {
    Decimal::new(12, 1)
}

/// Rent before discount, with the surge decisions that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseAmount {
    pub days: i64,
    pub price_per_day: Decimal,
    pub demand_surge_applied: bool,
    pub weekend_surge_applied: bool,
    pub original_base: Decimal,
}

/// Discount, commission and tax applied to an original base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Terms {
    pub original_base: Decimal,
    pub discount_percent: Decimal,
    pub max_discount_percent: Decimal,
    pub discount_amount: Decimal,
    pub discounted_base: Decimal,
    pub commission_percent: Decimal,
    pub commission_amount: Decimal,
    pub taxable_amount: Decimal,
    pub gst_percent: Decimal,
    pub gst_amount: Decimal,
    pub cgst_amount: Decimal,
    pub sgst_amount: Decimal,
    pub total: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    #[serde(flatten)]
    pub base: BaseAmount,
    #[serde(flatten)]
    pub terms: Terms,
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Discount cap for a booking starting on `start`.
pub fn max_discount_percent(start: NaiveDate) -> Decimal {
    if is_weekend(start) {
        Decimal::from(30)
    } else {
        Decimal::from(50)
    }
}

/// Inclusive day count.
pub fn day_count(start: NaiveDate, end: NaiveDate) -> Result<i64, AppError> {
    if end < start {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "End date {} is before start date {}",
            end,
            start
        )));
    }
    Ok((end - start).num_days() + 1)
}

fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn round_unit(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

/// Rent for the range with demand and weekend surges. The two surges compound.
pub fn surged_base(
    price_per_day: Decimal,
    start: NaiveDate,
    end: NaiveDate,
    approved_overlaps: usize,
) -> Result<BaseAmount, AppError> {
    if price_per_day < Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Daily price must not be negative"
        )));
    }
    let days = day_count(start, end)?;

    let mut base = price_per_day * Decimal::from(days);

    let demand_surge_applied = approved_overlaps > DEMAND_SURGE_THRESHOLD;
    if demand_surge_applied {
        base *= demand_multiplier();
    }

    let weekend_surge_applied = is_weekend(start);
    if weekend_surge_applied {
        base *= weekend_multiplier();
    }

    Ok(BaseAmount {
        days,
        price_per_day,
        demand_surge_applied,
        weekend_surge_applied,
        original_base: round_unit(base),
    })
}

/// Apply a discount and the platform's commission and GST to `original_base`.
pub fn apply_terms(
    original_base: Decimal,
    start: NaiveDate,
    discount_percent: Decimal,
    settings: &PlatformSettings,
) -> Result<Terms, AppError> {
    if discount_percent < Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Discount must not be negative"
        )));
    }

    let cap = max_discount_percent(start);
    if discount_percent > cap {
        let kind = if is_weekend(start) { "weekend" } else { "weekday" };
        return Err(AppError::business(format!(
            "Discount of {}% exceeds the {} cap of {}%",
            discount_percent.normalize(),
            kind,
            cap
        )));
    }

    let hundred = Decimal::ONE_HUNDRED;
    let discount_amount = round_money(original_base * discount_percent / hundred);
    let discounted_base = original_base - discount_amount;

    let commission_amount = round_money(discounted_base * settings.commission_percent / hundred);
    let taxable_amount = discounted_base + commission_amount;

    let gst_amount = round_money(taxable_amount * settings.gst_percent / hundred);
    let cgst_amount = round_money(gst_amount / Decimal::TWO);
    let sgst_amount = gst_amount - cgst_amount;

    Ok(Terms {
        original_base,
        discount_percent,
        max_discount_percent: cap,
        discount_amount,
        discounted_base,
        commission_percent: settings.commission_percent,
        commission_amount,
        taxable_amount,
        gst_percent: settings.gst_percent,
        gst_amount,
        cgst_amount,
        sgst_amount,
        total: taxable_amount + gst_amount,
        currency: settings.currency.clone(),
    })
}

/// Full breakdown for a billboard, date range and discount.
pub fn compute_breakdown(
    price_per_day: Decimal,
    start: NaiveDate,
    end: NaiveDate,
    discount_percent: Decimal,
    approved_overlaps: usize,
    settings: &PlatformSettings,
) -> Result<PriceBreakdown, AppError> {
    let base = surged_base(price_per_day, start, end, approved_overlaps)?;
    let terms = apply_terms(base.original_base, start, discount_percent, settings)?;
    Ok(PriceBreakdown { base, terms })
}

/// Terms for a new discount on an existing booking, keeping its original base.
pub fn rediscount(
    booking: &Booking,
    discount_percent: Decimal,
    settings: &PlatformSettings,
) -> Result<Terms, AppError> {
    apply_terms(
        booking.original_base_amount,
        booking.start_date,
        discount_percent,
        settings,
    )
}
