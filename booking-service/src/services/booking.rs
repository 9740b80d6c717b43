//! Booking lifecycle: creation, owner decisions, repricing, cancellation, completion.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::error::AppError;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::models::{AuditAction, AuditEntry, Booking, BookingStatus, Transition};
use crate::services::availability::conflicts_in;
use crate::services::kyc::KycCheck;
use crate::services::metrics::record_transition;
use crate::services::pricing::{self, PriceBreakdown, Terms};
use crate::services::settings::SettingsProvider;
use crate::services::store::{Store, UnitOfWork};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBooking {
    pub billboard_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

pub struct BookingService {
    store: Arc<dyn Store>,
    settings: Arc<SettingsProvider>,
    kyc: Arc<dyn KycCheck>,
}

/// Load a booking under lock or fail with `NotFound`.
pub(crate) async fn lock_existing(
    uow: &mut dyn UnitOfWork,
    booking_id: Uuid,
) -> Result<Booking, AppError> {
    uow.lock_booking(booking_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Booking {} not found", booking_id)))
}

/// Apply `transition`, persist the booking and append an audit entry.
pub(crate) async fn transition_in(
    uow: &mut dyn UnitOfWork,
    booking: &mut Booking,
    transition: Transition,
    audit: AuditEntry,
) -> Result<(), AppError> {
    let from = (booking.status, booking.payment_status);
    if let Err(e) = booking.apply(transition) {
        record_transition(transition.as_str(), false);
        return Err(e);
    }
    record_transition(transition.as_str(), true);

    uow.update_booking(booking).await?;
    uow.append_audit(&audit).await?;

    info!(
        booking_id = %booking.booking_id,
        transition = transition.as_str(),
        from_status = %from.0,
        from_payment = %from.1,
        status = %booking.status,
        payment_status = %booking.payment_status,
        "Booking transitioned"
    );
    Ok(())
}

/// Overwrite the price snapshot through [`Transition::Reprice`], persist the
/// booking and append the audit entry.
pub(crate) async fn reprice_in(
    uow: &mut dyn UnitOfWork,
    booking: &mut Booking,
    terms: &Terms,
    audit: AuditEntry,
) -> Result<(), AppError> {
    if let Err(e) = booking.reprice(terms) {
        record_transition(Transition::Reprice.as_str(), false);
        return Err(e);
    }
    record_transition(Transition::Reprice.as_str(), true);

    uow.update_booking(booking).await?;
    uow.append_audit(&audit).await?;
    Ok(())
}

/// Reprice an unpaid booking against the current billboard price and
/// settings, keeping its discount. Returns whether the snapshot changed.
///
/// No-op once paid, or while a live gateway order exists for the current total.
pub(crate) async fn recalculate_in(
    uow: &mut dyn UnitOfWork,
    booking: &mut Booking,
    actor: Option<Uuid>,
) -> Result<bool, AppError> {
    if booking.is_paid() || booking.has_live_order() {
        return Ok(false);
    }
    if !BookingStatus::RESERVING.contains(&booking.status) {
        return Ok(false);
    }

    let billboard = uow.billboard(booking.billboard_id).await?.ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!(
            "Billboard {} not found",
            booking.billboard_id
        ))
    })?;
    let approved = uow
        .overlapping_bookings(
            booking.billboard_id,
            booking.start_date,
            booking.end_date,
            &[BookingStatus::Approved],
        )
        .await?
        .len();
    let settings = uow.settings().await?;

    let breakdown = pricing::compute_breakdown(
        billboard.price_per_day,
        booking.start_date,
        booking.end_date,
        booking.discount_percent,
        approved,
        &settings,
    )?;

    let terms = &breakdown.terms;
    let unchanged = terms.original_base == booking.original_base_amount
        && terms.commission_percent == booking.commission_percent
        && terms.gst_percent == booking.gst_percent
        && terms.total == booking.total_price;
    if unchanged {
        return Ok(false);
    }

    let booking_id = booking.booking_id;
    let previous_total = booking.total_price;
    reprice_in(
        uow,
        booking,
        terms,
        AuditEntry::new(booking_id, AuditAction::PriceRecalculated, actor)
            .with_detail(format!("{} -> {}", previous_total, terms.total)),
    )
    .await?;

    info!(
        booking_id = %booking.booking_id,
        previous_total = %previous_total,
        total = %booking.total_price,
        "Booking price recalculated"
    );
    Ok(true)
}

impl BookingService {
    pub fn new(
        store: Arc<dyn Store>,
        settings: Arc<SettingsProvider>,
        kyc: Arc<dyn KycCheck>,
    ) -> Self {
        Self {
            store,
            settings,
            kyc,
        }
    }

    /// Authoritative price for a prospective booking. Uses cached settings.
    #[instrument(skip(self))]
    pub async fn price_preview(
        &self,
        billboard_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
        discount_percent: Option<Decimal>,
    ) -> Result<PriceBreakdown, AppError> {
        pricing::day_count(start, end)?;
        let settings = self.settings.get().await?;

        let mut uow = self.store.begin().await?;
        let billboard = uow.billboard(billboard_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Billboard {} not found", billboard_id))
        })?;
        let approved = uow
            .overlapping_bookings(billboard_id, start, end, &[BookingStatus::Approved])
            .await?
            .len();
        drop(uow);

        pricing::compute_breakdown(
            billboard.price_per_day,
            start,
            end,
            discount_percent.unwrap_or(Decimal::ZERO),
            approved,
            &settings,
        )
    }

    #[instrument(skip(self, request), fields(billboard_id = %request.billboard_id))]
    pub async fn create(
        &self,
        advertiser_id: Uuid,
        request: CreateBooking,
    ) -> Result<Booking, AppError> {
        request.validate()?;
        pricing::day_count(request.start_date, request.end_date)?;
        if request.start_date < Utc::now().date_naive() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Start date cannot be in the past"
            )));
        }

        if !self.kyc.is_approved(advertiser_id).await? {
            return Err(AppError::business(
                "Advertiser KYC must be approved before booking",
            ));
        }

        let mut uow = self.store.begin().await?;

        // Holding the billboard lock serializes the conflict check with the insert.
        let billboard = uow
            .lock_billboard(request.billboard_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Billboard {} not found",
                    request.billboard_id
                ))
            })?;
        if !billboard.active {
            return Err(AppError::business("Billboard is not available for booking"));
        }

        let conflicts = conflicts_in(
            uow.as_mut(),
            billboard.billboard_id,
            request.start_date,
            request.end_date,
            &BookingStatus::RESERVING,
        )
        .await?;
        if !conflicts.is_empty() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Billboard is already booked for the selected dates"
            )));
        }

        let approved = conflicts
            .iter()
            .filter(|b| b.status == BookingStatus::Approved)
            .count();
        let settings = uow.settings().await?;
        let breakdown = pricing::compute_breakdown(
            billboard.price_per_day,
            request.start_date,
            request.end_date,
            Decimal::ZERO,
            approved,
            &settings,
        )?;

        let booking = Booking::new(
            advertiser_id,
            billboard.billboard_id,
            billboard.owner_id,
            request.start_date,
            request.end_date,
            billboard.price_per_day,
            &breakdown.terms,
        );
        uow.insert_booking(&booking).await?;
        uow.append_audit(&AuditEntry::new(
            booking.booking_id,
            AuditAction::Created,
            Some(advertiser_id),
        ))
        .await?;
        uow.commit().await?;

        info!(
            booking_id = %booking.booking_id,
            advertiser_id = %advertiser_id,
            total = %booking.total_price,
            "Booking created"
        );
        Ok(booking)
    }

    #[instrument(skip(self))]
    pub async fn approve(&self, owner_id: Uuid, booking_id: Uuid) -> Result<Booking, AppError> {
        self.owner_decision(owner_id, booking_id, Transition::Approve, AuditAction::Approved)
            .await
    }

    #[instrument(skip(self))]
    pub async fn reject(&self, owner_id: Uuid, booking_id: Uuid) -> Result<Booking, AppError> {
        self.owner_decision(owner_id, booking_id, Transition::Reject, AuditAction::Rejected)
            .await
    }

    async fn owner_decision(
        &self,
        owner_id: Uuid,
        booking_id: Uuid,
        transition: Transition,
        action: AuditAction,
    ) -> Result<Booking, AppError> {
        let mut uow = self.store.begin().await?;
        let mut booking = lock_existing(uow.as_mut(), booking_id).await?;
        ensure_owner(&booking, owner_id)?;

        transition_in(
            uow.as_mut(),
            &mut booking,
            transition,
            AuditEntry::new(booking_id, action, Some(owner_id)),
        )
        .await?;
        uow.commit().await?;
        Ok(booking)
    }

    /// Re-derive the price from the original base with a new discount.
    #[instrument(skip(self))]
    pub async fn apply_discount(
        &self,
        owner_id: Uuid,
        booking_id: Uuid,
        discount_percent: Decimal,
    ) -> Result<Booking, AppError> {
        let mut uow = self.store.begin().await?;
        let mut booking = lock_existing(uow.as_mut(), booking_id).await?;
        ensure_owner(&booking, owner_id)?;

        let settings = uow.settings().await?;
        let terms = pricing::rediscount(&booking, discount_percent, &settings)?;
        let action = if discount_percent.is_zero() {
            AuditAction::DiscountRemoved
        } else {
            AuditAction::DiscountApplied
        };
        reprice_in(
            uow.as_mut(),
            &mut booking,
            &terms,
            AuditEntry::new(booking_id, action, Some(owner_id))
                .with_detail(format!("{}%", discount_percent.normalize())),
        )
        .await?;
        uow.commit().await?;

        if booking.gateway_order_id.is_some() && !booking.has_live_order() {
            info!(booking_id = %booking_id, "Discount made the outstanding payment order stale");
        }
        info!(
            booking_id = %booking_id,
            discount_percent = %discount_percent,
            total = %booking.total_price,
            "Discount applied"
        );
        Ok(booking)
    }

    #[instrument(skip(self))]
    pub async fn recalculate_if_unpaid(&self, booking_id: Uuid) -> Result<Booking, AppError> {
        let mut uow = self.store.begin().await?;
        let mut booking = lock_existing(uow.as_mut(), booking_id).await?;
        if recalculate_in(uow.as_mut(), &mut booking, None).await? {
            uow.commit().await?;
        }
        Ok(booking)
    }

    /// Pre-payment cancellation by the advertiser. Frees the dates immediately.
    #[instrument(skip(self))]
    pub async fn cancel(&self, advertiser_id: Uuid, booking_id: Uuid) -> Result<Booking, AppError> {
        let mut uow = self.store.begin().await?;
        let mut booking = lock_existing(uow.as_mut(), booking_id).await?;
        ensure_advertiser(&booking, advertiser_id)?;

        transition_in(
            uow.as_mut(),
            &mut booking,
            Transition::Cancel,
            AuditEntry::new(booking_id, AuditAction::Cancelled, Some(advertiser_id)),
        )
        .await?;
        uow.commit().await?;
        Ok(booking)
    }

    /// Cancel a paid booking without moving any money. An unpaid booking is
    /// simply cancelled.
    #[instrument(skip(self))]
    pub async fn cancel_after_payment(
        &self,
        advertiser_id: Uuid,
        booking_id: Uuid,
    ) -> Result<Booking, AppError> {
        let mut uow = self.store.begin().await?;
        let mut booking = lock_existing(uow.as_mut(), booking_id).await?;
        ensure_advertiser(&booking, advertiser_id)?;

        let (transition, action) = if booking.is_paid() {
            (Transition::CancelAfterPayment, AuditAction::CancelledNoRefund)
        } else {
            (Transition::Cancel, AuditAction::Cancelled)
        };
        transition_in(
            uow.as_mut(),
            &mut booking,
            transition,
            AuditEntry::new(booking_id, action, Some(advertiser_id)),
        )
        .await?;
        uow.commit().await?;
        Ok(booking)
    }

    #[instrument(skip(self))]
    pub async fn complete(&self, booking_id: Uuid, today: NaiveDate) -> Result<Booking, AppError> {
        let mut uow = self.store.begin().await?;
        let mut booking = lock_existing(uow.as_mut(), booking_id).await?;
        if !booking.has_ended(today) {
            return Err(AppError::business(
                "Booking can only be completed after its end date",
            ));
        }

        transition_in(
            uow.as_mut(),
            &mut booking,
            Transition::Complete,
            AuditEntry::new(booking_id, AuditAction::Completed, None),
        )
        .await?;
        uow.commit().await?;
        Ok(booking)
    }

    /// Complete every APPROVED booking that ended before `today`.
    #[instrument(skip(self))]
    pub async fn complete_elapsed(&self, today: NaiveDate) -> Result<usize, AppError> {
        let due = {
            let mut uow = self.store.begin().await?;
            uow.elapsed_bookings(today).await?
        };

        let mut completed = 0;
        for booking_id in due {
            match self.complete(booking_id, today).await {
                Ok(_) => completed += 1,
                Err(e) => warn!(booking_id = %booking_id, error = %e, "Could not complete booking"),
            }
        }
        if completed > 0 {
            info!(completed, "Completed elapsed bookings");
        }
        Ok(completed)
    }

    pub async fn get(&self, booking_id: Uuid) -> Result<Booking, AppError> {
        let mut uow = self.store.begin().await?;
        uow.booking(booking_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Booking {} not found", booking_id)))
    }

    pub async fn audit_trail(&self, booking_id: Uuid) -> Result<Vec<AuditEntry>, AppError> {
        let mut uow = self.store.begin().await?;
        uow.audit_trail(booking_id).await
    }
}

pub(crate) fn ensure_owner(booking: &Booking, owner_id: Uuid) -> Result<(), AppError> {
    if booking.owner_id != owner_id {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Only the billboard owner can act on this booking"
        )));
    }
    Ok(())
}

pub(crate) fn ensure_advertiser(booking: &Booking, advertiser_id: Uuid) -> Result<(), AppError> {
    if booking.advertiser_id != advertiser_id {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Only the advertiser who made this booking can act on it"
        )));
    }
    Ok(())
}
