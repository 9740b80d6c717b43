//! Payment order creation and refunds. Both call the gateway, so each runs in
//! two short units of work with the network call in between; no row lock is
//! held across the gateway round trip.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    AuditAction, AuditEntry, Booking, BookingStatus, PaymentStatus, RefundStatus, Transition,
};
use crate::services::booking::{ensure_advertiser, lock_existing, recalculate_in, transition_in};
use crate::services::gateway::{to_minor_units, PaymentGateway};
use crate::services::reconciler::{
    PaymentOutcome, PaymentReconciler, VerifyPayment, WebhookOutcome,
};
use crate::services::settlement::{refund_reference, ReversalReport, SettlementLedger};
use crate::services::store::Store;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateOrder {
    pub booking_id: Uuid,
}

/// What the checkout client needs to open the gateway's payment sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderDetails {
    pub booking_id: Uuid,
    pub order_id: String,
    pub amount: Decimal,
    pub amount_minor: i64,
    pub currency: String,
    pub key_id: Option<String>,
    /// True when an existing order for the same total was handed back.
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundResult {
    pub booking: Booking,
    pub refund_id: Option<String>,
    pub already_refunded: bool,
    pub reversal: Option<ReversalReport>,
}

pub struct PaymentService {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    reconciler: PaymentReconciler,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        require_webhook_signature: bool,
    ) -> Self {
        let reconciler =
            PaymentReconciler::new(store.clone(), gateway.clone(), require_webhook_signature);
        Self {
            store,
            gateway,
            reconciler,
        }
    }

    /// Create a gateway order for an APPROVED, unpaid booking.
    ///
    /// The price is recalculated first. An order already created for the
    /// current total is reused; a stale one is replaced.
    #[instrument(skip(self))]
    pub async fn create_order(
        &self,
        advertiser_id: Uuid,
        booking_id: Uuid,
    ) -> Result<OrderDetails, AppError> {
        let booking = {
            let mut uow = self.store.begin().await?;
            let mut booking = lock_existing(uow.as_mut(), booking_id).await?;
            ensure_advertiser(&booking, advertiser_id)?;
            ensure_payable(&booking)?;

            let repriced = recalculate_in(uow.as_mut(), &mut booking, Some(advertiser_id)).await?;
            if repriced {
                uow.commit().await?;
            }
            booking
        };

        if booking.has_live_order() {
            if let Some(order_id) = booking.gateway_order_id.clone() {
                info!(booking_id = %booking_id, order_id = %order_id, "Reusing payment order");
                return self.reused_order(&booking, order_id);
            }
        }

        let amount_minor = to_minor_units(booking.total_price)?;
        let order = self
            .gateway
            .create_order(amount_minor, &booking.currency, &booking.receipt())
            .await?;

        let mut uow = self.store.begin().await?;
        let mut current = lock_existing(uow.as_mut(), booking_id).await?;
        ensure_payable(&current)?;
        if current.has_live_order() {
            if let Some(order_id) = current.gateway_order_id.clone() {
                // A concurrent request stored its order first; ours is never shown to the payer.
                warn!(
                    booking_id = %booking_id,
                    order_id = %order_id,
                    abandoned_order_id = %order.order_id,
                    "Payment order created concurrently, reusing the stored one"
                );
                return self.reused_order(&current, order_id);
            }
        }
        if current.total_price != booking.total_price {
            warn!(
                booking_id = %booking_id,
                order_id = %order.order_id,
                ordered = %booking.total_price,
                total = %current.total_price,
                "Booking repriced while the order was being created"
            );
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Booking {} was repriced while the order was being created, retry",
                booking_id
            )));
        }

        current.gateway_order_id = Some(order.order_id.clone());
        current.order_amount = Some(current.total_price);
        transition_in(
            uow.as_mut(),
            &mut current,
            Transition::OrderCreated,
            AuditEntry::new(booking_id, AuditAction::OrderCreated, Some(advertiser_id))
                .with_detail(order.order_id.clone()),
        )
        .await?;
        uow.commit().await?;

        info!(
            booking_id = %booking_id,
            order_id = %order.order_id,
            amount_minor,
            "Payment order created"
        );
        Ok(OrderDetails {
            booking_id,
            order_id: order.order_id,
            amount: current.total_price,
            amount_minor,
            currency: current.currency,
            key_id: self.gateway.public_key_id(),
            reused: false,
        })
    }

    fn reused_order(&self, booking: &Booking, order_id: String) -> Result<OrderDetails, AppError> {
        Ok(OrderDetails {
            booking_id: booking.booking_id,
            order_id,
            amount: booking.total_price,
            amount_minor: to_minor_units(booking.total_price)?,
            currency: booking.currency.clone(),
            key_id: self.gateway.public_key_id(),
            reused: true,
        })
    }

    pub async fn verify(
        &self,
        advertiser_id: Option<Uuid>,
        request: VerifyPayment,
    ) -> Result<PaymentOutcome, AppError> {
        self.reconciler.verify(advertiser_id, request).await
    }

    pub async fn handle_webhook(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, AppError> {
        self.reconciler.handle_webhook(body, signature).await
    }

    /// Full refund of a paid booking: gateway refund, then settlement
    /// reversal and `CANCELLED`/`REFUNDED`. Refunding twice returns the
    /// booking unchanged.
    #[instrument(skip(self))]
    pub async fn refund(
        &self,
        advertiser_id: Uuid,
        booking_id: Uuid,
    ) -> Result<RefundResult, AppError> {
        let payment_id = {
            let mut uow = self.store.begin().await?;
            let booking = lock_existing(uow.as_mut(), booking_id).await?;
            ensure_advertiser(&booking, advertiser_id)?;

            if booking.payment_status == PaymentStatus::Refunded {
                return Ok(RefundResult {
                    booking,
                    refund_id: None,
                    already_refunded: true,
                    reversal: None,
                });
            }
            if !booking.is_paid() {
                return Err(AppError::business("Only PAID bookings can be refunded"));
            }
            booking.gateway_payment_id.clone().ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Paid booking {} has no gateway payment id",
                    booking_id
                ))
            })?
        };

        let refund = self
            .gateway
            .refund(&payment_id, &refund_reference(booking_id))
            .await?;

        let mut uow = self.store.begin().await?;
        let mut booking = lock_existing(uow.as_mut(), booking_id).await?;
        if booking.payment_status == PaymentStatus::Refunded {
            return Ok(RefundResult {
                booking,
                refund_id: Some(refund.refund_id),
                already_refunded: true,
                reversal: None,
            });
        }

        let reversal = SettlementLedger::reverse_in(uow.as_mut(), &booking).await?;
        transition_in(
            uow.as_mut(),
            &mut booking,
            Transition::Refund,
            AuditEntry::new(booking_id, AuditAction::Refunded, Some(advertiser_id))
                .with_detail(refund.refund_id.clone()),
        )
        .await?;

        if let Some(mut record) = uow.payment_record(&payment_id).await? {
            record.refund_id = Some(refund.refund_id.clone());
            record.refund_status = Some(if refund.status == "processed" {
                RefundStatus::Refunded
            } else {
                RefundStatus::Pending
            });
            record.updated_utc = Utc::now();
            uow.update_payment_record(&record).await?;
        }
        uow.commit().await?;

        info!(
            booking_id = %booking_id,
            refund_id = %refund.refund_id,
            shortfalls = reversal.shortfalls.len(),
            "Booking refunded"
        );
        Ok(RefundResult {
            booking,
            refund_id: Some(refund.refund_id),
            already_refunded: false,
            reversal: Some(reversal),
        })
    }
}

fn ensure_payable(booking: &Booking) -> Result<(), AppError> {
    if booking.is_paid() {
        return Err(AppError::business("Booking is already paid"));
    }
    if booking.status != BookingStatus::Approved {
        return Err(AppError::business(format!(
            "Only APPROVED bookings can be paid, booking is {}",
            booking.status
        )));
    }
    Ok(())
}
