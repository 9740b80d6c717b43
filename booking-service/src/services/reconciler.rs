//! Payment confirmation from two entry points: the paying client's verify call
//! and the gateway's webhook. Both funnel into [`finalize_in`], under the
//! booking row lock, after checking for PAID first. Whoever gets the lock
//! second sees PAID and exits without doing anything.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    next_state, AuditAction, AuditEntry, Booking, PaymentRecord, PaymentSource, PaymentSplit,
    RefundStatus, Transition,
};
use crate::services::booking::{ensure_advertiser, transition_in};
use crate::services::gateway::{from_minor_units, PaymentGateway};
use crate::services::metrics::PAYMENT_CONFIRMATIONS_TOTAL;
use crate::services::razorpay::WebhookEvent;
use crate::services::settlement::SettlementLedger;
use crate::services::store::{Store, UnitOfWork};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct VerifyPayment {
    #[validate(length(min = 1, max = 64))]
    pub order_id: String,
    #[validate(length(min = 1, max = 64))]
    pub payment_id: String,
    #[validate(length(min = 1, max = 128))]
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Paid {
        booking: Booking,
        split: PaymentSplit,
    },
    /// Another confirmation got there first.
    AlreadyPaid { booking: Booking },
}

impl PaymentOutcome {
    pub fn booking(&self) -> &Booking {
        match self {
            Self::Paid { booking, .. } | Self::AlreadyPaid { booking } => booking,
        }
    }
}

/// What a webhook delivery did. Every variant is acknowledged to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Settled { booking_id: Uuid },
    AlreadyPaid { booking_id: Uuid },
    PaymentFailedRecorded { booking_id: Uuid },
    RefundRecorded { payment_id: String },
    Ignored { reason: String },
}

impl WebhookOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Settled { .. } => "settled",
            Self::AlreadyPaid { .. } => "already_paid",
            Self::PaymentFailedRecorded { .. } => "payment_failed",
            Self::RefundRecorded { .. } => "refund_recorded",
            Self::Ignored { .. } => "ignored",
        }
    }
}

/// Mark the locked booking PAID, record the payment and settle it.
pub(crate) async fn finalize_in(
    uow: &mut dyn UnitOfWork,
    booking: &mut Booking,
    payment_id: &str,
    signature: Option<&str>,
    source: PaymentSource,
) -> Result<PaymentSplit, AppError> {
    // Fresh read: this is the rate that gets locked in.
    let settings = uow.settings().await?;
    if booking.locked_commission_percent.is_none() {
        booking.locked_commission_percent = Some(settings.commission_percent);
    }
    let now = Utc::now();
    booking.gateway_payment_id = Some(payment_id.to_string());
    booking.gateway_signature = signature.map(str::to_string);
    booking.paid_utc = Some(now);

    let booking_id = booking.booking_id;
    transition_in(
        uow,
        booking,
        Transition::MarkPaid,
        AuditEntry::new(booking_id, AuditAction::Paid, None)
            .with_detail(source.as_str()),
    )
    .await?;

    if uow.payment_record(payment_id).await?.is_none() {
        let record = PaymentRecord {
            record_id: Uuid::new_v4(),
            booking_id: booking.booking_id,
            gateway_order_id: booking.gateway_order_id.clone().unwrap_or_default(),
            gateway_payment_id: payment_id.to_string(),
            gateway_signature: signature.map(str::to_string),
            amount: booking.total_price,
            currency: booking.currency.clone(),
            source,
            refund_id: None,
            refund_status: None,
            paid_utc: now,
            updated_utc: now,
        };
        uow.insert_payment_record(&record).await?;
    }

    let outcome = SettlementLedger::settle_in(uow, booking).await?;
    Ok(outcome.split().clone())
}

pub struct PaymentReconciler {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    require_webhook_signature: bool,
}

impl PaymentReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        require_webhook_signature: bool,
    ) -> Self {
        Self {
            store,
            gateway,
            require_webhook_signature,
        }
    }

    /// Synchronous confirmation from the paying client. `actor` is checked
    /// against the booking's advertiser when present.
    #[instrument(skip(self, request), fields(order_id = %request.order_id, payment_id = %request.payment_id))]
    pub async fn verify(
        &self,
        actor: Option<Uuid>,
        request: VerifyPayment,
    ) -> Result<PaymentOutcome, AppError> {
        request.validate()?;

        let mut uow = self.store.begin().await?;
        let mut booking = uow
            .lock_booking_by_order(&request.order_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "No booking for order {}",
                    request.order_id
                ))
            })?;
        if let Some(actor) = actor {
            ensure_advertiser(&booking, actor)?;
        }

        if booking.is_paid() {
            PAYMENT_CONFIRMATIONS_TOTAL
                .with_label_values(&["verify", "already_paid"])
                .inc();
            info!(booking_id = %booking.booking_id, "Payment already confirmed");
            return Ok(PaymentOutcome::AlreadyPaid { booking });
        }

        if !self.gateway.verify_payment_signature(
            &request.order_id,
            &request.payment_id,
            &request.signature,
        ) {
            PAYMENT_CONFIRMATIONS_TOTAL
                .with_label_values(&["verify", "invalid_signature"])
                .inc();
            warn!(booking_id = %booking.booking_id, "Payment signature mismatch");

            if next_state(booking.status, booking.payment_status, Transition::PaymentFailed)
                .is_ok()
            {
                let booking_id = booking.booking_id;
                transition_in(
                    uow.as_mut(),
                    &mut booking,
                    Transition::PaymentFailed,
                    AuditEntry::new(booking_id, AuditAction::PaymentFailed, actor)
                        .with_detail("invalid signature"),
                )
                .await?;
                uow.commit().await?;
            }
            return Err(AppError::InvalidSignature(format!(
                "Signature does not match order {}",
                request.order_id
            )));
        }

        let split = finalize_in(
            uow.as_mut(),
            &mut booking,
            &request.payment_id,
            Some(&request.signature),
            PaymentSource::Verify,
        )
        .await?;
        uow.commit().await?;

        PAYMENT_CONFIRMATIONS_TOTAL
            .with_label_values(&["verify", "paid"])
            .inc();
        info!(booking_id = %booking.booking_id, "Payment verified and settled");
        Ok(PaymentOutcome::Paid { booking, split })
    }

    /// Asynchronous gateway callback. Safe to deliver any number of times.
    ///
    /// A signature that is present must match. A missing one is tolerated
    /// unless the service is configured to require it.
    #[instrument(skip(self, body, signature))]
    pub async fn handle_webhook(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, AppError> {
        match signature {
            Some(sig) if !self.gateway.verify_webhook_signature(body, sig) => {
                PAYMENT_CONFIRMATIONS_TOTAL
                    .with_label_values(&["webhook", "invalid_signature"])
                    .inc();
                warn!("Webhook signature mismatch, payload rejected");
                return Err(AppError::InvalidSignature(
                    "Webhook signature mismatch".to_string(),
                ));
            }
            Some(_) => {}
            None if self.require_webhook_signature => {
                return Err(AppError::Unauthorized(anyhow::anyhow!(
                    "Webhook signature header is required"
                )));
            }
            None => warn!("Webhook received without signature, processing as unverified"),
        }

        let event = WebhookEvent::parse(body)?;
        let outcome = match event.event.as_str() {
            "payment.captured" | "order.paid" => self.on_captured(&event).await?,
            "payment.failed" => self.on_failed(&event).await?,
            "refund.created" | "refund.processed" | "refund.failed" => {
                self.on_refund(&event).await?
            }
            other => {
                info!(event = other, "Unhandled webhook event");
                WebhookOutcome::ignored(format!("unhandled event {}", other))
            }
        };

        PAYMENT_CONFIRMATIONS_TOTAL
            .with_label_values(&["webhook", outcome.label()])
            .inc();
        Ok(outcome)
    }

    async fn on_captured(&self, event: &WebhookEvent) -> Result<WebhookOutcome, AppError> {
        let Some((order_id, payment_id, amount_minor)) = event.captured_payment() else {
            return Ok(WebhookOutcome::ignored("payment entity missing"));
        };

        let mut uow = self.store.begin().await?;
        let Some(mut booking) = uow.lock_booking_by_order(&order_id).await? else {
            info!(order_id = %order_id, "Webhook for unknown order ignored");
            return Ok(WebhookOutcome::ignored("unknown order"));
        };

        if booking.is_paid() {
            info!(booking_id = %booking.booking_id, "Webhook for already paid booking");
            return Ok(WebhookOutcome::AlreadyPaid {
                booking_id: booking.booking_id,
            });
        }

        let paid = from_minor_units(amount_minor);
        if paid != booking.total_price {
            error!(
                booking_id = %booking.booking_id,
                order_id = %order_id,
                payment_id = %payment_id,
                paid = %paid,
                expected = %booking.total_price,
                "Captured amount does not match booking total, manual review required"
            );
            return Ok(WebhookOutcome::ignored("amount mismatch"));
        }

        if let Err(e) = next_state(booking.status, booking.payment_status, Transition::MarkPaid) {
            error!(
                booking_id = %booking.booking_id,
                payment_id = %payment_id,
                status = %booking.status,
                payment_status = %booking.payment_status,
                error = %e,
                "Captured payment for a booking that cannot be paid, manual refund required"
            );
            return Ok(WebhookOutcome::ignored("booking not payable"));
        }

        finalize_in(
            uow.as_mut(),
            &mut booking,
            &payment_id,
            None,
            PaymentSource::Webhook,
        )
        .await?;
        uow.commit().await?;

        info!(booking_id = %booking.booking_id, payment_id = %payment_id, "Webhook settled booking");
        Ok(WebhookOutcome::Settled {
            booking_id: booking.booking_id,
        })
    }

    async fn on_failed(&self, event: &WebhookEvent) -> Result<WebhookOutcome, AppError> {
        let Some(payment) = event.payload.payment.as_ref().map(|p| &p.entity) else {
            return Ok(WebhookOutcome::ignored("payment entity missing"));
        };
        let Some(order_id) = payment.order_id.as_deref() else {
            return Ok(WebhookOutcome::ignored("payment has no order"));
        };

        let mut uow = self.store.begin().await?;
        let Some(mut booking) = uow.lock_booking_by_order(order_id).await? else {
            return Ok(WebhookOutcome::ignored("unknown order"));
        };
        if booking.is_paid() {
            return Ok(WebhookOutcome::AlreadyPaid {
                booking_id: booking.booking_id,
            });
        }
        if next_state(booking.status, booking.payment_status, Transition::PaymentFailed).is_err()
        {
            return Ok(WebhookOutcome::ignored("booking not awaiting payment"));
        }

        let reason = payment
            .error_description
            .clone()
            .unwrap_or_else(|| "payment failed".to_string());
        let booking_id = booking.booking_id;
        transition_in(
            uow.as_mut(),
            &mut booking,
            Transition::PaymentFailed,
            AuditEntry::new(booking_id, AuditAction::PaymentFailed, None)
                .with_detail(reason),
        )
        .await?;
        uow.commit().await?;

        Ok(WebhookOutcome::PaymentFailedRecorded {
            booking_id: booking.booking_id,
        })
    }

    async fn on_refund(&self, event: &WebhookEvent) -> Result<WebhookOutcome, AppError> {
        let Some(refund) = event.payload.refund.as_ref().map(|r| &r.entity) else {
            return Ok(WebhookOutcome::ignored("refund entity missing"));
        };

        let mut uow = self.store.begin().await?;
        let Some(mut record) = uow.payment_record(&refund.payment_id).await? else {
            return Ok(WebhookOutcome::ignored("unknown payment"));
        };

        record.refund_id = Some(refund.id.clone());
        record.refund_status = Some(match refund.status.as_deref() {
            Some("processed") => RefundStatus::Refunded,
            Some("failed") => RefundStatus::Failed,
            _ => RefundStatus::Pending,
        });
        record.updated_utc = Utc::now();
        uow.update_payment_record(&record).await?;
        uow.commit().await?;

        info!(
            payment_id = %refund.payment_id,
            refund_id = %refund.id,
            "Refund status recorded"
        );
        Ok(WebhookOutcome::RefundRecorded {
            payment_id: refund.payment_id.clone(),
        })
    }
}
