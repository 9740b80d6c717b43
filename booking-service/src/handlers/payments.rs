//! Payment order, verification and refund endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::handlers::ActorContext;
use crate::services::payment::{CreateOrder, OrderDetails, RefundResult};
use crate::services::reconciler::{PaymentOutcome, VerifyPayment};
use crate::startup::AppState;

/// Create (or reuse) the gateway order for an approved booking.
pub async fn create_order(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(payload): Json<CreateOrder>,
) -> Result<(StatusCode, Json<OrderDetails>), AppError> {
    payload.validate()?;
    tracing::info!(
        booking_id = %payload.booking_id,
        user_id = %actor.user_id,
        "Creating payment order"
    );

    let order = state
        .payments
        .create_order(actor.user_id, payload.booking_id)
        .await?;
    let status = if order.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(order)))
}

/// Client-side confirmation after checkout.
pub async fn verify_payment(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(payload): Json<VerifyPayment>,
) -> Result<Json<PaymentOutcome>, AppError> {
    tracing::info!(
        order_id = %payload.order_id,
        payment_id = %payload.payment_id,
        user_id = %actor.user_id,
        "Verifying payment"
    );

    let outcome = state.payments.verify(Some(actor.user_id), payload).await?;
    Ok(Json(outcome))
}

pub async fn refund_booking(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<RefundResult>, AppError> {
    tracing::info!(booking_id = %booking_id, user_id = %actor.user_id, "Refund requested");

    let result = state.payments.refund(actor.user_id, booking_id).await?;
    Ok(Json(result))
}
