use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use service_core::error::AppError;

use crate::services::reconciler::WebhookOutcome;
use crate::startup::AppState;

pub const SIGNATURE_HEADER: &str = "X-Razorpay-Signature";

/// Razorpay webhook receiver.
///
/// Anything the service decides not to act on is still acknowledged with
/// 200 so the gateway stops redelivering it. Signature failures are not.
pub async fn razorpay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookOutcome>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state.payments.handle_webhook(&body, signature).await?;
    tracing::info!(outcome = ?outcome, "Webhook processed");
    Ok(Json(outcome))
}
