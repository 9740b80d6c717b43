//! Razorpay client: Orders and Refunds APIs, signature checks, webhook payloads.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::retry::{retry_app_call, RetryConfig};
use service_core::utils::verify_hmac_sha256_hex;
use tracing::{debug, info, instrument};

use crate::config::RazorpayConfig;
use crate::services::gateway::{GatewayOrder, GatewayRefund, PaymentGateway};
use crate::services::metrics::GATEWAY_CALLS_TOTAL;

#[derive(Clone)]
pub struct RazorpayClient {
    client: Client,
    config: RazorpayConfig,
    retry: RetryConfig,
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
}

#[derive(Debug, Deserialize)]
struct RazorpayOrder {
    id: String,
    amount: i64,
    currency: String,
}

#[derive(Debug, Serialize)]
struct RefundRequest<'a> {
    receipt: &'a str,
}

#[derive(Debug, Deserialize)]
struct RazorpayRefund {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RazorpayError {
    error: RazorpayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct RazorpayErrorDetail {
    code: String,
    description: String,
}

/// Razorpay webhook envelope. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    #[serde(default)]
    pub payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    pub payment: Option<EntityWrapper<PaymentEntity>>,
    pub order: Option<EntityWrapper<OrderEntity>>,
    pub refund: Option<EntityWrapper<RefundEntity>>,
}

#[derive(Debug, Deserialize)]
pub struct EntityWrapper<T> {
    pub entity: T,
}

#[derive(Debug, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    /// Minor units.
    pub amount: i64,
    pub order_id: Option<String>,
    pub status: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrderEntity {
    pub id: String,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct RefundEntity {
    pub id: String,
    pub payment_id: String,
    pub status: Option<String>,
}

impl WebhookEvent {
    pub fn parse(body: &[u8]) -> Result<Self, AppError> {
        serde_json::from_slice(body)
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Malformed webhook payload: {}", e)))
    }

    /// `(order_id, payment_id, amount_minor)` of a captured payment.
    pub fn captured_payment(&self) -> Option<(String, String, i64)> {
        let payment = &self.payload.payment.as_ref()?.entity;
        let order_id = payment
            .order_id
            .clone()
            .or_else(|| self.payload.order.as_ref().map(|o| o.entity.id.clone()))?;
        Some((order_id, payment.id.clone(), payment.amount))
    }
}

impl RazorpayClient {
    pub fn new(config: RazorpayConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Razorpay client: {}", e)))?;
        let retry = RetryConfig::with_max_retries(config.max_retries);
        Ok(Self {
            client,
            config,
            retry,
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.config.key_id.is_empty() && !self.config.key_secret.expose_secret().is_empty()
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        operation: &'static str,
        path: &str,
        body: &B,
    ) -> Result<R, AppError> {
        if !self.is_configured() {
            return Err(AppError::ServiceUnavailable);
        }

        let url = format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .json(body)
            .send()
            .await
            .map_err(|e| {
                GATEWAY_CALLS_TOTAL
                    .with_label_values(&[operation, "transport_error"])
                    .inc();
                if e.is_timeout() {
                    AppError::GatewayTimeout(format!("{}: {}", operation, e))
                } else {
                    AppError::BadGateway(format!("{}: {}", operation, e))
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            AppError::BadGateway(format!("{}: unreadable response: {}", operation, e))
        })?;

        debug!(status = %status, operation, "Razorpay response");
        GATEWAY_CALLS_TOTAL
            .with_label_values(&[operation, status.as_str()])
            .inc();

        if status.is_success() {
            return serde_json::from_str(&text).map_err(|e| {
                AppError::BadGateway(format!("{}: malformed response: {}", operation, e))
            });
        }

        let detail = serde_json::from_str::<RazorpayError>(&text)
            .map(|e| format!("{}: {}", e.error.code, e.error.description))
            .unwrap_or_else(|_| text.clone());

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(AppError::BadGateway(format!(
                "{} returned {}: {}",
                operation, status, detail
            )))
        } else {
            Err(AppError::BadRequest(anyhow::anyhow!(
                "{} rejected by Razorpay: {}",
                operation,
                detail
            )))
        }
    }
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    #[instrument(skip(self))]
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder, AppError> {
        let request = CreateOrderRequest {
            amount: amount_minor,
            currency,
            receipt,
        };

        let order: RazorpayOrder = retry_app_call(&self.retry, "razorpay_create_order", || {
            self.post("create_order", "/orders", &request)
        })
        .await?;

        info!(
            order_id = %order.id,
            amount = order.amount,
            currency = %order.currency,
            "Razorpay order created"
        );

        Ok(GatewayOrder {
            order_id: order.id,
            amount_minor: order.amount,
            currency: order.currency,
        })
    }

    #[instrument(skip(self))]
    async fn refund(&self, payment_id: &str, receipt: &str) -> Result<GatewayRefund, AppError> {
        let path = format!("/payments/{}/refund", payment_id);
        let request = RefundRequest { receipt };

        let refund: RazorpayRefund = retry_app_call(&self.retry, "razorpay_refund", || {
            self.post("refund", &path, &request)
        })
        .await?;

        info!(refund_id = %refund.id, payment_id, status = %refund.status, "Razorpay refund created");

        Ok(GatewayRefund {
            refund_id: refund.id,
            status: refund.status,
        })
    }

    fn verify_payment_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        let payload = format!("{}|{}", order_id, payment_id);
        verify_hmac_sha256_hex(
            self.config.key_secret.expose_secret(),
            payload.as_bytes(),
            signature,
        )
        .unwrap_or(false)
    }

    fn verify_webhook_signature(&self, body: &[u8], signature: &str) -> bool {
        verify_hmac_sha256_hex(self.config.webhook_secret.expose_secret(), body, signature)
            .unwrap_or(false)
    }

    fn public_key_id(&self) -> Option<String> {
        Some(self.config.key_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;
    use service_core::utils::hmac_sha256_hex;
    use std::time::Duration;

    fn test_config(base: &str) -> RazorpayConfig {
        RazorpayConfig {
            key_id: "rzp_test_key".to_string(),
            key_secret: Secret::new("test_secret".to_string()),
            webhook_secret: Secret::new("webhook_secret".to_string()),
            api_base_url: base.to_string(),
            timeout: Duration::from_secs(2),
            max_retries: 0,
        }
    }

    #[test]
    fn verifies_order_payment_signature() {
        let client = RazorpayClient::new(test_config("http://localhost")).unwrap();
        let sig = hmac_sha256_hex("test_secret", b"order_1|pay_1").unwrap();

        assert!(client.verify_payment_signature("order_1", "pay_1", &sig));
        assert!(!client.verify_payment_signature("order_1", "pay_2", &sig));
        assert!(!client.verify_payment_signature("order_1", "pay_1", "deadbeef"));
    }

    #[test]
    fn verifies_webhook_body_signature() {
        let client = RazorpayClient::new(test_config("http://localhost")).unwrap();
        let body = br#"{"event":"payment.captured"}"#;
        let sig = hmac_sha256_hex("webhook_secret", body).unwrap();

        assert!(client.verify_webhook_signature(body, &sig));
        assert!(!client.verify_webhook_signature(b"{}", &sig));
    }

    #[test]
    fn captured_payment_falls_back_to_order_entity() {
        let body = br#"{
            "event": "order.paid",
            "payload": {
                "payment": { "entity": { "id": "pay_9", "amount": 407100 } },
                "order": { "entity": { "id": "order_9", "amount": 407100 } }
            }
        }"#;
        let event = WebhookEvent::parse(body).unwrap();
        assert_eq!(
            event.captured_payment(),
            Some(("order_9".to_string(), "pay_9".to_string(), 407100))
        );
    }

    #[test]
    fn malformed_webhook_is_bad_request() {
        assert!(matches!(
            WebhookEvent::parse(b"not json"),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn unconfigured_client_reports_it() {
        let mut config = test_config("http://localhost");
        config.key_id = String::new();
        assert!(!RazorpayClient::new(config).unwrap().is_configured());
    }
}
