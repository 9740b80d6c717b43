//! Payment gateway boundary. Everything past this trait is untrusted network.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub order_id: String,
    /// Minor units (paise).
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub refund_id: String,
    pub status: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder, AppError>;

    /// Full refund of a captured payment.
    async fn refund(&self, payment_id: &str, receipt: &str) -> Result<GatewayRefund, AppError>;

    /// HMAC-SHA256 over `order_id|payment_id`, lowercase hex.
    fn verify_payment_signature(&self, order_id: &str, payment_id: &str, signature: &str)
    -> bool;

    /// HMAC-SHA256 over the raw webhook body.
    fn verify_webhook_signature(&self, body: &[u8], signature: &str) -> bool;

    /// Public key id the client-side checkout needs, if any.
    fn public_key_id(&self) -> Option<String> {
        None
    }
}

/// Convert a currency amount to integral minor units.
pub fn to_minor_units(amount: Decimal) -> Result<i64, AppError> {
    let minor = amount * Decimal::ONE_HUNDRED;
    if minor.fract() != Decimal::ZERO {
        return Err(AppError::InternalError(anyhow::anyhow!(
            "Amount {} has sub-paise precision",
            amount
        )));
    }
    minor
        .to_i64()
        .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("Amount {} out of range", amount)))
}

pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn minor_unit_conversion() {
        assert_eq!(to_minor_units(Decimal::from_str("3256.8").unwrap()).unwrap(), 325680);
        assert_eq!(to_minor_units(Decimal::from(4071)).unwrap(), 407100);
        assert!(to_minor_units(Decimal::from_str("1.005").unwrap()).is_err());
        assert_eq!(from_minor_units(325680), Decimal::from_str("3256.80").unwrap());
    }
}
