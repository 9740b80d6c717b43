use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;

/// Platform-wide pricing parameters. Stored as a single row keyed `GLOBAL`.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct PlatformSettings {
    pub commission_percent: Decimal,
    pub gst_percent: Decimal,
    pub currency: String,
    pub updated_utc: DateTime<Utc>,
}

impl PlatformSettings {
    pub const KEY: &'static str = "GLOBAL";

    pub fn validate(&self) -> Result<(), AppError> {
        let hundred = Decimal::ONE_HUNDRED;
        if self.commission_percent < Decimal::ZERO || self.commission_percent > hundred {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Commission must be between 0 and 100"
            )));
        }
        if self.gst_percent < Decimal::ZERO || self.gst_percent > hundred {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "GST must be between 0 and 100"
            )));
        }
        if self.currency.len() != 3 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Currency must be a 3-letter ISO code"
            )));
        }
        Ok(())
    }
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            commission_percent: Decimal::from(15),
            gst_percent: Decimal::from(18),
            currency: "INR".to_string(),
            updated_utc: Utc::now(),
        }
    }
}
