use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The slice of a billboard listing that pricing and settlement need.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Billboard {
    pub billboard_id: Uuid,
    pub owner_id: Uuid,
    pub price_per_day: Decimal,
    pub active: bool,
    pub updated_utc: DateTime<Utc>,
}

impl Billboard {
    pub fn new(owner_id: Uuid, price_per_day: Decimal) -> Self {
        Self {
            billboard_id: Uuid::new_v4(),
            owner_id,
            price_per_day,
            active: true,
            updated_utc: Utc::now(),
        }
    }
}
