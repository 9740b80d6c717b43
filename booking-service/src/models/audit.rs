use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Created,
    Approved,
    Rejected,
    DiscountApplied,
    DiscountRemoved,
    PriceRecalculated,
    OrderCreated,
    PaymentFailed,
    Paid,
    Cancelled,
    CancelledNoRefund,
    Refunded,
    Completed,
}

/// Append-only history of what happened to a booking.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: Uuid,
    pub booking_id: Uuid,
    pub action: AuditAction,
    pub detail: Option<String>,
    pub actor_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(booking_id: Uuid, action: AuditAction, actor_id: Option<Uuid>) -> Self {
        Self {
            audit_id: Uuid::new_v4(),
            booking_id,
            action,
            detail: None,
            actor_id,
            created_utc: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
