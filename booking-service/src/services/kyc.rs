//! Advertiser KYC lookup, consumed only when a booking is created.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use service_core::error::AppError;
use tokio::sync::RwLock;
use tracing::{instrument, warn};
use uuid::Uuid;

#[async_trait]
pub trait KycCheck: Send + Sync {
    async fn is_approved(&self, user_id: Uuid) -> Result<bool, AppError>;
}

/// Fixed set of approved users, for development and tests.
#[derive(Default)]
pub struct StaticKycDirectory {
    approved: RwLock<HashSet<Uuid>>,
}

impl StaticKycDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn approve(&self, user_id: Uuid) {
        self.approved.write().await.insert(user_id);
    }

    pub async fn revoke(&self, user_id: Uuid) {
        self.approved.write().await.remove(&user_id);
    }
}

#[async_trait]
impl KycCheck for StaticKycDirectory {
    async fn is_approved(&self, user_id: Uuid) -> Result<bool, AppError> {
        Ok(self.approved.read().await.contains(&user_id))
    }
}

#[derive(Debug, Deserialize)]
struct KycStatusResponse {
    kyc_status: String,
}

/// Asks the identity service for the user's KYC status.
pub struct HttpKycCheck {
    client: reqwest::Client,
    base_url: String,
}

impl HttpKycCheck {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("KYC client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl KycCheck for HttpKycCheck {
    #[instrument(skip(self))]
    async fn is_approved(&self, user_id: Uuid) -> Result<bool, AppError> {
        let url = format!("{}/internal/users/{}/kyc", self.base_url, user_id);
        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::GatewayTimeout(format!("KYC lookup timed out: {}", e))
            } else {
                AppError::BadGateway(format!("KYC lookup failed: {}", e))
            }
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!(user_id = %user_id, "KYC record not found");
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(AppError::BadGateway(format!(
                "KYC service returned {}",
                response.status()
            )));
        }

        let body: KycStatusResponse = response
            .json()
            .await
            .map_err(|e| AppError::BadGateway(format!("Malformed KYC response: {}", e)))?;

        Ok(body.kyc_status.eq_ignore_ascii_case("APPROVED"))
    }
}
