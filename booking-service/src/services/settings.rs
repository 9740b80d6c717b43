//! Platform settings reader with a short-lived cache.
//!
//! Price previews tolerate a stale cached read. Anything that locks a rate
//! into a booking reads through the open unit of work instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::models::PlatformSettings;
use crate::services::store::Store;

struct CachedSettings {
    settings: PlatformSettings,
    fetched_at: Instant,
}

pub struct SettingsProvider {
    store: Arc<dyn Store>,
    ttl: Duration,
    cache: RwLock<Option<CachedSettings>>,
}

impl SettingsProvider {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Possibly stale settings.
    pub async fn get(&self) -> Result<PlatformSettings, AppError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.settings.clone());
                }
            }
        }
        self.get_fresh().await
    }

    /// Settings read straight from the store; refreshes the cache.
    pub async fn get_fresh(&self) -> Result<PlatformSettings, AppError> {
        let mut uow = self.store.begin().await?;
        let settings = uow.settings().await?;
        uow.commit().await?;

        *self.cache.write().await = Some(CachedSettings {
            settings: settings.clone(),
            fetched_at: Instant::now(),
        });
        Ok(settings)
    }

    #[instrument(skip(self))]
    pub async fn update(
        &self,
        commission_percent: Decimal,
        gst_percent: Decimal,
        currency: Option<String>,
    ) -> Result<PlatformSettings, AppError> {
        let mut uow = self.store.begin().await?;
        let current = uow.settings().await?;

        let updated = PlatformSettings {
            commission_percent,
            gst_percent,
            currency: currency.unwrap_or(current.currency),
            updated_utc: Utc::now(),
        };
        updated.validate()?;

        uow.save_settings(&updated).await?;
        uow.commit().await?;
        self.invalidate().await;

        info!(
            commission_percent = %updated.commission_percent,
            gst_percent = %updated.gst_percent,
            "Platform settings updated"
        );
        Ok(updated)
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}
