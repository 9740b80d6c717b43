//! PostgreSQL store. Row locks come from `SELECT ... FOR UPDATE`; a per-transaction
//! `lock_timeout` makes a losing contender fail fast instead of queueing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

use super::{Store, UnitOfWork};
use crate::models::{
    AuditEntry, Billboard, Booking, BookingStatus, PaymentRecord, PaymentSplit, PlatformSettings,
    RefundShortfall, Wallet, WalletKey, WalletTransaction,
};
use crate::services::metrics::STORE_OPERATION_DURATION;

const BOOKING_COLUMNS: &str = "booking_id, advertiser_id, billboard_id, owner_id, start_date, end_date, \
     status, payment_status, original_base_amount, discount_percent, discount_amount, base_amount, \
     commission_percent, commission_amount, gst_percent, gst_amount, total_price, currency, \
     locked_commission_percent, price_per_day_at_booking, gateway_order_id, order_amount, \
     gateway_payment_id, gateway_signature, paid_utc, created_utc, updated_utc";

const SPLIT_COLUMNS: &str = "split_id, booking_id, owner_id, owner_amount, platform_commission, \
     gst_amount, total_amount, settled, refunded, created_utc, settled_utc, refunded_utc";

const RECORD_COLUMNS: &str = "record_id, booking_id, gateway_order_id, gateway_payment_id, \
     gateway_signature, amount, currency, source, refund_id, refund_status, paid_utc, updated_utc";

/// Map a driver error, turning constraint and lock failures into `Conflict`.
fn map_db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(anyhow::anyhow!("{}: duplicate row", operation))
        }
        // lock_not_available
        sqlx::Error::Database(ref db_err) if db_err.code().as_deref() == Some("55P03") => {
            AppError::Conflict(anyhow::anyhow!(
                "{}: row is locked by a concurrent operation, retry",
                operation
            ))
        }
        _ => AppError::DatabaseError(anyhow::anyhow!("{} failed: {}", operation, e)),
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgStore {
    #[instrument(skip(database_url), fields(service = "booking-service"))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        lock_timeout: Duration,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool, lock_timeout })
    }

    pub fn from_pool(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, AppError> {
        let mut tx = self.pool.begin().await.map_err(map_db_error("begin"))?;

        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await
        .map_err(map_db_error("set lock_timeout"))?;

        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }
}

pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl PgUnitOfWork {
    async fn fetch_booking(
        &mut self,
        clause: &str,
        key: BookingKey<'_>,
        operation: &'static str,
    ) -> Result<Option<Booking>, AppError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let sql = format!("SELECT {} FROM bookings WHERE {}", BOOKING_COLUMNS, clause);
        let query = sqlx::query_as::<_, Booking>(&sql);
        let query = match key {
            BookingKey::Id(id) => query.bind(id),
            BookingKey::Order(order_id) => query.bind(order_id),
        };
        let booking = query
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error(operation))?;

        timer.observe_duration();
        Ok(booking)
    }
}

enum BookingKey<'a> {
    Id(Uuid),
    Order(&'a str),
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn billboard(&mut self, billboard_id: Uuid) -> Result<Option<Billboard>, AppError> {
        sqlx::query_as::<_, Billboard>(
            r#"
            SELECT billboard_id, owner_id, price_per_day, active, updated_utc
            FROM billboards
            WHERE billboard_id = $1
            "#,
        )
        .bind(billboard_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error("get billboard"))
    }

    async fn lock_billboard(&mut self, billboard_id: Uuid) -> Result<Option<Billboard>, AppError> {
        sqlx::query_as::<_, Billboard>(
            r#"
            SELECT billboard_id, owner_id, price_per_day, active, updated_utc
            FROM billboards
            WHERE billboard_id = $1
            FOR UPDATE
            "#,
        )
        .bind(billboard_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error("lock billboard"))
    }

    async fn upsert_billboard(&mut self, billboard: &Billboard) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO billboards (billboard_id, owner_id, price_per_day, active, updated_utc)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (billboard_id) DO UPDATE
            SET owner_id = EXCLUDED.owner_id,
                price_per_day = EXCLUDED.price_per_day,
                active = EXCLUDED.active,
                updated_utc = NOW()
            "#,
        )
        .bind(billboard.billboard_id)
        .bind(billboard.owner_id)
        .bind(billboard.price_per_day)
        .bind(billboard.active)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error("upsert billboard"))?;
        Ok(())
    }

    async fn booking(&mut self, booking_id: Uuid) -> Result<Option<Booking>, AppError> {
        self.fetch_booking("booking_id = $1", BookingKey::Id(booking_id), "get_booking")
            .await
    }

    async fn lock_booking(&mut self, booking_id: Uuid) -> Result<Option<Booking>, AppError> {
        self.fetch_booking(
            "booking_id = $1 FOR UPDATE",
            BookingKey::Id(booking_id),
            "lock_booking",
        )
        .await
    }

    async fn lock_booking_by_order(
        &mut self,
        order_id: &str,
    ) -> Result<Option<Booking>, AppError> {
        self.fetch_booking(
            "gateway_order_id = $1 FOR UPDATE",
            BookingKey::Order(order_id),
            "lock_booking_by_order",
        )
        .await
    }

    async fn insert_booking(&mut self, b: &Booking) -> Result<(), AppError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["insert_booking"])
            .start_timer();

        let sql = format!(
            "INSERT INTO bookings ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
             $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)",
            BOOKING_COLUMNS
        );
        sqlx::query(&sql)
            .bind(b.booking_id)
            .bind(b.advertiser_id)
            .bind(b.billboard_id)
            .bind(b.owner_id)
            .bind(b.start_date)
            .bind(b.end_date)
            .bind(b.status)
            .bind(b.payment_status)
            .bind(b.original_base_amount)
            .bind(b.discount_percent)
            .bind(b.discount_amount)
            .bind(b.base_amount)
            .bind(b.commission_percent)
            .bind(b.commission_amount)
            .bind(b.gst_percent)
            .bind(b.gst_amount)
            .bind(b.total_price)
            .bind(&b.currency)
            .bind(b.locked_commission_percent)
            .bind(b.price_per_day_at_booking)
            .bind(&b.gateway_order_id)
            .bind(b.order_amount)
            .bind(&b.gateway_payment_id)
            .bind(&b.gateway_signature)
            .bind(b.paid_utc)
            .bind(b.created_utc)
            .bind(b.updated_utc)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_error("insert booking"))?;

        timer.observe_duration();
        Ok(())
    }

    async fn update_booking(&mut self, b: &Booking) -> Result<(), AppError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["update_booking"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET status = $2, payment_status = $3,
                original_base_amount = $4, discount_percent = $5, discount_amount = $6,
                base_amount = $7, commission_percent = $8, commission_amount = $9,
                gst_percent = $10, gst_amount = $11, total_price = $12, currency = $13,
                locked_commission_percent = $14, gateway_order_id = $15, order_amount = $16,
                gateway_payment_id = $17, gateway_signature = $18, paid_utc = $19,
                updated_utc = $20
            WHERE booking_id = $1
            "#,
        )
        .bind(b.booking_id)
        .bind(b.status)
        .bind(b.payment_status)
        .bind(b.original_base_amount)
        .bind(b.discount_percent)
        .bind(b.discount_amount)
        .bind(b.base_amount)
        .bind(b.commission_percent)
        .bind(b.commission_amount)
        .bind(b.gst_percent)
        .bind(b.gst_amount)
        .bind(b.total_price)
        .bind(&b.currency)
        .bind(b.locked_commission_percent)
        .bind(&b.gateway_order_id)
        .bind(b.order_amount)
        .bind(&b.gateway_payment_id)
        .bind(&b.gateway_signature)
        .bind(b.paid_utc)
        .bind(b.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error("update booking"))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Booking {} not found",
                b.booking_id
            )));
        }
        Ok(())
    }

    async fn overlapping_bookings(
        &mut self,
        billboard_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, AppError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            "SELECT {} FROM bookings \
             WHERE billboard_id = $1 AND end_date >= $2 AND start_date <= $3 AND status = ANY($4) \
             ORDER BY start_date, created_utc",
            BOOKING_COLUMNS
        );
        sqlx::query_as::<_, Booking>(&sql)
            .bind(billboard_id)
            .bind(start)
            .bind(end)
            .bind(statuses)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_db_error("overlapping bookings"))
    }

    async fn elapsed_bookings(&mut self, today: NaiveDate) -> Result<Vec<Uuid>, AppError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT booking_id FROM bookings WHERE status = 'APPROVED' AND end_date < $1",
        )
        .bind(today)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error("elapsed bookings"))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn split_for_booking(
        &mut self,
        booking_id: Uuid,
    ) -> Result<Option<PaymentSplit>, AppError> {
        let sql = format!(
            "SELECT {} FROM payment_splits WHERE booking_id = $1",
            SPLIT_COLUMNS
        );
        sqlx::query_as::<_, PaymentSplit>(&sql)
            .bind(booking_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error("get split"))
    }

    async fn insert_split(&mut self, s: &PaymentSplit) -> Result<(), AppError> {
        let sql = format!(
            "INSERT INTO payment_splits ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            SPLIT_COLUMNS
        );
        sqlx::query(&sql)
            .bind(s.split_id)
            .bind(s.booking_id)
            .bind(s.owner_id)
            .bind(s.owner_amount)
            .bind(s.platform_commission)
            .bind(s.gst_amount)
            .bind(s.total_amount)
            .bind(s.settled)
            .bind(s.refunded)
            .bind(s.created_utc)
            .bind(s.settled_utc)
            .bind(s.refunded_utc)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_error("insert split"))?;
        Ok(())
    }

    async fn update_split(&mut self, s: &PaymentSplit) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE payment_splits
            SET settled = $2, refunded = $3, settled_utc = $4, refunded_utc = $5
            WHERE booking_id = $1
            "#,
        )
        .bind(s.booking_id)
        .bind(s.settled)
        .bind(s.refunded)
        .bind(s.settled_utc)
        .bind(s.refunded_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error("update split"))?;
        Ok(())
    }

    async fn lock_wallet(&mut self, key: WalletKey) -> Result<Wallet, AppError> {
        let wallet_key = key.as_key();

        sqlx::query("INSERT INTO wallets (wallet_key) VALUES ($1) ON CONFLICT (wallet_key) DO NOTHING")
            .bind(&wallet_key)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_error("create wallet"))?;

        sqlx::query_as::<_, Wallet>(
            r#"
            SELECT wallet_key, balance, total_earned, total_withdrawn, pending_withdrawal, updated_utc
            FROM wallets
            WHERE wallet_key = $1
            FOR UPDATE
            "#,
        )
        .bind(&wallet_key)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_error("lock wallet"))
    }

    async fn update_wallet(&mut self, w: &Wallet) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE wallets
            SET balance = $2, total_earned = $3, total_withdrawn = $4,
                pending_withdrawal = $5, updated_utc = $6
            WHERE wallet_key = $1
            "#,
        )
        .bind(&w.wallet_key)
        .bind(w.balance)
        .bind(w.total_earned)
        .bind(w.total_withdrawn)
        .bind(w.pending_withdrawal)
        .bind(w.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_check_violation() => {
                AppError::InsufficientFunds(format!("wallet {} would go negative", w.wallet_key))
            }
            other => map_db_error("update wallet")(other),
        })?;
        Ok(())
    }

    async fn append_wallet_transaction(
        &mut self,
        t: &WalletTransaction,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO wallet_transactions
                (transaction_id, wallet_key, direction, amount, reference, booking_id, balance_after, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(t.transaction_id)
        .bind(&t.wallet_key)
        .bind(t.direction)
        .bind(t.amount)
        .bind(&t.reference)
        .bind(t.booking_id)
        .bind(t.balance_after)
        .bind(t.created_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error("append wallet transaction"))?;
        Ok(())
    }

    async fn wallet_transactions(
        &mut self,
        key: WalletKey,
    ) -> Result<Vec<WalletTransaction>, AppError> {
        sqlx::query_as::<_, WalletTransaction>(
            r#"
            SELECT transaction_id, wallet_key, direction, amount, reference, booking_id, balance_after, created_utc
            FROM wallet_transactions
            WHERE wallet_key = $1
            ORDER BY sequence
            "#,
        )
        .bind(key.as_key())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error("list wallet transactions"))
    }

    async fn settings(&mut self) -> Result<PlatformSettings, AppError> {
        let defaults = PlatformSettings::default();
        sqlx::query(
            r#"
            INSERT INTO platform_settings (settings_key, commission_percent, gst_percent, currency)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (settings_key) DO NOTHING
            "#,
        )
        .bind(PlatformSettings::KEY)
        .bind(defaults.commission_percent)
        .bind(defaults.gst_percent)
        .bind(&defaults.currency)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error("create settings"))?;

        sqlx::query_as::<_, PlatformSettings>(
            r#"
            SELECT commission_percent, gst_percent, currency, updated_utc
            FROM platform_settings
            WHERE settings_key = $1
            "#,
        )
        .bind(PlatformSettings::KEY)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_error("get settings"))
    }

    async fn save_settings(&mut self, s: &PlatformSettings) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO platform_settings (settings_key, commission_percent, gst_percent, currency, updated_utc)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (settings_key) DO UPDATE
            SET commission_percent = EXCLUDED.commission_percent,
                gst_percent = EXCLUDED.gst_percent,
                currency = EXCLUDED.currency,
                updated_utc = EXCLUDED.updated_utc
            "#,
        )
        .bind(PlatformSettings::KEY)
        .bind(s.commission_percent)
        .bind(s.gst_percent)
        .bind(&s.currency)
        .bind(s.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error("save settings"))?;
        Ok(())
    }

    async fn payment_record(
        &mut self,
        payment_id: &str,
    ) -> Result<Option<PaymentRecord>, AppError> {
        let sql = format!(
            "SELECT {} FROM payment_records WHERE gateway_payment_id = $1",
            RECORD_COLUMNS
        );
        sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(payment_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error("get payment record"))
    }

    async fn insert_payment_record(&mut self, r: &PaymentRecord) -> Result<(), AppError> {
        let sql = format!(
            "INSERT INTO payment_records ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            RECORD_COLUMNS
        );
        sqlx::query(&sql)
            .bind(r.record_id)
            .bind(r.booking_id)
            .bind(&r.gateway_order_id)
            .bind(&r.gateway_payment_id)
            .bind(&r.gateway_signature)
            .bind(r.amount)
            .bind(&r.currency)
            .bind(r.source)
            .bind(&r.refund_id)
            .bind(r.refund_status)
            .bind(r.paid_utc)
            .bind(r.updated_utc)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_error("insert payment record"))?;
        Ok(())
    }

    async fn update_payment_record(&mut self, r: &PaymentRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE payment_records
            SET refund_id = $2, refund_status = $3, updated_utc = $4
            WHERE gateway_payment_id = $1
            "#,
        )
        .bind(&r.gateway_payment_id)
        .bind(&r.refund_id)
        .bind(r.refund_status)
        .bind(r.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error("update payment record"))?;
        Ok(())
    }

    async fn append_audit(&mut self, e: &AuditEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO booking_audit (audit_id, booking_id, action, detail, actor_id, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(e.audit_id)
        .bind(e.booking_id)
        .bind(e.action)
        .bind(&e.detail)
        .bind(e.actor_id)
        .bind(e.created_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error("append audit"))?;
        Ok(())
    }

    async fn audit_trail(&mut self, booking_id: Uuid) -> Result<Vec<AuditEntry>, AppError> {
        sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT audit_id, booking_id, action, detail, actor_id, created_utc
            FROM booking_audit
            WHERE booking_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(booking_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error("audit trail"))
    }

    async fn insert_shortfall(&mut self, s: &RefundShortfall) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO refund_shortfalls
                (shortfall_id, booking_id, wallet_key, expected_amount, available_balance, resolved, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(s.shortfall_id)
        .bind(s.booking_id)
        .bind(&s.wallet_key)
        .bind(s.expected_amount)
        .bind(s.available_balance)
        .bind(s.resolved)
        .bind(s.created_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error("insert shortfall"))?;
        Ok(())
    }

    async fn open_shortfalls(&mut self) -> Result<Vec<RefundShortfall>, AppError> {
        sqlx::query_as::<_, RefundShortfall>(
            r#"
            SELECT shortfall_id, booking_id, wallet_key, expected_amount, available_balance, resolved, created_utc
            FROM refund_shortfalls
            WHERE NOT resolved
            ORDER BY created_utc
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error("open shortfalls"))
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx.commit().await.map_err(map_db_error("commit"))
    }
}
