//! PostgreSQL code store
//!
//! A partial unique index (`otp_codes_one_pending`) guarantees at most one
//! pending record per phone and purpose, even when two issuers race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::{info, warn};
use uuid::Uuid;

use super::CodeStore;
use crate::error::StoreError;
use crate::models::{OtpRecord, OtpStatus, Purpose};
use crate::phone::PhoneNumber;

/// Rounds of supersede-and-insert before giving up on a racing issuer
const REPLACE_ROUNDS: u32 = 3;

const RECORD_COLUMNS: &str = "id, phone_number, purpose, code_hash, created_at, expires_at, \
                              attempts, status, associated_user_id, version";

#[derive(Clone)]
pub struct PgCodeStore {
    pool: PgPool,
}

impl PgCodeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &PgRow) -> Result<OtpRecord, StoreError> {
    let phone: String = row.try_get("phone_number")?;
    let purpose: String = row.try_get("purpose")?;
    let status: String = row.try_get("status")?;
    let attempts: i32 = row.try_get("attempts")?;

    Ok(OtpRecord {
        id: row.try_get("id")?,
        phone_number: PhoneNumber::parse_canonical(&phone)
            .ok_or_else(|| StoreError::Corrupt(format!("phone number '{}'", phone)))?,
        purpose: purpose.parse().map_err(StoreError::Corrupt)?,
        code_hash: row.try_get("code_hash")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        attempts: u32::try_from(attempts)
            .map_err(|_| StoreError::Corrupt(format!("attempts {}", attempts)))?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        associated_user_id: row.try_get("associated_user_id")?,
        version: row.try_get("version")?,
    })
}

#[async_trait]
impl CodeStore for PgCodeStore {
    async fn replace_pending(&self, record: &OtpRecord) -> Result<(), StoreError> {
        for round in 1..=REPLACE_ROUNDS {
            let mut tx = self.pool.begin().await?;

            let superseded = sqlx::query(
                r#"
                UPDATE otp_codes
                SET status = 'superseded', version = version + 1
                WHERE phone_number = $1 AND purpose = $2 AND status = 'pending'
                "#,
            )
            .bind(record.phone_number.as_str())
            .bind(record.purpose.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

            let inserted = sqlx::query(
                r#"
                INSERT INTO otp_codes (id, phone_number, purpose, code_hash, created_at,
                                       expires_at, attempts, status, associated_user_id, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(record.id)
            .bind(record.phone_number.as_str())
            .bind(record.purpose.as_str())
            .bind(&record.code_hash)
            .bind(record.created_at)
            .bind(record.expires_at)
            .bind(record.attempts as i32)
            .bind(record.status.as_str())
            .bind(record.associated_user_id)
            .bind(record.version)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {
                    tx.commit().await?;
                    if superseded > 0 {
                        info!(
                            "Superseded {} pending {} code(s) for {}",
                            superseded, record.purpose, record.phone_number
                        );
                    }
                    return Ok(());
                }
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    tx.rollback().await?;
                    warn!(
                        "Concurrent issuance for {} ({}), round {}",
                        record.phone_number, record.purpose, round
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Contended(REPLACE_ROUNDS))
    }

    async fn find_pending(
        &self,
        phone: &PhoneNumber,
        purpose: Purpose,
    ) -> Result<Option<OtpRecord>, StoreError> {
        let query = format!(
            "SELECT {} FROM otp_codes \
             WHERE phone_number = $1 AND purpose = $2 AND status = $3 \
             ORDER BY created_at DESC LIMIT 1",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(phone.as_str())
            .bind(purpose.as_str())
            .bind(OtpStatus::Pending.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OtpRecord>, StoreError> {
        let query = format!("SELECT {} FROM otp_codes WHERE id = $1", RECORD_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn compare_and_swap(&self, record: &OtpRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE otp_codes
            SET attempts = $1, status = $2, version = version + 1
            WHERE id = $3 AND version = $4 AND status = 'pending'
            "#,
        )
        .bind(record.attempts as i32)
        .bind(record.status.as_str())
        .bind(record.id)
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM otp_codes WHERE expires_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
