//! Identity store: users bound to phone numbers

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::info;
use uuid::Uuid;

use crate::error::IdentityError;
use crate::models::User;
use crate::phone::PhoneNumber;

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_user(&self, phone: &PhoneNumber) -> Result<Option<User>, IdentityError>;

    /// Return the user owning `phone`, creating one if none exists.
    /// Concurrent calls for the same phone resolve to the same user.
    async fn find_or_create_user(&self, phone: &PhoneNumber) -> Result<User, IdentityError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, IdentityError>;

    /// Rebind a user to a new phone number. Fails with
    /// [`IdentityError::PhoneTaken`] if another user already owns it.
    async fn update_phone(&self, id: Uuid, phone: &PhoneNumber) -> Result<User, IdentityError>;
}

const USER_COLUMNS: &str = "id, phone_number, name, national_id, is_active, created_at, updated_at";

/// User repository
#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    /// Create a new user repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn user_from_row(row: &PgRow) -> Result<User, IdentityError> {
    let phone: String = row.try_get("phone_number")?;
    Ok(User {
        id: row.try_get("id")?,
        phone_number: PhoneNumber::parse_canonical(&phone)
            .ok_or_else(|| IdentityError::Corrupt(format!("phone number '{}'", phone)))?,
        name: row.try_get("name")?,
        national_id: row.try_get("national_id")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn find_user(&self, phone: &PhoneNumber) -> Result<Option<User>, IdentityError> {
        let query = format!("SELECT {} FROM users WHERE phone_number = $1", USER_COLUMNS);
        let row = sqlx::query(&query)
            .bind(phone.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_or_create_user(&self, phone: &PhoneNumber) -> Result<User, IdentityError> {
        let candidate = User::new(phone.clone(), Utc::now());

        // The no-op update makes RETURNING yield the existing row on conflict
        let query = format!(
            "INSERT INTO users (id, phone_number, is_active, created_at, updated_at) \
             VALUES ($1, $2, TRUE, $3, $3) \
             ON CONFLICT (phone_number) DO UPDATE SET phone_number = EXCLUDED.phone_number \
             RETURNING {}",
            USER_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(candidate.id)
            .bind(phone.as_str())
            .bind(candidate.created_at)
            .fetch_one(&self.pool)
            .await?;

        let user = user_from_row(&row)?;
        if user.id == candidate.id {
            info!("Created user {} for {}", user.id, phone);
        }
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, IdentityError> {
        let query = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn update_phone(&self, id: Uuid, phone: &PhoneNumber) -> Result<User, IdentityError> {
        let query = format!(
            "UPDATE users SET phone_number = $1, updated_at = NOW() WHERE id = $2 RETURNING {}",
            USER_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(phone.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => IdentityError::PhoneTaken,
                other => IdentityError::Database(other),
            })?;

        match row {
            Some(row) => {
                let user = user_from_row(&row)?;
                info!("User {} moved to phone number {}", id, phone);
                Ok(user)
            }
            None => Err(IdentityError::NotFound(id)),
        }
    }
}
