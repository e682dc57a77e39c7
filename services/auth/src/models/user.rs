//! User model and related functionality

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::phone::PhoneNumber;

/// User identity bound to a phone number
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub phone_number: PhoneNumber,
    pub name: Option<String>,
    pub national_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// A fresh, active identity with no profile data yet
    pub fn new(phone_number: PhoneNumber, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            phone_number,
            name: None,
            national_id: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}
