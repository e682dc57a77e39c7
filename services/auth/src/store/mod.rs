//! Code store: persistence of OTP records
//!
//! The store is shared by every service instance, so each mutating
//! operation is atomic on its own: `replace_pending` supersedes and inserts
//! in one step and `compare_and_swap` only commits against an unchanged
//! version. Callers never hold a lock across these calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{OtpRecord, Purpose};
use crate::phone::PhoneNumber;

pub mod postgres;

pub use postgres::PgCodeStore;

#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Mark any pending record for the same phone and purpose as superseded
    /// and insert `record`, as one atomic unit.
    async fn replace_pending(&self, record: &OtpRecord) -> Result<(), StoreError>;

    /// Latest pending record for the phone and purpose, expired or not
    async fn find_pending(
        &self,
        phone: &PhoneNumber,
        purpose: Purpose,
    ) -> Result<Option<OtpRecord>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OtpRecord>, StoreError>;

    /// Persist `attempts` and `status` of `record` if the stored copy is
    /// still pending at `record.version`. Returns `false` when another
    /// writer got there first; nothing is written in that case.
    async fn compare_and_swap(&self, record: &OtpRecord) -> Result<bool, StoreError>;

    /// Delete records whose `expires_at` is before `cutoff`
    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
