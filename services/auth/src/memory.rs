//! In-process adapters
//!
//! Used by the test suites and for single-process development. Each
//! operation runs inside one mutex critical section, which gives the same
//! atomicity the Postgres and Redis adapters get from transactions and
//! scripts. No lock is ever held across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::delivery::CodeSender;
use crate::error::{DeliveryError, IdentityError, StoreError};
use crate::identity::IdentityStore;
use crate::models::{OtpRecord, OtpStatus, Purpose, User};
use crate::phone::PhoneNumber;
use crate::rate_limiter::{Admission, WindowCounter, WindowLimit};
use crate::store::CodeStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Code store
// =============================================================================

#[derive(Default)]
pub struct MemoryCodeStore {
    records: Mutex<HashMap<Uuid, OtpRecord>>,
}

impl MemoryCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held, whatever their status
    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CodeStore for MemoryCodeStore {
    async fn replace_pending(&self, record: &OtpRecord) -> Result<(), StoreError> {
        let mut records = lock(&self.records);
        for existing in records.values_mut().filter(|r| {
            r.status == OtpStatus::Pending
                && r.phone_number == record.phone_number
                && r.purpose == record.purpose
        }) {
            existing.status = OtpStatus::Superseded;
            existing.version += 1;
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn find_pending(
        &self,
        phone: &PhoneNumber,
        purpose: Purpose,
    ) -> Result<Option<OtpRecord>, StoreError> {
        Ok(lock(&self.records)
            .values()
            .filter(|r| {
                r.status == OtpStatus::Pending && &r.phone_number == phone && r.purpose == purpose
            })
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OtpRecord>, StoreError> {
        Ok(lock(&self.records).get(&id).cloned())
    }

    async fn compare_and_swap(&self, record: &OtpRecord) -> Result<bool, StoreError> {
        let mut records = lock(&self.records);
        match records.get_mut(&record.id) {
            Some(stored)
                if stored.version == record.version && stored.status == OtpStatus::Pending =>
            {
                stored.attempts = record.attempts;
                stored.status = record.status;
                stored.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|_, r| r.expires_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

// =============================================================================
// Window counter
// =============================================================================

struct Window {
    count: u32,
    resets_at: DateTime<Utc>,
}

pub struct MemoryWindowCounter {
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryWindowCounter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WindowCounter for MemoryWindowCounter {
    async fn try_acquire(&self, limits: &[WindowLimit]) -> Result<Admission, StoreError> {
        let now = self.clock.now();
        let mut windows = lock(&self.windows);

        let mut blocked: Option<std::time::Duration> = None;
        for limit in limits {
            let live = windows.get(&limit.key).filter(|w| w.resets_at > now);
            let count = live.map_or(0, |w| w.count);
            if count >= limit.max_requests {
                let remaining = live
                    .and_then(|w| (w.resets_at - now).to_std().ok())
                    .unwrap_or(limit.window);
                blocked = Some(blocked.map_or(remaining, |b| b.max(remaining)));
            }
        }
        if let Some(retry_after) = blocked {
            return Ok(Admission::RateLimited { retry_after });
        }

        for limit in limits {
            let window_len = chrono::Duration::from_std(limit.window)
                .map_err(|e| StoreError::Corrupt(format!("window for {}: {}", limit.key, e)))?;
            let window = windows.entry(limit.key.clone()).or_insert(Window {
                count: 0,
                resets_at: now,
            });
            if window.resets_at <= now {
                window.count = 0;
                window.resets_at = now + window_len;
            }
            window.count += 1;
        }
        Ok(Admission::Allowed)
    }
}

// =============================================================================
// Identity store
// =============================================================================

#[derive(Default)]
pub struct MemoryIdentityStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a user's active flag
    pub fn set_active(&self, id: Uuid, active: bool) {
        if let Some(user) = lock(&self.users).get_mut(&id) {
            user.is_active = active;
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_user(&self, phone: &PhoneNumber) -> Result<Option<User>, IdentityError> {
        Ok(lock(&self.users)
            .values()
            .find(|u| &u.phone_number == phone)
            .cloned())
    }

    async fn find_or_create_user(&self, phone: &PhoneNumber) -> Result<User, IdentityError> {
        let mut users = lock(&self.users);
        if let Some(user) = users.values().find(|u| &u.phone_number == phone) {
            return Ok(user.clone());
        }
        let user = User::new(phone.clone(), Utc::now());
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, IdentityError> {
        Ok(lock(&self.users).get(&id).cloned())
    }

    async fn update_phone(&self, id: Uuid, phone: &PhoneNumber) -> Result<User, IdentityError> {
        let mut users = lock(&self.users);
        if users
            .values()
            .any(|u| u.id != id && &u.phone_number == phone)
        {
            return Err(IdentityError::PhoneTaken);
        }
        let user = users.get_mut(&id).ok_or(IdentityError::NotFound(id))?;
        user.phone_number = phone.clone();
        user.updated_at = Utc::now();
        Ok(user.clone())
    }
}

// =============================================================================
// Recording sender
// =============================================================================

/// One message handed to [`RecordingSender`]
#[derive(Debug, Clone)]
pub struct SentCode {
    pub phone: PhoneNumber,
    pub code: String,
    pub purpose: Purpose,
}

/// Sender that keeps every code in memory instead of delivering it
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SentCode>>,
}

impl RecordingSender {
    /// Most recent code sent to `phone`
    pub fn last_code(&self, phone: &PhoneNumber) -> Option<String> {
        lock(&self.sent)
            .iter()
            .rev()
            .find(|s| &s.phone == phone)
            .map(|s| s.code.clone())
    }

    pub fn sent(&self) -> Vec<SentCode> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl CodeSender for RecordingSender {
    async fn send(
        &self,
        phone: &PhoneNumber,
        code: &str,
        purpose: Purpose,
    ) -> Result<(), DeliveryError> {
        lock(&self.sent).push(SentCode {
            phone: phone.clone(),
            code: code.to_string(),
            purpose,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[tokio::test]
    async fn test_rejected_acquire_increments_nothing() {
        let clock = ManualClock::new(Utc::now());
        let counter = MemoryWindowCounter::new(Arc::new(clock.clone()));
        let open = WindowLimit {
            key: "open".to_string(),
            max_requests: 5,
            window: Duration::from_secs(60),
        };
        let closed = WindowLimit {
            key: "closed".to_string(),
            max_requests: 0,
            window: Duration::from_secs(60),
        };

        let result = counter
            .try_acquire(&[open.clone(), closed])
            .await
            .unwrap();
        assert_eq!(
            result,
            Admission::RateLimited {
                retry_after: Duration::from_secs(60)
            }
        );

        for _ in 0..5 {
            assert_eq!(
                counter.try_acquire(&[open.clone()]).await.unwrap(),
                Admission::Allowed
            );
        }
    }

    #[tokio::test]
    async fn test_delete_expired_keeps_live_records() {
        let store = MemoryCodeStore::new();
        let now = Utc::now();
        let phone = crate::phone::normalize("+96551234567", None).unwrap();
        let old = OtpRecord::new(
            phone.clone(),
            Purpose::Login,
            "a".into(),
            None,
            now - chrono::Duration::hours(1),
            chrono::Duration::minutes(5),
        );
        let fresh = OtpRecord::new(
            phone,
            Purpose::PhoneChange,
            "b".into(),
            None,
            now,
            chrono::Duration::minutes(5),
        );
        store.replace_pending(&old).await.unwrap();
        store.replace_pending(&fresh).await.unwrap();

        assert_eq!(store.delete_expired(now).await.unwrap(), 1);
        assert!(store.find_by_id(fresh.id).await.unwrap().is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_phone_refuses_numbers_owned_by_others() {
        let identities = MemoryIdentityStore::new();
        let a = crate::phone::normalize("+96551234567", None).unwrap();
        let b = crate::phone::normalize("+96551234568", None).unwrap();
        let alice = identities.find_or_create_user(&a).await.unwrap();
        identities.find_or_create_user(&b).await.unwrap();

        assert!(matches!(
            identities.update_phone(alice.id, &b).await,
            Err(IdentityError::PhoneTaken)
        ));
        let c = crate::phone::normalize("+96551234569", None).unwrap();
        assert_eq!(identities.update_phone(alice.id, &c).await.unwrap().phone_number, c);
    }
}
