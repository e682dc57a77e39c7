//! OTP record model and lifecycle states

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phone::PhoneNumber;

/// What an OTP code may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Login,
    PhoneChange,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Login => "login",
            Purpose::PhoneChange => "phone_change",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "login" => Ok(Purpose::Login),
            "phone_change" => Ok(Purpose::PhoneChange),
            other => Err(format!("unknown OTP purpose '{}'", other)),
        }
    }
}

/// Persisted lifecycle status of an OTP record.
///
/// Only `Pending` records can change; every other status is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpStatus {
    Pending,
    Verified,
    Exhausted,
    Expired,
    /// Replaced by a newer code for the same phone and purpose
    Superseded,
}

impl OtpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtpStatus::Pending => "pending",
            OtpStatus::Verified => "verified",
            OtpStatus::Exhausted => "exhausted",
            OtpStatus::Expired => "expired",
            OtpStatus::Superseded => "superseded",
        }
    }
}

impl FromStr for OtpStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OtpStatus::Pending),
            "verified" => Ok(OtpStatus::Verified),
            "exhausted" => Ok(OtpStatus::Exhausted),
            "expired" => Ok(OtpStatus::Expired),
            "superseded" => Ok(OtpStatus::Superseded),
            other => Err(format!("unknown OTP status '{}'", other)),
        }
    }
}

/// One issued OTP code. Holds the hash, never the code itself.
#[derive(Debug, Clone, PartialEq)]
pub struct OtpRecord {
    pub id: Uuid,
    pub phone_number: PhoneNumber,
    pub purpose: Purpose,
    pub code_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub status: OtpStatus,
    pub associated_user_id: Option<Uuid>,
    /// Bumped by the store on every committed update
    pub version: i64,
}

impl OtpRecord {
    pub fn new(
        phone_number: PhoneNumber,
        purpose: Purpose,
        code_hash: String,
        associated_user_id: Option<Uuid>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            phone_number,
            purpose,
            code_hash,
            created_at: now,
            expires_at: now + ttl,
            attempts: 0,
            status: OtpStatus::Pending,
            associated_user_id,
            version: 0,
        }
    }

    /// True once the code has been successfully verified
    pub fn is_used(&self) -> bool {
        self.status == OtpStatus::Verified
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_attempts(&self, max_attempts: u32) -> u32 {
        max_attempts.saturating_sub(self.attempts)
    }

    /// Whether the record can still be verified at `now`
    pub fn is_live(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.status == OtpStatus::Pending
            && !self.is_expired_at(now)
            && self.attempts < max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phone::normalize;

    fn record(now: DateTime<Utc>) -> OtpRecord {
        OtpRecord::new(
            normalize("+96551234567", None).unwrap(),
            Purpose::Login,
            "hash".into(),
            None,
            now,
            Duration::minutes(5),
        )
    }

    #[test]
    fn test_new_record_is_pending_for_five_minutes() {
        let now = Utc::now();
        let record = record(now);
        assert_eq!(record.expires_at - record.created_at, Duration::minutes(5));
        assert_eq!(record.attempts, 0);
        assert!(!record.is_used());
        assert!(record.is_live(now, 3));
        assert!(record.is_live(now + Duration::seconds(299), 3));
        assert!(!record.is_live(now + Duration::minutes(5), 3));
    }

    #[test]
    fn test_attempts_exhaust_liveness() {
        let now = Utc::now();
        let mut record = record(now);
        record.attempts = 3;
        assert!(!record.is_live(now, 3));
        assert_eq!(record.remaining_attempts(3), 0);
    }

    #[test]
    fn test_purpose_and_status_parse_their_own_names() {
        for purpose in [Purpose::Login, Purpose::PhoneChange] {
            assert_eq!(purpose.as_str().parse::<Purpose>().unwrap(), purpose);
        }
        assert!("reset".parse::<Purpose>().is_err());
        assert_eq!("superseded".parse::<OtpStatus>().unwrap(), OtpStatus::Superseded);
    }
}
