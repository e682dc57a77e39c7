//! Rate limiter for OTP issuance
//!
//! Two fixed windows guard every issuance: one per phone number and one per
//! origin address. Both are checked and incremented as a single atomic unit
//! by the backing [`WindowCounter`], so concurrent requests for the same key
//! can never jointly overshoot a threshold.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::cache::RedisPool;
use redis::Script;
use tracing::warn;

use crate::error::{OtpError, StoreError};
use crate::phone::PhoneNumber;

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Issuance requests allowed per phone number per window
    pub phone_max_requests: u32,
    pub phone_window: Duration,
    /// Issuance requests allowed per origin address per window
    pub origin_max_requests: u32,
    pub origin_window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            phone_max_requests: 3,
            phone_window: Duration::from_secs(15 * 60),
            origin_max_requests: 10,
            origin_window: Duration::from_secs(60 * 60),
        }
    }
}

/// One counter taking part in an admission decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowLimit {
    pub key: String,
    pub max_requests: u32,
    pub window: Duration,
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    RateLimited { retry_after: Duration },
}

/// Shared fixed-window counters.
///
/// `try_acquire` must admit only if every limit is below its threshold, and
/// in that case increment every counter; otherwise it increments nothing and
/// reports the longest remaining window among the exceeded counters. The
/// whole decision is atomic with respect to other callers.
#[async_trait]
pub trait WindowCounter: Send + Sync {
    async fn try_acquire(&self, limits: &[WindowLimit]) -> Result<Admission, StoreError>;
}

/// Rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    counter: Arc<dyn WindowCounter>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(config: RateLimiterConfig, counter: Arc<dyn WindowCounter>) -> Self {
        Self { config, counter }
    }

    /// Check whether an OTP may be issued to `phone` on behalf of `origin`
    pub async fn admit(&self, phone: &PhoneNumber, origin: IpAddr) -> Result<Admission, OtpError> {
        let limits = [
            WindowLimit {
                key: format!("otp:rl:phone:{}", phone),
                max_requests: self.config.phone_max_requests,
                window: self.config.phone_window,
            },
            WindowLimit {
                key: format!("otp:rl:origin:{}", origin),
                max_requests: self.config.origin_max_requests,
                window: self.config.origin_window,
            },
        ];

        let admission = self.counter.try_acquire(&limits).await?;
        if let Admission::RateLimited { retry_after } = admission {
            warn!(
                "Rate limited OTP issuance for {} from {} (retry after {}s)",
                phone,
                origin,
                retry_after.as_secs()
            );
        }
        Ok(admission)
    }
}

/// KEYS: counters. ARGV: (limit, window_ms) per key.
/// Returns {1, 0} when admitted, {0, retry_after_ms} when not.
const ACQUIRE_SCRIPT: &str = r"
local blocked_ms = 0
for i = 1, #KEYS do
  local limit = tonumber(ARGV[2 * i - 1])
  local window_ms = tonumber(ARGV[2 * i])
  local count = tonumber(redis.call('GET', KEYS[i]) or '0')
  if count >= limit then
    local ttl = redis.call('PTTL', KEYS[i])
    if ttl < 0 then
      redis.call('PEXPIRE', KEYS[i], window_ms)
      ttl = window_ms
    end
    if ttl > blocked_ms then
      blocked_ms = ttl
    end
  end
end
if blocked_ms > 0 then
  return {0, blocked_ms}
end
for i = 1, #KEYS do
  if redis.call('INCR', KEYS[i]) == 1 then
    redis.call('PEXPIRE', KEYS[i], tonumber(ARGV[2 * i]))
  end
end
return {1, 0}
";

/// Window counters kept in Redis, shared by every service instance
#[derive(Clone)]
pub struct RedisWindowCounter {
    pool: RedisPool,
    script: Arc<Script>,
}

impl RedisWindowCounter {
    pub fn new(pool: RedisPool) -> Self {
        Self {
            pool,
            script: Arc::new(Script::new(ACQUIRE_SCRIPT)),
        }
    }
}

#[async_trait]
impl WindowCounter for RedisWindowCounter {
    async fn try_acquire(&self, limits: &[WindowLimit]) -> Result<Admission, StoreError> {
        let keys: Vec<&str> = limits.iter().map(|limit| limit.key.as_str()).collect();
        let args: Vec<u64> = limits
            .iter()
            .flat_map(|limit| {
                [
                    u64::from(limit.max_requests),
                    // A zero TTL would make PEXPIRE delete the key outright
                    (limit.window.as_millis() as u64).max(1),
                ]
            })
            .collect();

        let (allowed, retry_after_ms): (i64, i64) =
            self.pool.run_script(&self.script, &keys, &args).await?;

        if allowed == 1 {
            Ok(Admission::Allowed)
        } else {
            Ok(Admission::RateLimited {
                retry_after: Duration::from_millis(retry_after_ms.max(0) as u64),
            })
        }
    }
}
