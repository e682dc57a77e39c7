//! Service settings
//!
//! Policy knobs are read with the `config` crate: built-in defaults first,
//! then `OTP_`-prefixed environment variables with `__` between sections,
//! e.g. `OTP_RATE_LIMIT__PHONE_MAX=5` or `OTP_DELIVERY__CHANNEL=log`.
//! Infrastructure (database, Redis, JWT keys) keeps its own `from_env`.

use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::delivery::{MessageTemplate, TwilioChannel, TwilioOptions};
use crate::issuer::DeliveryFailurePolicy;
use crate::phone::Region;
use crate::rate_limiter::RateLimiterConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only safe behind a proxy that overwrites those headers.
    pub trust_forwarded_headers: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtpSettings {
    pub code_ttl_secs: u64,
    pub max_attempts: u32,
    /// Server-side key for code hashing
    pub hash_key: String,
    /// How numbers without a country code are read
    pub region_hint: Option<Region>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    pub phone_max: u32,
    pub phone_window_secs: u64,
    pub origin_max: u32,
    pub origin_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryChannel {
    /// Log a notice instead of sending anything
    Log,
    Sms,
    WhatsApp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySettings {
    pub channel: DeliveryChannel,
    pub on_failure: DeliveryFailurePolicy,
    pub brand_name: String,
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_from: Option<String>,
    pub twilio_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupSettings {
    /// Cron expression with a seconds field
    pub schedule: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub otp: OtpSettings,
    pub rate_limit: RateLimitSettings,
    pub session: SessionSettings,
    pub delivery: DeliverySettings,
    pub cleanup: CleanupSettings,
}

impl Settings {
    /// Load settings from defaults and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.trust_forwarded_headers", false)?
            .set_default("otp.code_ttl_secs", 300)?
            .set_default("otp.max_attempts", 3)?
            .set_default("rate_limit.phone_max", 3)?
            .set_default("rate_limit.phone_window_secs", 15 * 60)?
            .set_default("rate_limit.origin_max", 10)?
            .set_default("rate_limit.origin_window_secs", 60 * 60)?
            .set_default("session.ttl_secs", 24 * 60 * 60)?
            .set_default("delivery.channel", "sms")?
            .set_default("delivery.on_failure", "reject")?
            .set_default("delivery.brand_name", "Kuwait Medical Clinic")?
            .set_default("delivery.twilio_base_url", "https://api.twilio.com")?
            .set_default("cleanup.schedule", "0 */10 * * * *")?
            .add_source(
                Environment::with_prefix("OTP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.otp.hash_key.len() < 16 {
            return Err(ConfigError::Message(
                "otp.hash_key must be at least 16 bytes".to_string(),
            ));
        }
        if self.otp.code_ttl_secs == 0 || self.otp.max_attempts == 0 {
            return Err(ConfigError::Message(
                "otp.code_ttl_secs and otp.max_attempts must be positive".to_string(),
            ));
        }
        if self.session.ttl_secs == 0 {
            return Err(ConfigError::Message(
                "session.ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn code_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.otp.code_ttl_secs as i64)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session.ttl_secs as i64)
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            phone_max_requests: self.rate_limit.phone_max,
            phone_window: Duration::from_secs(self.rate_limit.phone_window_secs),
            origin_max_requests: self.rate_limit.origin_max,
            origin_window: Duration::from_secs(self.rate_limit.origin_window_secs),
        }
    }

    pub fn message_template(&self) -> MessageTemplate {
        MessageTemplate {
            brand_name: self.delivery.brand_name.clone(),
            expires_in_minutes: self.otp.code_ttl_secs.div_ceil(60),
        }
    }

    /// Twilio account details, `None` for the log channel
    pub fn twilio_options(&self) -> Option<TwilioOptions> {
        let channel = match self.delivery.channel {
            DeliveryChannel::Log => return None,
            DeliveryChannel::Sms => TwilioChannel::Sms,
            DeliveryChannel::WhatsApp => TwilioChannel::WhatsApp,
        };
        Some(TwilioOptions {
            account_sid: self.delivery.twilio_account_sid.clone().unwrap_or_default(),
            auth_token: self.delivery.twilio_auth_token.clone().unwrap_or_default(),
            from: self.delivery.twilio_from.clone().unwrap_or_default(),
            base_url: self.delivery.twilio_base_url.clone(),
            channel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "OTP_OTP__HASH_KEY",
        "OTP_OTP__REGION_HINT",
        "OTP_RATE_LIMIT__PHONE_MAX",
        "OTP_DELIVERY__CHANNEL",
        "OTP_DELIVERY__ON_FAILURE",
        "OTP_SERVER__PORT",
        "OTP_SERVER__TRUST_FORWARDED_HEADERS",
    ];

    fn clear() {
        for var in VARS {
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    #[serial]
    fn test_defaults_apply_when_only_key_is_set() {
        clear();
        unsafe {
            std::env::set_var("OTP_OTP__HASH_KEY", "0123456789abcdef");
        }

        let settings = Settings::load().unwrap();
        assert_eq!(settings.server.port, 8080);
        assert!(!settings.server.trust_forwarded_headers);
        assert_eq!(settings.otp.code_ttl_secs, 300);
        assert_eq!(settings.otp.max_attempts, 3);
        assert_eq!(settings.otp.region_hint, None);
        assert_eq!(settings.rate_limit.phone_max, 3);
        assert_eq!(settings.rate_limit.origin_window_secs, 3600);
        assert_eq!(settings.session_ttl(), chrono::Duration::hours(24));
        assert_eq!(settings.delivery.channel, DeliveryChannel::Sms);
        assert_eq!(settings.delivery.on_failure, DeliveryFailurePolicy::Reject);
        assert_eq!(settings.message_template().expires_in_minutes, 5);
        assert_eq!(settings.cleanup.schedule, "0 */10 * * * *");

        clear();
    }

    #[test]
    #[serial]
    fn test_environment_overrides_defaults() {
        clear();
        unsafe {
            std::env::set_var("OTP_OTP__HASH_KEY", "0123456789abcdef");
            std::env::set_var("OTP_OTP__REGION_HINT", "germany");
            std::env::set_var("OTP_RATE_LIMIT__PHONE_MAX", "5");
            std::env::set_var("OTP_DELIVERY__CHANNEL", "log");
            std::env::set_var("OTP_DELIVERY__ON_FAILURE", "report");
            std::env::set_var("OTP_SERVER__PORT", "9090");
            std::env::set_var("OTP_SERVER__TRUST_FORWARDED_HEADERS", "true");
        }

        let settings = Settings::load().unwrap();
        assert_eq!(settings.server.port, 9090);
        assert!(settings.server.trust_forwarded_headers);
        assert_eq!(settings.otp.region_hint, Some(Region::Germany));
        assert_eq!(settings.rate_limiter_config().phone_max_requests, 5);
        assert_eq!(settings.delivery.channel, DeliveryChannel::Log);
        assert_eq!(settings.delivery.on_failure, DeliveryFailurePolicy::Report);
        assert!(settings.twilio_options().is_none());

        clear();
    }

    #[test]
    #[serial]
    fn test_missing_or_short_hash_key_is_rejected() {
        clear();
        assert!(Settings::load().is_err());

        unsafe {
            std::env::set_var("OTP_OTP__HASH_KEY", "short");
        }
        assert!(Settings::load().is_err());

        clear();
    }
}
