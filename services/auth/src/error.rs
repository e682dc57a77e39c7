//! Error types for the OTP service
//!
//! `OtpError` is the caller-facing taxonomy: every variant has a stable
//! machine code and, where useful, a hint (retry-after, remaining attempts).
//! The smaller enums below are the collaborator errors that feed into it.

use std::time::Duration;

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;

use crate::models::Purpose;

/// Errors surfaced by the OTP core to its callers
#[derive(Error, Debug)]
pub enum OtpError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid phone number format. Expected a Kuwaiti (+965) or German (+49) number")]
    InvalidPhoneFormat,

    #[error("OTP must be 5 digits")]
    InvalidCodeFormat,

    #[error("Purpose '{0}' is not allowed for this operation")]
    PurposeNotAllowed(Purpose),

    #[error("Too many OTP requests, retry in {} seconds", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("Failed to deliver OTP: {reason}")]
    DeliveryFailed { reason: String },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("No valid OTP found")]
    NoActiveCode,

    #[error("OTP has expired")]
    CodeExpired,

    #[error("Too many verification attempts")]
    TooManyAttempts,

    #[error("Invalid OTP code")]
    IncorrectCode {
        remaining_attempts: u32,
        exhausted: bool,
    },

    #[error("Phone number already exists")]
    PhoneTaken,

    #[error("User account is inactive")]
    AccountInactive,

    #[error("Failed to resolve user identity: {0}")]
    IdentityCreationFailed(String),

    #[error("Failed to sign session credential: {0}")]
    SigningFailed(String),

    #[error("Unauthorized")]
    Unauthorized,
}

impl OtpError {
    /// Stable error code reported to clients
    pub fn code(&self) -> &'static str {
        match self {
            OtpError::InvalidRequest(_) => "INVALID_REQUEST",
            OtpError::InvalidPhoneFormat => "INVALID_PHONE_FORMAT",
            OtpError::InvalidCodeFormat => "INVALID_CODE_FORMAT",
            OtpError::PurposeNotAllowed(_) => "PURPOSE_NOT_ALLOWED",
            OtpError::RateLimited { .. } => "RATE_LIMITED",
            OtpError::DeliveryFailed { .. } => "DELIVERY_FAILED",
            OtpError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            OtpError::NoActiveCode => "NO_ACTIVE_CODE",
            OtpError::CodeExpired => "OTP_EXPIRED",
            OtpError::TooManyAttempts => "TOO_MANY_ATTEMPTS",
            OtpError::IncorrectCode { .. } => "INVALID_OTP",
            OtpError::PhoneTaken => "PHONE_EXISTS",
            OtpError::AccountInactive => "ACCOUNT_INACTIVE",
            OtpError::IdentityCreationFailed(_) => "IDENTITY_CREATION_FAILED",
            OtpError::SigningFailed(_) => "SIGNING_FAILED",
            OtpError::Unauthorized => "UNAUTHORIZED",
        }
    }

    /// Whether the submitted code was accepted before this error happened.
    ///
    /// When true the OTP record is already consumed, so resubmitting the
    /// same code can only yield `NoActiveCode`.
    pub fn code_accepted(&self) -> bool {
        matches!(
            self,
            OtpError::AccountInactive
                | OtpError::IdentityCreationFailed(_)
                | OtpError::SigningFailed(_)
        )
    }

    /// Machine-usable hints attached to the error, if any
    pub fn details(&self) -> Option<Value> {
        match self {
            OtpError::RateLimited { retry_after } => Some(json!({
                "retry_after_secs": retry_after_secs(*retry_after),
            })),
            OtpError::IncorrectCode {
                remaining_attempts,
                exhausted,
            } => Some(json!({
                "remaining_attempts": remaining_attempts,
                "exhausted": exhausted,
            })),
            e if e.code_accepted() => Some(json!({ "code_accepted": true })),
            _ => None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            OtpError::InvalidRequest(_)
            | OtpError::InvalidPhoneFormat
            | OtpError::InvalidCodeFormat
            | OtpError::PurposeNotAllowed(_)
            | OtpError::NoActiveCode
            | OtpError::CodeExpired
            | OtpError::TooManyAttempts
            | OtpError::IncorrectCode { .. } => StatusCode::BAD_REQUEST,
            OtpError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            OtpError::DeliveryFailed { .. } => StatusCode::BAD_GATEWAY,
            OtpError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            OtpError::PhoneTaken => StatusCode::CONFLICT,
            OtpError::AccountInactive => StatusCode::FORBIDDEN,
            OtpError::IdentityCreationFailed(_) | OtpError::SigningFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            OtpError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Retry hints are rounded up so clients never retry too early
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

impl IntoResponse for OtpError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal failure detail stays in the logs
        let message = match &self {
            OtpError::StorageUnavailable(_) => "Service temporarily unavailable".to_string(),
            OtpError::IdentityCreationFailed(_) | OtpError::SigningFailed(_) => {
                "Code accepted but session could not be issued".to_string()
            }
            other => other.to_string(),
        };

        let mut error = json!({
            "code": self.code(),
            "message": message,
        });
        if let Some(details) = self.details() {
            error["details"] = details;
        }

        let mut response = (
            status,
            Json(json!({
                "success": false,
                "error": error,
            })),
        )
            .into_response();

        if let OtpError::RateLimited { retry_after } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs(*retry_after).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

impl From<JsonRejection> for OtpError {
    fn from(rejection: JsonRejection) -> Self {
        OtpError::InvalidRequest(rejection.body_text())
    }
}

/// Errors raised by the code store and the rate-limit counters
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(#[from] common::error::CacheError),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    #[error("gave up after {0} conflicting concurrent updates")]
    Contended(u32),
}

impl From<StoreError> for OtpError {
    fn from(err: StoreError) -> Self {
        OtpError::StorageUnavailable(err.to_string())
    }
}

/// Errors raised by a delivery channel
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("delivery channel misconfigured: {0}")]
    Misconfigured(String),
}

impl From<DeliveryError> for OtpError {
    fn from(err: DeliveryError) -> Self {
        OtpError::DeliveryFailed {
            reason: err.to_string(),
        }
    }
}

/// Errors raised by the identity store
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("phone number already belongs to another user")]
    PhoneTaken,

    #[error("user {0} not found")]
    NotFound(uuid::Uuid),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

/// Errors raised while signing or verifying credentials
#[derive(Error, Debug)]
pub enum SigningError {
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("signing key error: {0}")]
    Key(String),
}

impl From<SigningError> for OtpError {
    fn from(err: SigningError) -> Self {
        OtpError::SigningFailed(err.to_string())
    }
}

/// Type alias for OTP results
pub type OtpResult<T> = Result<T, OtpError>;
