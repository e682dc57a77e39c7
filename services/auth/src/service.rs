//! OTP service: the operations exposed to callers
//!
//! Wires the normalizer, rate limiter, issuer, verifier and session issuer
//! into the request, verify and phone change flows.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{IdentityError, OtpError, OtpResult};
use crate::identity::IdentityStore;
use crate::issuer::OtpIssuer;
use crate::jwt::SessionClaims;
use crate::models::{Purpose, User};
use crate::phone::{PhoneNumber, Region, normalize};
use crate::rate_limiter::{Admission, RateLimiter};
use crate::session::{SessionCredential, SessionIssuer};
use crate::store::CodeStore;
use crate::verifier::OtpVerifier;

/// A request for a new code
#[derive(Debug, Clone)]
pub struct OtpRequest {
    pub raw_phone: String,
    pub purpose: Purpose,
    /// Network address the request came from
    pub origin: IpAddr,
    /// Authenticated user asking for the code, required for phone changes
    pub requested_by: Option<Uuid>,
}

/// Acknowledgement of an issued code. Never carries the code itself.
#[derive(Debug, Clone, Serialize)]
pub struct OtpReceipt {
    pub phone_number: PhoneNumber,
    pub purpose: Purpose,
    pub expires_in_secs: u64,
    pub delivered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub credential: SessionCredential,
    pub user: User,
}

#[derive(Clone)]
pub struct OtpService {
    limiter: RateLimiter,
    issuer: OtpIssuer,
    verifier: OtpVerifier,
    sessions: SessionIssuer,
    identities: Arc<dyn IdentityStore>,
    store: Arc<dyn CodeStore>,
    clock: Arc<dyn Clock>,
    region_hint: Option<Region>,
}

fn identity_lookup_failed(err: IdentityError) -> OtpError {
    error!("Identity lookup failed: {}", err);
    OtpError::StorageUnavailable(err.to_string())
}

impl OtpService {
    pub fn new(
        limiter: RateLimiter,
        issuer: OtpIssuer,
        verifier: OtpVerifier,
        sessions: SessionIssuer,
        identities: Arc<dyn IdentityStore>,
        store: Arc<dyn CodeStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiter,
            issuer,
            verifier,
            sessions,
            identities,
            store,
            clock,
            region_hint: None,
        }
    }

    /// Read numbers without a country code as belonging to `region`
    pub fn with_region_hint(mut self, region: Option<Region>) -> Self {
        self.region_hint = region;
        self
    }

    fn normalize(&self, raw: &str) -> OtpResult<PhoneNumber> {
        normalize(raw, self.region_hint).inspect_err(|_| {
            warn!("Rejected malformed phone number input");
        })
    }

    /// Issue a code for a login or a phone change
    pub async fn request_otp(&self, request: OtpRequest) -> OtpResult<OtpReceipt> {
        let phone = self.normalize(&request.raw_phone)?;

        // Refused phone changes must not consume rate-limit budget
        let associated_user_id = match request.purpose {
            Purpose::Login => None,
            Purpose::PhoneChange => {
                let Some(requester) = request.requested_by else {
                    return Err(OtpError::PurposeNotAllowed(request.purpose));
                };
                let owner = self
                    .identities
                    .find_user(&phone)
                    .await
                    .map_err(identity_lookup_failed)?;
                if owner.is_some_and(|owner| owner.id != requester) {
                    warn!("Phone change to {} refused: number already registered", phone);
                    return Err(OtpError::PhoneTaken);
                }
                Some(requester)
            }
        };

        if let Admission::RateLimited { retry_after } =
            self.limiter.admit(&phone, request.origin).await?
        {
            return Err(OtpError::RateLimited { retry_after });
        }

        let associated_user_id = match request.purpose {
            Purpose::Login => self
                .identities
                .find_user(&phone)
                .await
                .map_err(identity_lookup_failed)?
                .map(|user| user.id),
            Purpose::PhoneChange => associated_user_id,
        };

        let issued = self
            .issuer
            .issue(&phone, request.purpose, associated_user_id)
            .await?;

        Ok(OtpReceipt {
            phone_number: phone,
            purpose: request.purpose,
            expires_in_secs: self.issuer.code_ttl().num_seconds().max(0) as u64,
            delivered: issued.delivered,
        })
    }

    /// Verify a login code and mint a session
    pub async fn verify_otp(
        &self,
        raw_phone: &str,
        purpose: Purpose,
        code: &str,
    ) -> OtpResult<LoginOutcome> {
        if purpose != Purpose::Login {
            return Err(OtpError::PurposeNotAllowed(purpose));
        }
        let phone = self.normalize(raw_phone)?;

        let verified = self.verifier.verify(&phone, purpose, code).await?;
        let (credential, user) = self
            .sessions
            .issue_session(&verified.phone_number, verified.associated_user_id)
            .await?;

        Ok(LoginOutcome { credential, user })
    }

    /// Move `user_id` to a new phone number proven by `code`
    pub async fn change_phone(
        &self,
        user_id: Uuid,
        raw_new_phone: &str,
        code: &str,
    ) -> OtpResult<User> {
        let phone = self.normalize(raw_new_phone)?;

        self.verifier
            .verify_owned(&phone, Purpose::PhoneChange, code, user_id)
            .await?;

        let user = self
            .identities
            .update_phone(user_id, &phone)
            .await
            .map_err(|e| match e {
                IdentityError::PhoneTaken => OtpError::PhoneTaken,
                IdentityError::NotFound(_) => OtpError::Unauthorized,
                other => identity_lookup_failed(other),
            })?;

        info!("User {} changed phone number to {}", user.id, phone);
        Ok(user)
    }

    /// Validate a bearer credential
    pub fn authenticate(&self, token: &str) -> OtpResult<SessionClaims> {
        self.sessions.authenticate(token)
    }

    /// Delete records whose expiry has passed
    pub async fn purge_expired(&self) -> OtpResult<u64> {
        let deleted = self.store.delete_expired(self.clock.now()).await?;
        if deleted > 0 {
            info!("Purged {} expired OTP records", deleted);
        }
        Ok(deleted)
    }
}
