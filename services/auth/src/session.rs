//! Session issuance after a successful verification

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{IdentityError, OtpError, OtpResult};
use crate::identity::IdentityStore;
use crate::jwt::{CredentialSigner, SessionClaims};
use crate::models::User;
use crate::phone::PhoneNumber;

/// Signed, stateless proof of a phone login
#[derive(Debug, Clone, Serialize)]
pub struct SessionCredential {
    pub user_id: Uuid,
    pub phone_number: PhoneNumber,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token: String,
}

/// Session issuer binding verified phones to identities
#[derive(Clone)]
pub struct SessionIssuer {
    identities: Arc<dyn IdentityStore>,
    signer: Arc<dyn CredentialSigner>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

fn identity_failure(phone: &PhoneNumber, err: IdentityError) -> OtpError {
    error!("Failed to resolve identity for {}: {}", phone, err);
    OtpError::IdentityCreationFailed(err.to_string())
}

impl SessionIssuer {
    /// Create a new session issuer
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        signer: Arc<dyn CredentialSigner>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            identities,
            signer,
            clock,
            ttl,
        }
    }

    async fn resolve_user(
        &self,
        phone: &PhoneNumber,
        associated_user_id: Option<Uuid>,
    ) -> OtpResult<User> {
        if let Some(id) = associated_user_id {
            match self.identities.find_by_id(id).await {
                Ok(Some(user)) if user.phone_number == *phone => return Ok(user),
                Ok(Some(_)) => warn!("User {} bound to code for {} moved to another number", id, phone),
                Ok(None) => warn!("User {} bound to code for {} no longer exists", id, phone),
                Err(e) => return Err(identity_failure(phone, e)),
            }
        }

        self.identities
            .find_or_create_user(phone)
            .await
            .map_err(|e| identity_failure(phone, e))
    }

    /// Issue a session credential for a verified phone
    pub async fn issue_session(
        &self,
        phone: &PhoneNumber,
        associated_user_id: Option<Uuid>,
    ) -> OtpResult<(SessionCredential, User)> {
        let user = self.resolve_user(phone, associated_user_id).await?;
        if !user.is_active {
            warn!("Refusing session for inactive user {}", user.id);
            return Err(OtpError::AccountInactive);
        }

        let issued_at = self.clock.now();
        let expires_at = issued_at + self.ttl;
        let claims = SessionClaims {
            sub: user.id,
            phone_number: phone.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = self.signer.sign(&claims).map_err(|e| {
            error!("Failed to sign session for user {}: {}", user.id, e);
            OtpError::from(e)
        })?;

        info!("Issued session for user {} ({})", user.id, phone);
        Ok((
            SessionCredential {
                user_id: user.id,
                phone_number: phone.clone(),
                issued_at,
                expires_at,
                token,
            },
            user,
        ))
    }

    /// Validate a bearer token and return its claims
    pub fn authenticate(&self, token: &str) -> OtpResult<SessionClaims> {
        self.signer.verify_signature(token).map_err(|e| {
            warn!("Rejected session token: {}", e);
            OtpError::Unauthorized
        })
    }
}
