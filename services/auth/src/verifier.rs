//! OTP verification
//!
//! Every decision is taken against a snapshot of the latest pending record
//! and committed with a version compare-and-swap. If another verifier
//! committed first, the snapshot is re-read and the rules are applied
//! again, so concurrent submissions never double count an attempt and at
//! most one of them can observe success.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{OtpError, OtpResult, StoreError};
use crate::hashing::{CodeHasher, is_well_formed};
use crate::models::{OtpRecord, OtpStatus, Purpose};
use crate::phone::PhoneNumber;
use crate::store::CodeStore;

/// Re-read rounds before a conflicting record is reported as unavailable
const CAS_ROUNDS: u32 = 5;

/// A code that was accepted and consumed
#[derive(Debug, Clone)]
pub struct VerifiedCode {
    pub record_id: Uuid,
    pub phone_number: PhoneNumber,
    pub purpose: Purpose,
    pub associated_user_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct OtpVerifier {
    store: Arc<dyn CodeStore>,
    hasher: CodeHasher,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl OtpVerifier {
    pub fn new(
        store: Arc<dyn CodeStore>,
        hasher: CodeHasher,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            hasher,
            clock,
            max_attempts,
        }
    }

    /// Check `code` against the pending record for `(phone, purpose)`
    pub async fn verify(
        &self,
        phone: &PhoneNumber,
        purpose: Purpose,
        code: &str,
    ) -> OtpResult<VerifiedCode> {
        self.evaluate(phone, purpose, code, None).await
    }

    /// Like [`verify`](Self::verify), but only a record issued on behalf of
    /// `owner` is considered; any other pending record is left untouched.
    pub async fn verify_owned(
        &self,
        phone: &PhoneNumber,
        purpose: Purpose,
        code: &str,
        owner: Uuid,
    ) -> OtpResult<VerifiedCode> {
        self.evaluate(phone, purpose, code, Some(owner)).await
    }

    /// Apply the verification rules to `record`, mutating it in place
    fn judge(&self, record: &mut OtpRecord, code: &str) -> OtpResult<()> {
        if record.is_expired_at(self.clock.now()) {
            record.status = OtpStatus::Expired;
            return Err(OtpError::CodeExpired);
        }
        if record.attempts >= self.max_attempts {
            record.status = OtpStatus::Exhausted;
            return Err(OtpError::TooManyAttempts);
        }

        record.attempts += 1;
        if self
            .hasher
            .verify(&record.phone_number, record.purpose, code, &record.code_hash)
        {
            record.status = OtpStatus::Verified;
            Ok(())
        } else {
            Err(OtpError::IncorrectCode {
                remaining_attempts: record.remaining_attempts(self.max_attempts),
                exhausted: record.attempts >= self.max_attempts,
            })
        }
    }

    async fn evaluate(
        &self,
        phone: &PhoneNumber,
        purpose: Purpose,
        code: &str,
        owner: Option<Uuid>,
    ) -> OtpResult<VerifiedCode> {
        if !is_well_formed(code) {
            return Err(OtpError::InvalidCodeFormat);
        }

        for round in 1..=CAS_ROUNDS {
            let Some(mut record) = self.store.find_pending(phone, purpose).await? else {
                return Err(OtpError::NoActiveCode);
            };
            if owner.is_some() && record.associated_user_id != owner {
                warn!("Pending {} code for {} belongs to another user", purpose, phone);
                return Err(OtpError::NoActiveCode);
            }

            let verdict = self.judge(&mut record, code);
            if !self.store.compare_and_swap(&record).await? {
                warn!(
                    "Concurrent update of {} code {} for {}, round {}",
                    purpose, record.id, phone, round
                );
                continue;
            }

            return match verdict {
                Ok(()) => {
                    info!("Verified {} code {} for {}", purpose, record.id, phone);
                    Ok(VerifiedCode {
                        record_id: record.id,
                        phone_number: record.phone_number,
                        purpose: record.purpose,
                        associated_user_id: record.associated_user_id,
                    })
                }
                Err(e) => {
                    warn!(
                        "Rejected {} code {} for {}: {} (attempts {})",
                        purpose,
                        record.id,
                        phone,
                        e.code(),
                        record.attempts
                    );
                    Err(e)
                }
            };
        }

        Err(StoreError::Contended(CAS_ROUNDS).into())
    }
}
