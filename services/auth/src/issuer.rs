//! OTP issuance: generate, store, deliver

use std::sync::Arc;

use chrono::Duration;
use serde::Deserialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::delivery::CodeSender;
use crate::error::{OtpError, OtpResult};
use crate::hashing::{CodeHasher, generate_code};
use crate::models::{OtpRecord, Purpose};
use crate::phone::PhoneNumber;
use crate::store::CodeStore;

/// What to tell the caller when a stored code could not be delivered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryFailurePolicy {
    /// Fail the request with `DeliveryFailed`
    #[default]
    Reject,
    /// Succeed with `delivered = false`
    Report,
}

/// A freshly stored code
#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub record: OtpRecord,
    pub delivered: bool,
}

#[derive(Clone)]
pub struct OtpIssuer {
    store: Arc<dyn CodeStore>,
    sender: Arc<dyn CodeSender>,
    hasher: CodeHasher,
    clock: Arc<dyn Clock>,
    code_ttl: Duration,
    on_delivery_failure: DeliveryFailurePolicy,
}

impl OtpIssuer {
    pub fn new(
        store: Arc<dyn CodeStore>,
        sender: Arc<dyn CodeSender>,
        hasher: CodeHasher,
        clock: Arc<dyn Clock>,
        code_ttl: Duration,
        on_delivery_failure: DeliveryFailurePolicy,
    ) -> Self {
        Self {
            store,
            sender,
            hasher,
            clock,
            code_ttl,
            on_delivery_failure,
        }
    }

    pub fn code_ttl(&self) -> Duration {
        self.code_ttl
    }

    /// Issue a new code for `(phone, purpose)`, superseding any pending one.
    ///
    /// The caller must already have been admitted by the rate limiter.
    pub async fn issue(
        &self,
        phone: &PhoneNumber,
        purpose: Purpose,
        associated_user_id: Option<Uuid>,
    ) -> OtpResult<IssuedCode> {
        let code = generate_code();
        let record = OtpRecord::new(
            phone.clone(),
            purpose,
            self.hasher.hash(phone, purpose, &code),
            associated_user_id,
            self.clock.now(),
            self.code_ttl,
        );

        self.store.replace_pending(&record).await.map_err(|e| {
            error!("Failed to store {} code for {}: {}", purpose, phone, e);
            OtpError::from(e)
        })?;
        info!(
            "Issued {} code {} for {}, expires at {}",
            purpose, record.id, phone, record.expires_at
        );

        match self.sender.send(phone, &code, purpose).await {
            Ok(()) => Ok(IssuedCode {
                record,
                delivered: true,
            }),
            Err(e) => {
                error!("Failed to deliver {} code {} to {}: {}", purpose, record.id, phone, e);
                match self.on_delivery_failure {
                    DeliveryFailurePolicy::Reject => Err(e.into()),
                    DeliveryFailurePolicy::Report => Ok(IssuedCode {
                        record,
                        delivered: false,
                    }),
                }
            }
        }
    }
}
