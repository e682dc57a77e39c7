//! Phone number authentication with one-time passcodes
//!
//! A code is issued to a normalized phone number under per-phone and
//! per-origin rate limits, verified against a bounded number of attempts
//! before it expires, and exchanged for a signed session credential.
//!
//! Storage, delivery, identities and signing sit behind traits
//! ([`store::CodeStore`], [`delivery::CodeSender`],
//! [`identity::IdentityStore`], [`jwt::CredentialSigner`]) with
//! Postgres/Redis/Twilio adapters for production and in-memory adapters
//! in [`memory`].

pub mod cleanup;
pub mod clock;
pub mod delivery;
pub mod error;
pub mod hashing;
pub mod identity;
pub mod issuer;
pub mod jwt;
pub mod memory;
pub mod middleware;
pub mod models;
pub mod phone;
pub mod rate_limiter;
pub mod routes;
pub mod service;
pub mod session;
pub mod settings;
pub mod state;
pub mod store;
pub mod verifier;

pub use error::{OtpError, OtpResult};
pub use service::{LoginOutcome, OtpReceipt, OtpRequest, OtpService};
pub use state::AppState;
