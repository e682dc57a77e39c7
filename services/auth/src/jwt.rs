//! JWT service for signing and validating session credentials
//!
//! Tokens are signed with RS256 when a PEM key pair is configured, or with
//! HS256 when only a shared secret is available.

use anyhow::Result;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SigningError;

/// Key material used to sign session credentials
#[derive(Debug, Clone)]
pub enum JwtKeys {
    /// RSA key pair in PEM format
    Rsa {
        private_key: String,
        public_key: String,
    },
    /// Shared secret
    Secret(String),
}

/// JWT configuration
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub keys: JwtKeys,
}

/// Read a PEM value given either inline or as a path to a key file
fn read_pem(var: &str) -> Result<String> {
    let value = std::env::var(var)
        .map_err(|_| anyhow::anyhow!("{} environment variable not set", var))?;

    if value.starts_with("-----BEGIN") {
        return Ok(value);
    }

    // Try the working directory first, then the crate root
    let pem = std::fs::read_to_string(&value)
        .or_else(|_| {
            let mut path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
            path.push(&value);
            std::fs::read_to_string(path)
        })
        .map_err(|e| anyhow::anyhow!("Failed to read key file for {}: {}", var, e))?;

    Ok(pem.trim().to_string())
}

impl JwtConfig {
    /// Create a new JwtConfig from environment variables
    ///
    /// # Environment Variables
    /// - `JWT_SECRET`: Shared secret for HS256 signing. Takes precedence when set.
    /// - `JWT_PRIVATE_KEY`: Private key for RS256 signing (PEM format) or path to private key file
    /// - `JWT_PUBLIC_KEY`: Public key for RS256 verification (PEM format) or path to public key file
    pub fn from_env() -> Result<Self> {
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            if secret.is_empty() {
                return Err(anyhow::anyhow!("JWT_SECRET must not be empty"));
            }
            return Ok(JwtConfig {
                keys: JwtKeys::Secret(secret),
            });
        }

        Ok(JwtConfig {
            keys: JwtKeys::Rsa {
                private_key: read_pem("JWT_PRIVATE_KEY")?,
                public_key: read_pem("JWT_PUBLIC_KEY")?,
            },
        })
    }
}

/// Claims carried by a session credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User ID
    pub sub: Uuid,
    /// Canonical phone number the session was issued for
    pub phone_number: String,
    /// Issued at, seconds since the epoch
    pub iat: i64,
    /// Expiration, seconds since the epoch
    pub exp: i64,
}

/// Signs and checks session credentials
pub trait CredentialSigner: Send + Sync {
    fn sign(&self, claims: &SessionClaims) -> Result<String, SigningError>;

    /// Check signature and expiry, returning the embedded claims
    fn verify_signature(&self, token: &str) -> Result<SessionClaims, SigningError>;
}

/// JWT service
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    validation: Validation,
}

impl JwtService {
    /// Initialize a new JWT service
    pub fn new(config: JwtConfig) -> Result<Self, SigningError> {
        let (encoding_key, decoding_key, algorithm) = match &config.keys {
            JwtKeys::Rsa {
                private_key,
                public_key,
            } => (
                EncodingKey::from_rsa_pem(private_key.as_bytes())?,
                DecodingKey::from_rsa_pem(public_key.as_bytes())?,
                Algorithm::RS256,
            ),
            JwtKeys::Secret(secret) => {
                if secret.is_empty() {
                    return Err(SigningError::Key("empty shared secret".to_string()));
                }
                (
                    EncodingKey::from_secret(secret.as_bytes()),
                    DecodingKey::from_secret(secret.as_bytes()),
                    Algorithm::HS256,
                )
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        validation.leeway = 0;

        Ok(JwtService {
            encoding_key,
            decoding_key,
            algorithm,
            validation,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }
}

impl CredentialSigner for JwtService {
    fn sign(&self, claims: &SessionClaims) -> Result<String, SigningError> {
        Ok(encode(
            &Header::new(self.algorithm),
            claims,
            &self.encoding_key,
        )?)
    }

    fn verify_signature(&self, token: &str) -> Result<SessionClaims, SigningError> {
        let token_data = decode::<SessionClaims>(token, &self.decoding_key, &self.validation)?;
        Ok(token_data.claims)
    }
}
