//! OTP code generation and keyed hashing
//!
//! Codes are hashed with HMAC-SHA256 under a server-side key. The phone
//! number and purpose are part of the MAC input, so a stored hash is only
//! ever valid for the record it was issued for.

use hmac::{Hmac, Mac, digest::InvalidLength};
use rand::{Rng, rngs::OsRng};
use sha2::Sha256;

use crate::models::Purpose;
use crate::phone::PhoneNumber;

type HmacSha256 = Hmac<Sha256>;

/// Number of digits in an OTP code
pub const CODE_LENGTH: usize = 5;

/// Generate a uniformly random numeric code, zero padded
pub fn generate_code() -> String {
    let value: u32 = OsRng.gen_range(0..10u32.pow(CODE_LENGTH as u32));
    format!("{:0width$}", value, width = CODE_LENGTH)
}

/// Whether a submitted code has the shape of an OTP code at all
pub fn is_well_formed(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| b.is_ascii_digit())
}

/// Keyed hasher for OTP codes
#[derive(Clone)]
pub struct CodeHasher {
    mac: HmacSha256,
}

impl CodeHasher {
    pub fn new(key: &[u8]) -> Result<Self, InvalidLength> {
        Ok(Self {
            mac: HmacSha256::new_from_slice(key)?,
        })
    }

    fn keyed(&self, phone: &PhoneNumber, purpose: Purpose, code: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(purpose.as_str().as_bytes());
        mac.update(b"|");
        mac.update(phone.as_str().as_bytes());
        mac.update(b"|");
        mac.update(code.as_bytes());
        mac
    }

    /// Hex encoded MAC of the code bound to `(phone, purpose)`
    pub fn hash(&self, phone: &PhoneNumber, purpose: Purpose, code: &str) -> String {
        hex::encode(self.keyed(phone, purpose, code).finalize().into_bytes())
    }

    /// Constant-time comparison of a submitted code against a stored hash
    pub fn verify(&self, phone: &PhoneNumber, purpose: Purpose, code: &str, expected: &str) -> bool {
        let Ok(expected) = hex::decode(expected) else {
            return false;
        };
        self.keyed(phone, purpose, code)
            .verify_slice(&expected)
            .is_ok()
    }
}
