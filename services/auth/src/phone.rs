//! Phone number normalization
//!
//! Two regional families are accepted: Kuwait (`+965`, eight digit
//! subscriber numbers starting with 5, 6 or 9) and Germany (`+49`, national
//! significant numbers of 9 to 12 digits). Everything else is rejected.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::OtpError;

/// Regional family used to interpret numbers written without a country code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Kuwait,
    Germany,
}

impl Region {
    pub fn country_code(&self) -> &'static str {
        match self {
            Region::Kuwait => "965",
            Region::Germany => "49",
        }
    }
}

/// A phone number in canonical international form (`+<cc><subscriber>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Accept a value that must already be canonical, e.g. read back from storage
    pub fn parse_canonical(value: &str) -> Option<Self> {
        normalize(value, None).ok().filter(|phone| phone.0 == value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PhoneNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

struct PhonePattern {
    regex: Regex,
    region: Region,
    /// Local forms carry no country code and are subject to the region hint
    local: bool,
}

fn patterns() -> &'static [PhonePattern] {
    static PATTERNS: OnceLock<Vec<PhonePattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let pattern = |re: &str, region, local| PhonePattern {
            regex: Regex::new(re).expect("Failed to compile phone regex"),
            region,
            local,
        };
        vec![
            pattern(r"^\+965([569]\d{7})$", Region::Kuwait, false),
            pattern(r"^965([569]\d{7})$", Region::Kuwait, false),
            pattern(r"^\+49([1-9]\d{8,11})$", Region::Germany, false),
            pattern(r"^([569]\d{7})$", Region::Kuwait, true),
            pattern(r"^0([1-9]\d{8,11})$", Region::Germany, true),
        ]
    })
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || matches!(c, '-' | '(' | ')' | '.' | '/')
}

/// Normalize raw user input into a canonical [`PhoneNumber`].
///
/// Pure and deterministic: the same `(raw, region_hint)` always yields the
/// same result, and canonical output normalizes to itself.
pub fn normalize(raw: &str, region_hint: Option<Region>) -> Result<PhoneNumber, OtpError> {
    let cleaned: String = raw.chars().filter(|c| !is_separator(*c)).collect();

    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(OtpError::InvalidPhoneFormat);
    }

    for pattern in patterns() {
        if pattern.local && region_hint.is_some_and(|hint| hint != pattern.region) {
            continue;
        }
        if let Some(caps) = pattern.regex.captures(&cleaned) {
            return Ok(PhoneNumber(format!(
                "+{}{}",
                pattern.region.country_code(),
                &caps[1]
            )));
        }
    }

    Err(OtpError::InvalidPhoneFormat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(raw: &str) -> String {
        normalize(raw, None).unwrap().to_string()
    }

    #[test]
    fn test_kuwait_forms() {
        assert_eq!(canonical("+96551234567"), "+96551234567");
        assert_eq!(canonical("96561234567"), "+96561234567");
        assert_eq!(canonical("91234567"), "+96591234567");
        assert_eq!(canonical("+965 5123-4567"), "+96551234567");
        assert_eq!(canonical("(965) 512 345 67"), "+96551234567");
    }

    #[test]
    fn test_german_forms() {
        assert_eq!(canonical("+49 151 23456789"), "+4915123456789");
        assert_eq!(canonical("0151/23456789"), "+4915123456789");
        assert_eq!(canonical("030 1234567"), "+49301234567");
        assert_eq!(canonical("+49 (30) 1234-5678"), "+493012345678");
    }

    #[test]
    fn test_rejects_malformed_input() {
        for raw in [
            "",
            "12345",
            "+1 555",
            "+96541234567",
            "+9655123456",
            "5123456a",
            "+49 0151 2345678",
            "0012345678",
            "++96551234567",
            "965+51234567",
            "+49 12345",
        ] {
            assert!(
                matches!(normalize(raw, None), Err(OtpError::InvalidPhoneFormat)),
                "expected rejection for {raw:?}"
            );
        }
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in [
            "+96551234567",
            "96561234567",
            "9 1234 567",
            "+49 151 23456789",
            "0151 23456789",
            "030-1234567",
        ] {
            let once = normalize(raw, None).unwrap();
            let twice = normalize(once.as_str(), None).unwrap();
            assert_eq!(once, twice, "not idempotent for {raw:?}");
            // Canonical forms are accepted whatever the hint
            assert_eq!(normalize(once.as_str(), Some(Region::Kuwait)).unwrap(), once);
            assert_eq!(normalize(once.as_str(), Some(Region::Germany)).unwrap(), once);
        }
    }

    #[test]
    fn test_region_hint_restricts_local_forms() {
        assert!(normalize("51234567", Some(Region::Germany)).is_err());
        assert!(normalize("015123456789", Some(Region::Kuwait)).is_err());
        assert_eq!(
            normalize("51234567", Some(Region::Kuwait)).unwrap().as_str(),
            "+96551234567"
        );
        assert_eq!(
            normalize("015123456789", Some(Region::Germany))
                .unwrap()
                .as_str(),
            "+4915123456789"
        );
    }

    #[test]
    fn test_parse_canonical_only_accepts_canonical_values() {
        assert!(PhoneNumber::parse_canonical("+96551234567").is_some());
        assert!(PhoneNumber::parse_canonical("51234567").is_none());
        assert!(PhoneNumber::parse_canonical("+965 51234567").is_none());
    }
}
