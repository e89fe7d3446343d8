use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use super::ValidationError;

const MAX_LEN: usize = 256;

/// A recipient address, trimmed and lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress(String);

impl FromStr for EmailAddress {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
        let re = EMAIL_REGEX
            .get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"));

        let invalid = |reason| ValidationError::EmailAddress {
            value: value.to_string(),
            reason,
        };

        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(invalid("cannot be empty"));
        }
        if trimmed.chars().count() > MAX_LEN {
            return Err(invalid("too long"));
        }
        if !re.is_match(trimmed) {
            return Err(invalid("incorrect format"));
        }

        Ok(Self(trimmed.to_lowercase()))
    }
}

impl AsRef<str> for EmailAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes() {
        let e: EmailAddress = "  Ops@Example.COM ".parse().unwrap();
        assert_eq!(e.as_ref(), "ops@example.com");
    }

    #[test]
    fn test_rejects_bad_addresses() {
        for bad in ["", "   ", "example.com", "@example.com", "a@b", "a b@c.d"] {
            assert!(bad.parse::<EmailAddress>().is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_too_long() {
        let local = "a".repeat(MAX_LEN);
        assert!(format!("{}@example.com", local).parse::<EmailAddress>().is_err());
    }
}
