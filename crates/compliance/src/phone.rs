//! E.164 phone numbers.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use dialtone_core::DomainError;

/// A phone number in E.164 form (`+` followed by 2..=15 digits, no leading zero).
///
/// Parsing accepts common formatting (spaces, dashes, dots, parentheses) and
/// normalizes it away, so `"+1 (555) 123-4567"` and `"+15551234567"` are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let trimmed = input.trim();
        let Some(rest) = trimmed.strip_prefix('+') else {
            return Err(DomainError::validation(format!(
                "phone number '{trimmed}' must start with '+' (E.164)"
            )));
        };

        let mut digits = String::with_capacity(rest.len());
        for c in rest.chars() {
            match c {
                '0'..='9' => digits.push(c),
                ' ' | '-' | '.' | '(' | ')' => {}
                _ => {
                    return Err(DomainError::validation(format!(
                        "phone number '{trimmed}' contains invalid character '{c}'"
                    )));
                }
            }
        }

        if digits.len() < 2 || digits.len() > 15 {
            return Err(DomainError::validation(format!(
                "phone number '{trimmed}' must have between 2 and 15 digits"
            )));
        }
        if digits.starts_with('0') {
            return Err(DomainError::validation(format!(
                "phone number '{trimmed}' has a leading zero country code"
            )));
        }

        Ok(Self(format!("+{digits}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PhoneNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalizes_formatting() {
        let a = PhoneNumber::parse("+1 (555) 123-4567").unwrap();
        let b = PhoneNumber::parse("+15551234567").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "+15551234567");
    }

    #[test]
    fn rejects_missing_plus_and_letters() {
        assert!(PhoneNumber::parse("15551234567").is_err());
        assert!(PhoneNumber::parse("+1555CALLNOW").is_err());
        assert!(PhoneNumber::parse("+0123456").is_err());
        assert!(PhoneNumber::parse("+1234567890123456").is_err());
    }

    #[test]
    fn deserialize_validates() {
        let ok: PhoneNumber = serde_json::from_str("\"+442071838750\"").unwrap();
        assert_eq!(ok.as_str(), "+442071838750");
        assert!(serde_json::from_str::<PhoneNumber>("\"555\"").is_err());
    }

    proptest! {
        #[test]
        fn any_valid_e164_parses_to_itself(cc in 1u8..=9, rest in "[0-9]{1,14}") {
            let raw = format!("+{cc}{rest}");
            prop_assume!(raw.len() <= 16);
            let parsed = PhoneNumber::parse(&raw).unwrap();
            prop_assert_eq!(parsed.as_str(), raw.as_str());
        }
    }
}
