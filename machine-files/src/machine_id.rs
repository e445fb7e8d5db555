//! Machine identifier validation.
//!
//! A [`MachineId`] is the only key the blob store understands, so every identifier that arrives
//! over the wire goes through [`IdentifierPolicy::validate`] before anything touches storage.
//!
//! Normalization is deliberately minimal: surrounding whitespace is trimmed and nothing else.
//! **Case is preserved and significant** - `M-001` and `m-001` name two different machines and
//! map to two different records. Storage backends must not fold case when deriving their own
//! keys from a `MachineId`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::IdentifierConfig;
use crate::errors::{Error, Result};

/// A validated machine identifier.
///
/// Only constructed through [`IdentifierPolicy::validate`], or deserialized from records the
/// store wrote itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

impl MachineId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MachineId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Charset and length rules for machine identifiers.
///
/// ASCII letters and digits are always allowed; the punctuation set comes from configuration
/// (`-` and `_` by default). Config validation guarantees it never includes path separators or
/// `.`, so a valid identifier can never spell `..` or a nested path.
#[derive(Debug, Clone)]
pub struct IdentifierPolicy {
    max_length: usize,
    allowed_punctuation: Vec<char>,
}

impl IdentifierPolicy {
    pub fn new(config: &IdentifierConfig) -> Self {
        Self {
            max_length: config.max_length,
            allowed_punctuation: config.allowed_punctuation.chars().collect(),
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn is_allowed(&self, c: char) -> bool {
        c.is_ascii_alphanumeric() || self.allowed_punctuation.contains(&c)
    }

    /// Validate a raw identifier taken from a request.
    pub fn validate(&self, raw: &str) -> Result<MachineId> {
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(Error::InvalidIdentifier {
                reason: "identifier is empty".to_string(),
            });
        }

        let length = trimmed.chars().count();
        if length > self.max_length {
            return Err(Error::InvalidIdentifier {
                reason: format!("identifier is {length} characters, maximum is {}", self.max_length),
            });
        }

        if let Some(bad) = trimmed.chars().find(|c| !self.is_allowed(*c)) {
            return Err(Error::InvalidIdentifier {
                reason: format!("identifier contains disallowed character {bad:?}"),
            });
        }

        Ok(MachineId(trimmed.to_string()))
    }
}

impl Default for IdentifierPolicy {
    fn default() -> Self {
        Self::new(&IdentifierConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> IdentifierPolicy {
        IdentifierPolicy::default()
    }

    #[test]
    fn test_accepts_typical_identifiers() {
        for raw in ["m-001", "MACHINE_42", "a", "0", "line-3_press-7"] {
            let id = policy().validate(raw).unwrap();
            assert_eq!(id.as_str(), raw);
        }
    }

    #[test]
    fn test_trims_surrounding_whitespace_only() {
        let id = policy().validate("  m-001\t\n").unwrap();
        assert_eq!(id.as_str(), "m-001");

        assert!(policy().validate("m 001").is_err());
    }

    #[test]
    fn test_case_is_significant() {
        let upper = policy().validate("M-001").unwrap();
        let lower = policy().validate("m-001").unwrap();
        assert_ne!(upper, lower);
        assert_eq!(upper.as_str(), "M-001");
    }

    #[test]
    fn test_rejects_empty_and_blank() {
        assert!(matches!(policy().validate(""), Err(Error::InvalidIdentifier { .. })));
        assert!(matches!(policy().validate("   "), Err(Error::InvalidIdentifier { .. })));
    }

    #[test]
    fn test_length_boundary() {
        let max = policy().max_length();
        assert!(policy().validate(&"a".repeat(max)).is_ok());
        assert!(matches!(
            policy().validate(&"a".repeat(max + 1)),
            Err(Error::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_rejects_path_like_identifiers() {
        for raw in ["../etc", "..", "a/b", "a\\b", "m.001", "/abs", "m%2F1", "m\0"] {
            assert!(
                matches!(policy().validate(raw), Err(Error::InvalidIdentifier { .. })),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_non_ascii_letters() {
        assert!(policy().validate("machine-é").is_err());
        assert!(policy().validate("машина").is_err());
    }

    #[test]
    fn test_custom_punctuation() {
        let policy = IdentifierPolicy::new(&IdentifierConfig {
            max_length: 8,
            allowed_punctuation: ":".to_string(),
        });

        assert!(policy.validate("rack:12").is_ok());
        assert!(policy.validate("rack-12").is_err());
        assert!(policy.validate("rack:1234").is_err());
    }
}
