use std::fmt;

use serde::{Deserialize, Serialize};

use crate::util::random_uppercase_string;

/// A short human-shareable code identifying a session.
///
/// Six uppercase alphanumerics, the only identifier clients ever need to
/// exchange (for example via a `/watch-party/{code}` link).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCode(String);

impl SessionCode {
    pub const LENGTH: usize = 6;

    /// Generates a fresh random code.
    ///
    /// Uniqueness is not guaranteed here; the coordinator retries on
    /// collision against the store.
    pub fn generate() -> Self {
        Self(random_uppercase_string(Self::LENGTH))
    }

    /// Parses a code from user input, normalizing case and trimming
    /// whitespace. Returns `None` when the input cannot be a code.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized: String = input
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.len() != Self::LENGTH {
            return None;
        }

        Some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes() {
        let code = SessionCode::parse(" ab3k9z ").unwrap();
        assert_eq!(code.as_str(), "AB3K9Z");

        assert!(SessionCode::parse("AB3").is_none());
        assert!(SessionCode::parse("AB3K9Z7").is_none());
        assert!(SessionCode::parse("").is_none());
    }

    #[test]
    fn test_generate_shape() {
        let code = SessionCode::generate();

        assert_eq!(code.as_str().len(), SessionCode::LENGTH);
        assert!(code
            .as_str()
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }
}
