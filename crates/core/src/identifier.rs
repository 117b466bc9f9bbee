use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;

pub const MIN_IDENTIFIER_LEN: usize = 3;
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Identifiers that are needed for system level routing and cannot be claimed by signups.
pub const RESERVED_IDENTIFIERS: &[&str] = &[
    "www",
    "api",
    "admin",
    "mail",
    "ftp",
    "localhost",
    "public",
    "test",
    "demo",
];

/// Identifier of the tenant that owns cross-tenant administrative data.
pub const PUBLIC_IDENTIFIER: &str = "public";

/// Normalized tenant identifier.
///
/// Values can only be built through [`TenantIdentifier::parse`], so every
/// instance is lowercase, starts with a letter, contains only `[a-z0-9-]`,
/// and is between [`MIN_IDENTIFIER_LEN`] and [`MAX_IDENTIFIER_LEN`] bytes long.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantIdentifier(String);

impl TenantIdentifier {
    /// Trims and lowercases the candidate, then checks format and length.
    ///
    /// Reserved words are accepted here; see [`IdentifierPolicy`].
    pub fn parse(candidate: &str) -> Result<Self, IdentifierError> {
        let normalized = candidate.trim().to_lowercase();

        if !is_well_formed(&normalized) {
            return Err(IdentifierError::InvalidFormat);
        }
        if normalized.len() < MIN_IDENTIFIER_LEN {
            return Err(IdentifierError::TooShort);
        }
        if normalized.len() > MAX_IDENTIFIER_LEN {
            return Err(IdentifierError::TooLong);
        }

        Ok(Self(normalized))
    }

    /// The bootstrap tenant used for hosts that do not belong to a customer.
    pub fn public() -> Self {
        Self(PUBLIC_IDENTIFIER.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_reserved(&self) -> bool {
        RESERVED_IDENTIFIERS.contains(&self.0.as_str())
    }

    pub fn is_public(&self) -> bool {
        self.0 == PUBLIC_IDENTIFIER
    }

    /// Builds the primary hostname `{identifier}.{base_domain}`.
    pub fn hostname_under(&self, base_domain: &str) -> String {
        format!("{}.{}", self.0, base_domain)
    }
}

impl fmt::Display for TenantIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for TenantIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

fn is_well_formed(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Reasons an identifier cannot be used for a new tenant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("identifier must start with a letter and contain only lowercase letters, numbers, and hyphens")]
    InvalidFormat,
    #[error("identifier must be at least 3 characters long")]
    TooShort,
    #[error("identifier must be at most 63 characters long")]
    TooLong,
    #[error("the identifier '{0}' is reserved")]
    Reserved(String),
    #[error("this identifier is already taken")]
    Taken(String),
}

impl IdentifierError {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "invalid_format",
            Self::TooShort => "too_short",
            Self::TooLong => "too_long",
            Self::Reserved(_) => "reserved",
            Self::Taken(_) => "taken",
        }
    }

    /// Short wording used by the availability check.
    pub fn availability_message(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "Invalid identifier format",
            Self::TooShort => "Too short",
            Self::TooLong => "Too long",
            Self::Reserved(_) => "Reserved",
            Self::Taken(_) => "Already taken",
        }
    }
}

/// Local (non-registry) checks applied to a candidate identifier.
#[derive(Debug, Clone, Copy)]
pub struct IdentifierPolicy {
    enforce_reserved: bool,
}

impl IdentifierPolicy {
    /// Rules applied to public signups.
    pub fn signup() -> Self {
        Self {
            enforce_reserved: true,
        }
    }

    /// Rules applied to operator commands, which may claim reserved identifiers.
    pub fn operator() -> Self {
        Self {
            enforce_reserved: false,
        }
    }

    pub fn check(&self, candidate: &str) -> Result<TenantIdentifier, IdentifierError> {
        let identifier = TenantIdentifier::parse(candidate)?;
        if self.enforce_reserved && identifier.is_reserved() {
            return Err(IdentifierError::Reserved(identifier.0));
        }
        Ok(identifier)
    }
}

impl Default for IdentifierPolicy {
    fn default() -> Self {
        Self::signup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_and_normalizes_valid_identifiers() {
        for (input, expected) in [
            ("acme", "acme"),
            ("  Acme-Corp2 ", "acme-corp2"),
            ("a-1", "a-1"),
            ("abc-", "abc-"),
        ] {
            let id = IdentifierPolicy::signup()
                .check(input)
                .unwrap_or_else(|err| panic!("{input} should be accepted: {err}"));
            assert_eq!(id.as_str(), expected);
        }

        let longest = format!("a{}", "b".repeat(MAX_IDENTIFIER_LEN - 1));
        assert!(TenantIdentifier::parse(&longest).is_ok());
    }

    #[test]
    fn rejects_invalid_format() {
        for input in ["Acme!", "", "   ", "1acme", "-acme", "ac me", "acme_co", "acmé"] {
            assert_eq!(
                TenantIdentifier::parse(input),
                Err(IdentifierError::InvalidFormat),
                "{input:?} should be rejected as invalid format"
            );
        }
    }

    #[test]
    fn rejects_by_length() {
        assert_eq!(TenantIdentifier::parse("ab"), Err(IdentifierError::TooShort));
        assert_eq!(TenantIdentifier::parse("a"), Err(IdentifierError::TooShort));

        let too_long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert_eq!(TenantIdentifier::parse(&too_long), Err(IdentifierError::TooLong));
    }

    #[test]
    fn reserved_words_depend_on_policy() {
        for word in RESERVED_IDENTIFIERS {
            let err = IdentifierPolicy::signup()
                .check(word)
                .expect_err("reserved word must be rejected");
            assert_eq!(err.reason(), "reserved");
        }

        let public = IdentifierPolicy::operator()
            .check("PUBLIC")
            .expect("operators may claim reserved identifiers");
        assert!(public.is_public());
        assert_eq!(public, TenantIdentifier::public());
    }

    #[test]
    fn reasons_are_distinct() {
        let errors = [
            IdentifierError::InvalidFormat,
            IdentifierError::TooShort,
            IdentifierError::TooLong,
            IdentifierError::Reserved("admin".into()),
            IdentifierError::Taken("acme".into()),
        ];
        let mut messages: Vec<_> = errors.iter().map(|e| e.availability_message()).collect();
        messages.sort();
        messages.dedup();
        assert_eq!(messages.len(), errors.len());
        assert_eq!(
            IdentifierError::Reserved("admin".into()).to_string(),
            "the identifier 'admin' is reserved"
        );
    }

    #[test]
    fn builds_hostname_and_serializes_as_string() {
        let id = TenantIdentifier::parse("acme").unwrap();
        assert_eq!(id.hostname_under("example.com"), "acme.example.com");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"acme\"");
    }
}
