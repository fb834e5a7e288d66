//! Visit identifiers and sharded-path utilities.
//!
//! Every editing session and every persisted draft is keyed by the identifier of the visit
//! it belongs to. Identifiers use a *canonical* representation: **32 lowercase hexadecimal
//! characters** (no hyphens), the same value as `Uuid::new_v4().simple().to_string()`.
//!
//! ## Sharded directory layout
//! For a canonical id `v`, draft files live under:
//! `parent_dir/<v[0..2]>/<v[2..4]>/<v>/`
//!
//! Example:
//! `visit_data/drafts/55/0e/550e8400e29b41d4a716446655440000/`
//!
//! This keeps the fan-out of any single directory small on busy clinics.

use std::path::{Path, PathBuf};
use std::{fmt, str::FromStr};

pub use ::uuid::Uuid;

/// Error type for visit identifier operations.
#[derive(Debug, thiserror::Error)]
pub enum UuidError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for visit identifier operations.
pub type UuidResult<T> = Result<T, UuidError>;

/// Canonical identifier of a clinical visit.
///
/// Once constructed the contained UUID is guaranteed to be valid, and [`Display`] always
/// produces the canonical 32-character form.
///
/// - [`VisitId::new`] allocates a fresh identifier.
/// - [`VisitId::parse`] validates an externally supplied identifier (CLI argument, URL path).
///
/// [`Display`]: fmt::Display
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VisitId(Uuid);

impl Default for VisitId {
    fn default() -> Self {
        Self::new()
    }
}

impl VisitId {
    /// Generates a new random visit identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Validates and parses an identifier that must already be canonical.
    ///
    /// Hyphenated or uppercase forms are rejected rather than normalised, so that a single
    /// visit can never map to two storage locations.
    ///
    /// # Errors
    ///
    /// Returns [`UuidError::InvalidInput`] if `input` is not in canonical form.
    pub fn parse(input: &str) -> UuidResult<Self> {
        if !Self::is_canonical(input) {
            return Err(UuidError::InvalidInput(format!(
                "visit id must be 32 lowercase hex characters without hyphens, got: '{}'",
                input
            )));
        }

        Uuid::parse_str(input)
            .map(Self)
            .map_err(|e| UuidError::InvalidInput(format!("invalid visit id '{}': {}", input, e)))
    }

    /// Returns the underlying UUID.
    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// Returns true if `input` is exactly 32 lowercase hex characters.
    pub fn is_canonical(input: &str) -> bool {
        input.len() == 32
            && input
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// Returns `parent_dir/<s1>/<s2>/<id>/` where `s1`/`s2` are the first two pairs of hex
    /// characters of this identifier.
    pub fn sharded_dir(&self, parent_dir: &Path) -> PathBuf {
        let canonical = self.0.simple().to_string();
        let s1 = &canonical[0..2];
        let s2 = &canonical[2..4];
        parent_dir.join(s1).join(s2).join(&canonical)
    }
}

impl fmt::Display for VisitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for VisitId {
    type Err = UuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VisitId::parse(s)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for VisitId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for VisitId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        VisitId::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_generates_canonical_id() {
        let id = VisitId::new();
        let canonical = id.to_string();

        assert_eq!(canonical.len(), 32);
        assert!(VisitId::is_canonical(&canonical));
    }

    #[test]
    fn test_parse_valid_canonical_id() {
        let canonical = "550e8400e29b41d4a716446655440000";
        let id = VisitId::parse(canonical).expect("canonical id should parse");
        assert_eq!(id.to_string(), canonical);
    }

    #[test]
    fn test_parse_rejects_hyphenated_id() {
        let result = VisitId::parse("550e8400-e29b-41d4-a716-446655440000");
        assert!(matches!(result, Err(UuidError::InvalidInput(_))));
    }

    #[test]
    fn test_parse_rejects_uppercase_and_wrong_length() {
        assert!(VisitId::parse("550E8400E29B41D4A716446655440000").is_err());
        assert!(VisitId::parse("550e8400e29b41d4a71644665544000").is_err());
        assert!(VisitId::parse("550e8400e29b41d4a7164466554400000").is_err());
        assert!(VisitId::parse("550e8400e29b41d4a716446655440zzz").is_err());
    }

    #[test]
    fn test_sharded_dir_layout() {
        let id = VisitId::parse("550e8400e29b41d4a716446655440000").unwrap();
        let dir = id.sharded_dir(Path::new("visit_data/drafts"));
        assert_eq!(
            dir,
            PathBuf::from("visit_data/drafts/55/0e/550e8400e29b41d4a716446655440000")
        );
    }

    #[test]
    fn test_serde_uses_canonical_form() {
        let id = VisitId::parse("550e8400e29b41d4a716446655440000").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"550e8400e29b41d4a716446655440000\"");

        let back: VisitId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<VisitId>("\"not-a-visit\"").is_err());
    }
}
