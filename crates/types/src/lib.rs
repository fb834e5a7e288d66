//! Validated text types shared across the visit editor crates.
//!
//! - [`NonEmptyText`] for names and labels that must carry content
//! - [`NormalisedText`] for suggestion cache keys (trimmed, lowercased)
//! - [`FieldPath`] for dotted paths into a clinical draft

use std::fmt;

/// Segment name of the one nested sub-tree of a clinical draft.
pub const SPECIALTY_ROOT: &str = "specialtyData";

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,
    /// A dotted path contained an empty segment (e.g. `a..b` or a trailing dot)
    #[error("Field path '{0}' contains an empty segment")]
    EmptySegment(String),
}

/// A string type that guarantees non-empty content.
///
/// The input is trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// Returns `Err(TextError::Empty)` if the trimmed input is empty.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Free text reduced to its cache identity.
///
/// Two inputs that differ only by letter case or surrounding whitespace normalise to the
/// same value. Inner whitespace is preserved as typed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalisedText(String);

impl NormalisedText {
    /// Trims and lowercases `input`.
    ///
    /// Returns `Err(TextError::Empty)` when nothing remains after trimming, since there is
    /// nothing to analyse.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NormalisedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dotted path addressing one field of a clinical draft.
///
/// `chiefComplaint` addresses a top-level field; `specialtyData.odontogram.18` addresses a
/// value nested inside the specialty sub-tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parses a dotted path. Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// - [`TextError::Empty`] if the path is blank.
    /// - [`TextError::EmptySegment`] if any segment between dots is empty.
    pub fn parse(input: &str) -> Result<Self, TextError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }

        let mut segments = Vec::new();
        for segment in trimmed.split('.') {
            let segment = segment.trim();
            if segment.is_empty() {
                return Err(TextError::EmptySegment(trimmed.to_owned()));
            }
            segments.push(segment.to_owned());
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment of the path.
    pub fn root(&self) -> &str {
        // parse() never produces an empty segment list
        self.segments.first().map(String::as_str).unwrap_or_default()
    }

    /// True if the path points into the specialty sub-tree (including the sub-tree itself).
    pub fn is_specialty(&self) -> bool {
        self.root() == SPECIALTY_ROOT
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl std::str::FromStr for FieldPath {
    type Err = TextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for FieldPath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for FieldPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FieldPath::parse(&s).map_err(serde::de::Error::custom)
    }
}
