//! Suggestion channels and the suggestion-service collaborator.
//!
//! Payloads (ICD codes, analysis text, drug names) are opaque: a [`SuggestionResult`] is a
//! set of field writes the engine applies to the draft.

use crate::constants::{
    CLINICAL_ANALYSIS_DEBOUNCE_MS, CODED_SUGGESTION_DEBOUNCE_MS, DEFAULT_FIELD_DEBOUNCE_MS,
};
use crate::error::CollaboratorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use visit_types::NonEmptyText;

/// An independent debounce and cache lane.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SuggestionChannel {
    /// Free-text clinical analysis of the presenting complaint.
    ClinicalAnalysis,
    /// Coded diagnosis suggestions.
    CodedSuggestion,
    /// Any other field-level lane, identified by name.
    Field(NonEmptyText),
}

impl SuggestionChannel {
    pub fn name(&self) -> &str {
        match self {
            SuggestionChannel::ClinicalAnalysis => "clinical-analysis",
            SuggestionChannel::CodedSuggestion => "coded-suggestion",
            SuggestionChannel::Field(name) => name.as_str(),
        }
    }

    pub fn default_delay(&self) -> Duration {
        Duration::from_millis(match self {
            SuggestionChannel::ClinicalAnalysis => CLINICAL_ANALYSIS_DEBOUNCE_MS,
            SuggestionChannel::CodedSuggestion => CODED_SUGGESTION_DEBOUNCE_MS,
            SuggestionChannel::Field(_) => DEFAULT_FIELD_DEBOUNCE_MS,
        })
    }

    /// Inverse of [`SuggestionChannel::name`].
    pub fn from_name(name: &str) -> Result<Self, visit_types::TextError> {
        match name.trim() {
            "clinical-analysis" => Ok(SuggestionChannel::ClinicalAnalysis),
            "coded-suggestion" => Ok(SuggestionChannel::CodedSuggestion),
            other => NonEmptyText::new(other).map(SuggestionChannel::Field),
        }
    }
}

impl fmt::Display for SuggestionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for SuggestionChannel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for SuggestionChannel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SuggestionChannel::from_name(&s).map_err(serde::de::Error::custom)
    }
}

/// Field writes proposed by the suggestion service, keyed by dotted field path.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SuggestionResult {
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl SuggestionResult {
    pub fn with_field(mut self, path: impl Into<String>, value: Value) -> Self {
        self.fields.insert(path.into(), value);
        self
    }
}

/// Non-sensitive ambient fields (patient age, sex) passed through to the service untouched.
pub type SuggestionContext = Map<String, Value>;

/// The remote service that turns clinical free text into suggestions.
#[async_trait]
pub trait SuggestionService: Send + Sync {
    async fn fetch_suggestions(
        &self,
        channel: &SuggestionChannel,
        input: &str,
        context: &SuggestionContext,
    ) -> Result<SuggestionResult, CollaboratorError>;
}

/// Suggestion service used when no backend is configured: every request yields nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSuggestions;

#[async_trait]
impl SuggestionService for NoSuggestions {
    async fn fetch_suggestions(
        &self,
        _channel: &SuggestionChannel,
        _input: &str,
        _context: &SuggestionContext,
    ) -> Result<SuggestionResult, CollaboratorError> {
        Ok(SuggestionResult::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_delays_match_clinic_timings() {
        assert_eq!(
            SuggestionChannel::ClinicalAnalysis.default_delay(),
            Duration::from_millis(1000)
        );
        assert_eq!(
            SuggestionChannel::CodedSuggestion.default_delay(),
            Duration::from_millis(800)
        );
        let custom = SuggestionChannel::from_name("allergy-lookup").unwrap();
        assert_eq!(custom.default_delay(), Duration::from_millis(300));
    }

    #[test]
    fn channel_names_round_trip_through_serde() {
        let json = serde_json::to_string(&SuggestionChannel::CodedSuggestion).unwrap();
        assert_eq!(json, "\"coded-suggestion\"");
        let back: SuggestionChannel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SuggestionChannel::CodedSuggestion);
        assert!(serde_json::from_str::<SuggestionChannel>("\"  \"").is_err());
    }

    #[test]
    fn result_deserialises_without_fields() {
        let result: SuggestionResult = serde_json::from_str("{}").unwrap();
        assert!(result.fields.is_empty());
    }
}
