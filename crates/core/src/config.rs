//! Editor runtime configuration.
//!
//! Configuration is resolved once at process startup and passed into each editing session
//! as `Arc<EditorConfig>`. The core never reads environment variables; binaries read them
//! and use the `*_from_env_value` helpers here to turn raw values into typed settings.

use crate::constants::{
    AUTOSAVE_INTERVAL_MS, CHIEF_COMPLAINT_FIELD, DEFAULT_SUGGESTION_CACHE_CAPACITY,
    DIAGNOSIS_FIELD,
};
use crate::draft::SpecialtySchema;
use crate::suggest::SuggestionChannel;
use crate::{EditorError, EditorResult};
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;
use visit_types::FieldPath;

/// Routes edits of one draft field into a suggestion channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelBinding {
    pub field: FieldPath,
    pub channel: SuggestionChannel,
    pub delay: Duration,
}

impl ChannelBinding {
    /// Bind `field` to `channel` using the channel's standard delay.
    pub fn new(field: FieldPath, channel: SuggestionChannel) -> Self {
        let delay = channel.default_delay();
        Self {
            field,
            channel,
            delay,
        }
    }
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct EditorConfig {
    autosave_interval: Duration,
    cache_capacity: NonZeroUsize,
    bindings: Vec<ChannelBinding>,
    specialty_schema: SpecialtySchema,
}

impl Default for EditorConfig {
    fn default() -> Self {
        let bindings = [
            (CHIEF_COMPLAINT_FIELD, SuggestionChannel::ClinicalAnalysis),
            (DIAGNOSIS_FIELD, SuggestionChannel::CodedSuggestion),
        ]
        .into_iter()
        .filter_map(|(field, channel)| {
            FieldPath::parse(field)
                .ok()
                .map(|field| ChannelBinding::new(field, channel))
        })
        .collect();

        Self {
            autosave_interval: Duration::from_millis(AUTOSAVE_INTERVAL_MS),
            cache_capacity: NonZeroUsize::new(DEFAULT_SUGGESTION_CACHE_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            bindings,
            specialty_schema: SpecialtySchema::dental(),
        }
    }
}

impl EditorConfig {
    /// Create a configuration with the standard timings and channel bindings.
    pub fn new(cache_capacity: NonZeroUsize, specialty_schema: SpecialtySchema) -> Self {
        Self {
            cache_capacity,
            specialty_schema,
            ..Self::default()
        }
    }

    /// Route edits of `field` into `channel`. A later binding for the same field replaces
    /// the earlier one.
    pub fn with_binding(mut self, binding: ChannelBinding) -> Self {
        self.bindings.retain(|b| b.field != binding.field);
        self.bindings.push(binding);
        self
    }

    pub fn autosave_interval(&self) -> Duration {
        self.autosave_interval
    }

    pub fn cache_capacity(&self) -> NonZeroUsize {
        self.cache_capacity
    }

    pub fn specialty_schema(&self) -> &SpecialtySchema {
        &self.specialty_schema
    }

    pub fn bindings(&self) -> &[ChannelBinding] {
        &self.bindings
    }

    /// The binding whose source field is `path`, if any.
    pub fn binding_for_field(&self, path: &FieldPath) -> Option<&ChannelBinding> {
        self.bindings.iter().find(|b| &b.field == path)
    }

    /// The binding feeding `channel`, if any.
    pub fn binding_for_channel(&self, channel: &SuggestionChannel) -> Option<&ChannelBinding> {
        self.bindings.iter().find(|b| &b.channel == channel)
    }
}

/// Parse the suggestion cache capacity from an optional string value.
///
/// If `value` is `None` or empty/whitespace, returns the default capacity.
pub fn cache_capacity_from_env_value(value: Option<String>) -> EditorResult<NonZeroUsize> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    match value {
        None => NonZeroUsize::new(DEFAULT_SUGGESTION_CACHE_CAPACITY).ok_or_else(|| {
            EditorError::InvalidInput("default cache capacity must be positive".into())
        }),
        Some(raw) => raw
            .parse::<NonZeroUsize>()
            .map_err(|_| {
                EditorError::InvalidInput(format!(
                    "suggestion cache capacity must be a positive integer, got '{raw}'"
                ))
            }),
    }
}

/// Load the specialty schema from an optional YAML file.
///
/// If `path` is `None`, returns the dental schema.
pub fn specialty_schema_from_path(path: Option<&Path>) -> EditorResult<SpecialtySchema> {
    let Some(path) = path else {
        return Ok(SpecialtySchema::dental());
    };

    let text = std::fs::read_to_string(path).map_err(EditorError::ConfigRead)?;
    SpecialtySchema::from_yaml(&text)
}
