//! The clinical draft under edit.
//!
//! A draft is a flat map of top-level fields (scalars, arrays, or small objects) plus the
//! `specialtyData` sub-tree, whose shape belongs to the specialty module (dental charting,
//! for example). The engine never validates the sub-tree. It only guarantees structural
//! completion: once anything inside it is written, every key the [`SpecialtySchema`] knows
//! about is present, so a partial update can never drop a sibling.

use crate::{EditorError, EditorResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use visit_types::FieldPath;
use visit_uuid::VisitId;

/// Known keys of `specialtyData` and the empty values they start with.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpecialtySchema {
    defaults: BTreeMap<String, Value>,
}

impl SpecialtySchema {
    /// Build a schema from key/default pairs.
    ///
    /// # Errors
    ///
    /// Returns [`EditorError::InvalidSpecialtySchema`] if a default is not an empty value
    /// (`null`, `""`, `[]`, or `{}`).
    pub fn new(defaults: BTreeMap<String, Value>) -> EditorResult<Self> {
        for (key, value) in &defaults {
            if key.trim().is_empty() {
                return Err(EditorError::InvalidSpecialtySchema(
                    "specialty keys cannot be empty".into(),
                ));
            }
            if !is_empty_value(value) {
                return Err(EditorError::InvalidSpecialtySchema(format!(
                    "default for '{key}' must be empty (null, \"\", [] or {{}}), got {value}"
                )));
            }
        }
        Ok(Self { defaults })
    }

    /// Schema used by the dental clinic forms.
    pub fn dental() -> Self {
        let defaults = BTreeMap::from([
            ("odontogram".to_string(), Value::Object(Map::new())),
            ("treatmentPlan".to_string(), Value::Array(Vec::new())),
            ("periodontalNotes".to_string(), Value::String(String::new())),
        ]);
        Self { defaults }
    }

    /// Parse a schema from a YAML mapping of key to default value.
    ///
    /// ```yaml
    /// odontogram: {}
    /// treatmentPlan: []
    /// periodontalNotes: ""
    /// ```
    pub fn from_yaml(yaml_text: &str) -> EditorResult<Self> {
        let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
        let defaults: BTreeMap<String, Value> = serde_path_to_error::deserialize(deserializer)
            .map_err(|err| {
                let path = err.path().to_string();
                let path = if path.is_empty() || path == "." {
                    "<root>".to_string()
                } else {
                    path
                };
                EditorError::InvalidSpecialtySchema(format!(
                    "schema mismatch at {path}: {}",
                    err.inner()
                ))
            })?;
        Self::new(defaults)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.defaults.keys().map(String::as_str)
    }

    fn complete(&self, data: &mut Map<String, Value>) {
        for (key, default) in &self.defaults {
            data.entry(key.clone())
                .or_insert_with(|| default.clone());
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Recursively merge `incoming` into `target`. Objects merge key by key; anything else
/// replaces the existing value.
fn deep_merge(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

fn write_at(map: &mut Map<String, Value>, segments: &[String], value: Value, merge: bool) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        match map.get_mut(head) {
            Some(slot) if merge => deep_merge(slot, value),
            Some(slot) => *slot = value,
            None => {
                map.insert(head.clone(), value);
            }
        }
        return;
    }

    let child = map
        .entry(head.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(child_map) = child {
        write_at(child_map, rest, value, merge);
    }
}

fn read_at<'a>(map: &'a Map<String, Value>, segments: &[String]) -> Option<&'a Value> {
    let (head, rest) = segments.split_first()?;
    let value = map.get(head)?;
    if rest.is_empty() {
        return Some(value);
    }
    match value {
        Value::Object(child) => read_at(child, rest),
        _ => None,
    }
}

/// The mutable record being edited for one visit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalDraft {
    visit_id: VisitId,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default)]
    specialty_data: Map<String, Value>,
    is_draft: bool,
    #[serde(default)]
    finalised: bool,
}

impl ClinicalDraft {
    /// A new, empty draft. The "is draft" marker starts set.
    pub fn new(visit_id: VisitId) -> Self {
        Self {
            visit_id,
            fields: Map::new(),
            specialty_data: Map::new(),
            is_draft: true,
            finalised: false,
        }
    }

    pub fn visit_id(&self) -> VisitId {
        self.visit_id
    }

    /// True until the first successful explicit save.
    pub fn is_draft(&self) -> bool {
        self.is_draft
    }

    pub fn is_finalised(&self) -> bool {
        self.finalised
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn specialty_data(&self) -> &Map<String, Value> {
        &self.specialty_data
    }

    /// Write `value` at `path`.
    ///
    /// Top-level paths replace whatever was there. Paths under `specialtyData` first
    /// complete the sub-tree from `schema` and then deep-merge `value` into place.
    ///
    /// # Errors
    ///
    /// Returns [`EditorError::InvalidInput`] when the whole `specialtyData` sub-tree is
    /// written with something other than an object.
    pub fn set_field(
        &mut self,
        path: &FieldPath,
        value: Value,
        schema: &SpecialtySchema,
    ) -> EditorResult<()> {
        if !path.is_specialty() {
            write_at(&mut self.fields, path.segments(), value, false);
            return Ok(());
        }

        let nested = &path.segments()[1..];
        if nested.is_empty() {
            let Value::Object(incoming) = value else {
                return Err(EditorError::InvalidInput(
                    "specialtyData can only be replaced by an object".into(),
                ));
            };
            schema.complete(&mut self.specialty_data);
            for (key, value) in incoming {
                write_at(&mut self.specialty_data, &[key], value, true);
            }
            return Ok(());
        }

        schema.complete(&mut self.specialty_data);
        write_at(&mut self.specialty_data, nested, value, true);
        Ok(())
    }

    /// Read the value at `path`, if present.
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        if path.is_specialty() {
            let nested = &path.segments()[1..];
            if nested.is_empty() {
                return None;
            }
            return read_at(&self.specialty_data, nested);
        }
        read_at(&self.fields, path.segments())
    }

    /// Restore structural completion on a draft loaded from storage.
    pub fn complete_structure(&mut self, schema: &SpecialtySchema) {
        if !self.specialty_data.is_empty() {
            schema.complete(&mut self.specialty_data);
        }
    }

    /// Clear the "is draft" marker after a successful explicit save, and mark the record
    /// finalised when `finalise` is set.
    pub fn mark_saved(&mut self, finalise: bool) {
        self.is_draft = false;
        if finalise {
            self.finalised = true;
        }
    }
}
