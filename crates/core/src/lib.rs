//! # Visit Core
//!
//! The visit-state gate and draft synchronisation engine behind the clinical visit editor.
//!
//! This crate contains:
//! - Capability gates derived from queue and payment status (`gate`)
//! - The clinical draft model with structural completion of `specialtyData` (`draft`)
//! - Per-channel debouncing and the session suggestion cache (`debounce`, `cache`)
//! - Draft persistence, including a sharded JSON file store (`store`)
//! - The per-visit editing session tying it all together (`synchronizer`)
//!
//! **No API concerns**: HTTP servers, environment handling and concrete suggestion backends
//! belong in the binaries.

pub mod cache;
pub mod config;
pub mod constants;
pub mod debounce;
pub mod draft;
pub mod error;
pub mod gate;
pub mod snapshot;
pub mod store;
pub mod suggest;
pub mod synchronizer;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheKey, SuggestionCache};
pub use config::{
    cache_capacity_from_env_value, specialty_schema_from_path, ChannelBinding, EditorConfig,
};
pub use debounce::{Debouncer, Trigger};
pub use draft::{ClinicalDraft, SpecialtySchema};
pub use error::{CollaboratorError, EditorError, EditorResult, StoreError, StoreResult};
pub use gate::{can_edit, can_finalize, can_open, is_paid, Capability, GateFlags};
pub use snapshot::{DiscountMode, PaymentStatus, StatusSource, VisitStatus, VisitStatusSnapshot};
pub use store::{DraftStore, DraftSummary, FileDraftStore, PersistOptions, PersistedDraft};
pub use suggest::{
    NoSuggestions, SuggestionChannel, SuggestionContext, SuggestionResult, SuggestionService,
};
pub use synchronizer::{
    AutosaveOutcome, CloseOutcome, Collaborators, DraftState, DraftSynchronizer, EditorView,
    SuggestionOutcome, UnloadWarning,
};
pub use visit_types::FieldPath;
pub use visit_uuid::VisitId;
