//! Constants used throughout the visit editor core.
//!
//! Timing values are part of observable behaviour (clinicians notice when suggestions or
//! autosaves arrive) and must not drift between releases.

/// Fixed interval between autosave ticks while a session is open.
pub const AUTOSAVE_INTERVAL_MS: u64 = 30_000;

/// Quiet period before free-text clinical analysis is requested.
pub const CLINICAL_ANALYSIS_DEBOUNCE_MS: u64 = 1_000;

/// Quiet period before coded (ICD) suggestions are requested.
pub const CODED_SUGGESTION_DEBOUNCE_MS: u64 = 800;

/// Quiet period for any other field-level trigger.
pub const DEFAULT_FIELD_DEBOUNCE_MS: u64 = 300;

/// Upper bound on distinct suggestion results kept per session.
pub const DEFAULT_SUGGESTION_CACHE_CAPACITY: usize = 512;

/// Default directory for visit data when no explicit directory is configured.
pub const DEFAULT_VISIT_DATA_DIR: &str = "visit_data";

/// Directory name for persisted drafts, below the visit data directory.
pub const DRAFTS_DIR_NAME: &str = "drafts";

/// Filename of a persisted draft inside its sharded visit directory.
pub const DRAFT_JSON_FILENAME: &str = "draft.json";

/// Free-text field feeding the clinical analysis channel.
pub const CHIEF_COMPLAINT_FIELD: &str = "chiefComplaint";

/// Free-text field feeding the coded suggestion channel.
pub const DIAGNOSIS_FIELD: &str = "diagnosis";
