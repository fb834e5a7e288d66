//! Draft persistence.
//!
//! [`DraftStore`] is the seam to whatever system of record keeps clinical drafts. The
//! engine only requires that `persist` is idempotent under retry.
//!
//! [`FileDraftStore`] is the bundled implementation. It keeps one JSON document per visit
//! under a sharded directory tree:
//!
//! ```text
//! <data_dir>/drafts/
//! └── 55/0e/550e8400e29b41d4a716446655440000/
//!     └── draft.json
//! ```
//!
//! Writes go to a temporary file first and are renamed into place, so a crash mid-write
//! never leaves a truncated draft behind.

use crate::constants::{DRAFTS_DIR_NAME, DRAFT_JSON_FILENAME};
use crate::draft::ClinicalDraft;
use crate::error::{CollaboratorError, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use visit_uuid::VisitId;

/// How a persist call should be recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistOptions {
    /// True for autosaves: the stored copy is work in progress.
    pub draft: bool,
    /// True when this persist completes the record.
    pub finalise: bool,
}

impl PersistOptions {
    pub fn autosave() -> Self {
        Self {
            draft: true,
            finalise: false,
        }
    }

    pub fn explicit(finalise: bool) -> Self {
        Self {
            draft: false,
            finalise,
        }
    }
}

/// Acknowledgement returned by a successful persist.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDraft {
    pub visit_id: VisitId,
    pub options: PersistOptions,
    pub persisted_at: DateTime<Utc>,
}

/// System of record for clinical drafts.
#[async_trait]
pub trait DraftStore: Send + Sync {
    /// Store `draft`. Submitting identical content twice must have no side effects beyond
    /// timestamp bookkeeping.
    async fn persist(
        &self,
        draft: &ClinicalDraft,
        options: PersistOptions,
    ) -> Result<PersistedDraft, CollaboratorError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredDraft {
    draft: ClinicalDraft,
    options: PersistOptions,
    persisted_at: DateTime<Utc>,
}

/// One line of [`FileDraftStore::list`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSummary {
    pub visit_id: VisitId,
    pub is_draft: bool,
    pub finalised: bool,
    pub autosaved: bool,
    pub persisted_at: DateTime<Utc>,
}

/// File-backed [`DraftStore`].
#[derive(Clone, Debug)]
pub struct FileDraftStore {
    drafts_dir: PathBuf,
}

impl FileDraftStore {
    /// Create a store rooted at `<data_dir>/drafts`. Directories are created lazily.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            drafts_dir: data_dir.as_ref().join(DRAFTS_DIR_NAME),
        }
    }

    pub fn drafts_dir(&self) -> &Path {
        &self.drafts_dir
    }

    fn draft_path(&self, visit_id: VisitId) -> PathBuf {
        visit_id
            .sharded_dir(&self.drafts_dir)
            .join(DRAFT_JSON_FILENAME)
    }

    async fn read_stored(&self, path: &Path) -> StoreResult<Option<StoredDraft>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::FileRead(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(StoreError::Deserialization)
    }

    /// Write `draft` for its visit.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyFinalised`] if the stored record is finalised, unless this is
    ///   a retry of the same finalisation.
    /// - [`StoreError::DirCreation`], [`StoreError::FileWrite`] on I/O failures.
    ///
    /// An existing file that does not parse is overwritten.
    pub async fn write(
        &self,
        draft: &ClinicalDraft,
        options: PersistOptions,
    ) -> StoreResult<PersistedDraft> {
        let visit_id = draft.visit_id();
        let path = self.draft_path(visit_id);

        let existing = match self.read_stored(&path).await {
            Ok(existing) => existing,
            Err(StoreError::Deserialization(e)) => {
                tracing::warn!(
                    visit_id = %visit_id,
                    "replacing unreadable draft {}: {}",
                    path.display(),
                    e
                );
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(existing) = existing {
            let same_finalisation = options.finalise && existing.draft == *draft;
            if existing.draft.is_finalised() && !same_finalisation {
                return Err(StoreError::AlreadyFinalised(visit_id));
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StoreError::DirCreation)?;
        }

        let stored = StoredDraft {
            draft: draft.clone(),
            options,
            persisted_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&stored).map_err(StoreError::Serialization)?;

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(StoreError::FileWrite)?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(StoreError::FileWrite)?;

        tracing::debug!(visit_id = %visit_id, draft = options.draft, finalise = options.finalise, "draft written");

        Ok(PersistedDraft {
            visit_id,
            options,
            persisted_at: stored.persisted_at,
        })
    }

    /// Load the last persisted draft for `visit_id`, if there is one.
    pub async fn load(&self, visit_id: VisitId) -> StoreResult<Option<ClinicalDraft>> {
        let path = self.draft_path(visit_id);
        Ok(self.read_stored(&path).await?.map(|stored| stored.draft))
    }

    /// Summaries of every persisted draft.
    ///
    /// Traverses `<drafts_dir>/<s1>/<s2>/<visit_id>/draft.json`. Files that cannot be parsed
    /// are logged and skipped.
    pub async fn list(&self) -> StoreResult<Vec<DraftSummary>> {
        let mut summaries = Vec::new();

        for s1 in subdirectories(&self.drafts_dir).await? {
            for s2 in subdirectories(&s1).await? {
                for visit_dir in subdirectories(&s2).await? {
                    let path = visit_dir.join(DRAFT_JSON_FILENAME);
                    match self.read_stored(&path).await {
                        Ok(Some(stored)) => summaries.push(DraftSummary {
                            visit_id: stored.draft.visit_id(),
                            is_draft: stored.draft.is_draft(),
                            finalised: stored.draft.is_finalised(),
                            autosaved: stored.options.draft,
                            persisted_at: stored.persisted_at,
                        }),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!("failed to read draft {}: {}", path.display(), e);
                        }
                    }
                }
            }
        }

        summaries.sort_by(|a, b| b.persisted_at.cmp(&a.persisted_at));
        Ok(summaries)
    }
}

async fn subdirectories(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::FileRead(e)),
    };

    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(StoreError::FileRead)? {
        let file_type = entry.file_type().await.map_err(StoreError::FileRead)?;
        if file_type.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[async_trait]
impl DraftStore for FileDraftStore {
    async fn persist(
        &self,
        draft: &ClinicalDraft,
        options: PersistOptions,
    ) -> Result<PersistedDraft, CollaboratorError> {
        self.write(draft, options).await.map_err(Into::into)
    }
}
