//! Recording collaborators for session tests.

use crate::config::EditorConfig;
use crate::draft::ClinicalDraft;
use crate::error::CollaboratorError;
use crate::snapshot::VisitStatusSnapshot;
use crate::store::{DraftStore, PersistOptions, PersistedDraft};
use crate::suggest::{SuggestionChannel, SuggestionContext, SuggestionResult, SuggestionService};
use crate::synchronizer::{Collaborators, DraftSynchronizer};
use crate::EditorResult;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use visit_uuid::VisitId;

/// Store that records every successful persist. Can be told to fail, or to hold each
/// persist until [`RecordingStore::release`] is called.
pub(crate) struct RecordingStore {
    persisted: Mutex<Vec<(ClinicalDraft, PersistOptions)>>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    fail: AtomicBool,
    held: AtomicBool,
    gate: Semaphore,
}

impl Default for RecordingStore {
    fn default() -> Self {
        Self {
            persisted: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }
}

impl RecordingStore {
    pub(crate) fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release(&self, persists: usize) {
        self.gate.add_permits(persists);
    }

    pub(crate) fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Persist attempts, successful or not.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub(crate) fn options(&self) -> Vec<PersistOptions> {
        self.persisted
            .lock()
            .unwrap()
            .iter()
            .map(|(_, options)| *options)
            .collect()
    }

    pub(crate) fn last_draft(&self) -> Option<ClinicalDraft> {
        self.persisted
            .lock()
            .unwrap()
            .last()
            .map(|(draft, _)| draft.clone())
    }
}

#[async_trait]
impl DraftStore for RecordingStore {
    async fn persist(
        &self,
        draft: &ClinicalDraft,
        options: PersistOptions,
    ) -> Result<PersistedDraft, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if self.held.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err("store unavailable".into());
        }

        self.persisted
            .lock()
            .unwrap()
            .push((draft.clone(), options));
        Ok(PersistedDraft {
            visit_id: draft.visit_id(),
            options,
            persisted_at: Utc::now(),
        })
    }
}

/// Suggestion service returning a fixed result and recording every request.
#[derive(Default)]
pub(crate) struct ScriptedSuggestions {
    result: Mutex<SuggestionResult>,
    inputs: Mutex<Vec<(SuggestionChannel, String)>>,
    fail: AtomicBool,
}

impl ScriptedSuggestions {
    pub(crate) fn respond_with(&self, result: SuggestionResult) {
        *self.result.lock().unwrap() = result;
    }

    pub(crate) fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.inputs.lock().unwrap().len()
    }

    pub(crate) fn inputs(&self) -> Vec<(SuggestionChannel, String)> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl SuggestionService for ScriptedSuggestions {
    async fn fetch_suggestions(
        &self,
        channel: &SuggestionChannel,
        input: &str,
        _context: &SuggestionContext,
    ) -> Result<SuggestionResult, CollaboratorError> {
        self.inputs
            .lock()
            .unwrap()
            .push((channel.clone(), input.to_string()));
        if self.fail.load(Ordering::SeqCst) {
            return Err("suggestion service unavailable".into());
        }
        Ok(self.result.lock().unwrap().clone())
    }
}

/// Collaborators plus a status channel the test can push snapshots into.
pub(crate) struct Harness {
    pub(crate) store: Arc<RecordingStore>,
    pub(crate) suggestions: Arc<ScriptedSuggestions>,
    status_tx: watch::Sender<VisitStatusSnapshot>,
    status_rx: Arc<watch::Receiver<VisitStatusSnapshot>>,
}

impl Harness {
    pub(crate) fn new(snapshot: VisitStatusSnapshot) -> Self {
        let (status_tx, status_rx) = watch::channel(snapshot);
        Self {
            store: Arc::new(RecordingStore::default()),
            suggestions: Arc::new(ScriptedSuggestions::default()),
            status_tx,
            status_rx: Arc::new(status_rx),
        }
    }

    pub(crate) fn set_status(&self, snapshot: VisitStatusSnapshot) {
        self.status_tx.send_replace(snapshot);
    }

    pub(crate) fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            suggestions: self.suggestions.clone(),
            status: self.status_rx.clone(),
        }
    }

    pub(crate) fn open_with(&self, draft: ClinicalDraft) -> EditorResult<DraftSynchronizer> {
        DraftSynchronizer::open(
            Arc::new(EditorConfig::default()),
            draft,
            self.collaborators(),
            SuggestionContext::new(),
        )
    }

    pub(crate) fn open(&self) -> DraftSynchronizer {
        self.open_with(ClinicalDraft::new(VisitId::new()))
            .expect("open session")
    }
}
