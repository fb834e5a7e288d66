//! # Draft synchronizer
//!
//! One [`DraftSynchronizer`] owns the clinical draft for one open visit record. It ties the
//! other parts of the crate together:
//!
//! - edits go through [`DraftSynchronizer::set_field`], which marks the draft dirty and
//!   feeds any bound suggestion channel through the session's [`Debouncer`];
//! - debounced triggers consult the session's [`SuggestionCache`] and only reach the
//!   suggestion service on a miss;
//! - an autosave timer owned by the session persists dirty drafts every interval while the
//!   visit is editable;
//! - explicit saves and finalisation go through [`DraftSynchronizer::save`].
//!
//! Autosave and explicit save share one persist lock, so at most one persist is in flight
//! per draft. Autosave skips a tick when the lock is taken; explicit save waits for it.
//! Suggestions are not serialised against persists: a suggestion merged while a persist is
//! in flight leaves the draft dirty and goes out with the next persist.
//!
//! State lives behind a plain mutex that is never held across an `.await`.

use crate::cache::{CacheKey, SuggestionCache};
use crate::config::{ChannelBinding, EditorConfig};
use crate::debounce::Debouncer;
use crate::draft::ClinicalDraft;
use crate::gate::{self, Capability, GateFlags};
use crate::snapshot::StatusSource;
use crate::store::{DraftStore, PersistOptions, PersistedDraft};
use crate::suggest::{SuggestionChannel, SuggestionContext, SuggestionResult, SuggestionService};
use crate::{EditorError, EditorResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use visit_types::{FieldPath, NormalisedText};
use visit_uuid::VisitId;

/// External systems a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn DraftStore>,
    pub suggestions: Arc<dyn SuggestionService>,
    pub status: Arc<dyn StatusSource>,
}

/// Draft plus synchronisation state, published to subscribers on every change.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftState {
    pub draft: ClinicalDraft,
    pub dirty: bool,
    pub in_flight: bool,
    pub last_autosave_at: Option<DateTime<Utc>>,
    pub closed: bool,
}

/// Read model for the host UI: the draft state combined with the gate flags for the
/// current status snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorView {
    pub draft: ClinicalDraft,
    pub dirty: bool,
    pub in_flight: bool,
    pub last_autosave_at: Option<DateTime<Utc>>,
    pub finalised: bool,
    pub is_paid: bool,
    pub can_open: bool,
    pub can_edit: bool,
    pub can_finalize: bool,
}

/// The cancellable "leave without saving" warning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnloadWarning {
    pub visit_id: VisitId,
    pub last_autosave_at: Option<DateTime<Utc>>,
    pub message: String,
}

impl UnloadWarning {
    fn new(visit_id: VisitId, last_autosave_at: Option<DateTime<Utc>>) -> Self {
        Self {
            visit_id,
            last_autosave_at,
            message: "This visit has unsaved changes. Leave without saving?".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The draft is dirty and the caller did not choose to discard it. The session is
    /// still open.
    Blocked(UnloadWarning),
    Closed { discarded_unsaved: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AutosaveOutcome {
    /// The visit is not editable right now.
    GateClosed,
    Closed,
    /// Nothing to save.
    Clean,
    /// Another persist holds the lock; try again next tick.
    InFlight,
    Persisted(PersistedDraft),
    Failed(String),
    /// The session was closed while the persist was in flight.
    Discarded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuggestionOutcome {
    Applied { from_cache: bool, fields: usize },
    /// The source field changed while the request was in flight. The result was cached
    /// but not applied.
    Stale,
    GateDenied,
    /// Blank input.
    Skipped,
    /// The session was closed or the record finalised before the result arrived.
    Discarded,
}

struct SessionState {
    draft: ClinicalDraft,
    dirty: bool,
    // bumped on every mutation; a persist only clears `dirty` if it is unchanged
    revision: u64,
    in_flight: bool,
    // the persist in flight was started by autosave_tick
    autosaving: bool,
    // a finalising save is in flight; the draft is frozen until it resolves
    finalising: bool,
    last_autosave_at: Option<DateTime<Utc>>,
    closed: bool,
    autosave: Option<JoinHandle<()>>,
}

impl SessionState {
    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.revision += 1;
    }

    fn is_frozen(&self) -> bool {
        self.finalising || self.draft.is_finalised()
    }

    fn published(&self) -> DraftState {
        DraftState {
            draft: self.draft.clone(),
            dirty: self.dirty,
            in_flight: self.in_flight,
            last_autosave_at: self.last_autosave_at,
            closed: self.closed,
        }
    }
}

struct Inner {
    config: Arc<EditorConfig>,
    store: Arc<dyn DraftStore>,
    suggestions: Arc<dyn SuggestionService>,
    status: Arc<dyn StatusSource>,
    context: SuggestionContext,
    visit_id: VisitId,
    cache: SuggestionCache,
    state: Mutex<SessionState>,
    persist_lock: tokio::sync::Mutex<()>,
    debouncer: Debouncer,
    runtime: Handle,
    notify: watch::Sender<DraftState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self) {
        let published = self.state().published();
        self.notify.send_replace(published);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = state.autosave.take() {
            handle.abort();
        }
        self.debouncer.cancel_all();
    }
}

/// Editing session for one visit record. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct DraftSynchronizer {
    inner: Arc<Inner>,
}

impl DraftSynchronizer {
    /// Open an editing session over `draft`.
    ///
    /// Must be called from within a tokio runtime; debounced triggers and the autosave
    /// timer run on it.
    ///
    /// # Errors
    ///
    /// - [`EditorError::GateDenied`] with [`Capability::Open`] if the current snapshot does
    ///   not allow the record to be opened.
    /// - [`EditorError::NoRuntime`] outside a tokio runtime.
    pub fn open(
        config: Arc<EditorConfig>,
        mut draft: ClinicalDraft,
        collaborators: Collaborators,
        context: SuggestionContext,
    ) -> EditorResult<Self> {
        let runtime = Handle::try_current().map_err(|_| EditorError::NoRuntime)?;

        let snapshot = collaborators.status.current();
        if !gate::can_open(&snapshot) {
            tracing::debug!(
                visit_id = %draft.visit_id(),
                visit_status = %snapshot.visit_status,
                "open denied by gate"
            );
            return Err(EditorError::GateDenied(Capability::Open));
        }

        draft.complete_structure(config.specialty_schema());
        let visit_id = draft.visit_id();

        let state = SessionState {
            draft,
            dirty: false,
            revision: 0,
            in_flight: false,
            autosaving: false,
            finalising: false,
            last_autosave_at: None,
            closed: false,
            autosave: None,
        };
        let (notify, _) = watch::channel(state.published());

        tracing::info!(visit_id = %visit_id, "editing session opened");

        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                store: collaborators.store,
                suggestions: collaborators.suggestions,
                status: collaborators.status,
                context,
                visit_id,
                cache: SuggestionCache::new(config.cache_capacity()),
                state: Mutex::new(state),
                persist_lock: tokio::sync::Mutex::new(()),
                debouncer: Debouncer::new(runtime.clone()),
                runtime,
                notify,
            }),
        })
    }

    pub fn visit_id(&self) -> VisitId {
        self.inner.visit_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.state().dirty
    }

    /// Snapshot of the read model, with gate flags evaluated against the latest status.
    pub fn view(&self) -> EditorView {
        let snapshot = self.inner.status.current();
        let state = self.inner.state();
        let flags = GateFlags::evaluate(&state.draft, &snapshot);

        EditorView {
            draft: state.draft.clone(),
            dirty: state.dirty,
            in_flight: state.in_flight,
            last_autosave_at: state.last_autosave_at,
            finalised: state.draft.is_finalised(),
            is_paid: flags.is_paid,
            can_open: flags.can_open,
            can_edit: flags.can_edit,
            can_finalize: flags.can_finalize,
        }
    }

    /// Receive a fresh [`DraftState`] on every mutation and persist completion.
    pub fn subscribe(&self) -> watch::Receiver<DraftState> {
        self.inner.notify.subscribe()
    }

    /// Write `value` at `path` and mark the draft dirty.
    ///
    /// If `path` feeds a suggestion channel, the channel's debounced trigger is invoked with
    /// the new text. Writing a blank or non-text value cancels whatever was pending there.
    ///
    /// Fails with [`EditorError::RecordFinalised`] once a finalising save has started.
    pub fn set_field(&self, path: &FieldPath, value: Value) -> EditorResult<()> {
        let input = value.as_str().map(str::to_owned);
        {
            let mut state = self.inner.state();
            if state.closed {
                return Err(EditorError::SessionClosed);
            }
            if state.is_frozen() {
                return Err(EditorError::RecordFinalised);
            }
            state
                .draft
                .set_field(path, value, self.inner.config.specialty_schema())?;
            state.mark_dirty();
        }
        self.inner.publish();

        if let Some(binding) = self.inner.config.binding_for_field(path) {
            self.trigger(binding, input);
        }
        Ok(())
    }

    fn trigger(&self, binding: &ChannelBinding, input: Option<String>) {
        let input = input.filter(|text| NormalisedText::new(text).is_ok());
        let Some(input) = input else {
            self.inner.debouncer.cancel(binding.channel.name());
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let channel = binding.channel.clone();
        let trigger = self.inner.debouncer.debounce(
            binding.channel.name(),
            binding.delay,
            move |input: String| {
                let weak = weak.clone();
                let channel = channel.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let session = DraftSynchronizer { inner };
                    // failures are logged where they happen
                    let _ = session.on_debounced_trigger(&channel, &input).await;
                }
            },
        );
        trigger.call(input);
    }

    /// Run one suggestion request for `channel`.
    ///
    /// No-op unless the visit is editable. Cache hits apply immediately; misses go to the
    /// suggestion service and are cached on success. A result only lands in the draft if
    /// the channel's source field still holds the same text.
    ///
    /// # Errors
    ///
    /// [`EditorError::Suggestion`] if the service fails or its result cannot be merged into
    /// the draft. The draft is untouched and nothing is cached.
    pub async fn on_debounced_trigger(
        &self,
        channel: &SuggestionChannel,
        input: &str,
    ) -> EditorResult<SuggestionOutcome> {
        let Ok(text) = NormalisedText::new(input) else {
            return Ok(SuggestionOutcome::Skipped);
        };
        if self.is_closed() {
            return Ok(SuggestionOutcome::Discarded);
        }

        let snapshot = self.inner.status.current();
        if !gate::can_edit(&snapshot) {
            tracing::debug!(
                visit_id = %self.inner.visit_id,
                channel = %channel,
                "suggestion skipped, visit not editable"
            );
            return Ok(SuggestionOutcome::GateDenied);
        }

        let key = CacheKey::new(channel.clone(), text);
        if let Some(cached) = self.inner.cache.get(&key) {
            return self.apply_suggestion(&key, cached, true);
        }

        let result = self
            .inner
            .suggestions
            .fetch_suggestions(channel, input, &self.inner.context)
            .await
            .map_err(|e| {
                tracing::warn!(
                    visit_id = %self.inner.visit_id,
                    channel = %channel,
                    "suggestion request failed: {}",
                    e
                );
                EditorError::Suggestion(e)
            })?;

        self.apply_suggestion(&key, result, false)
    }

    fn apply_suggestion(
        &self,
        key: &CacheKey,
        result: SuggestionResult,
        from_cache: bool,
    ) -> EditorResult<SuggestionOutcome> {
        let outcome = {
            let mut state = self.inner.state();
            if state.closed || state.is_frozen() {
                return Ok(SuggestionOutcome::Discarded);
            }

            let mut merged = state.draft.clone();
            let schema = self.inner.config.specialty_schema();
            for (path, value) in &result.fields {
                let written = FieldPath::parse(path)
                    .map_err(EditorError::from)
                    .and_then(|path| merged.set_field(&path, value.clone(), schema));
                if let Err(e) = written {
                    tracing::warn!(
                        visit_id = %self.inner.visit_id,
                        channel = %key.channel(),
                        field = %path,
                        "suggestion cannot be merged into the draft: {}",
                        e
                    );
                    return Err(EditorError::Suggestion(Box::new(e)));
                }
            }

            let fields = result.fields.len();
            if !from_cache {
                self.inner.cache.put(key.clone(), result);
            }

            if let Some(binding) = self.inner.config.binding_for_channel(key.channel()) {
                let current = state
                    .draft
                    .get(&binding.field)
                    .and_then(Value::as_str)
                    .and_then(|text| NormalisedText::new(text).ok());
                if current.as_ref() != Some(key.text()) {
                    tracing::debug!(
                        visit_id = %self.inner.visit_id,
                        channel = %key.channel(),
                        "suggestion no longer matches its field"
                    );
                    return Ok(SuggestionOutcome::Stale);
                }
            }

            if fields > 0 {
                state.draft = merged;
                state.mark_dirty();
            }
            SuggestionOutcome::Applied { from_cache, fields }
        };

        self.inner.publish();
        Ok(outcome)
    }

    /// One autosave cycle. Persists the draft marked as a draft if it is dirty, the visit
    /// is editable, and no other persist is in flight.
    ///
    /// Failures are logged and leave the draft dirty for the next tick.
    pub async fn autosave_tick(&self) -> AutosaveOutcome {
        let snapshot = self.inner.status.current();
        if !gate::can_edit(&snapshot) {
            return AutosaveOutcome::GateClosed;
        }

        let Ok(_permit) = self.inner.persist_lock.try_lock() else {
            return AutosaveOutcome::InFlight;
        };

        let (draft, revision) = {
            let mut state = self.inner.state();
            if state.closed {
                return AutosaveOutcome::Closed;
            }
            if !state.dirty || state.draft.is_finalised() {
                return AutosaveOutcome::Clean;
            }
            state.in_flight = true;
            state.autosaving = true;
            (state.draft.clone(), state.revision)
        };
        self.inner.publish();

        let result = self
            .inner
            .store
            .persist(&draft, PersistOptions::autosave())
            .await;

        let outcome = {
            let mut state = self.inner.state();
            state.in_flight = false;
            state.autosaving = false;
            if state.closed {
                AutosaveOutcome::Discarded
            } else {
                match result {
                    Ok(ack) => {
                        if state.revision == revision {
                            state.dirty = false;
                        }
                        state.last_autosave_at = Some(ack.persisted_at);
                        tracing::debug!(visit_id = %self.inner.visit_id, "autosaved draft");
                        AutosaveOutcome::Persisted(ack)
                    }
                    Err(e) => {
                        tracing::warn!(
                            visit_id = %self.inner.visit_id,
                            "autosave failed, will retry next tick: {}",
                            e
                        );
                        AutosaveOutcome::Failed(e.to_string())
                    }
                }
            }
        };

        self.inner.publish();
        outcome
    }

    /// Explicit save. With `finalise` set the record is completed and can no longer be
    /// edited.
    ///
    /// Waits for any autosave in flight, then persists the latest draft. On success the
    /// "is draft" marker is cleared and, unless the draft changed meanwhile, so is dirty.
    /// While a finalising save is in flight the draft accepts no edits or suggestions.
    ///
    /// # Errors
    ///
    /// - [`EditorError::GateDenied`] with [`Capability::Finalise`] when finalising a draft
    ///   that has never been saved, or while the visit is not editable.
    /// - [`EditorError::Persist`] if the store fails. The draft stays dirty.
    /// - [`EditorError::SessionClosed`], [`EditorError::RecordFinalised`].
    pub async fn save(&self, finalise: bool) -> EditorResult<PersistedDraft> {
        if finalise {
            self.check_finalise()?;
        } else {
            self.check_writable()?;
        }

        let _permit = self.inner.persist_lock.lock().await;
        if finalise {
            // the status may have moved on while another persist held the lock
            self.check_finalise()?;
        }

        let (outgoing, revision) = {
            let mut state = self.inner.state();
            if state.closed {
                return Err(EditorError::SessionClosed);
            }
            if state.draft.is_finalised() {
                return Err(EditorError::RecordFinalised);
            }
            let mut outgoing = state.draft.clone();
            outgoing.mark_saved(finalise);
            state.in_flight = true;
            state.finalising = finalise;
            (outgoing, state.revision)
        };
        self.inner.publish();

        let result = self
            .inner
            .store
            .persist(&outgoing, PersistOptions::explicit(finalise))
            .await;

        let result = {
            let mut state = self.inner.state();
            state.in_flight = false;
            state.finalising = false;
            match result {
                Ok(ack) if state.closed => Ok(ack),
                Ok(ack) => {
                    if finalise {
                        state.draft = outgoing;
                        state.dirty = false;
                    } else {
                        state.draft.mark_saved(false);
                        if state.revision == revision {
                            state.dirty = false;
                        }
                    }
                    tracing::debug!(visit_id = %self.inner.visit_id, finalise, "saved draft");
                    Ok(ack)
                }
                Err(e) => {
                    tracing::warn!(visit_id = %self.inner.visit_id, finalise, "save failed: {}", e);
                    Err(EditorError::Persist(e))
                }
            }
        };

        if finalise && result.is_ok() {
            self.inner.debouncer.cancel_all();
            tracing::info!(visit_id = %self.inner.visit_id, "record finalised");
        }
        self.inner.publish();
        result
    }

    fn check_writable(&self) -> EditorResult<()> {
        let state = self.inner.state();
        if state.closed {
            return Err(EditorError::SessionClosed);
        }
        if state.draft.is_finalised() {
            return Err(EditorError::RecordFinalised);
        }
        Ok(())
    }

    fn check_finalise(&self) -> EditorResult<()> {
        self.check_writable()?;
        let snapshot = self.inner.status.current();
        let state = self.inner.state();
        if !gate::can_finalize(&state.draft, &snapshot) {
            tracing::debug!(
                visit_id = %self.inner.visit_id,
                is_draft = state.draft.is_draft(),
                visit_status = %snapshot.visit_status,
                "finalise denied by gate"
            );
            return Err(EditorError::GateDenied(Capability::Finalise));
        }
        Ok(())
    }

    /// Start the autosave timer. The first tick fires one full interval from now. Ticks
    /// while the visit is not editable do nothing. Calling this again is a no-op.
    pub fn on_mount(&self) -> EditorResult<()> {
        let mut state = self.inner.state();
        if state.closed {
            return Err(EditorError::SessionClosed);
        }
        if state.autosave.is_some() {
            return Ok(());
        }

        let period = self.inner.config.autosave_interval();
        let weak = Arc::downgrade(&self.inner);
        let handle = self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let session = DraftSynchronizer { inner };
                if session.is_closed() {
                    break;
                }
                match session.autosave_tick().await {
                    AutosaveOutcome::Closed | AutosaveOutcome::Discarded => break,
                    _ => {}
                }
            }
        });
        state.autosave = Some(handle);
        Ok(())
    }

    /// Tear the session down unconditionally: stop the timer and cancel pending triggers.
    pub fn on_unmount(&self) {
        self.shutdown();
    }

    /// The warning to show before the host tears the session down, if there is unsaved work.
    pub fn before_unload(&self) -> Option<UnloadWarning> {
        let state = self.inner.state();
        if state.closed || !state.dirty {
            return None;
        }
        Some(UnloadWarning::new(self.inner.visit_id, state.last_autosave_at))
    }

    /// Close the session. A dirty draft blocks the close unless `discard` is set.
    pub fn close(&self, discard: bool) -> CloseOutcome {
        let dirty = self.is_dirty() && !self.is_closed();
        if dirty && !discard {
            if let Some(warning) = self.before_unload() {
                return CloseOutcome::Blocked(warning);
            }
        }
        self.shutdown();
        CloseOutcome::Closed {
            discarded_unsaved: dirty,
        }
    }

    fn shutdown(&self) {
        let autosave = {
            let mut state = self.inner.state();
            if state.closed {
                return;
            }
            state.closed = true;
            // a timer mid-persist is left to finish; it stops itself on the next check
            let autosaving = state.autosaving;
            state.autosave.take().filter(|_| !autosaving)
        };
        if let Some(handle) = autosave {
            handle.abort();
        }
        self.inner.debouncer.cancel_all();
        self.inner.publish();
        tracing::info!(visit_id = %self.inner.visit_id, "editing session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{PaymentStatus, VisitStatus, VisitStatusSnapshot};
    use crate::testing::Harness;
    use serde_json::json;
    use std::time::Duration;

    fn path(p: &str) -> FieldPath {
        FieldPath::parse(p).unwrap()
    }

    fn called() -> VisitStatusSnapshot {
        VisitStatusSnapshot::new(VisitStatus::Called)
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn called_visit_walkthrough() {
        let harness = Harness::new(called());
        let session = harness.open();

        let view = session.view();
        assert!(view.is_paid);
        assert!(view.can_open);
        assert!(view.can_edit);
        assert!(!view.can_finalize);

        session.on_mount().unwrap();
        session
            .set_field(&path("vitalSigns.pulse"), json!(80))
            .unwrap();
        assert!(session.view().dirty);

        advance(30_001).await;
        assert_eq!(harness.store.options(), vec![PersistOptions::autosave()]);
        assert!(!session.view().dirty);
        assert!(session.view().last_autosave_at.is_some());

        let err = session.save(true).await.unwrap_err();
        assert!(matches!(err, EditorError::GateDenied(Capability::Finalise)));

        session.save(false).await.unwrap();
        assert!(!session.view().draft.is_draft());
        assert!(session.view().can_finalize);

        session.save(true).await.unwrap();
        let view = session.view();
        assert!(view.finalised);
        assert!(!view.dirty);
        assert_eq!(
            harness.store.options(),
            vec![
                PersistOptions::autosave(),
                PersistOptions::explicit(false),
                PersistOptions::explicit(true),
            ]
        );

        let err = session
            .set_field(&path("vitalSigns.pulse"), json!(90))
            .unwrap_err();
        assert!(matches!(err, EditorError::RecordFinalised));
    }

    #[tokio::test(start_paused = true)]
    async fn clean_draft_is_never_autosaved() {
        let harness = Harness::new(called());
        let session = harness.open();

        for _ in 0..10 {
            assert_eq!(session.autosave_tick().await, AutosaveOutcome::Clean);
        }

        session.on_mount().unwrap();
        advance(10 * 30_000 + 1).await;
        assert_eq!(harness.store.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_save_waits_for_autosave_in_flight() {
        let harness = Harness::new(called());
        let session = harness.open();
        harness.store.hold();

        session.set_field(&path("diagnosis"), json!("")).unwrap();

        let autosave = tokio::spawn({
            let session = session.clone();
            async move { session.autosave_tick().await }
        });
        advance(1).await;
        assert!(session.view().in_flight);

        let save = tokio::spawn({
            let session = session.clone();
            async move { session.save(false).await }
        });
        advance(1).await;
        assert_eq!(harness.store.calls(), 1);
        assert_eq!(session.autosave_tick().await, AutosaveOutcome::InFlight);

        harness.store.release(2);
        assert!(matches!(
            autosave.await.unwrap(),
            AutosaveOutcome::Persisted(_)
        ));
        save.await.unwrap().unwrap();

        assert_eq!(harness.store.calls(), 2);
        assert_eq!(harness.store.max_concurrent(), 1);
        assert!(!session.view().dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn finalise_requires_prior_save() {
        let harness = Harness::new(VisitStatusSnapshot::new(VisitStatus::InProgress));
        let session = harness.open();
        session.set_field(&path("notes"), json!("plan")).unwrap();

        let err = session.save(true).await.unwrap_err();
        assert!(matches!(err, EditorError::GateDenied(Capability::Finalise)));
        assert_eq!(harness.store.calls(), 0);
        assert!(session.view().dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn finalise_denied_when_visit_no_longer_editable() {
        let harness = Harness::new(called());
        let session = harness.open();
        session.set_field(&path("notes"), json!("plan")).unwrap();
        session.save(false).await.unwrap();

        harness.set_status(VisitStatusSnapshot::new(VisitStatus::Completed));
        let err = session.save(true).await.unwrap_err();
        assert!(matches!(err, EditorError::GateDenied(Capability::Finalise)));
    }

    #[tokio::test(start_paused = true)]
    async fn normalised_inputs_share_one_fetch() {
        let harness = Harness::new(called());
        harness
            .suggestions
            .respond_with(SuggestionResult::default().with_field("analysis", json!("dental pain")));
        let session = harness.open();
        let complaint = path("chiefComplaint");

        session.set_field(&complaint, json!("Toothache")).unwrap();
        advance(1_500).await;
        assert_eq!(harness.suggestions.calls(), 1);
        assert_eq!(
            session.view().draft.get(&path("analysis")),
            Some(&json!("dental pain"))
        );

        session.set_field(&complaint, json!("  toothache  ")).unwrap();
        advance(1_500).await;
        assert_eq!(harness.suggestions.calls(), 1);

        let outcome = session
            .on_debounced_trigger(&SuggestionChannel::ClinicalAnalysis, "TOOTHACHE ")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SuggestionOutcome::Applied {
                from_cache: true,
                fields: 1
            }
        );
        assert_eq!(harness.suggestions.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_typing_sends_only_last_text() {
        let harness = Harness::new(called());
        let session = harness.open();
        let complaint = path("chiefComplaint");

        for text in ["t", "to", "too", "toot", "tooth"] {
            session.set_field(&complaint, json!(text)).unwrap();
            advance(100).await;
        }
        advance(1_000).await;

        assert_eq!(
            harness.suggestions.inputs(),
            vec![(SuggestionChannel::ClinicalAnalysis, "tooth".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn suggestion_failure_leaves_draft_clean_and_uncached() {
        let harness = Harness::new(called());
        let mut draft = ClinicalDraft::new(VisitId::new());
        draft
            .set_field(
                &path("chiefComplaint"),
                json!("toothache"),
                &crate::draft::SpecialtySchema::dental(),
            )
            .unwrap();
        let session = harness.open_with(draft).unwrap();

        harness.suggestions.fail(true);
        let err = session
            .on_debounced_trigger(&SuggestionChannel::ClinicalAnalysis, "toothache")
            .await
            .unwrap_err();
        assert!(matches!(err, EditorError::Suggestion(_)));
        assert!(!session.view().dirty);

        harness.suggestions.fail(false);
        harness
            .suggestions
            .respond_with(SuggestionResult::default().with_field("analysis", json!("caries")));
        let outcome = session
            .on_debounced_trigger(&SuggestionChannel::ClinicalAnalysis, "toothache")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SuggestionOutcome::Applied {
                from_cache: false,
                fields: 1
            }
        );
        assert_eq!(harness.suggestions.calls(), 2);
        assert!(session.view().dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_suggestion_is_cached_but_not_applied() {
        let harness = Harness::new(called());
        harness
            .suggestions
            .respond_with(SuggestionResult::default().with_field("analysis", json!("caries")));
        let session = harness.open();
        session
            .set_field(&path("chiefComplaint"), json!("fever"))
            .unwrap();

        let outcome = session
            .on_debounced_trigger(&SuggestionChannel::ClinicalAnalysis, "toothache")
            .await
            .unwrap();
        assert_eq!(outcome, SuggestionOutcome::Stale);
        assert_eq!(session.view().draft.get(&path("analysis")), None);

        session
            .set_field(&path("chiefComplaint"), json!("Toothache"))
            .unwrap();
        let outcome = session
            .on_debounced_trigger(&SuggestionChannel::ClinicalAnalysis, "toothache")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SuggestionOutcome::Applied {
                from_cache: true,
                fields: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn suggestions_and_autosave_wait_for_edit_gate() {
        let snapshot =
            VisitStatusSnapshot::new(VisitStatus::Registered).with_payment(PaymentStatus::Paid);
        let harness = Harness::new(snapshot);
        let session = harness.open();

        let view = session.view();
        assert!(view.can_open);
        assert!(!view.can_edit);

        let outcome = session
            .on_debounced_trigger(&SuggestionChannel::CodedSuggestion, "caries")
            .await
            .unwrap();
        assert_eq!(outcome, SuggestionOutcome::GateDenied);
        assert_eq!(harness.suggestions.calls(), 0);

        session.set_field(&path("notes"), json!("x")).unwrap();
        assert_eq!(session.autosave_tick().await, AutosaveOutcome::GateClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn autosave_timer_resumes_when_visit_becomes_editable() {
        let harness = Harness::new(called());
        let session = harness.open();
        session.on_mount().unwrap();
        session.on_mount().unwrap();
        session.set_field(&path("notes"), json!("x")).unwrap();

        harness.set_status(VisitStatusSnapshot::new(VisitStatus::Completed));
        advance(60_001).await;
        assert_eq!(harness.store.calls(), 0);

        harness.set_status(VisitStatusSnapshot::new(VisitStatus::InVisit));
        advance(30_000).await;
        assert_eq!(harness.store.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unpaid_registered_visit_cannot_be_opened() {
        let harness = Harness::new(
            VisitStatusSnapshot::new(VisitStatus::Registered).with_payment(PaymentStatus::Unpaid),
        );
        let err = harness
            .open_with(ClinicalDraft::new(VisitId::new()))
            .err()
            .unwrap();
        assert!(matches!(err, EditorError::GateDenied(Capability::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_autosave_keeps_draft_dirty() {
        let harness = Harness::new(called());
        let session = harness.open();
        session.set_field(&path("notes"), json!("x")).unwrap();

        harness.store.fail(true);
        assert!(matches!(
            session.autosave_tick().await,
            AutosaveOutcome::Failed(_)
        ));
        assert!(session.view().dirty);

        harness.store.fail(false);
        assert!(matches!(
            session.autosave_tick().await,
            AutosaveOutcome::Persisted(_)
        ));
        assert!(!session.view().dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_explicit_save_propagates_and_keeps_marker() {
        let harness = Harness::new(called());
        let session = harness.open();
        session.set_field(&path("notes"), json!("x")).unwrap();

        harness.store.fail(true);
        let err = session.save(false).await.unwrap_err();
        assert!(matches!(err, EditorError::Persist(_)));

        let view = session.view();
        assert!(view.dirty);
        assert!(view.draft.is_draft());
    }

    #[tokio::test(start_paused = true)]
    async fn edit_during_persist_stays_dirty() {
        let harness = Harness::new(called());
        let session = harness.open();
        harness.store.hold();
        session.set_field(&path("notes"), json!("first")).unwrap();

        let autosave = tokio::spawn({
            let session = session.clone();
            async move { session.autosave_tick().await }
        });
        advance(1).await;
        session.set_field(&path("notes"), json!("second")).unwrap();

        harness.store.release(1);
        assert!(matches!(
            autosave.await.unwrap(),
            AutosaveOutcome::Persisted(_)
        ));
        assert!(session.view().dirty);
        assert_eq!(
            harness.store.last_draft().unwrap().get(&path("notes")),
            Some(&json!("first"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dirty_session_blocks_close_until_discarded() {
        let harness = Harness::new(called());
        let session = harness.open();
        assert_eq!(session.before_unload(), None);

        session.set_field(&path("notes"), json!("x")).unwrap();
        let warning = session.before_unload().unwrap();
        assert_eq!(warning.visit_id, session.visit_id());

        assert_eq!(session.close(false), CloseOutcome::Blocked(warning));
        assert!(!session.is_closed());

        assert_eq!(
            session.close(true),
            CloseOutcome::Closed {
                discarded_unsaved: true
            }
        );
        assert!(session.is_closed());
        assert_eq!(session.before_unload(), None);

        let err = session.set_field(&path("notes"), json!("y")).unwrap_err();
        assert!(matches!(err, EditorError::SessionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_suggestions_and_timer() {
        let harness = Harness::new(called());
        let session = harness.open();
        session.on_mount().unwrap();
        session
            .set_field(&path("chiefComplaint"), json!("toothache"))
            .unwrap();

        session.on_unmount();
        advance(60_001).await;

        assert_eq!(harness.suggestions.calls(), 0);
        assert_eq!(harness.store.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_finishing_after_close_is_discarded() {
        let harness = Harness::new(called());
        let session = harness.open();
        harness.store.hold();
        session.set_field(&path("notes"), json!("x")).unwrap();

        let autosave = tokio::spawn({
            let session = session.clone();
            async move { session.autosave_tick().await }
        });
        advance(1).await;
        session.close(true);

        harness.store.release(1);
        assert_eq!(autosave.await.unwrap(), AutosaveOutcome::Discarded);
        assert_eq!(harness.store.calls(), 1);
        assert!(session.view().last_autosave_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_set_field_is_idempotent() {
        let harness = Harness::new(called());
        let once = harness.open();
        let twice = harness.open();
        let odontogram = path("specialtyData.odontogram");
        let value = json!({"18": "caries"});

        once.set_field(&odontogram, value.clone()).unwrap();
        twice.set_field(&odontogram, value.clone()).unwrap();
        twice.set_field(&odontogram, value).unwrap();

        assert!(twice.view().dirty);
        let once_draft = serde_json::to_value(once.view().draft).unwrap();
        let mut twice_draft = serde_json::to_value(twice.view().draft).unwrap();
        twice_draft["visitId"] = once_draft["visitId"].clone();
        assert_eq!(
            serde_json::to_vec(&once_draft).unwrap(),
            serde_json::to_vec(&twice_draft).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_mutations() {
        let harness = Harness::new(called());
        let session = harness.open();
        let mut updates = session.subscribe();
        assert!(!updates.borrow_and_update().dirty);

        session.set_field(&path("notes"), json!("x")).unwrap();
        assert!(updates.has_changed().unwrap());
        assert!(updates.borrow_and_update().dirty);

        session.save(false).await.unwrap();
        let state = updates.borrow_and_update().clone();
        assert!(!state.dirty);
        assert!(!state.draft.is_draft());
    }

    fn draft_with_complaint(complaint: &str) -> ClinicalDraft {
        let mut draft = ClinicalDraft::new(VisitId::new());
        draft
            .set_field(
                &path("chiefComplaint"),
                json!(complaint),
                &crate::draft::SpecialtySchema::dental(),
            )
            .unwrap();
        draft
    }

    #[tokio::test(start_paused = true)]
    async fn unmergeable_suggestion_leaves_draft_untouched_and_uncached() {
        let harness = Harness::new(called());
        harness.suggestions.respond_with(
            SuggestionResult::default()
                .with_field("analysis", json!("caries"))
                .with_field("specialtyData", json!("oops")),
        );
        let session = harness.open_with(draft_with_complaint("toothache")).unwrap();

        let err = session
            .on_debounced_trigger(&SuggestionChannel::ClinicalAnalysis, "toothache")
            .await
            .unwrap_err();
        assert!(matches!(err, EditorError::Suggestion(_)));

        let view = session.view();
        assert_eq!(view.draft.get(&path("analysis")), None);
        assert!(!view.dirty);
        assert_eq!(session.autosave_tick().await, AutosaveOutcome::Clean);

        let err = session
            .on_debounced_trigger(&SuggestionChannel::ClinicalAnalysis, "toothache")
            .await
            .unwrap_err();
        assert!(matches!(err, EditorError::Suggestion(_)));
        assert_eq!(harness.suggestions.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn draft_is_frozen_while_finalising() {
        let harness = Harness::new(called());
        let session = harness.open_with(draft_with_complaint("toothache")).unwrap();
        session.set_field(&path("notes"), json!("a")).unwrap();
        session.save(false).await.unwrap();

        harness.store.hold();
        let finalise = tokio::spawn({
            let session = session.clone();
            async move { session.save(true).await }
        });
        advance(1).await;
        assert!(session.view().in_flight);

        let err = session
            .set_field(&path("notes"), json!("late edit"))
            .unwrap_err();
        assert!(matches!(err, EditorError::RecordFinalised));

        harness
            .suggestions
            .respond_with(SuggestionResult::default().with_field("analysis", json!("caries")));
        let outcome = session
            .on_debounced_trigger(&SuggestionChannel::ClinicalAnalysis, "toothache")
            .await
            .unwrap();
        assert_eq!(outcome, SuggestionOutcome::Discarded);

        harness.store.release(1);
        finalise.await.unwrap().unwrap();

        let view = session.view();
        assert!(view.finalised);
        assert!(!view.dirty);
        assert_eq!(view.draft.get(&path("notes")), Some(&json!("a")));
        assert_eq!(view.draft.get(&path("analysis")), None);
        assert_eq!(session.before_unload(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_finalise_unfreezes_draft() {
        let harness = Harness::new(called());
        let session = harness.open();
        session.set_field(&path("notes"), json!("a")).unwrap();
        session.save(false).await.unwrap();

        harness.store.fail(true);
        let err = session.save(true).await.unwrap_err();
        assert!(matches!(err, EditorError::Persist(_)));

        session.set_field(&path("notes"), json!("b")).unwrap();
        assert!(!session.view().finalised);
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_explicit_save_stops_timer() {
        let harness = Harness::new(called());
        let session = harness.open();
        session.on_mount().unwrap();
        session.set_field(&path("notes"), json!("x")).unwrap();

        harness.store.hold();
        let save = tokio::spawn({
            let session = session.clone();
            async move { session.save(false).await }
        });
        advance(1).await;
        assert!(session.view().in_flight);

        harness.set_status(VisitStatusSnapshot::new(VisitStatus::Completed));
        let timer = session
            .inner
            .state()
            .autosave
            .as_ref()
            .unwrap()
            .abort_handle();
        session.close(true);
        advance(1).await;
        assert!(timer.is_finished());

        harness.store.release(1);
        save.await.unwrap().unwrap();
        advance(60_001).await;
        assert_eq!(harness.store.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn suggestion_merged_during_persist_goes_out_next_tick() {
        let harness = Harness::new(called());
        let session = harness.open_with(draft_with_complaint("toothache")).unwrap();
        harness.store.hold();
        session.set_field(&path("notes"), json!("x")).unwrap();

        let autosave = tokio::spawn({
            let session = session.clone();
            async move { session.autosave_tick().await }
        });
        advance(1).await;

        harness
            .suggestions
            .respond_with(SuggestionResult::default().with_field("analysis", json!("caries")));
        let outcome = session
            .on_debounced_trigger(&SuggestionChannel::ClinicalAnalysis, "toothache")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SuggestionOutcome::Applied {
                from_cache: false,
                fields: 1
            }
        );

        harness.store.release(1);
        assert!(matches!(
            autosave.await.unwrap(),
            AutosaveOutcome::Persisted(_)
        ));
        assert!(session.view().dirty);
        assert_eq!(
            harness.store.last_draft().unwrap().get(&path("analysis")),
            None
        );

        harness.store.release(1);
        assert!(matches!(
            session.autosave_tick().await,
            AutosaveOutcome::Persisted(_)
        ));
        assert!(!session.view().dirty);
        assert_eq!(
            harness.store.last_draft().unwrap().get(&path("analysis")),
            Some(&json!("caries"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn finalise_rechecks_gate_after_waiting_for_persist() {
        let harness = Harness::new(called());
        let session = harness.open();
        session.set_field(&path("notes"), json!("a")).unwrap();
        session.save(false).await.unwrap();

        harness.store.hold();
        session.set_field(&path("notes"), json!("b")).unwrap();
        let autosave = tokio::spawn({
            let session = session.clone();
            async move { session.autosave_tick().await }
        });
        advance(1).await;
        let finalise = tokio::spawn({
            let session = session.clone();
            async move { session.save(true).await }
        });
        advance(1).await;

        harness.set_status(VisitStatusSnapshot::new(VisitStatus::Completed));
        harness.store.release(1);
        assert!(matches!(
            autosave.await.unwrap(),
            AutosaveOutcome::Persisted(_)
        ));

        let err = finalise.await.unwrap().unwrap_err();
        assert!(matches!(err, EditorError::GateDenied(Capability::Finalise)));
        assert_eq!(harness.store.calls(), 2);
        assert!(!session.view().finalised);
    }

    #[test]
    fn open_outside_runtime_fails() {
        let harness = Harness::new(called());
        let err = harness
            .open_with(ClinicalDraft::new(VisitId::new()))
            .err()
            .unwrap();
        assert!(matches!(err, EditorError::NoRuntime));
    }
}
