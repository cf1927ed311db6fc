//! Per-mode chat memory
//!
//! `ChatMemoryStore` owns the authoritative message history for every mode,
//! along with the bookkeeping the reconciler needs (last sync time, pending
//! sync tickets, the active mode). Clones share the same state.
//!
//! Every mutator has a `try_*` form returning [`MemoryError`] and a boolean
//! form that logs the failure and returns `false`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use shared::agent_api::ChatMessage;
use shared::error::MemoryError;
use shared::events::MemoryEvent;
use shared::memory::{Message, Mode};
use shared::settings::MemorySettings;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::reconciler::DebounceTimers;
use crate::validator;

/// Mutable state guarded by a single lock
#[derive(Debug, Default)]
pub(crate) struct MemoryState {
    pub(crate) modes: HashMap<Mode, Vec<Message>>,
    pub(crate) last_sync: HashMap<Mode, DateTime<Utc>>,
    /// Mode -> ticket of the sync currently pending for it
    pub(crate) pending: HashMap<Mode, u64>,
    pub(crate) active_mode: Option<Mode>,
}

impl MemoryState {
    /// Live history for `mode`, created empty on first access
    pub(crate) fn messages_mut(&mut self, mode: &Mode) -> &mut Vec<Message> {
        self.modes.entry(mode.clone()).or_default()
    }

    /// Validate and replace a mode's history, then stamp it and make it active
    pub(crate) fn commit(&mut self, mode: &Mode, messages: Vec<Message>) -> Result<(), MemoryError> {
        validator::validate_messages(&messages)?;

        let count = messages.len();
        self.modes.insert(mode.clone(), messages);
        self.last_sync.insert(mode.clone(), Utc::now());
        self.active_mode = Some(mode.clone());

        debug!(mode = %mode, count, "Committed messages");
        Ok(())
    }

    /// Drop the pending flag only if it still belongs to `ticket`
    pub(crate) fn release_pending(&mut self, mode: &Mode, ticket: u64) -> bool {
        if self.pending.get(mode) == Some(&ticket) {
            self.pending.remove(mode);
            true
        } else {
            false
        }
    }
}

pub(crate) struct Inner {
    pub(crate) settings: MemorySettings,
    pub(crate) state: Mutex<MemoryState>,
    pub(crate) timers: Mutex<DebounceTimers>,
    event_sender: Option<mpsc::UnboundedSender<MemoryEvent>>,
    next_ticket: AtomicU64,
}

/// Serializable copy of the whole store
#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub active_mode: Option<Mode>,
    pub modes: BTreeMap<Mode, Vec<Message>>,
    pub last_sync: BTreeMap<Mode, DateTime<Utc>>,
}

/// Shared chat memory for all modes
#[derive(Clone)]
pub struct ChatMemoryStore {
    pub(crate) inner: Arc<Inner>,
}

impl ChatMemoryStore {
    /// Create a store with every configured mode initialized empty
    pub fn new(settings: MemorySettings) -> Self {
        Self::build(settings, None)
    }

    /// Create a store that reports events on `event_sender`
    pub fn with_events(
        settings: MemorySettings,
        event_sender: mpsc::UnboundedSender<MemoryEvent>,
    ) -> Self {
        Self::build(settings, Some(event_sender))
    }

    fn build(
        settings: MemorySettings,
        event_sender: Option<mpsc::UnboundedSender<MemoryEvent>>,
    ) -> Self {
        let mut state = MemoryState::default();
        for name in &settings.known_modes {
            state.modes.insert(Mode::new(name.as_str()), Vec::new());
        }

        let timers = DebounceTimers::new(settings.timer_scope);

        Self {
            inner: Arc::new(Inner {
                settings,
                state: Mutex::new(state),
                timers: Mutex::new(timers),
                event_sender,
                next_ticket: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.inner.settings
    }

    // ---- Mode memory table ----

    /// Copy of the history for `mode`. Unseen modes are created empty.
    pub fn get_messages(&self, mode: &Mode) -> Vec<Message> {
        self.inner.state.lock().messages_mut(mode).clone()
    }

    /// Every mode the store has seen, sorted by name
    pub fn modes(&self) -> Vec<Mode> {
        let state = self.inner.state.lock();
        let mut modes: Vec<Mode> = state.modes.keys().cloned().collect();
        modes.sort();
        modes
    }

    /// Mode most recently written by a commit
    pub fn active_mode(&self) -> Option<Mode> {
        self.inner.state.lock().active_mode.clone()
    }

    pub fn last_sync_time(&self, mode: &Mode) -> Option<DateTime<Utc>> {
        self.inner.state.lock().last_sync.get(mode).copied()
    }

    pub fn is_sync_pending(&self, mode: &Mode) -> bool {
        self.inner.state.lock().pending.contains_key(mode)
    }

    // ---- Single-mode mutators ----

    pub fn try_set_messages(&self, mode: &Mode, messages: Vec<Message>) -> Result<(), MemoryError> {
        self.inner.state.lock().commit(mode, messages)
    }

    /// Replace the history of `mode` wholesale and make it the active mode
    pub fn set_messages_for_mode(&self, mode: &Mode, messages: Vec<Message>) -> bool {
        report("set messages", mode, self.try_set_messages(mode, messages))
    }

    /// Untyped form of [`Self::set_messages_for_mode`]
    pub fn set_messages_from_value(&self, mode: &Mode, messages: &Value) -> bool {
        let result =
            validator::parse_messages(messages).and_then(|parsed| self.try_set_messages(mode, parsed));
        report("set messages", mode, result)
    }

    /// Apply `update` to a copy of message `id` and commit the result.
    ///
    /// The closure runs without the store locked, so it may read the store.
    pub fn try_update_message<F>(&self, mode: &Mode, id: &str, update: F) -> Result<(), MemoryError>
    where
        F: FnOnce(Message) -> Message,
    {
        let original = self
            .inner
            .state
            .lock()
            .messages_mut(mode)
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| not_found(mode, id))?;

        let updated = update(original);
        validator::validate_message(&updated)?;

        let mut state = self.inner.state.lock();
        let current = state.messages_mut(mode);
        let position = current
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| not_found(mode, id))?;

        if updated.id != id && current.iter().any(|m| m.id == updated.id) {
            return Err(MemoryError::DuplicateId {
                mode: mode.clone(),
                id: updated.id,
            });
        }

        let mut next = current.clone();
        next[position] = updated;
        state.commit(mode, next)
    }

    pub fn update_message<F>(&self, mode: &Mode, id: &str, update: F) -> bool
    where
        F: FnOnce(Message) -> Message,
    {
        report("update message", mode, self.try_update_message(mode, id, update))
    }

    pub fn try_add_message(&self, mode: &Mode, message: Message) -> Result<(), MemoryError> {
        if message.id.is_empty() {
            return Err(MemoryError::MissingId);
        }

        let mut state = self.inner.state.lock();
        let current = state.messages_mut(mode);
        if current.iter().any(|m| m.id == message.id) {
            return Err(MemoryError::DuplicateId {
                mode: mode.clone(),
                id: message.id,
            });
        }

        let mut next = current.clone();
        next.push(message);
        state.commit(mode, next)
    }

    /// Append `message` unless its id is missing or already present
    pub fn add_message_to_mode(&self, mode: &Mode, message: Message) -> bool {
        report("add message", mode, self.try_add_message(mode, message))
    }

    /// Untyped form of [`Self::add_message_to_mode`]
    pub fn add_message_from_value(&self, mode: &Mode, message: &Value) -> bool {
        let result =
            validator::parse_message(message).and_then(|parsed| self.try_add_message(mode, parsed));
        report("add message", mode, result)
    }

    /// Empty the history of `mode`. The active mode and last-sync time are
    /// left alone.
    pub fn clear_mode(&self, mode: &Mode) {
        let mut state = self.inner.state.lock();
        state.modes.insert(mode.clone(), Vec::new());
        info!(mode = %mode, "Cleared mode history");
    }

    // ---- Global sync ----

    pub fn try_sync_all_modes(&self, messages: Vec<Message>) -> Result<Mode, MemoryError> {
        let mut state = self.inner.state.lock();
        let mode = state.active_mode.clone().ok_or(MemoryError::NoActiveMode)?;
        state.commit(&mode, messages)?;
        Ok(mode)
    }

    /// Force the active mode to exactly `messages`, skipping the debounce
    /// and merge policy
    pub fn sync_all_modes(&self, messages: Vec<Message>) -> bool {
        match self.try_sync_all_modes(messages) {
            Ok(mode) => {
                info!(mode = %mode, "Force-synced active mode");
                true
            }
            Err(e) => {
                warn!(error = %e, "Global sync failed");
                false
            }
        }
    }

    // ---- Context window ----

    /// Most recent `max_messages` of `mode`, oldest first. Zero uses the
    /// configured window size.
    pub fn context_window(&self, mode: &Mode, max_messages: usize) -> Vec<Message> {
        let limit = if max_messages == 0 {
            self.inner.settings.context_window_messages
        } else {
            max_messages
        };

        let mut state = self.inner.state.lock();
        let messages = state.messages_mut(mode);
        let start = messages.len().saturating_sub(limit);
        messages[start..].to_vec()
    }

    /// [`Self::context_window`] in the shape providers expect
    pub fn api_context_window(&self, mode: &Mode, max_messages: usize) -> Vec<ChatMessage> {
        self.context_window(mode, max_messages)
            .iter()
            .map(ChatMessage::from)
            .collect()
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let state = self.inner.state.lock();
        MemorySnapshot {
            active_mode: state.active_mode.clone(),
            modes: state
                .modes
                .iter()
                .map(|(mode, messages)| (mode.clone(), messages.clone()))
                .collect(),
            last_sync: state
                .last_sync
                .iter()
                .map(|(mode, time)| (mode.clone(), *time))
                .collect(),
        }
    }

    // ---- Internals shared with the reconciler ----

    pub(crate) fn next_ticket(&self) -> u64 {
        self.inner.next_ticket.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn send_event(&self, event: MemoryEvent) {
        if let Some(ref sender) = self.inner.event_sender {
            // Receiver may have been dropped
            let _ = sender.send(event);
        }
    }
}

fn not_found(mode: &Mode, id: &str) -> MemoryError {
    MemoryError::MessageNotFound {
        mode: mode.clone(),
        id: id.to_string(),
    }
}

/// Log a failed operation and flatten the result to a bool
pub(crate) fn report(op: &str, mode: &Mode, result: Result<(), MemoryError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) if e.is_routine() => {
            info!(mode = %mode, error = %e, "Skipped {}", op);
            false
        }
        Err(e) => {
            warn!(mode = %mode, error = %e, "Failed to {}", op);
            false
        }
    }
}
