//! Debounced reconciliation of model context into the store.
//!
//! A model round-trip hands back its own view of the conversation (trimmed,
//! summarized, or regenerated). `sync_with_context` folds that view back into
//! the mode's stored history after a short debounce, without letting a
//! truncated view erase messages the user can already see.
//!
//! Each mode admits one pending sync at a time. With the default
//! [`TimerScope::Global`] only one debounce timer exists for the whole store,
//! so scheduling a sync for one mode cancels a not-yet-fired sync for another.

use serde_json::Value;
use shared::error::MemoryError;
use shared::events::{MemoryEvent, MergeDecision, MergeReason};
use shared::memory::{Message, Mode};
use shared::settings::TimerScope;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::store::{report, ChatMemoryStore};
use crate::validator;

/// Decide how `context` relates to the `stored` history
pub fn decide(stored: &[Message], context: &[Message]) -> MergeDecision {
    let matches_stored = |len: usize| {
        stored
            .iter()
            .zip(context)
            .take(len)
            .all(|(s, c)| s.same_turn(c))
    };

    if context.len() > stored.len() {
        MergeDecision::Overwrite(MergeReason::ContextLonger)
    } else if context.len() == stored.len() {
        if matches_stored(stored.len()) {
            MergeDecision::Keep(MergeReason::Identical)
        } else {
            MergeDecision::Overwrite(MergeReason::ContentEdited)
        }
    } else if matches_stored(context.len()) {
        MergeDecision::Keep(MergeReason::StalePrefix)
    } else {
        MergeDecision::Overwrite(MergeReason::Diverged)
    }
}

/// A scheduled reconciliation waiting on its debounce delay
#[derive(Debug)]
struct ScheduledSync {
    mode: Mode,
    ticket: u64,
    handle: JoinHandle<()>,
}

/// Debounce timers, keyed by mode or shared by all modes
#[derive(Debug)]
pub(crate) struct DebounceTimers {
    scope: TimerScope,
    slots: HashMap<Option<Mode>, ScheduledSync>,
}

impl DebounceTimers {
    pub(crate) fn new(scope: TimerScope) -> Self {
        Self {
            scope,
            slots: HashMap::new(),
        }
    }

    fn slot(&self, mode: &Mode) -> Option<Mode> {
        match self.scope {
            TimerScope::Global => None,
            TimerScope::PerMode => Some(mode.clone()),
        }
    }

    /// Remove the timer for `mode` if it still belongs to `ticket`.
    /// A timer that is no longer in its slot was superseded.
    fn claim(&mut self, mode: &Mode, ticket: u64) -> bool {
        let key = self.slot(mode);
        match self.slots.get(&key) {
            Some(scheduled) if scheduled.ticket == ticket => {
                self.slots.remove(&key);
                true
            }
            _ => false,
        }
    }
}

/// Clears a pending flag when the timer task ends, however it ends
struct PendingGuard {
    store: ChatMemoryStore,
    mode: Mode,
    ticket: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let released = self
            .store
            .inner
            .state
            .lock()
            .release_pending(&self.mode, self.ticket);
        if released {
            debug!(mode = %self.mode, ticket = self.ticket, "Released pending sync");
        }
    }
}

impl ChatMemoryStore {
    /// Schedule a reconciliation of `context` into `mode`.
    ///
    /// Returns `Ok(())` once the sync is scheduled; the merge itself runs
    /// after the debounce delay and reports a [`MemoryEvent::Reconciled`].
    pub fn try_sync_with_context(
        &self,
        mode: &Mode,
        context: Vec<Message>,
    ) -> Result<(), MemoryError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| MemoryError::NoRuntime {
            mode: mode.clone(),
        })?;

        let ticket = {
            let mut state = self.inner.state.lock();
            if state.pending.contains_key(mode) {
                return Err(MemoryError::SyncPending { mode: mode.clone() });
            }
            let ticket = self.next_ticket();
            state.pending.insert(mode.clone(), ticket);
            ticket
        };

        let delay = self.inner.settings.debounce();
        let mut timers = self.inner.timers.lock();
        let key = timers.slot(mode);

        if let Some(previous) = timers.slots.remove(&key) {
            previous.handle.abort();
            self.inner
                .state
                .lock()
                .release_pending(&previous.mode, previous.ticket);
            warn!(
                mode = %previous.mode,
                by = %mode,
                "Scheduled sync superseded before it ran"
            );
            self.send_event(MemoryEvent::SyncSuperseded {
                mode: previous.mode,
                by: mode.clone(),
            });
        }

        // Built outside the task so an abort before the first poll still
        // drops it. Spawned under the timers lock so the task can't claim
        // its slot before the slot exists.
        let guard = PendingGuard {
            store: self.clone(),
            mode: mode.clone(),
            ticket,
        };
        let store = self.clone();
        let task_mode = mode.clone();
        let handle = runtime.spawn(async move {
            let _guard = guard;

            tokio::time::sleep(delay).await;

            if !store.inner.timers.lock().claim(&task_mode, ticket) {
                return;
            }
            store.reconcile(&task_mode, ticket, context);
        });

        timers.slots.insert(
            key,
            ScheduledSync {
                mode: mode.clone(),
                ticket,
                handle,
            },
        );

        debug!(mode = %mode, ticket, delay_ms = delay.as_millis() as u64, "Scheduled sync");
        Ok(())
    }

    /// Schedule a debounced reconciliation. `false` when a sync is already
    /// pending for `mode` or none could be scheduled.
    pub fn sync_with_context(&self, mode: &Mode, context: Vec<Message>) -> bool {
        match self.try_sync_with_context(mode, context) {
            Err(e @ MemoryError::NoRuntime { .. }) => {
                error!(mode = %mode, error = %e, "Could not schedule sync");
                self.send_event(MemoryEvent::sync_error(e.to_string()));
                false
            }
            result => report("sync with context", mode, result),
        }
    }

    /// Untyped form of [`Self::sync_with_context`]. A context that is not a
    /// valid message list fails before anything is scheduled.
    pub fn sync_with_context_value(&self, mode: &Mode, context: &Value) -> bool {
        match validator::parse_messages(context) {
            Ok(messages) => self.sync_with_context(mode, messages),
            Err(e) => {
                error!(mode = %mode, error = %e, "Rejected context for sync");
                self.send_event(MemoryEvent::sync_error(format!(
                    "Couldn't sync {} conversation: {}",
                    mode, e
                )));
                false
            }
        }
    }

    /// Apply the merge policy and commit if it calls for a write. The
    /// pending flag is released before any event goes out.
    fn reconcile(&self, mode: &Mode, ticket: u64, context: Vec<Message>) {
        let (decision, result) = {
            let mut state = self.inner.state.lock();
            let decision = decide(state.messages_mut(mode), &context);
            let result = if decision.writes() {
                Some(state.commit(mode, context))
            } else {
                None
            };
            state.release_pending(mode, ticket);
            (decision, result)
        };

        let committed = match result {
            Some(Ok(())) => {
                info!(mode = %mode, reason = ?decision.reason(), "Reconciled context into memory");
                true
            }
            Some(Err(e)) => {
                error!(mode = %mode, error = %e, "Reconciliation rejected context");
                self.send_event(MemoryEvent::sync_error(format!(
                    "Couldn't sync {} conversation: {}",
                    mode, e
                )));
                false
            }
            None => {
                debug!(mode = %mode, reason = ?decision.reason(), "Memory already up to date");
                false
            }
        };

        self.send_event(MemoryEvent::Reconciled {
            mode: mode.clone(),
            decision,
            committed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::memory::Role;
    use shared::settings::MemorySettings;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn msg(id: &str, content: &str) -> Message {
        Message::new(id, Role::User, content)
    }

    fn contents(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    fn store_with_events(
        scope: TimerScope,
    ) -> (ChatMemoryStore, mpsc::UnboundedReceiver<MemoryEvent>) {
        let settings = MemorySettings {
            debounce_ms: 20,
            timer_scope: scope,
            ..MemorySettings::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (ChatMemoryStore::with_events(settings, tx), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<MemoryEvent>) -> MemoryEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for memory event")
            .expect("event channel closed")
    }

    async fn next_reconciled(rx: &mut mpsc::UnboundedReceiver<MemoryEvent>) -> (Mode, MergeDecision) {
        loop {
            if let MemoryEvent::Reconciled { mode, decision, .. } = next_event(rx).await {
                return (mode, decision);
            }
        }
    }

    #[test]
    fn test_decide_policy() {
        let a = msg("a", "A");
        let b = msg("b", "B");
        let c = msg("c", "C");
        let b_edit = msg("b", "B'");

        let stored = vec![a.clone(), b.clone()];
        assert_eq!(
            decide(&stored, &[a.clone(), b.clone(), c.clone()]),
            MergeDecision::Overwrite(MergeReason::ContextLonger)
        );
        assert_eq!(
            decide(&stored, &[a.clone(), b.clone()]),
            MergeDecision::Keep(MergeReason::Identical)
        );
        assert_eq!(
            decide(&stored, &[a.clone(), b_edit.clone()]),
            MergeDecision::Overwrite(MergeReason::ContentEdited)
        );

        let stored = vec![a.clone(), b.clone(), c.clone()];
        assert_eq!(
            decide(&stored, &[a.clone(), b.clone()]),
            MergeDecision::Keep(MergeReason::StalePrefix)
        );
        assert_eq!(
            decide(&stored, &[a.clone(), b_edit]),
            MergeDecision::Overwrite(MergeReason::Diverged)
        );
        assert_eq!(decide(&stored, &[]), MergeDecision::Keep(MergeReason::StalePrefix));
        assert_eq!(decide(&[], &[]), MergeDecision::Keep(MergeReason::Identical));
    }

    #[test]
    fn test_decide_compares_ids_not_just_content() {
        let stored = vec![msg("a", "same")];
        assert_eq!(
            decide(&stored, &[msg("z", "same")]),
            MergeDecision::Overwrite(MergeReason::ContentEdited)
        );
    }

    #[test]
    fn test_sync_without_runtime_fails() {
        let store = ChatMemoryStore::new(MemorySettings::default());
        let mode = Mode::general();
        assert!(!store.sync_with_context(&mode, vec![msg("a", "A")]));
        assert!(!store.is_sync_pending(&mode));
    }

    #[tokio::test]
    async fn test_longer_context_overwrites() {
        let (store, mut rx) = store_with_events(TimerScope::Global);
        let mode = Mode::general();
        store.set_messages_for_mode(&mode, vec![msg("a", "A"), msg("b", "B")]);

        assert!(store.sync_with_context(&mode, vec![msg("a", "A"), msg("b", "B"), msg("c", "C")]));
        assert!(store.is_sync_pending(&mode));

        let (synced, decision) = next_reconciled(&mut rx).await;
        assert_eq!(synced, mode);
        assert_eq!(decision, MergeDecision::Overwrite(MergeReason::ContextLonger));
        assert_eq!(contents(&store.get_messages(&mode)), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_stale_prefix_is_discarded() {
        let (store, mut rx) = store_with_events(TimerScope::Global);
        let mode = Mode::student();
        store.set_messages_for_mode(&mode, vec![msg("a", "A"), msg("b", "B"), msg("c", "C")]);

        assert!(store.sync_with_context(&mode, vec![msg("a", "A"), msg("b", "B")]));

        let (_, decision) = next_reconciled(&mut rx).await;
        assert_eq!(decision, MergeDecision::Keep(MergeReason::StalePrefix));
        assert_eq!(contents(&store.get_messages(&mode)), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_divergent_shorter_context_overwrites() {
        let (store, mut rx) = store_with_events(TimerScope::Global);
        let mode = Mode::creative();
        store.set_messages_for_mode(&mode, vec![msg("a", "A"), msg("b", "B"), msg("c", "C")]);

        assert!(store.sync_with_context(&mode, vec![msg("a", "A"), msg("b", "B'")]));

        let (_, decision) = next_reconciled(&mut rx).await;
        assert_eq!(decision, MergeDecision::Overwrite(MergeReason::Diverged));
        assert_eq!(contents(&store.get_messages(&mode)), vec!["A", "B'"]);
    }

    #[tokio::test]
    async fn test_identical_context_does_not_write() {
        let (store, mut rx) = store_with_events(TimerScope::Global);
        let mode = Mode::general();
        store.set_messages_for_mode(&mode, vec![msg("a", "A")]);
        let stamped = store.last_sync_time(&mode);

        assert!(store.sync_with_context(&mode, vec![msg("a", "A")]));

        match next_event(&mut rx).await {
            MemoryEvent::Reconciled {
                decision, committed, ..
            } => {
                assert_eq!(decision, MergeDecision::Keep(MergeReason::Identical));
                assert!(!committed);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(store.last_sync_time(&mode), stamped);
    }

    #[tokio::test]
    async fn test_second_sync_for_same_mode_is_rejected() {
        let (store, mut rx) = store_with_events(TimerScope::Global);
        let mode = Mode::general();

        assert!(store.sync_with_context(&mode, vec![msg("a", "A")]));
        assert!(!store.sync_with_context(&mode, vec![msg("a", "A"), msg("b", "B")]));

        // Only the first call's timer is live
        let (_, decision) = next_reconciled(&mut rx).await;
        assert_eq!(decision, MergeDecision::Overwrite(MergeReason::ContextLonger));
        assert_eq!(contents(&store.get_messages(&mode)), vec!["A"]);
        assert!(!store.is_sync_pending(&mode));

        // Guard is released once the sync completes
        assert!(store.sync_with_context(&mode, vec![msg("a", "A"), msg("b", "B")]));
        next_reconciled(&mut rx).await;
        assert_eq!(contents(&store.get_messages(&mode)), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_global_timer_drops_other_modes_sync() {
        let (store, mut rx) = store_with_events(TimerScope::Global);
        let first = Mode::general();
        let second = Mode::student();

        assert!(store.sync_with_context(&first, vec![msg("a", "A")]));
        assert!(store.sync_with_context(&second, vec![msg("s", "S")]));

        let superseded = next_event(&mut rx).await;
        assert_eq!(superseded.mode(), Some(&first));
        match superseded {
            MemoryEvent::SyncSuperseded { by, .. } => assert_eq!(by, second),
            other => panic!("unexpected event {:?}", other),
        }
        let (synced, _) = next_reconciled(&mut rx).await;
        assert_eq!(synced, second);

        assert!(store.get_messages(&first).is_empty());
        assert_eq!(contents(&store.get_messages(&second)), vec!["S"]);
        // The dropped mode is free to sync again
        assert!(!store.is_sync_pending(&first));
        assert!(store.sync_with_context(&first, vec![msg("a", "A")]));
    }

    #[tokio::test]
    async fn test_per_mode_timers_are_independent() {
        let (store, mut rx) = store_with_events(TimerScope::PerMode);
        let first = Mode::general();
        let second = Mode::student();

        assert!(store.sync_with_context(&first, vec![msg("a", "A")]));
        assert!(store.sync_with_context(&second, vec![msg("s", "S")]));

        let mut synced = vec![next_reconciled(&mut rx).await.0, next_reconciled(&mut rx).await.0];
        synced.sort();
        assert_eq!(synced, vec![first.clone(), second.clone()]);
        assert_eq!(contents(&store.get_messages(&first)), vec!["A"]);
        assert_eq!(contents(&store.get_messages(&second)), vec!["S"]);
    }

    /// Pull the scheduled timer out of its slot and abort it, bypassing
    /// the supersede path
    async fn abort_scheduled(store: &ChatMemoryStore, mode: &Mode) {
        let scheduled = store
            .inner
            .timers
            .lock()
            .slots
            .remove(&Some(mode.clone()))
            .expect("sync should be scheduled");
        scheduled.handle.abort();
        assert!(scheduled.handle.await.unwrap_err().is_cancelled());
    }

    fn slow_store() -> (ChatMemoryStore, mpsc::UnboundedReceiver<MemoryEvent>) {
        let settings = MemorySettings {
            debounce_ms: 10_000,
            timer_scope: TimerScope::PerMode,
            ..MemorySettings::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (ChatMemoryStore::with_events(settings, tx), rx)
    }

    #[tokio::test]
    async fn test_aborted_timer_releases_pending() {
        let (store, _rx) = slow_store();
        let mode = Mode::general();

        assert!(store.sync_with_context(&mode, vec![msg("a", "A")]));
        assert!(store.is_sync_pending(&mode));

        // Never polled before the abort
        abort_scheduled(&store, &mode).await;
        assert!(!store.is_sync_pending(&mode));
        assert!(store.get_messages(&mode).is_empty());
    }

    #[tokio::test]
    async fn test_aborted_mid_sleep_releases_pending() {
        let (store, _rx) = slow_store();
        let mode = Mode::general();

        assert!(store.sync_with_context(&mode, vec![msg("a", "A")]));
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        abort_scheduled(&store, &mode).await;
        assert!(!store.is_sync_pending(&mode));
    }

    #[tokio::test]
    async fn test_sync_after_aborted_timer_succeeds() {
        let (store, mut rx) = store_with_events(TimerScope::PerMode);
        let mode = Mode::general();

        assert!(store.sync_with_context(&mode, vec![msg("a", "stale")]));
        abort_scheduled(&store, &mode).await;

        assert!(store.sync_with_context(&mode, vec![msg("a", "A"), msg("b", "B")]));
        let (synced, decision) = next_reconciled(&mut rx).await;
        assert_eq!(synced, mode);
        assert_eq!(decision, MergeDecision::Overwrite(MergeReason::ContextLonger));
        assert_eq!(contents(&store.get_messages(&mode)), vec!["A", "B"]);
        assert!(!store.is_sync_pending(&mode));
    }

    #[tokio::test]
    async fn test_invalid_context_array_notifies() {
        let (store, mut rx) = store_with_events(TimerScope::Global);
        let mode = Mode::general();

        assert!(!store.sync_with_context_value(&mode, &json!("not a list")));
        assert!(!store.is_sync_pending(&mode));

        match next_event(&mut rx).await {
            MemoryEvent::Notice { title, .. } => assert_eq!(title, "Sync Error"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_value_context_is_scheduled() {
        let (store, mut rx) = store_with_events(TimerScope::Global);
        let mode = Mode::productivity();

        assert!(store.sync_with_context_value(
            &mode,
            &json!([{"id": "a", "role": "assistant", "content": "A"}])
        ));
        next_reconciled(&mut rx).await;
        assert_eq!(contents(&store.get_messages(&mode)), vec!["A"]);
    }

    #[tokio::test]
    async fn test_rejected_overwrite_reports_sync_error() {
        let (store, mut rx) = store_with_events(TimerScope::Global);
        let mode = Mode::general();

        assert!(store.sync_with_context(&mode, vec![msg("a", "")]));

        match next_event(&mut rx).await {
            MemoryEvent::Notice { title, .. } => assert_eq!(title, "Sync Error"),
            other => panic!("unexpected event {:?}", other),
        }
        match next_event(&mut rx).await {
            MemoryEvent::Reconciled { committed, .. } => assert!(!committed),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(store.get_messages(&mode).is_empty());
        assert!(!store.is_sync_pending(&mode));
    }
}
