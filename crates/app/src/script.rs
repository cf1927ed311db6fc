//! Replay scripts
//!
//! A script is a JSON array of steps applied in order to a
//! [`ChatMemoryStore`]. Message payloads stay untyped so the store's own
//! validation decides what gets in.

use anyhow::{Context, Result};
use chat_memory::{parse_messages, ChatMemoryStore, MemoryEvent, MemorySnapshot, Mode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One memory operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptStep {
    Set { mode: Mode, messages: Value },
    Add { mode: Mode, message: Value },
    Update { mode: Mode, id: String, content: String },
    Sync { mode: Mode, context: Value },
    SyncAll { messages: Value },
    Clear { mode: Mode },
    Wait { ms: u64 },
}

impl ScriptStep {
    pub fn name(&self) -> &'static str {
        match self {
            ScriptStep::Set { .. } => "set",
            ScriptStep::Add { .. } => "add",
            ScriptStep::Update { .. } => "update",
            ScriptStep::Sync { .. } => "sync",
            ScriptStep::SyncAll { .. } => "sync_all",
            ScriptStep::Clear { .. } => "clear",
            ScriptStep::Wait { .. } => "wait",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step: usize,
    pub op: &'static str,
    pub ok: bool,
}

/// Everything a replay produced
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub outcomes: Vec<StepOutcome>,
    pub events: Vec<MemoryEvent>,
    pub snapshot: MemorySnapshot,
}

pub fn load_script(path: &Path) -> Result<Vec<ScriptStep>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading script {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing script {}", path.display()))
}

async fn apply(store: &ChatMemoryStore, step: ScriptStep) -> bool {
    match step {
        ScriptStep::Set { mode, messages } => store.set_messages_from_value(&mode, &messages),
        ScriptStep::Add { mode, message } => store.add_message_from_value(&mode, &message),
        ScriptStep::Update { mode, id, content } => {
            store.update_message(&mode, &id, |mut m| {
                m.content = content;
                m
            })
        }
        ScriptStep::Sync { mode, context } => store.sync_with_context_value(&mode, &context),
        ScriptStep::SyncAll { messages } => match parse_messages(&messages) {
            Ok(parsed) => store.sync_all_modes(parsed),
            Err(e) => {
                warn!(error = %e, "Rejected messages for global sync");
                false
            }
        },
        ScriptStep::Clear { mode } => {
            store.clear_mode(&mode);
            true
        }
        ScriptStep::Wait { ms } => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            true
        }
    }
}

/// Run `steps` against `store`, then let any scheduled syncs fire before
/// taking the snapshot
pub async fn replay(
    store: &ChatMemoryStore,
    events: &mut mpsc::UnboundedReceiver<MemoryEvent>,
    steps: Vec<ScriptStep>,
) -> ReplayReport {
    let mut outcomes = Vec::with_capacity(steps.len());

    for (i, step) in steps.into_iter().enumerate() {
        let op = step.name();
        let ok = apply(store, step).await;
        info!(step = i, op, ok, "Applied step");
        outcomes.push(StepOutcome { step: i, op, ok });
    }

    settle(store).await;

    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        let mode = event.mode().map(Mode::as_str).unwrap_or("-");
        debug!(mode, ?event, "Collected memory event");
        collected.push(event);
    }

    ReplayReport {
        outcomes,
        events: collected,
        snapshot: store.snapshot(),
    }
}

/// Wait until no mode has a sync pending, bounded by a few debounce periods
async fn settle(store: &ChatMemoryStore) {
    let step = store.settings().debounce().max(Duration::from_millis(10));
    for _ in 0..10 {
        if store.modes().iter().all(|m| !store.is_sync_pending(m)) {
            return;
        }
        tokio::time::sleep(step).await;
    }
    warn!("Replay finished with syncs still pending");
}
