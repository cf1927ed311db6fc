//! Events emitted by the chat memory store.
//!
//! The store pushes these through an optional channel so the UI can show
//! notices and tests can observe when a debounced sync has finished.

use serde::{Deserialize, Serialize};

use crate::memory::Mode;

/// Title shown to the user when a context sync fails
pub const SYNC_ERROR_TITLE: &str = "Sync Error";

/// Why a reconciliation wrote or kept the stored history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeReason {
    /// Context has more messages than the store
    ContextLonger,
    /// Same length, at least one position differs by id or content
    ContentEdited,
    /// Same length, every position matches
    Identical,
    /// Shorter context that matches the start of the store
    StalePrefix,
    /// Shorter context whose messages differ from the store
    Diverged,
}

/// Outcome of the merge policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "reason", rename_all = "snake_case")]
pub enum MergeDecision {
    Overwrite(MergeReason),
    Keep(MergeReason),
}

impl MergeDecision {
    pub fn writes(&self) -> bool {
        matches!(self, MergeDecision::Overwrite(_))
    }

    pub fn reason(&self) -> MergeReason {
        match self {
            MergeDecision::Overwrite(reason) | MergeDecision::Keep(reason) => *reason,
        }
    }
}

/// Memory store event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MemoryEvent {
    /// A debounced sync ran to completion
    Reconciled {
        mode: Mode,
        decision: MergeDecision,
        /// False when an overwrite was refused by validation
        committed: bool,
    },
    /// A scheduled sync was cancelled by a newer call before it fired
    SyncSuperseded { mode: Mode, by: Mode },
    /// User-facing notice
    Notice { title: String, message: String },
}

impl MemoryEvent {
    pub fn sync_error(message: impl Into<String>) -> Self {
        MemoryEvent::Notice {
            title: SYNC_ERROR_TITLE.to_string(),
            message: message.into(),
        }
    }

    pub fn mode(&self) -> Option<&Mode> {
        match self {
            MemoryEvent::Reconciled { mode, .. } => Some(mode),
            MemoryEvent::SyncSuperseded { mode, .. } => Some(mode),
            MemoryEvent::Notice { .. } => None,
        }
    }
}
