//! Failure modes of chat memory operations.

use crate::memory::Mode;

/// Why a memory operation was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("Invalid message at position {index}: {reason}")]
    InvalidMessage { index: usize, reason: String },

    #[error("Expected a list of messages, got {found}")]
    NotAnArray { found: String },

    #[error("Message has no id")]
    MissingId,

    #[error("Message {id} already exists in {mode} mode")]
    DuplicateId { mode: Mode, id: String },

    #[error("Message {id} not found in {mode} mode")]
    MessageNotFound { mode: Mode, id: String },

    #[error("A sync is already pending for {mode} mode")]
    SyncPending { mode: Mode },

    #[error("No active mode to sync")]
    NoActiveMode,

    #[error("No async runtime available to schedule sync for {mode} mode")]
    NoRuntime { mode: Mode },
}

impl MemoryError {
    /// Guard rejections are routine and logged at info rather than warn
    pub fn is_routine(&self) -> bool {
        matches!(self, MemoryError::SyncPending { .. })
    }
}
