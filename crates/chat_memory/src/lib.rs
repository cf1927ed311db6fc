//! Chat Memory - per-mode conversation history for the assistant
//!
//! This crate provides the store that keeps each assistant mode's history
//! consistent while model round-trips hand back their own view of it:
//! - Validate messages before they enter memory
//! - Append, update, or replace a mode's history
//! - Reconcile a model's context window back into memory after a debounce
//! - Force the active mode to match a reloaded history

pub mod reconciler;
pub mod store;
pub mod validator;

pub use reconciler::decide;
pub use store::{ChatMemoryStore, MemorySnapshot};
pub use validator::{is_valid_message, parse_message, parse_messages, validate_message};

pub use shared::error::MemoryError;
pub use shared::events::{MemoryEvent, MergeDecision, MergeReason};
pub use shared::memory::{Message, Mode, Role};
pub use shared::settings::{MemorySettings, TimerScope};
