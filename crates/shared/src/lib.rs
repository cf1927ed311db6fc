pub mod error;
pub mod events;
pub mod memory;

pub mod settings {
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::path::Path;
    use std::time::Duration;

    fn default_debounce_ms() -> u64 {
        100
    }

    fn default_known_modes() -> Vec<String> {
        crate::memory::Mode::known()
            .into_iter()
            .map(|m| m.as_str().to_string())
            .collect()
    }

    fn default_context_window_messages() -> usize {
        20
    }

    /// Which reconciliations a new debounce timer cancels
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
    #[serde(rename_all = "snake_case")]
    pub enum TimerScope {
        /// One timer shared by every mode; a call for any mode cancels it
        #[default]
        Global,
        /// One timer per mode
        PerMode,
    }

    /// Tunables for the chat memory store
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MemorySettings {
        /// Delay before a scheduled reconciliation runs
        #[serde(default = "default_debounce_ms")]
        pub debounce_ms: u64,
        #[serde(default)]
        pub timer_scope: TimerScope,
        /// Modes initialized to an empty history at startup
        #[serde(default = "default_known_modes")]
        pub known_modes: Vec<String>,
        /// Default size of the model-facing context window
        #[serde(default = "default_context_window_messages")]
        pub context_window_messages: usize,
    }

    impl MemorySettings {
        pub fn debounce(&self) -> Duration {
            Duration::from_millis(self.debounce_ms)
        }

        /// Read settings from a JSON file; missing fields take their defaults
        pub fn from_json_file(path: &Path) -> Result<Self> {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading settings from {}", path.display()))?;
            let settings = serde_json::from_str(&json)
                .with_context(|| format!("parsing settings in {}", path.display()))?;
            Ok(settings)
        }

        /// Like `from_json_file`, but an absent file yields the defaults
        pub fn load_or_default(path: &Path) -> Result<Self> {
            if path.exists() {
                Self::from_json_file(path)
            } else {
                Ok(Self::default())
            }
        }
    }

    impl Default for MemorySettings {
        fn default() -> Self {
            Self {
                debounce_ms: default_debounce_ms(),
                timer_scope: TimerScope::default(),
                known_modes: default_known_modes(),
                context_window_messages: default_context_window_messages(),
            }
        }
    }

}

pub mod agent_api {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ChatMessage {
        pub role: String, // "system" | "user" | "assistant"
        pub content: String,
    }
}
