//! Engine configuration (layered: code > env).

use std::time::Duration;

/// Strategy for suppressing a model echoing the user prompt at the start of
/// its completion. A defensive patch for specific open-source completion
/// backends; configurable rather than a universal law.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoSuppression {
    Off,
    /// Strip one exact leading occurrence of the (whitespace-trimmed) user
    /// prompt from the first flushed chunk of a message.
    #[default]
    StripLeadingPrompt,
}

/// Tunables for a [`StreamEngine`](crate::engine::StreamEngine) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Shared chunk-flush cadence across all conversations.
    pub flush_interval: Duration,
    /// Shared progress-persist cadence across all active runs.
    pub persist_interval: Duration,
    /// Workspace file-list refresh cadence while a conversation streams.
    pub workspace_poll_interval: Duration,
    /// Cap applied to tool summaries attached on `tool_end`/`tool_error`.
    pub tool_summary_max_chars: usize,
    pub echo_suppression: EchoSuppression,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(75),
            persist_interval: Duration::from_millis(450),
            workspace_poll_interval: Duration::from_secs(5),
            tool_summary_max_chars: 200,
            echo_suppression: EchoSuppression::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load defaults, then apply `TETHER_*` environment overrides
    /// (`TETHER_FLUSH_MS`, `TETHER_PERSIST_MS`, `TETHER_POLL_MS`,
    /// `TETHER_TOOL_SUMMARY_MAX`, `TETHER_ECHO_SUPPRESSION=off|strip`).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let mut config = Self::default();
        if let Some(ms) = env_u64("TETHER_FLUSH_MS") {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("TETHER_PERSIST_MS") {
            config.persist_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("TETHER_POLL_MS") {
            config.workspace_poll_interval = Duration::from_millis(ms);
        }
        if let Some(max) = env_u64("TETHER_TOOL_SUMMARY_MAX") {
            config.tool_summary_max_chars = max as usize;
        }
        if let Ok(raw) = std::env::var("TETHER_ECHO_SUPPRESSION") {
            if let Some(strategy) = parse_echo_suppression(&raw) {
                config.echo_suppression = strategy;
            }
        }
        config
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval;
        self
    }

    pub fn with_workspace_poll_interval(mut self, interval: Duration) -> Self {
        self.workspace_poll_interval = interval;
        self
    }

    pub fn with_tool_summary_max_chars(mut self, max: usize) -> Self {
        self.tool_summary_max_chars = max;
        self
    }

    pub fn with_echo_suppression(mut self, strategy: EchoSuppression) -> Self {
        self.echo_suppression = strategy;
        self
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|raw| raw.trim().parse().ok())
}

fn parse_echo_suppression(raw: &str) -> Option<EchoSuppression> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" | "none" | "disabled" => Some(EchoSuppression::Off),
        "strip" | "strip_leading_prompt" | "on" => Some(EchoSuppression::StripLeadingPrompt),
        _ => None,
    }
}
