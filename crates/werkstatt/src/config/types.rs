use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::Isolation;
use crate::worker::PauseMode;

/// Pool size used when neither `size` nor `tags` is given.
pub const DEFAULT_POOL_SIZE: usize = 4;

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for a werkstatt deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WerkstattConfig {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub log: LogConfig,
}

// ── Section configs ─────────────────────────────────────────────────

/// Pool section: initial members and per-worker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of auto-named workers. Ignored in favor of `tags` when both
    /// are set (they must then agree).
    pub size: Option<usize>,

    /// Explicit member tags, in rotation order.
    #[serde(default)]
    pub tags: Vec<String>,

    /// How each worker's context is isolated: `task` or `thread`.
    #[serde(default)]
    pub isolation: Isolation,

    /// `gate_dispatch` or `hold_completions`.
    #[serde(default)]
    pub pause_mode: PauseMode,

    /// Timeout for dispatches that do not pass their own.
    pub default_timeout_ms: Option<u64>,

    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Buffer size of each event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Log per-request diagnostics through `tracing`.
    #[serde(default)]
    pub diagnostics: bool,
}

fn default_startup_timeout_ms() -> u64 {
    5_000
}

fn default_event_capacity() -> usize {
    256
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: None,
            tags: Vec::new(),
            isolation: Isolation::default(),
            pause_mode: PauseMode::default(),
            default_timeout_ms: None,
            startup_timeout_ms: default_startup_timeout_ms(),
            event_capacity: default_event_capacity(),
            diagnostics: false,
        }
    }
}

impl PoolConfig {
    /// Tags the pool starts with.
    pub fn initial_tags(&self) -> Vec<String> {
        if !self.tags.is_empty() {
            return self.tags.clone();
        }
        (1..=self.size.unwrap_or(DEFAULT_POOL_SIZE))
            .map(|n| format!("worker_{n}"))
            .collect()
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Log section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
