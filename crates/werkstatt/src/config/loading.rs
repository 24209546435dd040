use std::path::Path;
use std::str::FromStr;

use tracing::warn;

use crate::error::WerkstattError;

use super::types::{LogConfig, PoolConfig, WerkstattConfig};

impl WerkstattConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, WerkstattError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WerkstattError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults for a single-process run: four task-isolated workers.
    pub fn local() -> Self {
        Self {
            pool: PoolConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// - `WERKSTATT_POOL_SIZE` -> `pool.size`
    /// - `WERKSTATT_POOL_TAGS` -> `pool.tags` (comma-separated)
    /// - `WERKSTATT_POOL_ISOLATION` -> `pool.isolation`
    /// - `WERKSTATT_POOL_PAUSE_MODE` -> `pool.pause_mode`
    /// - `WERKSTATT_POOL_DEFAULT_TIMEOUT_MS` -> `pool.default_timeout_ms`
    /// - `WERKSTATT_POOL_STARTUP_TIMEOUT_MS` -> `pool.startup_timeout_ms`
    /// - `WERKSTATT_POOL_EVENT_CAPACITY` -> `pool.event_capacity`
    /// - `WERKSTATT_POOL_DIAGNOSTICS` -> `pool.diagnostics`
    /// - `WERKSTATT_LOG_LEVEL` -> `log.level`
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("WERKSTATT_POOL_SIZE") {
            if let Some(size) = parsed("WERKSTATT_POOL_SIZE", &v) {
                self.pool.size = Some(size);
            }
        }
        if let Some(v) = lookup("WERKSTATT_POOL_TAGS") {
            self.pool.tags = v
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("WERKSTATT_POOL_ISOLATION") {
            if let Some(isolation) = parsed("WERKSTATT_POOL_ISOLATION", &v) {
                self.pool.isolation = isolation;
            }
        }
        if let Some(v) = lookup("WERKSTATT_POOL_PAUSE_MODE") {
            if let Some(mode) = parsed("WERKSTATT_POOL_PAUSE_MODE", &v) {
                self.pool.pause_mode = mode;
            }
        }
        if let Some(v) = lookup("WERKSTATT_POOL_DEFAULT_TIMEOUT_MS") {
            if let Some(ms) = parsed("WERKSTATT_POOL_DEFAULT_TIMEOUT_MS", &v) {
                self.pool.default_timeout_ms = Some(ms);
            }
        }
        if let Some(v) = lookup("WERKSTATT_POOL_STARTUP_TIMEOUT_MS") {
            if let Some(ms) = parsed("WERKSTATT_POOL_STARTUP_TIMEOUT_MS", &v) {
                self.pool.startup_timeout_ms = ms;
            }
        }
        if let Some(v) = lookup("WERKSTATT_POOL_EVENT_CAPACITY") {
            if let Some(capacity) = parsed("WERKSTATT_POOL_EVENT_CAPACITY", &v) {
                self.pool.event_capacity = capacity;
            }
        }
        if let Some(v) = lookup("WERKSTATT_POOL_DIAGNOSTICS") {
            if let Some(enabled) = parsed("WERKSTATT_POOL_DIAGNOSTICS", &v) {
                self.pool.diagnostics = enabled;
            }
        }
        if let Some(v) = lookup("WERKSTATT_LOG_LEVEL") {
            self.log.level = v;
        }
    }
}

fn parsed<V: FromStr>(key: &str, raw: &str) -> Option<V> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "ignoring unparsable override");
            None
        }
    }
}
