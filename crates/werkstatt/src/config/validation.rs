use std::collections::HashSet;

use super::types::WerkstattConfig;
use crate::error::WerkstattError;

impl WerkstattConfig {
    /// Validate the config: tag uniqueness, size/tag agreement, non-zero limits.
    pub fn validate(&self) -> Result<(), WerkstattError> {
        self.validate_tags()?;
        self.validate_size()?;
        self.validate_limits()?;
        Ok(())
    }

    /// Tags must be non-empty and unique.
    fn validate_tags(&self) -> Result<(), WerkstattError> {
        let mut seen = HashSet::new();
        for tag in &self.pool.tags {
            if tag.trim().is_empty() {
                return Err(WerkstattError::Config("pool tags must not be empty".into()));
            }
            if !seen.insert(tag.as_str()) {
                return Err(WerkstattError::Config(format!(
                    "pool tag '{tag}' is listed more than once"
                )));
            }
        }
        Ok(())
    }

    /// When both `size` and `tags` are given they must agree.
    fn validate_size(&self) -> Result<(), WerkstattError> {
        match self.pool.size {
            Some(size) if !self.pool.tags.is_empty() && size != self.pool.tags.len() => {
                Err(WerkstattError::Config(format!(
                    "pool size {size} does not match the {} listed tags",
                    self.pool.tags.len()
                )))
            }
            _ => Ok(()),
        }
    }

    fn validate_limits(&self) -> Result<(), WerkstattError> {
        if self.pool.event_capacity == 0 {
            return Err(WerkstattError::Config(
                "pool.event_capacity must be at least 1".into(),
            ));
        }
        if self.pool.startup_timeout_ms == 0 {
            return Err(WerkstattError::Config(
                "pool.startup_timeout_ms must be at least 1".into(),
            ));
        }
        if self.pool.default_timeout_ms == Some(0) {
            return Err(WerkstattError::Config(
                "pool.default_timeout_ms must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }
}
