use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the werkstatt worker engine.
#[derive(Debug, Error)]
pub enum WerkstattError {
    #[error("worker '{tag}' failed to start: {reason}")]
    Startup { tag: String, reason: String },

    #[error("worker '{0}' has not been started")]
    NotStarted(String),

    #[error("worker '{0}' is paused")]
    Paused(String),

    #[error("no worker tagged '{0}'")]
    UnknownTag(String),

    #[error("pool has no workers")]
    NoWorkers,

    #[error("every worker in the pool is paused")]
    NoAvailableWorker,

    #[error("request {correlation_id} timed out after {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("worker '{0}' was killed")]
    WorkerKilled(String),

    #[error("task {correlation_id} failed: {message}")]
    Execution {
        correlation_id: String,
        message: String,
    },

    #[error("correlation id {0} is already pending")]
    DuplicateCorrelationId(String),

    #[error("a worker tagged '{0}' already exists")]
    DuplicateTag(String),

    #[error("serialization error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

impl WerkstattError {
    /// Whether the pool could not route the request to any worker.
    ///
    /// Routing failures never touch a worker; everything else happened to
    /// a request that was (or was about to be) handed to a specific one.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            Self::UnknownTag(_) | Self::NoWorkers | Self::NoAvailableWorker
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_errors_are_distinguishable() {
        assert!(WerkstattError::NoWorkers.is_routing());
        assert!(WerkstattError::NoAvailableWorker.is_routing());
        assert!(WerkstattError::UnknownTag("x".into()).is_routing());
        assert!(!WerkstattError::Paused("x".into()).is_routing());
        assert!(!WerkstattError::WorkerKilled("x".into()).is_routing());
        assert!(!WerkstattError::Timeout {
            correlation_id: "c".into(),
            timeout: Duration::from_millis(10),
        }
        .is_routing());
    }

    #[test]
    fn display_names_the_worker() {
        let err = WerkstattError::Paused("worker_2".into());
        assert_eq!(err.to_string(), "worker 'worker_2' is paused");
    }
}
