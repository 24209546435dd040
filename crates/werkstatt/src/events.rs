//! Observable event feeds.
//!
//! Workers broadcast [`WorkerEvent`]s as requests enter and leave them; the
//! pool broadcasts [`PoolEvent`]s when its membership or a member's paused
//! state changes. Both feeds are purely informational.

use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Request lifecycle on a single worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent<T: Task> {
    /// The worker registered the request and sent it into its context.
    Accepted {
        worker: String,
        correlation_id: String,
        task: T,
    },
    /// The context answered. `result` carries the task's own failure, if any.
    Completed {
        worker: String,
        correlation_id: String,
        result: Result<T::Output, String>,
    },
}

impl<T: Task> WorkerEvent<T> {
    pub fn worker(&self) -> &str {
        match self {
            Self::Accepted { worker, .. } | Self::Completed { worker, .. } => worker,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Accepted { correlation_id, .. } | Self::Completed { correlation_id, .. } => {
                correlation_id
            }
        }
    }
}

/// Membership and pause changes in a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tag", rename_all = "snake_case")]
pub enum PoolEvent {
    Added(String),
    Removed(String),
    Paused(String),
    Resumed(String),
}

impl PoolEvent {
    pub fn tag(&self) -> &str {
        match self {
            Self::Added(tag) | Self::Removed(tag) | Self::Paused(tag) | Self::Resumed(tag) => tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_event_json_shape() {
        let json = serde_json::to_string(&PoolEvent::Added("worker_1".into())).unwrap();
        assert_eq!(json, r#"{"kind":"added","tag":"worker_1"}"#);

        let back: PoolEvent = serde_json::from_str(r#"{"kind":"paused","tag":"custom"}"#).unwrap();
        assert_eq!(back, PoolEvent::Paused("custom".into()));
        assert_eq!(back.tag(), "custom");
    }
}
