pub mod config;
pub mod context;
pub mod correlation;
pub mod diagnostics;
pub mod error;
pub mod events;
mod listener;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod task;
pub mod worker;

pub use config::{LogConfig, PoolConfig, WerkstattConfig};
pub use context::{
    context_entry, ContextEntry, ContextHandle, Isolation, Spawner, TaskSpawner, ThreadSpawner,
};
pub use correlation::{CorrelationIds, UuidCorrelationIds};
pub use diagnostics::{DiagnosticsSink, Phase, TracingDiagnostics};
pub use error::WerkstattError;
pub use events::{PoolEvent, WorkerEvent};
pub use metrics::{PoolStats, WorkerStats};
pub use pool::{PoolBuilder, WorkerPool};
pub use task::{Computation, Job, Task};
pub use worker::{PauseMode, WorkerBuilder, WorkerOptions, WorkerState, WorkerUnit};
