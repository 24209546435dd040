//! Optional per-request timing reports.
//!
//! When a worker has a sink configured, every envelope it sends carries the
//! diagnostics flag. The context then reports `Started` and `Completed`
//! phases back over the channel and the worker's listener hands them to the
//! sink. Sinks only observe: nothing they do feeds back into dispatch.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Started,
    Completed,
}

/// Receives diagnostics for requests executed by a worker.
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, worker: &str, phase: Phase, correlation_id: &str, elapsed: Option<Duration>);
}

/// Sink that writes each report as a `debug!` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn record(&self, worker: &str, phase: Phase, correlation_id: &str, elapsed: Option<Duration>) {
        debug!(
            worker = %worker,
            correlation_id = %correlation_id,
            ?phase,
            elapsed_ms = elapsed.map(|d| d.as_millis() as u64),
            "task diagnostics"
        );
    }
}
