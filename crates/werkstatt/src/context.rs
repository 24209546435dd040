//! Isolated execution contexts.
//!
//! A context is an independently scheduled piece of execution that shares no
//! mutable state with the worker owning it. The only way in is the request
//! endpoint it hands back during the handshake; the only way out is the
//! channel it was spawned with. [`Spawner`] is the primitive that creates
//! one; [`run_context`] is the trampoline every context runs.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::diagnostics::Phase;
use crate::error::WerkstattError;
use crate::message::{ContextMessage, DiagnosticReport, Envelope, Reply};
use crate::task::Task;

/// Boxed entry point handed to a [`Spawner`].
pub type ContextEntry = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Box a future-producing closure as a [`ContextEntry`].
pub fn context_entry<F, Fut>(f: F) -> ContextEntry
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(f()) })
}

/// Handle to a running context, used to tear it down.
#[derive(Debug)]
pub enum ContextHandle {
    /// Context running as a task on the caller's tokio runtime.
    Task(tokio::task::JoinHandle<()>),
    /// Context running on a dedicated OS thread with its own runtime.
    Thread(std::thread::JoinHandle<()>),
}

impl ContextHandle {
    /// Stop the context.
    ///
    /// Task contexts are aborted outright. Thread contexts cannot be aborted
    /// from outside; they wind down once their request endpoint is dropped,
    /// which the owning worker does right before calling this.
    pub fn terminate(self) {
        match self {
            Self::Task(handle) => handle.abort(),
            Self::Thread(handle) => drop(handle),
        }
    }
}

/// Creates isolated contexts.
pub trait Spawner: Send + Sync {
    /// Start `entry` in a fresh context named `name`.
    fn spawn(&self, name: &str, entry: ContextEntry) -> Result<ContextHandle, WerkstattError>;
}

/// Which built-in [`Spawner`] a worker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// A tokio task on the ambient runtime.
    #[default]
    Task,
    /// A dedicated OS thread driving a current-thread runtime.
    Thread,
}

impl Isolation {
    pub fn spawner(self) -> Arc<dyn Spawner> {
        match self {
            Self::Task => Arc::new(TaskSpawner),
            Self::Thread => Arc::new(ThreadSpawner),
        }
    }
}

impl FromStr for Isolation {
    type Err = WerkstattError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "thread" => Ok(Self::Thread),
            other => Err(WerkstattError::Config(format!(
                "invalid isolation '{other}', expected 'task' or 'thread'"
            ))),
        }
    }
}

/// Spawns each context as a task on the current tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskSpawner;

impl Spawner for TaskSpawner {
    fn spawn(&self, name: &str, entry: ContextEntry) -> Result<ContextHandle, WerkstattError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| WerkstattError::Startup {
            tag: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(ContextHandle::Task(runtime.spawn(entry())))
    }
}

/// Spawns each context on its own OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl Spawner for ThreadSpawner {
    fn spawn(&self, name: &str, entry: ContextEntry) -> Result<ContextHandle, WerkstattError> {
        let startup = |e: std::io::Error| WerkstattError::Startup {
            tag: name.to_string(),
            reason: e.to_string(),
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(startup)?;
        let handle = std::thread::Builder::new()
            .name(format!("werkstatt-{name}"))
            .spawn(move || runtime.block_on(entry()))
            .map_err(startup)?;
        Ok(ContextHandle::Thread(handle))
    }
}

/// Trampoline executed inside every context.
///
/// Opens the request endpoint, hands it to the worker through `outbound`,
/// then executes each incoming envelope as its own task so slow requests do
/// not hold up fast ones. Returns once the worker drops the endpoint; any
/// requests still executing are aborted with the [`JoinSet`].
pub async fn run_context<T: Task>(outbound: mpsc::UnboundedSender<ContextMessage>) {
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel::<Envelope>();
    if outbound.send(ContextMessage::Ready(inbound_tx)).is_err() {
        return;
    }

    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            envelope = inbound.recv() => match envelope {
                Some(envelope) => {
                    running.spawn(execute_envelope::<T>(envelope, outbound.clone()));
                }
                None => break,
            },
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "request task ended abnormally");
                }
            }
        }
    }
    debug!(in_flight = running.len(), "context shutting down");
}

/// Decode, execute and answer a single request.
async fn execute_envelope<T: Task>(envelope: Envelope, outbound: mpsc::UnboundedSender<ContextMessage>) {
    let correlation_id = envelope.correlation_id.clone();
    let started = Instant::now();
    if envelope.diagnostics {
        report(&outbound, Phase::Started, &correlation_id, None);
    }

    let reply = match envelope.decode::<T>() {
        Ok(task) => match AssertUnwindSafe(task.execute()).catch_unwind().await {
            Ok(Ok(output)) => Reply::success(&correlation_id, &output)
                .unwrap_or_else(|e| Reply::failure(&correlation_id, format!("encode output: {e}"))),
            Ok(Err(e)) => Reply::failure(&correlation_id, format!("{e:#}")),
            Err(panic) => Reply::failure(&correlation_id, panic_message(&*panic)),
        },
        Err(e) => Reply::failure(&correlation_id, format!("decode task: {e}")),
    };

    if envelope.diagnostics {
        report(&outbound, Phase::Completed, &correlation_id, Some(started.elapsed()));
    }
    // The worker may already be gone; nobody is left to tell.
    let _ = outbound.send(ContextMessage::Reply(reply));
}

fn report(
    outbound: &mpsc::UnboundedSender<ContextMessage>,
    phase: Phase,
    correlation_id: &str,
    elapsed: Option<std::time::Duration>,
) {
    let _ = outbound.send(ContextMessage::Diagnostic(DiagnosticReport {
        phase,
        correlation_id: correlation_id.to_string(),
        elapsed,
    }));
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}
