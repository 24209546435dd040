//! Worker units.
//!
//! A [`WorkerUnit`] is the control-side handle to one isolated context. The
//! handle itself holds no request bookkeeping: the pending-request table,
//! the paused flag and the counters belong to the worker's listener loop
//! (see [`crate::listener`]), and the handle talks to that loop through a
//! command channel. Lifecycle state is published back through a `watch`
//! channel so precondition checks never wait on the loop.
//!
//! Lifecycle: `Unstarted → Running ⇄ Paused → Killed`.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, instrument};

use crate::context::{context_entry, run_context, Isolation, Spawner};
use crate::correlation::{CorrelationIds, UuidCorrelationIds};
use crate::diagnostics::DiagnosticsSink;
use crate::error::WerkstattError;
use crate::events::WorkerEvent;
use crate::listener::{Command, Listener};
use crate::message::{ContextMessage, Envelope};
use crate::metrics::WorkerStats;
use crate::task::Task;

// ── State ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Unstarted,
    Running,
    Paused,
    Killed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unstarted => "unstarted",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// What pausing a worker does to replies already in flight.
///
/// Both modes refuse new dispatches while paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseMode {
    /// Keep delivering replies for requests dispatched before the pause.
    #[default]
    GateDispatch,
    /// Leave replies queued in the channel until the worker is resumed.
    HoldCompletions,
}

impl FromStr for PauseMode {
    type Err = WerkstattError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gate_dispatch" => Ok(Self::GateDispatch),
            "hold_completions" => Ok(Self::HoldCompletions),
            other => Err(WerkstattError::Config(format!(
                "invalid pause mode '{other}', expected 'gate_dispatch' or 'hold_completions'"
            ))),
        }
    }
}

// ── Options & builder ────────────────────────────────────────────────

/// Tunables shared by every worker built from the same [`WorkerBuilder`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub pause_mode: PauseMode,
    /// Timeout applied by [`WorkerUnit::dispatch`]; `None` waits indefinitely.
    pub default_timeout: Option<Duration>,
    /// How long `start` waits for the context handshake.
    pub startup_timeout: Duration,
    /// Buffer size of the worker's event broadcast channel.
    pub event_capacity: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            pause_mode: PauseMode::default(),
            default_timeout: None,
            startup_timeout: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

/// Fluent builder for [`WorkerUnit`]s.
///
/// # Example
/// ```ignore
/// let worker = WorkerBuilder::new("resize")
///     .isolation(Isolation::Thread)
///     .default_timeout(Duration::from_secs(2))
///     .build::<ResizeJob>();
/// worker.start().await?;
/// ```
#[derive(Clone)]
pub struct WorkerBuilder {
    tag: String,
    options: WorkerOptions,
    spawner: Arc<dyn Spawner>,
    ids: Arc<dyn CorrelationIds>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

impl WorkerBuilder {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            options: WorkerOptions::default(),
            spawner: Isolation::default().spawner(),
            ids: Arc::new(UuidCorrelationIds),
            diagnostics: None,
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn pause_mode(mut self, mode: PauseMode) -> Self {
        self.options.pause_mode = mode;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.options.default_timeout = Some(timeout);
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.options.startup_timeout = timeout;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.options.event_capacity = capacity.max(1);
        self
    }

    /// Use one of the built-in spawners.
    pub fn isolation(mut self, isolation: Isolation) -> Self {
        self.spawner = isolation.spawner();
        self
    }

    /// Use a custom spawner.
    pub fn spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn correlation_ids(mut self, ids: Arc<dyn CorrelationIds>) -> Self {
        self.ids = ids;
        self
    }

    /// Attach a diagnostics sink. Requests then ask their context for
    /// started/completed reports.
    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn worker_options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Build an unstarted worker.
    pub fn build<T: Task>(self) -> WorkerUnit<T> {
        let (events, _) = broadcast::channel(self.options.event_capacity.max(1));
        let (stats, _) = watch::channel(WorkerStats::new(self.tag.clone()));
        WorkerUnit {
            shared: Arc::new(Shared {
                tag: self.tag,
                options: self.options,
                spawner: self.spawner,
                ids: self.ids,
                diagnostics: self.diagnostics,
                stats: Arc::new(stats),
                events,
                commands: OnceLock::new(),
                lifecycle: Mutex::new(()),
            }),
        }
    }
}

impl fmt::Debug for WorkerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerBuilder")
            .field("tag", &self.tag)
            .field("options", &self.options)
            .field("diagnostics", &self.diagnostics.is_some())
            .finish()
    }
}

// ── WorkerUnit ───────────────────────────────────────────────────────

struct Shared<T: Task> {
    tag: String,
    options: WorkerOptions,
    spawner: Arc<dyn Spawner>,
    ids: Arc<dyn CorrelationIds>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    /// Written by the handle only while unstarted; by the listener after.
    stats: Arc<watch::Sender<WorkerStats>>,
    events: broadcast::Sender<WorkerEvent<T>>,
    commands: OnceLock<mpsc::UnboundedSender<Command<T>>>,
    /// Serializes start and kill.
    lifecycle: Mutex<()>,
}

/// Control-side handle to one isolated execution context.
///
/// Cloning is cheap; all clones address the same worker. The worker shuts
/// down (resolving anything pending with `WorkerKilled`) when it is killed or
/// when the last handle is dropped.
pub struct WorkerUnit<T: Task> {
    shared: Arc<Shared<T>>,
}

impl<T: Task> Clone for WorkerUnit<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Task> fmt::Debug for WorkerUnit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerUnit")
            .field("tag", &self.shared.tag)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Task> WorkerUnit<T> {
    pub fn tag(&self) -> &str {
        &self.shared.tag
    }

    pub fn state(&self) -> WorkerState {
        self.shared.stats.borrow().state
    }

    pub fn is_paused(&self) -> bool {
        self.state() == WorkerState::Paused
    }

    /// Whether a dispatch issued now would be accepted.
    pub fn is_accepting(&self) -> bool {
        self.state() == WorkerState::Running
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.stats.borrow().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.stats.borrow().pending
    }

    /// Subscribe to this worker's accepted/completed events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent<T>> {
        self.shared.events.subscribe()
    }

    /// Spawn the isolated context and wait for its handshake.
    ///
    /// Starting a running worker is a no-op; a killed worker cannot be
    /// restarted.
    #[instrument(skip_all, fields(worker = %self.shared.tag))]
    pub async fn start(&self) -> Result<(), WerkstattError> {
        let _guard = self.shared.lifecycle.lock().await;
        match self.state() {
            WorkerState::Running | WorkerState::Paused => return Ok(()),
            WorkerState::Killed => return Err(WerkstattError::WorkerKilled(self.shared.tag.clone())),
            WorkerState::Unstarted => {}
        }

        let tag = self.shared.tag.clone();
        let startup = |reason: String| WerkstattError::Startup {
            tag: tag.clone(),
            reason,
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ContextMessage>();
        let entry = context_entry(move || run_context::<T>(outbound_tx));
        let context = self.shared.spawner.spawn(&tag, entry)?;

        let limit = self.shared.options.startup_timeout;
        let inbound = match tokio::time::timeout(limit, outbound_rx.recv()).await {
            Ok(Some(ContextMessage::Ready(inbound))) => inbound,
            Ok(Some(_)) => {
                context.terminate();
                return Err(startup("context spoke before its handshake".into()));
            }
            Ok(None) => {
                context.terminate();
                return Err(startup("context exited before its handshake".into()));
            }
            Err(_) => {
                context.terminate();
                return Err(startup(format!("no handshake within {limit:?}")));
            }
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let listener = Listener::new(
            tag.clone(),
            self.shared.options.pause_mode,
            commands_rx,
            outbound_rx,
            inbound,
            context,
            Arc::clone(&self.shared.stats),
            self.shared.events.clone(),
            self.shared.diagnostics.clone(),
        );

        self.shared
            .stats
            .send_modify(|stats| stats.state = WorkerState::Running);
        // The lifecycle lock guarantees this is the first and only start.
        let _ = self.shared.commands.set(commands_tx);
        tokio::spawn(listener.run());

        info!(worker = %tag, "worker started");
        Ok(())
    }

    /// Dispatch a task, waiting at most the configured default timeout.
    pub async fn dispatch(&self, task: T) -> Result<T::Output, WerkstattError> {
        self.request(task, self.shared.options.default_timeout).await
    }

    /// Dispatch a task, waiting at most `timeout` for the reply.
    ///
    /// On expiry the request is forgotten locally; the context may still
    /// finish the work, and its late reply is discarded.
    pub async fn dispatch_with_timeout(
        &self,
        task: T,
        timeout: Duration,
    ) -> Result<T::Output, WerkstattError> {
        self.request(task, Some(timeout)).await
    }

    async fn request(
        &self,
        mut task: T,
        timeout: Option<Duration>,
    ) -> Result<T::Output, WerkstattError> {
        let commands = self.accepting_commands()?;

        let correlation_id = match task.correlation_id() {
            Some(id) => id.to_string(),
            None => {
                let id = self.shared.ids.next_id();
                task.set_correlation_id(id.clone());
                id
            }
        };
        let envelope =
            Envelope::for_task(&correlation_id, &task, self.shared.diagnostics.is_some())?;

        let (responder, mut response) = oneshot::channel();
        commands
            .send(Command::Dispatch {
                correlation_id: correlation_id.clone(),
                task,
                envelope,
                responder,
            })
            .map_err(|_| WerkstattError::WorkerKilled(self.shared.tag.clone()))?;

        // Forgets the entry if this future is dropped or times out.
        let mut waiting = Waiting {
            commands,
            correlation_id: Some(correlation_id),
        };

        // A dropped responder means the listener is gone.
        let killed = || Err(WerkstattError::WorkerKilled(self.shared.tag.clone()));
        let result = match timeout {
            None => (&mut response).await.unwrap_or_else(|_| killed()),
            Some(limit) => match tokio::time::timeout(limit, &mut response).await {
                Ok(response) => response.unwrap_or_else(|_| killed()),
                Err(_) => {
                    // Closing settles the race with a reply sent as the timer fired.
                    response.close();
                    if let Ok(result) = response.try_recv() {
                        result
                    } else {
                        let correlation_id = waiting.correlation_id.clone().unwrap_or_default();
                        debug!(
                            worker = %self.shared.tag,
                            correlation_id = %correlation_id,
                            "request timed out"
                        );
                        return Err(WerkstattError::Timeout {
                            correlation_id,
                            timeout: limit,
                        });
                    }
                }
            },
        };
        waiting.resolved();
        result
    }

    /// Command channel, if the worker is in a state that accepts dispatches.
    fn accepting_commands(&self) -> Result<&mpsc::UnboundedSender<Command<T>>, WerkstattError> {
        let tag = || self.shared.tag.clone();
        match self.state() {
            WorkerState::Unstarted => Err(WerkstattError::NotStarted(tag())),
            WorkerState::Paused => Err(WerkstattError::Paused(tag())),
            WorkerState::Killed => Err(WerkstattError::WorkerKilled(tag())),
            WorkerState::Running => self
                .shared
                .commands
                .get()
                .ok_or_else(|| WerkstattError::NotStarted(tag())),
        }
    }

    /// Stop accepting new dispatches.
    pub async fn pause(&self) -> Result<(), WerkstattError> {
        self.toggle(|ack| Command::Pause { ack }).await
    }

    /// Accept dispatches again.
    pub async fn resume(&self) -> Result<(), WerkstattError> {
        self.toggle(|ack| Command::Resume { ack }).await
    }

    async fn toggle(
        &self,
        command: impl FnOnce(oneshot::Sender<()>) -> Command<T>,
    ) -> Result<(), WerkstattError> {
        match self.state() {
            WorkerState::Unstarted => Err(WerkstattError::NotStarted(self.shared.tag.clone())),
            WorkerState::Killed => Ok(()),
            WorkerState::Running | WorkerState::Paused => {
                if let Some(commands) = self.shared.commands.get() {
                    let (ack, done) = oneshot::channel();
                    if commands.send(command(ack)).is_ok() {
                        // Err here means the worker died meanwhile: nothing to toggle.
                        let _ = done.await;
                    }
                }
                Ok(())
            }
        }
    }

    /// Terminate the context and fail every pending request with
    /// `WorkerKilled`. Killing twice is a no-op.
    pub async fn kill(&self) {
        let _guard = self.shared.lifecycle.lock().await;
        match self.state() {
            WorkerState::Killed => {}
            WorkerState::Unstarted => {
                self.shared
                    .stats
                    .send_modify(|stats| stats.state = WorkerState::Killed);
                info!(worker = %self.shared.tag, "unstarted worker discarded");
            }
            WorkerState::Running | WorkerState::Paused => {
                if let Some(commands) = self.shared.commands.get() {
                    let (ack, done) = oneshot::channel();
                    if commands.send(Command::Kill { ack }).is_ok() {
                        let _ = done.await;
                    }
                }
            }
        }
    }
}

/// An in-flight request whose caller may stop waiting.
struct Waiting<'a, T: Task> {
    commands: &'a mpsc::UnboundedSender<Command<T>>,
    correlation_id: Option<String>,
}

impl<T: Task> Waiting<'_, T> {
    /// The listener already removed the entry.
    fn resolved(&mut self) {
        self.correlation_id = None;
    }
}

impl<T: Task> Drop for Waiting<'_, T> {
    fn drop(&mut self) {
        if let Some(correlation_id) = self.correlation_id.take() {
            let _ = self.commands.send(Command::Forget { correlation_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_mode_parses_config_values() {
        assert_eq!("gate_dispatch".parse::<PauseMode>().unwrap(), PauseMode::GateDispatch);
        assert_eq!(
            "hold_completions".parse::<PauseMode>().unwrap(),
            PauseMode::HoldCompletions
        );
        assert!("later".parse::<PauseMode>().is_err());
    }

    #[test]
    fn builder_defaults() {
        let builder = WorkerBuilder::new("w");
        let opts = builder.worker_options();
        assert_eq!(opts.pause_mode, PauseMode::GateDispatch);
        assert_eq!(opts.default_timeout, None);
        assert_eq!(opts.startup_timeout, Duration::from_secs(5));
        assert_eq!(opts.event_capacity, 256);
    }

    #[test]
    fn builder_fluent_api() {
        let builder = WorkerBuilder::new("w")
            .tag("renamed")
            .pause_mode(PauseMode::HoldCompletions)
            .default_timeout(Duration::from_millis(250))
            .startup_timeout(Duration::from_secs(1))
            .event_capacity(0);
        let opts = builder.worker_options();
        assert_eq!(opts.pause_mode, PauseMode::HoldCompletions);
        assert_eq!(opts.default_timeout, Some(Duration::from_millis(250)));
        assert_eq!(opts.startup_timeout, Duration::from_secs(1));
        assert_eq!(opts.event_capacity, 1);
        assert!(format!("{builder:?}").contains("renamed"));
    }

    #[test]
    fn worker_state_display() {
        assert_eq!(WorkerState::Paused.to_string(), "paused");
        assert_eq!(WorkerState::Killed.to_string(), "killed");
    }
}
