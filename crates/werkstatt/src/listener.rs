//! The per-worker event loop.
//!
//! Every started [`WorkerUnit`](crate::worker::WorkerUnit) has exactly one
//! [`Listener`] task. It is the single writer of the worker's bookkeeping:
//! the pending-request table, the paused flag and the counters are plain
//! fields here, never shared. Handles reach it through [`Command`]s; the
//! isolated context reaches it through [`ContextMessage`]s. Both arrive on
//! channels multiplexed with `tokio::select!`.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::context::ContextHandle;
use crate::diagnostics::DiagnosticsSink;
use crate::error::WerkstattError;
use crate::events::WorkerEvent;
use crate::message::{ContextMessage, Envelope, Reply};
use crate::metrics::WorkerStats;
use crate::task::Task;
use crate::worker::{PauseMode, WorkerState};

pub(crate) type Responder<T> = oneshot::Sender<Result<<T as Task>::Output, WerkstattError>>;

/// Requests from a worker handle to its listener.
pub(crate) enum Command<T: Task> {
    Dispatch {
        correlation_id: String,
        task: T,
        envelope: Envelope,
        responder: Responder<T>,
    },
    /// The caller gave up waiting; drop the entry without resolving it.
    Forget { correlation_id: String },
    Pause { ack: oneshot::Sender<()> },
    Resume { ack: oneshot::Sender<()> },
    Kill { ack: oneshot::Sender<()> },
}

struct PendingRequest<T: Task> {
    responder: Responder<T>,
    dispatched_at: Instant,
}

pub(crate) struct Listener<T: Task> {
    tag: String,
    pause_mode: PauseMode,
    paused: bool,
    pending: HashMap<String, PendingRequest<T>>,
    commands: mpsc::UnboundedReceiver<Command<T>>,
    outbound: mpsc::UnboundedReceiver<ContextMessage>,
    inbound: Option<mpsc::UnboundedSender<Envelope>>,
    context: Option<ContextHandle>,
    stats: Arc<watch::Sender<WorkerStats>>,
    events: broadcast::Sender<WorkerEvent<T>>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

impl<T: Task> Listener<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tag: String,
        pause_mode: PauseMode,
        commands: mpsc::UnboundedReceiver<Command<T>>,
        outbound: mpsc::UnboundedReceiver<ContextMessage>,
        inbound: mpsc::UnboundedSender<Envelope>,
        context: ContextHandle,
        stats: Arc<watch::Sender<WorkerStats>>,
        events: broadcast::Sender<WorkerEvent<T>>,
        diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    ) -> Self {
        Self {
            tag,
            pause_mode,
            paused: false,
            pending: HashMap::new(),
            commands,
            outbound,
            inbound: Some(inbound),
            context: Some(context),
            stats,
            events,
            diagnostics,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let hold = self.paused && self.pause_mode == PauseMode::HoldCompletions;
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!(worker = %self.tag, "all handles dropped");
                        self.shutdown();
                        return;
                    };
                    if let ControlFlow::Break(()) = self.handle_command(command) {
                        return;
                    }
                }
                message = self.outbound.recv(), if !hold => {
                    let Some(message) = message else {
                        warn!(worker = %self.tag, pending = self.pending.len(), "context exited unexpectedly");
                        self.shutdown();
                        return;
                    };
                    self.handle_message(message);
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command<T>) -> ControlFlow<()> {
        match command {
            Command::Dispatch {
                correlation_id,
                task,
                envelope,
                responder,
            } => return self.dispatch(correlation_id, task, envelope, responder),
            Command::Forget { correlation_id } => {
                if self.pending.remove(&correlation_id).is_some() {
                    self.publish(|stats| stats.timed_out += 1);
                }
            }
            Command::Pause { ack } => {
                if !self.paused {
                    self.paused = true;
                    self.publish(|stats| stats.state = WorkerState::Paused);
                    info!(worker = %self.tag, mode = ?self.pause_mode, "worker paused");
                }
                let _ = ack.send(());
            }
            Command::Resume { ack } => {
                if self.paused {
                    self.paused = false;
                    self.publish(|stats| stats.state = WorkerState::Running);
                    info!(worker = %self.tag, "worker resumed");
                }
                let _ = ack.send(());
            }
            Command::Kill { ack } => {
                self.shutdown();
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn dispatch(
        &mut self,
        correlation_id: String,
        task: T,
        envelope: Envelope,
        responder: Responder<T>,
    ) -> ControlFlow<()> {
        // The handle checked state before sending, but a pause may have
        // landed in between.
        if self.paused {
            let _ = responder.send(Err(WerkstattError::Paused(self.tag.clone())));
            return ControlFlow::Continue(());
        }
        if self.pending.contains_key(&correlation_id) {
            let _ = responder.send(Err(WerkstattError::DuplicateCorrelationId(correlation_id)));
            return ControlFlow::Continue(());
        }

        self.pending.insert(
            correlation_id.clone(),
            PendingRequest {
                responder,
                dispatched_at: Instant::now(),
            },
        );
        self.publish(|stats| stats.dispatched += 1);
        let _ = self.events.send(WorkerEvent::Accepted {
            worker: self.tag.clone(),
            correlation_id: correlation_id.clone(),
            task,
        });

        let sent = self
            .inbound
            .as_ref()
            .is_some_and(|inbound| inbound.send(envelope).is_ok());
        if !sent {
            warn!(worker = %self.tag, correlation_id = %correlation_id, "context endpoint closed");
            self.shutdown();
            return ControlFlow::Break(());
        }
        debug!(worker = %self.tag, correlation_id = %correlation_id, "request sent");
        ControlFlow::Continue(())
    }

    fn handle_message(&mut self, message: ContextMessage) {
        match message {
            ContextMessage::Reply(reply) => self.complete(reply),
            ContextMessage::Diagnostic(report) => {
                if let Some(sink) = &self.diagnostics {
                    sink.record(&self.tag, report.phase, &report.correlation_id, report.elapsed);
                }
            }
            ContextMessage::Ready(_) => {
                warn!(worker = %self.tag, "ignoring repeated handshake");
            }
        }
    }

    fn complete(&mut self, reply: Reply) {
        let Some(entry) = self.pending.remove(&reply.correlation_id) else {
            debug!(
                worker = %self.tag,
                correlation_id = %reply.correlation_id,
                "reply for unknown correlation id dropped"
            );
            return;
        };

        let correlation_id = reply.correlation_id.clone();
        let result = reply.into_result::<T>();
        let event_result = match &result {
            Ok(output) => Ok(output.clone()),
            Err(WerkstattError::Execution { message, .. }) => Err(message.clone()),
            Err(e) => Err(e.to_string()),
        };
        let succeeded = result.is_ok();
        let elapsed_ms = entry.dispatched_at.elapsed().as_millis() as u64;

        // The caller left; its Forget may still be queued behind this reply.
        if entry.responder.send(result).is_err() {
            debug!(
                worker = %self.tag,
                correlation_id = %correlation_id,
                "reply for abandoned request dropped"
            );
            self.publish(|stats| stats.timed_out += 1);
            return;
        }

        debug!(
            worker = %self.tag,
            correlation_id = %correlation_id,
            ok = succeeded,
            elapsed_ms,
            "request completed"
        );
        self.publish(|stats| {
            if succeeded {
                stats.completed += 1;
            } else {
                stats.failed += 1;
            }
        });
        let _ = self.events.send(WorkerEvent::Completed {
            worker: self.tag.clone(),
            correlation_id,
            result: event_result,
        });
    }

    /// Tear down the context and resolve everything still pending.
    fn shutdown(&mut self) {
        // Dropping the endpoint lets thread contexts wind down on their own.
        self.inbound = None;
        if let Some(context) = self.context.take() {
            context.terminate();
        }

        let cancelled = self.pending.len();
        for (_, entry) in self.pending.drain() {
            let _ = entry
                .responder
                .send(Err(WerkstattError::WorkerKilled(self.tag.clone())));
        }
        self.paused = false;
        self.publish(|stats| {
            stats.cancelled += cancelled as u64;
            stats.state = WorkerState::Killed;
        });
        info!(worker = %self.tag, cancelled, "worker killed");
    }

    /// Apply `change` to the published stats, keeping `pending` in sync.
    fn publish(&self, change: impl FnOnce(&mut WorkerStats)) {
        let pending = self.pending.len();
        self.stats.send_modify(|stats| {
            change(stats);
            stats.pending = pending;
        });
    }
}
