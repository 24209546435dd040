//! Pools of tagged workers.
//!
//! A [`WorkerPool`] owns an ordered list of [`WorkerUnit`]s and routes tasks
//! to them either round-robin or by tag. All membership changes and routing
//! decisions go through one async mutex; the request itself is awaited after
//! the lock is released, so a slow task never blocks the pool. Worker
//! startup also runs outside that mutex: a second lock serializes only the
//! calls that start workers, which keeps auto-chosen tags unique.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;
use crate::error::WerkstattError;
use crate::events::{PoolEvent, WorkerEvent};
use crate::metrics::PoolStats;
use crate::task::Task;
use crate::worker::{WorkerBuilder, WorkerOptions, WorkerState, WorkerUnit};

struct Member<T: Task> {
    unit: WorkerUnit<T>,
    forwarding: bool,
}

struct PoolInner<T: Task> {
    members: Vec<Member<T>>,
    cursor: usize,
}

impl<T: Task> PoolInner<T> {
    fn position(&self, tag: &str) -> Option<usize> {
        self.members.iter().position(|m| m.unit.tag() == tag)
    }

    fn find(&self, tag: &str) -> Result<&WorkerUnit<T>, WerkstattError> {
        self.members
            .iter()
            .map(|m| &m.unit)
            .find(|unit| unit.tag() == tag)
            .ok_or_else(|| WerkstattError::UnknownTag(tag.to_string()))
    }

    /// Next tag of the form `worker_<n>` not currently in use.
    fn auto_tag(&self) -> String {
        let mut n = self.members.len() + 1;
        loop {
            let tag = format!("worker_{n}");
            if self.position(&tag).is_none() {
                return tag;
            }
            n += 1;
        }
    }

    fn remove_at(&mut self, index: usize) -> WorkerUnit<T> {
        let member = self.members.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.members.len() {
            self.cursor = 0;
        }
        member.unit
    }
}

struct PoolShared<T: Task> {
    inner: Mutex<PoolInner<T>>,
    /// Held across `start` and `add_worker`; only these insert or start members.
    adding: Mutex<()>,
    template: WorkerBuilder,
    events: broadcast::Sender<PoolEvent>,
    worker_events: broadcast::Sender<WorkerEvent<T>>,
}

/// An ordered, tag-addressable set of workers.
///
/// Cloning is cheap; all clones share the same members.
pub struct WorkerPool<T: Task> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Task> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Task> fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("template", &self.shared.template)
            .finish_non_exhaustive()
    }
}

impl<T: Task> WorkerPool<T> {
    /// Build an unstarted pool from configuration.
    pub fn from_config(config: &PoolConfig) -> Result<Self, WerkstattError> {
        let template = WorkerBuilder::new("")
            .isolation(config.isolation)
            .options(WorkerOptions {
                pause_mode: config.pause_mode,
                default_timeout: config.default_timeout(),
                startup_timeout: config.startup_timeout(),
                event_capacity: config.event_capacity,
            });
        let template = if config.diagnostics {
            template.diagnostics(Arc::new(crate::diagnostics::TracingDiagnostics))
        } else {
            template
        };
        PoolBuilder::new()
            .tags(config.initial_tags())
            .worker(template)
            .build()
    }

    /// Start every member that has not been started yet.
    ///
    /// Stops at the first failure; members started before it keep running.
    #[instrument(skip_all)]
    pub async fn start(&self) -> Result<(), WerkstattError> {
        let _adding = self.shared.adding.lock().await;
        let units: Vec<WorkerUnit<T>> = {
            let mut inner = self.shared.inner.lock().await;
            inner
                .members
                .iter_mut()
                .map(|member| {
                    if !member.forwarding {
                        self.forward(&member.unit);
                        member.forwarding = true;
                    }
                    member.unit.clone()
                })
                .collect()
        };
        for unit in &units {
            // Removed since the snapshot.
            if unit.state() == WorkerState::Killed {
                continue;
            }
            unit.start().await?;
        }
        info!(workers = units.len(), "pool started");
        Ok(())
    }

    /// Dispatch to the next available worker in rotation.
    pub async fn dispatch(&self, task: T) -> Result<T::Output, WerkstattError> {
        let unit = self.next_available().await?;
        unit.dispatch(task).await
    }

    pub async fn dispatch_with_timeout(
        &self,
        task: T,
        timeout: Duration,
    ) -> Result<T::Output, WerkstattError> {
        let unit = self.next_available().await?;
        unit.dispatch_with_timeout(task, timeout).await
    }

    /// Dispatch to the worker tagged `tag`.
    pub async fn dispatch_to_tag(&self, tag: &str, task: T) -> Result<T::Output, WerkstattError> {
        let unit = self.addressed(tag).await?;
        unit.dispatch(task).await
    }

    pub async fn dispatch_to_tag_with_timeout(
        &self,
        tag: &str,
        task: T,
        timeout: Duration,
    ) -> Result<T::Output, WerkstattError> {
        let unit = self.addressed(tag).await?;
        unit.dispatch_with_timeout(task, timeout).await
    }

    /// Round-robin pick. Every examined candidate consumes a turn, so a
    /// paused worker keeps its slot in the rotation.
    async fn next_available(&self) -> Result<WorkerUnit<T>, WerkstattError> {
        let mut inner = self.shared.inner.lock().await;
        let len = inner.members.len();
        if len == 0 {
            return Err(WerkstattError::NoWorkers);
        }
        for _ in 0..len {
            let index = inner.cursor % len;
            inner.cursor = (index + 1) % len;
            let unit = &inner.members[index].unit;
            if !matches!(unit.state(), WorkerState::Paused | WorkerState::Killed) {
                return Ok(unit.clone());
            }
            debug!(worker = %unit.tag(), "skipping unavailable worker");
        }
        Err(WerkstattError::NoAvailableWorker)
    }

    async fn addressed(&self, tag: &str) -> Result<WorkerUnit<T>, WerkstattError> {
        let inner = self.shared.inner.lock().await;
        let unit = inner.find(tag)?;
        if unit.is_paused() {
            return Err(WerkstattError::Paused(tag.to_string()));
        }
        Ok(unit.clone())
    }

    /// Start a new worker and append it to the rotation.
    ///
    /// Without a tag the worker is named `worker_<n>`, `n` being one past
    /// the current member count (bumped while taken). Returns the tag used.
    #[instrument(skip(self))]
    pub async fn add_worker(&self, tag: Option<&str>) -> Result<String, WerkstattError> {
        let _adding = self.shared.adding.lock().await;
        let tag = {
            let inner = self.shared.inner.lock().await;
            match tag {
                Some(tag) if inner.position(tag).is_some() => {
                    return Err(WerkstattError::DuplicateTag(tag.to_string()))
                }
                Some(tag) => tag.to_string(),
                None => inner.auto_tag(),
            }
        };

        // Routing keeps going while the handshake runs.
        let unit: WorkerUnit<T> = self.shared.template.clone().tag(tag.clone()).build();
        self.forward(&unit);
        unit.start().await?;

        let mut inner = self.shared.inner.lock().await;
        if inner.members.is_empty() {
            inner.cursor = 0;
        }
        inner.members.push(Member {
            unit,
            forwarding: true,
        });
        drop(inner);

        info!(worker = %tag, "worker added");
        let _ = self.shared.events.send(PoolEvent::Added(tag.clone()));
        Ok(tag)
    }

    /// Kill and remove the worker tagged `tag`.
    pub async fn remove_by_tag(&self, tag: &str) -> Result<(), WerkstattError> {
        let mut inner = self.shared.inner.lock().await;
        let index = inner
            .position(tag)
            .ok_or_else(|| WerkstattError::UnknownTag(tag.to_string()))?;
        let unit = inner.remove_at(index);
        unit.kill().await;
        drop(inner);

        info!(worker = %tag, "worker removed");
        let _ = self.shared.events.send(PoolEvent::Removed(tag.to_string()));
        Ok(())
    }

    /// Kill and remove every listed worker. Unknown tags are skipped;
    /// returns the tags actually removed.
    pub async fn remove_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> Vec<String> {
        let mut inner = self.shared.inner.lock().await;
        let mut removed = Vec::new();
        for tag in tags {
            let tag = tag.as_ref();
            let Some(index) = inner.position(tag) else {
                debug!(worker = %tag, "not a member, skipping");
                continue;
            };
            inner.remove_at(index).kill().await;
            removed.push(tag.to_string());
        }
        drop(inner);

        for tag in &removed {
            let _ = self.shared.events.send(PoolEvent::Removed(tag.clone()));
        }
        info!(count = removed.len(), "workers removed");
        removed
    }

    /// Kill and remove every worker; returns their tags in member order.
    pub async fn remove_all(&self) -> Vec<String> {
        let mut inner = self.shared.inner.lock().await;
        let members: Vec<_> = inner.members.drain(..).collect();
        inner.cursor = 0;

        let mut removed = Vec::with_capacity(members.len());
        for member in members {
            member.unit.kill().await;
            removed.push(member.unit.tag().to_string());
        }
        drop(inner);

        for tag in &removed {
            let _ = self.shared.events.send(PoolEvent::Removed(tag.clone()));
        }
        info!(count = removed.len(), "all workers removed");
        removed
    }

    pub async fn pause_by_tag(&self, tag: &str) -> Result<(), WerkstattError> {
        let inner = self.shared.inner.lock().await;
        let unit = inner.find(tag)?;
        if Self::pause_unit(unit).await? {
            let _ = self.shared.events.send(PoolEvent::Paused(tag.to_string()));
        }
        Ok(())
    }

    pub async fn resume_by_tag(&self, tag: &str) -> Result<(), WerkstattError> {
        let inner = self.shared.inner.lock().await;
        let unit = inner.find(tag)?;
        if Self::resume_unit(unit).await? {
            let _ = self.shared.events.send(PoolEvent::Resumed(tag.to_string()));
        }
        Ok(())
    }

    pub async fn pause_all(&self) -> Result<(), WerkstattError> {
        let inner = self.shared.inner.lock().await;
        for member in &inner.members {
            if Self::pause_unit(&member.unit).await? {
                let _ = self
                    .shared
                    .events
                    .send(PoolEvent::Paused(member.unit.tag().to_string()));
            }
        }
        Ok(())
    }

    pub async fn resume_all(&self) -> Result<(), WerkstattError> {
        let inner = self.shared.inner.lock().await;
        for member in &inner.members {
            if Self::resume_unit(&member.unit).await? {
                let _ = self
                    .shared
                    .events
                    .send(PoolEvent::Resumed(member.unit.tag().to_string()));
            }
        }
        Ok(())
    }

    /// Pause `unit`; returns whether its state actually changed.
    async fn pause_unit(unit: &WorkerUnit<T>) -> Result<bool, WerkstattError> {
        let was = unit.state();
        unit.pause().await?;
        Ok(was == WorkerState::Running && unit.is_paused())
    }

    async fn resume_unit(unit: &WorkerUnit<T>) -> Result<bool, WerkstattError> {
        let was = unit.state();
        unit.resume().await?;
        Ok(was == WorkerState::Paused && unit.state() == WorkerState::Running)
    }

    /// Member tags in rotation order.
    pub async fn list_tags(&self) -> Vec<String> {
        let inner = self.shared.inner.lock().await;
        inner.members.iter().map(|m| m.unit.tag().to_string()).collect()
    }

    pub async fn len(&self) -> usize {
        self.shared.inner.lock().await.members.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.inner.lock().await.members.is_empty()
    }

    /// Handle to the member tagged `tag`, if any.
    pub async fn worker(&self, tag: &str) -> Option<WorkerUnit<T>> {
        let inner = self.shared.inner.lock().await;
        inner.find(tag).ok().cloned()
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock().await;
        PoolStats::from_workers(inner.members.iter().map(|m| m.unit.stats()).collect())
    }

    /// Membership and pause changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Request events from every member, including members added later.
    pub fn subscribe_workers(&self) -> broadcast::Receiver<WorkerEvent<T>> {
        self.shared.worker_events.subscribe()
    }

    /// Relay `unit`'s events into the aggregate feed until the worker is gone.
    fn forward(&self, unit: &WorkerUnit<T>) {
        let mut events = unit.subscribe();
        let aggregate = self.shared.worker_events.clone();
        let tag = unit.tag().to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let _ = aggregate.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(worker = %tag, skipped, "aggregate feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(worker = %tag, "event forwarder finished");
        });
    }
}

/// Builder for [`WorkerPool`].
///
/// Members come from explicit `tags`, or else `size` auto-named workers
/// (`worker_1..=worker_<size>`). Every member is built from the `worker`
/// template with its own tag.
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    size: usize,
    tags: Vec<String>,
    template: WorkerBuilder,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            size: 0,
            tags: Vec::new(),
            template: WorkerBuilder::new(""),
        }
    }
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Template every member is built from. Its tag is ignored.
    pub fn worker(mut self, template: WorkerBuilder) -> Self {
        self.template = template;
        self
    }

    /// Build an unstarted pool.
    pub fn build<T: Task>(self) -> Result<WorkerPool<T>, WerkstattError> {
        let tags = if self.tags.is_empty() {
            (1..=self.size).map(|n| format!("worker_{n}")).collect()
        } else {
            self.tags
        };

        let mut members: Vec<Member<T>> = Vec::with_capacity(tags.len());
        for tag in tags {
            if members.iter().any(|m| m.unit.tag() == tag) {
                return Err(WerkstattError::DuplicateTag(tag));
            }
            members.push(Member {
                unit: self.template.clone().tag(tag).build(),
                forwarding: false,
            });
        }

        let capacity = self.template.worker_options().event_capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        let (worker_events, _) = broadcast::channel(capacity);
        Ok(WorkerPool {
            shared: Arc::new(PoolShared {
                inner: Mutex::new(PoolInner { members, cursor: 0 }),
                adding: Mutex::new(()),
                template: self.template,
                events,
                worker_events,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Computation, Job};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Computation for Noop {
        type Input = ();
        type Output = ();

        async fn compute(_: &()) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn builder_names_workers_by_position() {
        let pool: WorkerPool<Job<Noop>> = PoolBuilder::new().size(3).build().unwrap();
        assert_eq!(pool.list_tags().await, vec!["worker_1", "worker_2", "worker_3"]);
    }

    #[tokio::test]
    async fn explicit_tags_win_over_size() {
        let pool: WorkerPool<Job<Noop>> = PoolBuilder::new()
            .size(5)
            .tags(["alpha", "beta"])
            .build()
            .unwrap();
        assert_eq!(pool.list_tags().await, vec!["alpha", "beta"]);
    }

    #[test]
    fn builder_rejects_duplicate_tags() {
        let result = PoolBuilder::new().tags(["a", "a"]).build::<Job<Noop>>();
        assert!(matches!(result, Err(WerkstattError::DuplicateTag(tag)) if tag == "a"));
    }

    #[test]
    fn auto_tag_skips_live_tags() {
        let mut inner = PoolInner::<Job<Noop>> {
            members: Vec::new(),
            cursor: 0,
        };
        assert_eq!(inner.auto_tag(), "worker_1");
        for tag in ["worker_2", "x"] {
            inner.members.push(Member {
                unit: WorkerBuilder::new(tag).build(),
                forwarding: false,
            });
        }
        // Two members: starts at worker_3.
        assert_eq!(inner.auto_tag(), "worker_3");
        inner.members.remove(1);
        // One member, but worker_2 is taken.
        assert_eq!(inner.auto_tag(), "worker_3");
    }

    #[test]
    fn removal_keeps_cursor_in_range() {
        let mut inner = PoolInner::<Job<Noop>> {
            members: ["a", "b", "c"]
                .into_iter()
                .map(|tag| Member {
                    unit: WorkerBuilder::new(tag).build(),
                    forwarding: false,
                })
                .collect(),
            cursor: 2,
        };
        inner.remove_at(0);
        assert_eq!(inner.cursor, 1);
        inner.remove_at(1);
        assert_eq!(inner.cursor, 0);
        inner.remove_at(0);
        assert_eq!(inner.cursor, 0);
        assert!(inner.members.is_empty());
    }
}
