//! The contract every unit of offloaded work satisfies.
//!
//! A [`Task`] is plain data plus an `execute` method. The engine never calls
//! `execute` on the caller's side: the task is serialized, shipped across the
//! isolation boundary, decoded again inside the worker's context and executed
//! there. That is why every task must round-trip through serde.
//!
//! Job types that carry nothing but an input can use [`Job`] with a
//! [`Computation`] instead of implementing [`Task`] by hand.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A unit of work that can be offloaded to a worker.
#[async_trait]
pub trait Task: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// Payload the task operates on.
    type Input: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync;

    /// Value produced by [`Task::execute`].
    type Output: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static;

    /// Correlation id pre-assigned by the caller, if any.
    fn correlation_id(&self) -> Option<&str>;

    /// Stamp the id the engine settled on. Called once, before dispatch.
    fn set_correlation_id(&mut self, id: String);

    fn input(&self) -> &Self::Input;

    /// Run the computation. Only ever invoked inside an isolated context.
    async fn execute(&self) -> anyhow::Result<Self::Output>;
}

/// Behavior half of a [`Job`]: how to turn an input into an output.
#[async_trait]
pub trait Computation: Send + Sync + 'static {
    type Input: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync;
    type Output: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static;

    async fn compute(input: &Self::Input) -> anyhow::Result<Self::Output>;
}

/// Generic task carrying an input for computation `C`.
#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "C::Input: Serialize",
    deserialize = "C::Input: DeserializeOwned"
))]
pub struct Job<C: Computation> {
    correlation_id: Option<String>,
    input: C::Input,
    #[serde(skip)]
    computation: PhantomData<fn() -> C>,
}

impl<C: Computation> Job<C> {
    pub fn new(input: C::Input) -> Self {
        Self {
            correlation_id: None,
            input,
            computation: PhantomData,
        }
    }

    /// Pre-assign the correlation id instead of letting the engine pick one.
    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

impl<C: Computation> Clone for Job<C> {
    fn clone(&self) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            input: self.input.clone(),
            computation: PhantomData,
        }
    }
}

impl<C: Computation> fmt::Debug for Job<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("correlation_id", &self.correlation_id)
            .field("input", &self.input)
            .finish()
    }
}

#[async_trait]
impl<C: Computation> Task for Job<C> {
    type Input = C::Input;
    type Output = C::Output;

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    fn set_correlation_id(&mut self, id: String) {
        self.correlation_id = Some(id);
    }

    fn input(&self) -> &Self::Input {
        &self.input
    }

    async fn execute(&self) -> anyhow::Result<Self::Output> {
        C::compute(&self.input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Double;

    #[async_trait]
    impl Computation for Double {
        type Input = u32;
        type Output = u32;

        async fn compute(input: &u32) -> anyhow::Result<u32> {
            Ok(input * 2)
        }
    }

    #[tokio::test]
    async fn job_executes_its_computation() {
        let job = Job::<Double>::new(21);
        assert_eq!(*job.input(), 21);
        assert_eq!(job.execute().await.unwrap(), 42);
    }

    #[test]
    fn job_keeps_correlation_across_the_wire() {
        let job = Job::<Double>::new(7).with_correlation("req-1");
        let bytes = rmp_serde::to_vec(&job).unwrap();
        let decoded: Job<Double> = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.correlation_id(), Some("req-1"));
        assert_eq!(*decoded.input(), 7);
    }

    #[test]
    fn set_correlation_id_overwrites_missing_id() {
        let mut job = Job::<Double>::new(1);
        assert!(job.correlation_id().is_none());
        job.set_correlation_id("assigned".into());
        assert_eq!(job.correlation_id(), Some("assigned"));
    }
}
