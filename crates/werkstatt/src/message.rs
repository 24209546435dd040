use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::diagnostics::Phase;
use crate::error::WerkstattError;
use crate::task::Task;

/// Request envelope shipped into an isolated context.
///
/// The task travels as MessagePack bytes so nothing but owned data crosses
/// the isolation boundary. `correlation_id` is duplicated outside the payload
/// so the context can answer even when the payload fails to decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation ID pairing this request with its reply.
    pub correlation_id: String,

    /// MessagePack-encoded task.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    /// Whether the context should report started/completed diagnostics.
    pub diagnostics: bool,

    /// When this envelope was created.
    pub timestamp: DateTime<Utc>,

    /// Schema version for forward-compatible evolution.
    #[serde(default = "default_version")]
    pub version: u16,
}

/// Default version for envelopes that omit the field.
fn default_version() -> u16 {
    1
}

impl Envelope {
    /// Serialize a task into a request envelope.
    pub fn for_task<T: Task>(
        correlation_id: impl Into<String>,
        task: &T,
        diagnostics: bool,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            correlation_id: correlation_id.into(),
            payload: rmp_serde::to_vec(task)?,
            diagnostics,
            timestamp: Utc::now(),
            version: 1,
        })
    }

    /// Decode the payload back into the concrete task type.
    pub fn decode<T: Task>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.payload)
    }
}

/// How a request ended inside the context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome {
    /// MessagePack-encoded `Task::Output`.
    Success(#[serde(with = "serde_bytes")] Vec<u8>),
    /// The task failed (returned an error, panicked, or could not be decoded).
    Failure(String),
}

/// Reply envelope sent back out of an isolated context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub correlation_id: String,
    pub outcome: Outcome,
}

impl Reply {
    pub fn success<O: Serialize>(
        correlation_id: impl Into<String>,
        output: &O,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            correlation_id: correlation_id.into(),
            outcome: Outcome::Success(rmp_serde::to_vec(output)?),
        })
    }

    pub fn failure(correlation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            outcome: Outcome::Failure(message.into()),
        }
    }

    /// Decode the outcome into the caller-facing result.
    pub fn into_result<T: Task>(self) -> Result<T::Output, WerkstattError> {
        match self.outcome {
            Outcome::Success(bytes) => Ok(rmp_serde::from_slice(&bytes)?),
            Outcome::Failure(message) => Err(WerkstattError::Execution {
                correlation_id: self.correlation_id,
                message,
            }),
        }
    }
}

/// Diagnostic report produced by the context when the envelope asked for one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub phase: Phase,
    pub correlation_id: String,
    pub elapsed: Option<Duration>,
}

/// Everything an isolated context can say to its owning worker.
///
/// The first message on a fresh channel is always [`ContextMessage::Ready`],
/// handing over the endpoint the worker uses to send requests in.
#[derive(Debug)]
pub enum ContextMessage {
    Ready(mpsc::UnboundedSender<Envelope>),
    Reply(Reply),
    Diagnostic(DiagnosticReport),
}

/// Helper module for serde to handle `Vec<u8>` as raw bytes in MessagePack.
mod serde_bytes {
    use std::fmt;

    use serde::de::{SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        d.deserialize_byte_buf(BytesVisitor)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte array")
        }

        fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        // Older encoders write byte arrays as plain sequences.
        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element::<u8>()? {
                out.push(b);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Computation, Job};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Computation for Echo {
        type Input = String;
        type Output = String;

        async fn compute(input: &String) -> anyhow::Result<String> {
            Ok(input.clone())
        }
    }

    #[test]
    fn envelope_carries_the_encoded_task() {
        let job = Job::<Echo>::new("hello".into()).with_correlation("c-1");
        let env = Envelope::for_task("c-1", &job, true).unwrap();
        assert_eq!(env.correlation_id, "c-1");
        assert!(env.diagnostics);
        assert_eq!(env.version, 1);

        let decoded: Job<Echo> = env.decode().unwrap();
        assert_eq!(decoded.input(), "hello");
    }

    #[test]
    fn envelope_survives_msgpack_transport() {
        let job = Job::<Echo>::new("payload".into());
        let env = Envelope::for_task("c-2", &job, false).unwrap();
        let bytes = rmp_serde::to_vec(&env).unwrap();
        let back: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back.correlation_id, "c-2");
        assert_eq!(back.payload, env.payload);
    }

    #[test]
    fn failed_reply_becomes_execution_error() {
        let reply = Reply::failure("c-3", "boom");
        match reply.into_result::<Job<Echo>>() {
            Err(WerkstattError::Execution {
                correlation_id,
                message,
            }) => {
                assert_eq!(correlation_id, "c-3");
                assert_eq!(message, "boom");
            }
            other => panic!("expected Execution error, got: {other:?}"),
        }
    }

    #[test]
    fn successful_reply_decodes_output() {
        let reply = Reply::success("c-4", &"done".to_string()).unwrap();
        let out = reply.into_result::<Job<Echo>>().unwrap();
        assert_eq!(out, "done");
    }
}
