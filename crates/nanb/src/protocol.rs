//! Messages exchanged between the session and the kernel process.
//!
//! Every message is serialized as JSON and sent in a length-prefixed frame
//! (see `connection.rs`). The first frame on a connection is a [`Hello`]
//! from the client, answered by [`KernelMessage::Ready`].
//!
//! Interrupts are not part of this protocol: they travel as SIGINT to the
//! kernel process so they reach it even while it is busy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Bumped whenever a message changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Correlates one `Execute` with its output and its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Which stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
    /// Value of the trailing expression of a cell.
    Result,
    /// Traceback of a failed run.
    Error,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
            Stream::Result => write!(f, "result"),
            Stream::Error => write!(f, "error"),
        }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
    Interrupted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Ok => write!(f, "ok"),
            RunStatus::Error => write!(f, "error"),
            RunStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// First frame on every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    /// Identifies the owning session in kernel logs.
    pub session_id: String,
}

impl Hello {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            session_id: session_id.into(),
        }
    }
}

/// Messages the session sends to the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Evaluate `source` in the interpreter's persistent global scope.
    Execute {
        run_id: RunId,
        cell_id: usize,
        source: String,
    },

    Heartbeat,

    /// Ask the kernel to exit after acknowledging with `ShuttingDown`.
    Shutdown,
}

/// Messages the kernel sends to the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelMessage {
    /// Handshake accepted; the interpreter is up.
    Ready {
        pid: u32,
        protocol_version: u32,
        started_at: DateTime<Utc>,
        interpreter: String,
    },

    /// The kernel accepted an `Execute` and handed it to the interpreter.
    ExecutionStarted { run_id: RunId },

    /// Output produced by a run, forwarded as soon as it is written.
    OutputChunk {
        run_id: RunId,
        stream: Stream,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Last message of a run.
    ExecutionResult {
        run_id: RunId,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_detail: Option<String>,
    },

    Heartbeat,

    /// Acknowledgement of `Shutdown`.
    ShuttingDown,

    /// The kernel rejected the connection or a request.
    Error { message: String },
}

impl KernelMessage {
    /// Run this message belongs to, if any.
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            KernelMessage::ExecutionStarted { run_id }
            | KernelMessage::OutputChunk { run_id, .. }
            | KernelMessage::ExecutionResult { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }
}

pub(crate) mod base64_bytes {
    use super::*;
    use base64::prelude::*;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
