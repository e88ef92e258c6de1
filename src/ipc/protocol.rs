//! Wire protocol between the gateway and a worker subprocess.
//!
//! One JSON object per line over the worker's stdin/stdout. Every request
//! carries an opaque id; every response carries the id of the request it
//! answers. See SPEC_FULL.md §4.1 for the response-cardinality rules per
//! command (exactly one RESULT/ERROR, or a CHUNK* DONE/ERROR stream).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of commands a gateway can send to a worker.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandTag {
    Load,
    Generate,
    GenerateStream,
    Tokenize,
    Status,
    Heartbeat,
    Shutdown,
}

/// The closed set of response kinds a worker can send back.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseKind {
    Result,
    Chunk,
    Done,
    Error,
}

/// A request sent from the gateway (Proxy) to a worker, answered by one or
/// more [`WorkerResponse`]s carrying the same `id`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerRequest {
    pub id: String,
    pub command: CommandTag,
    #[serde(default)]
    pub payload: Value,
}

impl WorkerRequest {
    pub fn new(id: impl Into<String>, command: CommandTag, payload: Value) -> Self {
        Self {
            id: id.into(),
            command,
            payload,
        }
    }
}

/// A response sent from a worker back to the gateway.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    #[serde(default)]
    pub payload: Value,
}

impl WorkerResponse {
    pub fn result(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: ResponseKind::Result,
            payload,
        }
    }

    pub fn chunk(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: ResponseKind::Chunk,
            payload,
        }
    }

    pub fn done(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: ResponseKind::Done,
            payload,
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ResponseKind::Error,
            payload: serde_json::json!({ "error": message.into() }),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }
}

/// The StopFlag (SPEC_FULL.md §4.4/§5): a gateway-to-worker signal that is
/// deliberately *not* a [`CommandTag`] — the spec fixes the command set at
/// exactly seven tags, and the StopFlag is explicitly the one channel
/// allowed outside request/response correlation. The Python original
/// realizes it with a `multiprocessing.Event` (real shared memory); over a
/// pipe-only transport the nearest equivalent is a one-line control message
/// the worker's stdin-reader thread can observe without waiting for the
/// in-progress `GENERATE_STREAM` handler to yield (see `worker::runtime`).
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct StopSignal {
    pub stop: bool,
}

/// Either shape of line a worker can read from stdin.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum IncomingLine {
    Request(WorkerRequest),
    Stop(StopSignal),
}
