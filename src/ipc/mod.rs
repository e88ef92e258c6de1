//! IPC framing (SPEC_FULL.md §4.1): typed request/response records over a
//! bidirectional, ordered, message-oriented channel between gateway and
//! worker, plus the line-delimited transport that carries them.

pub mod protocol;
pub mod transport;

pub use protocol::{CommandTag, IncomingLine, ResponseKind, StopSignal, WorkerRequest, WorkerResponse};
