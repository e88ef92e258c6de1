//! Worker subprocess: process lifecycle (from the gateway's side) and the
//! command loop (run inside the worker process itself) (SPEC_FULL.md §4.2).

pub mod process;
pub mod runtime;

pub use process::WorkerProcess;
