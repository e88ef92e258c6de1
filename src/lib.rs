//! Library surface of the gateway's model supervisor (SPEC_FULL.md §2).
//!
//! `main.rs` is a thin CLI wrapper; everything that matters — IPC framing,
//! worker process lifecycle, the worker command loop, the single-slot
//! supervisor, and the idle reaper — lives here so it can be exercised
//! directly from `#[tokio::test]`s without going through a subprocess.

pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod supervisor;
pub mod worker;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use proxy::Proxy;
pub use supervisor::Supervisor;
