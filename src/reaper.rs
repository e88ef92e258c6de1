//! Idle reaper (SPEC_FULL.md §4.5).
//!
//! Grounded in `original_source/tasks.py::monitor_idle_models`: a loop that
//! sleeps `check_interval` seconds, calls `unload_idle_models(idle_timeout)`,
//! and swallows any error so one failed check never stops the next one.
//! The Python original runs this as a daemon `threading.Thread`; here it is
//! a `tokio::spawn`ed task driven by `tokio::time::interval`.

use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::supervisor::Supervisor;

/// Spawn the periodic idle-eviction task. Returns its `JoinHandle` so
/// callers can abort it on shutdown.
pub fn spawn(supervisor: Arc<Supervisor>, check_interval: Duration, idle_timeout: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        // The first tick fires immediately; skip it so the reaper's first
        // real check happens one interval after startup, not at t=0 before
        // any model could plausibly be idle.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = supervisor.unload_idle_models(idle_timeout).await;
            for model_name in evicted {
                info!("idle reaper unloaded '{model_name}'");
            }
        }
    })
}

/// One-shot check, exposed for tests that don't want to wait out a real
/// interval.
pub async fn check_once(supervisor: &Supervisor, idle_timeout: Duration) {
    let evicted = supervisor.unload_idle_models(idle_timeout).await;
    if evicted.is_empty() {
        return;
    }
    for model_name in evicted {
        info!("idle reaper unloaded '{model_name}'");
    }
}
