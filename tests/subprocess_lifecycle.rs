//! Drives a real `llama-gateway --worker` subprocess through
//! [`Supervisor::get_model`] (SPEC_FULL.md §4.2-§4.4 end to end), rather than
//! the in-process command loop the other integration tests exercise.
//!
//! Built against the worker binary's `mock` feature
//! (`cargo test --features mock --test subprocess_lifecycle`) so these
//! scenarios don't depend on a real GGUF model or GPU: the subprocess still
//! forks, frames IPC over real pipes, and gets killed for real, only the
//! inference backend inside it is [`llama_gateway_core::engine::MockLlamaEngine`].

#![cfg(feature = "mock")]

use std::collections::HashMap;
use std::path::PathBuf;

use llama_gateway_core::config::{GatewayConfig, ModelManagerConfig};
use llama_gateway_core::Supervisor;

fn worker_exe() -> &'static str {
    env!("CARGO_BIN_EXE_llama-gateway")
}

fn config(models_directory: PathBuf) -> GatewayConfig {
    GatewayConfig {
        model_manager: ModelManagerConfig {
            models_directory,
            default_model: None,
            n_ctx: 2048,
            n_gpu_layers: 0,
            n_threads: 2,
            check_interval: 30,
            idle_timeout: 600,
        },
        model_settings: HashMap::new(),
    }
}

/// Switching the active model shuts the old subprocess down before the new
/// one is spawned (SPEC_FULL.md §4.4 "Resolve model_name ... switching the
/// subprocess as needed"), never running two workers at once.
#[tokio::test]
async fn switching_models_shuts_down_the_old_worker_before_spawning_the_new_one() {
    std::env::set_var("LLAMA_GATEWAY_WORKER_EXE", worker_exe());

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.gguf"), b"").unwrap();
    std::fs::write(dir.path().join("b.gguf"), b"").unwrap();
    let supervisor = Supervisor::new(config(dir.path().to_path_buf()), PathBuf::from("unused-config.json")).unwrap();

    let proxy_a = supervisor.get_model(Some("a")).await.unwrap();
    assert!(proxy_a.is_alive().await);

    let proxy_b = supervisor.get_model(Some("b")).await.unwrap();
    assert!(proxy_b.is_alive().await);

    // The old proxy's subprocess was torn down as part of the switch, not
    // left running alongside the new one.
    assert!(!proxy_a.is_alive().await);

    supervisor.unload_all_models().await;
}

/// Requesting the same already-active model again reuses the running
/// subprocess instead of restarting it.
#[tokio::test]
async fn requesting_the_active_model_again_reuses_the_running_worker() {
    std::env::set_var("LLAMA_GATEWAY_WORKER_EXE", worker_exe());

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.gguf"), b"").unwrap();
    let supervisor = Supervisor::new(config(dir.path().to_path_buf()), PathBuf::from("unused-config.json")).unwrap();

    let first = supervisor.get_model(Some("a")).await.unwrap();
    let second = supervisor.get_model(Some("a")).await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    supervisor.unload_all_models().await;
}

/// If the worker subprocess is killed out from under the proxy, the proxy
/// reports it dead rather than hanging, and the supervisor can recover by
/// spawning a fresh one on the next request (SPEC_FULL.md §8 crash recovery,
/// §4.2 "crash detection").
#[cfg(unix)]
#[tokio::test]
async fn a_killed_worker_is_detected_dead_and_the_supervisor_recovers() {
    std::env::set_var("LLAMA_GATEWAY_WORKER_EXE", worker_exe());

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.gguf"), b"").unwrap();
    let supervisor = Supervisor::new(config(dir.path().to_path_buf()), PathBuf::from("unused-config.json")).unwrap();

    let proxy = supervisor.get_model(Some("a")).await.unwrap();
    assert!(proxy.is_alive().await);

    let tokenize_before_kill = proxy.tokenize("still alive", true).await;
    assert!(tokenize_before_kill.is_ok());

    // Kill the real process out from under the proxy, bypassing the
    // escalating-shutdown path entirely.
    let pid = proxy.worker_pid().await.expect("worker running");
    // SAFETY: `pid` belongs to the worker subprocess spawned above, which is
    // still alive (checked via `is_alive` just before this); SIGKILL on a
    // pid we own is a documented signal send, no dereference.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }

    // Give the OS a moment to reap the process before the next check.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!proxy.is_alive().await, "is_alive must notice the process is gone");

    // The supervisor's active slot still points at the dead proxy until the
    // next `get_model` call; asking for the same model again must detect
    // that it's no longer alive and spawn a fresh worker rather than
    // handing back the dead one.
    let recovered = supervisor.get_model(Some("a")).await.unwrap();
    assert!(recovered.is_alive().await);
    assert!(!std::sync::Arc::ptr_eq(&proxy, &recovered));

    supervisor.unload_all_models().await;
}
