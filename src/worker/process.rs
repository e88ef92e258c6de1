//! Worker subprocess lifecycle: spawn, stdio capture, escalating shutdown.
//!
//! Grounded in the teacher's `web::worker::process_manager::ProcessManager`
//! for the spawn/kill/restart shape, and in
//! `original_source/model_proxy.py::ModelProxy.shutdown` for the exact
//! escalating timeout sequence (SHUTDOWN message + 5s join, then
//! `terminate` + 2s join, then `kill` + 1s join) that the teacher's own
//! `kill()` collapses straight to `SIGKILL`.

use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc;

use crate::error::{GatewayError, Result};
use crate::ipc::transport::{spawn_line_reader, spawn_line_writer};
use crate::ipc::{CommandTag, WorkerRequest};

/// A spawned worker subprocess plus the line channels talking to it.
pub struct WorkerProcess {
    child: Child,
    writer: mpsc::UnboundedSender<String>,
    reader: Option<mpsc::UnboundedReceiver<String>>,
}

impl WorkerProcess {
    /// Spawn the current executable in `--worker` mode (SPEC_FULL.md §4.2),
    /// piping stdin/stdout for IPC and inheriting stderr for logs.
    ///
    /// The executable path can be overridden with `LLAMA_GATEWAY_WORKER_EXE`,
    /// since `std::env::current_exe()` resolves to the test harness binary
    /// rather than `llama-gateway` when this is exercised from an
    /// integration test.
    pub fn spawn(config_path: &std::path::Path) -> Result<Self> {
        let exe = match std::env::var_os("LLAMA_GATEWAY_WORKER_EXE") {
            Some(path) => path.into(),
            None => std::env::current_exe()
                .map_err(|e| GatewayError::LoadFailed(format!("cannot find own executable: {e}")))?,
        };

        info!(
            "spawning worker: {} --worker --config {}",
            exe.display(),
            config_path.display()
        );

        let mut child = Command::new(exe)
            .arg("--worker")
            .arg("--config")
            .arg(config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| GatewayError::LoadFailed(format!("failed to spawn worker: {e}")))?;

        let stdin: ChildStdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::LoadFailed("worker stdin not piped".into()))?;
        let stdout: ChildStdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::LoadFailed("worker stdout not piped".into()))?;

        let writer = spawn_line_writer(stdin);
        let reader = spawn_line_reader(stdout);

        Ok(Self {
            child,
            writer,
            reader: Some(reader),
        })
    }

    /// Line sender for outbound `WorkerRequest`/`StopSignal` frames.
    pub fn writer(&self) -> mpsc::UnboundedSender<String> {
        self.writer.clone()
    }

    /// OS process id of the spawned worker, for crash-recovery tests that
    /// need to kill it out from under the proxy.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Takes the line receiver. Callable once; the caller (Proxy) owns it
    /// for the process's lifetime afterward.
    pub fn take_reader(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.reader.take()
    }

    /// Non-blocking liveness check (SPEC_FULL.md §4.2 "crash detection").
    pub fn check_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("worker exited with status: {status}");
                false
            }
            Err(e) => {
                warn!("failed to check worker status: {e}");
                false
            }
        }
    }

    /// Escalating shutdown: SHUTDOWN message + 5s join, then SIGTERM + 2s
    /// join, then SIGKILL + 1s join. Idempotent — safe to call on an
    /// already-dead child.
    pub async fn shutdown(&mut self, request_id: impl Into<String>) {
        if !self.check_alive() {
            return;
        }

        let request =
            WorkerRequest::new(request_id, CommandTag::Shutdown, serde_json::Value::Null);
        if let Ok(line) = serde_json::to_string(&request) {
            let _ = self.writer.send(line);
        }

        if self.wait_with_timeout(Duration::from_secs(5)).await {
            return;
        }

        warn!("worker did not exit gracefully, sending SIGTERM");
        self.terminate();
        if self.wait_with_timeout(Duration::from_secs(2)).await {
            return;
        }

        warn!("worker did not terminate, sending SIGKILL");
        let _ = self.child.kill();
        let _ = self.wait_with_timeout(Duration::from_secs(1)).await;
    }

    #[cfg(not(windows))]
    fn terminate(&self) {
        // SAFETY: the pid belongs to the still-alive child we spawned above;
        // `kill(2)` with SIGTERM is a documented signal send, no dereference.
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }
    }

    #[cfg(windows)]
    fn terminate(&mut self) {
        let _ = self.child.kill();
    }

    async fn wait_with_timeout(&mut self, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        while tokio::time::Instant::now() < deadline {
            if !self.check_alive() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        !self.check_alive()
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.check_alive() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
