//! Gateway-side proxy to one worker subprocess (SPEC_FULL.md §4.3).
//!
//! Grounded in `original_source/model_proxy.py::ModelProxy` for the exact
//! per-operation timeouts (LOAD 120s, GENERATE 300s, per-chunk 60s,
//! TOKENIZE 30s) and the `self.lock` held for the whole duration of
//! `generate`/`generate_stream`/`tokenize` while `stop_generation` stays
//! outside it; and in the teacher's `worker_bridge::WorkerBridge` for the
//! id-keyed pending-request map used to demultiplex responses arriving on
//! a single stdout stream.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::engine::FinishReason;
use crate::error::{GatewayError, Result};
use crate::ipc::{CommandTag, ResponseKind, StopSignal, WorkerRequest, WorkerResponse};
use crate::worker::WorkerProcess;

const LOAD_TIMEOUT: Duration = Duration::from_secs(120);
const GENERATE_TIMEOUT: Duration = Duration::from_secs(300);
const CHUNK_TIMEOUT: Duration = Duration::from_secs(60);
const TOKENIZE_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<WorkerResponse>>>>;

/// Token accounting returned alongside a completed generation
/// (SPEC_FULL.md §6 "usage").
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The result of a TOKENIZE call (SPEC_FULL.md §6).
#[derive(Debug, Clone)]
pub struct TokenizeResult {
    pub tokens: Vec<i32>,
    pub token_count: usize,
    pub n_ctx: u32,
}

/// A token chunk or the terminal outcome of a GENERATE_STREAM call.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(String),
    Done { finish_reason: FinishReason, usage: Usage },
}

/// One subprocess and the channel plumbing around it. Not `Clone`; shared
/// via `Arc` by callers that need to reach the same proxy concurrently.
pub struct Proxy {
    pub model_name: String,
    model_path: PathBuf,
    process: Mutex<Option<WorkerProcess>>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: PendingMap,
    /// Held for the entire duration of generate/generate_stream/tokenize
    /// (SPEC_FULL.md §4.3) — deliberately NOT used by `stop_generation`.
    /// `Arc`-wrapped so `generate_stream` can move an owned guard into its
    /// background forwarding task, keeping the lock held past this
    /// function's own `await` point for the whole stream's lifetime.
    op_lock: Arc<Mutex<()>>,
    last_used: Mutex<Instant>,
}

impl Proxy {
    pub fn new(model_name: String, model_path: PathBuf) -> Self {
        Self {
            model_name,
            model_path,
            process: Mutex::new(None),
            writer: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            op_lock: Arc::new(Mutex::new(())),
            last_used: Mutex::new(Instant::now()),
        }
    }

    /// Start the subprocess and send LOAD, waiting up to 120s for a reply.
    pub async fn start(&self, config: &GatewayConfig, config_path: &std::path::Path) -> Result<()> {
        if self.is_alive().await {
            return Ok(());
        }

        info!("starting subprocess for model: {}", self.model_name);
        let mut worker = WorkerProcess::spawn(config_path)?;
        let reader = worker
            .take_reader()
            .expect("reader taken exactly once, right after spawn");
        let writer = worker.writer();

        spawn_dispatch_loop(reader, Arc::clone(&self.pending));

        *self.writer.lock().await = Some(writer);
        *self.process.lock().await = Some(worker);

        let params = config.effective_load_params(&self.model_name);
        let payload = json!({
            "model_path": self.model_path.to_string_lossy(),
            "n_ctx": params.n_ctx,
            "n_gpu_layers": params.n_gpu_layers,
            "n_threads": params.n_threads,
            "offload_kqv": params.offload_kqv,
            "override_tensor": params.override_tensor,
        });

        let response = self
            .send_request_single(CommandTag::Load, payload, LOAD_TIMEOUT, "model load")
            .await;

        match response {
            Ok(r) if r.kind == ResponseKind::Error => {
                let message = r.error_message().unwrap_or("unknown error").to_string();
                self.shutdown().await;
                Err(GatewayError::LoadFailed(message))
            }
            Ok(_) => {
                *self.last_used.lock().await = Instant::now();
                Ok(())
            }
            Err(e) => {
                self.shutdown().await;
                Err(e)
            }
        }
    }

    pub async fn is_alive(&self) -> bool {
        match self.process.lock().await.as_mut() {
            Some(process) => process.check_alive(),
            None => false,
        }
    }

    pub async fn last_used(&self) -> Instant {
        *self.last_used.lock().await
    }

    /// OS process id of the running worker, if any. Test-only hook for
    /// simulating a crash by killing the process out from under the proxy.
    pub async fn worker_pid(&self) -> Option<u32> {
        self.process.lock().await.as_ref().map(WorkerProcess::pid)
    }

    /// Non-streaming generation. Holds `op_lock` for the whole call.
    pub async fn generate(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<(String, FinishReason, Usage)> {
        let _guard = self.op_lock.lock().await;
        if !self.is_alive().await {
            return Err(GatewayError::WorkerNotRunning);
        }
        *self.last_used.lock().await = Instant::now();

        let payload = json!({"prompt": prompt, "temperature": temperature, "max_tokens": max_tokens});
        let response = self
            .send_request_single(CommandTag::Generate, payload, GENERATE_TIMEOUT, "generation")
            .await?;

        if response.kind == ResponseKind::Error {
            return Err(GatewayError::GenerationError(
                response.error_message().unwrap_or("unknown error").to_string(),
            ));
        }

        let text = response.payload.get("text").and_then(Value::as_str).unwrap_or("").to_string();
        let usage = parse_usage(response.payload.get("usage"));
        let finish_reason = parse_finish_reason(response.payload.get("finish_reason"));
        Ok((text, finish_reason, usage))
    }

    /// Streaming generation. Holds `op_lock` for the whole call; the
    /// returned channel is exhausted when a DONE/ERROR frame arrives or a
    /// per-chunk 60s timeout elapses.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<impl Stream<Item = Result<StreamEvent>>> {
        // The guard travels with the background forwarding task so the
        // lock stays held until the whole stream (not just this call)
        // completes — matching `original_source/model_proxy.py`'s
        // `with self.lock:` wrapping the entire generator.
        let guard = Arc::clone(&self.op_lock).lock_owned().await;
        if !self.is_alive().await {
            drop(guard);
            return Err(GatewayError::WorkerNotRunning);
        }
        *self.last_used.lock().await = Instant::now();

        let id = Uuid::new_v4().to_string();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel();
        self.pending.lock().await.insert(id.clone(), response_tx);

        let payload = json!({"prompt": prompt, "temperature": temperature, "max_tokens": max_tokens});
        self.send_line(&id, CommandTag::GenerateStream, payload).await?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let pending = Arc::clone(&self.pending);
        let request_id = id.clone();
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                let next = tokio::time::timeout(CHUNK_TIMEOUT, response_rx.recv()).await;
                match next {
                    Ok(Some(response)) => match response.kind {
                        ResponseKind::Chunk => {
                            let text = response.payload.get("text").and_then(Value::as_str).unwrap_or("");
                            if out_tx.send(Ok(StreamEvent::Chunk(text.to_string()))).is_err() {
                                break;
                            }
                        }
                        ResponseKind::Done => {
                            let finish_reason = parse_finish_reason(response.payload.get("finish_reason"));
                            let usage = parse_usage(response.payload.get("usage"));
                            let _ = out_tx.send(Ok(StreamEvent::Done { finish_reason, usage }));
                            break;
                        }
                        ResponseKind::Error => {
                            let message = response.error_message().unwrap_or("unknown error").to_string();
                            let _ = out_tx.send(Err(GatewayError::GenerationError(message)));
                            break;
                        }
                        ResponseKind::Result => break,
                    },
                    Ok(None) => {
                        let _ = out_tx.send(Err(GatewayError::WorkerCrashed(
                            "model worker crashed unexpectedly during stream".to_string(),
                        )));
                        break;
                    }
                    Err(_) => {
                        let _ = out_tx.send(Err(GatewayError::Timeout("streaming chunk")));
                        break;
                    }
                }
            }
            pending.lock().await.remove(&request_id);
        });

        Ok(UnboundedReceiverStream::new(out_rx))
    }

    /// Signal the worker to stop the current stream. Deliberately does NOT
    /// take `op_lock` (SPEC_FULL.md §4.3) so it can interrupt an in-flight
    /// call from another caller.
    pub async fn stop_generation(&self) -> Result<()> {
        let writer = self.writer.lock().await;
        let Some(writer) = writer.as_ref() else {
            return Err(GatewayError::WorkerNotRunning);
        };
        let line = serde_json::to_string(&StopSignal { stop: true })
            .map_err(|e| GatewayError::ProtocolError(e.to_string()))?;
        writer
            .send(line)
            .map_err(|_| GatewayError::WorkerNotRunning)?;
        info!("stop signal sent to model: {}", self.model_name);
        Ok(())
    }

    pub async fn tokenize(&self, text: &str, add_bos: bool) -> Result<TokenizeResult> {
        let _guard = self.op_lock.lock().await;
        if !self.is_alive().await {
            return Err(GatewayError::WorkerNotRunning);
        }
        *self.last_used.lock().await = Instant::now();

        let payload = json!({"text": text, "add_bos": add_bos});
        let response = self
            .send_request_single(CommandTag::Tokenize, payload, TOKENIZE_TIMEOUT, "tokenize")
            .await?;

        if response.kind == ResponseKind::Error {
            return Err(GatewayError::GenerationError(
                response.error_message().unwrap_or("unknown error").to_string(),
            ));
        }

        let tokens: Vec<i32> = response
            .payload
            .get("tokens")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_i64().map(|n| n as i32)).collect())
            .unwrap_or_default();
        let token_count = response
            .payload
            .get("token_count")
            .and_then(Value::as_u64)
            .map_or(tokens.len(), |n| n as usize);
        let n_ctx = response.payload.get("n_ctx").and_then(Value::as_u64).unwrap_or(0) as u32;
        Ok(TokenizeResult { tokens, token_count, n_ctx })
    }

    /// Escalating shutdown (SPEC_FULL.md §4.2/§4.3). Idempotent.
    pub async fn shutdown(&self) {
        let mut process = self.process.lock().await;
        let Some(worker) = process.as_mut() else {
            return;
        };
        info!("shutting down subprocess for model: {}", self.model_name);
        worker.shutdown(Uuid::new_v4().to_string()).await;
        *process = None;
        *self.writer.lock().await = None;
        info!("subprocess shutdown complete for model: {}", self.model_name);
    }

    async fn send_line(&self, id: &str, command: CommandTag, payload: Value) -> Result<()> {
        let writer = self.writer.lock().await;
        let Some(writer) = writer.as_ref() else {
            return Err(GatewayError::WorkerNotRunning);
        };
        let request = WorkerRequest::new(id, command, payload);
        let line = serde_json::to_string(&request).map_err(|e| GatewayError::ProtocolError(e.to_string()))?;
        writer.send(line).map_err(|_| GatewayError::WorkerNotRunning)
    }

    async fn send_request_single(
        &self,
        command: CommandTag,
        payload: Value,
        budget: Duration,
        what: &'static str,
    ) -> Result<WorkerResponse> {
        let id = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.lock().await.insert(id.clone(), tx);

        self.send_line(&id, command, payload).await?;

        let result = tokio::time::timeout(budget, rx.recv()).await;
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(GatewayError::WorkerCrashed(format!(
                "model worker crashed unexpectedly during {what}"
            ))),
            Err(_) => {
                warn!("{what} timed out after {budget:?}");
                Err(GatewayError::Timeout(what))
            }
        }
    }
}

fn parse_finish_reason(value: Option<&Value>) -> FinishReason {
    match value.and_then(Value::as_str) {
        Some("length") => FinishReason::Length,
        Some("cancelled") => FinishReason::Cancelled,
        _ => FinishReason::Stop,
    }
}

fn parse_usage(value: Option<&Value>) -> Usage {
    let Some(value) = value else {
        return Usage::default();
    };
    let field = |name: &str| value.get(name).and_then(Value::as_u64).unwrap_or(0) as u32;
    Usage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
    }
}

/// Background task: demultiplex lines from the worker's stdout onto the
/// per-request channels registered in `pending`, keyed by response id.
fn spawn_dispatch_loop(mut reader: mpsc::UnboundedReceiver<String>, pending: PendingMap) {
    tokio::spawn(async move {
        while let Some(line) = reader.recv().await {
            let response: WorkerResponse = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!("failed to parse worker response: {e}");
                    continue;
                }
            };
            let sender = pending.lock().await.get(&response.id).cloned();
            if let Some(sender) = sender {
                let _ = sender.send(response);
            }
        }

        // stdout hit end-of-stream: the worker is gone. Drop every
        // still-registered sender so any `rx.recv()` waiting under a
        // per-operation timeout (`send_request_single`, the
        // `generate_stream` forwarding task) resolves to `None` right away
        // and reports `WorkerCrashed` immediately instead of waiting out
        // its full budget, matching the Python original's `conn.recv()`
        // raising `EOFError` on a closed pipe rather than blocking.
        pending.lock().await.clear();
    });
}

#[cfg(test)]
mod dispatch_loop_tests {
    use super::*;

    /// Once the worker's stdout pipe closes, every still-registered sender
    /// must be dropped so an in-flight `rx.recv()` (e.g. inside
    /// `send_request_single` or the `generate_stream` forwarding task)
    /// observes `None` immediately instead of only after its own
    /// operation timeout elapses.
    #[tokio::test]
    async fn eof_clears_pending_so_in_flight_receivers_see_none_promptly() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();

        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<WorkerResponse>();
        pending.lock().await.insert("in-flight".to_string(), resp_tx);

        spawn_dispatch_loop(line_rx, Arc::clone(&pending));

        // Simulate the worker's stdout closing with no terminal response
        // ever having arrived for "in-flight".
        drop(line_tx);

        let received = tokio::time::timeout(Duration::from_secs(1), resp_rx.recv())
            .await
            .expect("pending entry must be cleared on EOF, not left to time out");
        assert!(received.is_none());
        assert!(pending.lock().await.is_empty());
    }
}
