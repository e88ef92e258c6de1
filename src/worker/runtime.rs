//! The worker's command loop (SPEC_FULL.md §4.2).
//!
//! Grounded in `original_source/model_worker.py`'s `ModelWorker.run`/
//! `_handle_*` dispatch (one `Command` in, one or more `Response`s out,
//! catch-and-report-but-keep-running on handler errors) and in the
//! teacher's `worker_main.rs` split between a dedicated stdin-reading
//! thread and the command loop itself.
//!
//! Unlike the teacher's `worker_main.rs`, GENERATE_STREAM does not spawn a
//! second thread to run generation concurrently with command dispatch
//! (SPEC_FULL.md §4.2): the command loop IS the generation loop for the
//! duration of a stream, and cancellation works because the stdin-reader
//! thread keeps draining lines in the background — a [`StopSignal`]
//! arriving mid-stream sits in the channel until the generation callback's
//! `try_recv` notices it. The Proxy's held mutex (SPEC_FULL.md §4.3)
//! guarantees nothing else arrives on that channel during a stream.

use std::io::{BufRead, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use log::{error, info, warn};
use serde_json::{json, Value};

use crate::engine::{FinishReason, LlamaEngine, TokenSink};
use crate::ipc::{CommandTag, IncomingLine, ResponseKind, StopSignal, WorkerRequest, WorkerResponse};

/// Run the worker command loop to completion (until SHUTDOWN or stdin
/// closes). `engine` starts unloaded; LOAD populates it.
pub fn run<E: LlamaEngine>(engine: E, stdin: impl BufRead + Send + 'static, mut stdout: impl Write) {
    let (tx, rx): (Sender<IncomingLine>, Receiver<IncomingLine>) = mpsc::channel();
    spawn_stdin_reader(stdin, tx);

    let mut engine = engine;
    info!("worker started, pid={}", std::process::id());

    loop {
        let incoming = match rx.recv() {
            Ok(line) => line,
            Err(_) => {
                info!("stdin closed, exiting");
                break;
            }
        };

        let request = match incoming {
            IncomingLine::Request(req) => req,
            IncomingLine::Stop(_) => {
                // A StopSignal outside an in-flight stream has nothing to
                // cancel; ignore it (matches `stop_event` being a no-op
                // when no generation is running in the Python original).
                continue;
            }
        };

        let is_shutdown = request.command == CommandTag::Shutdown;
        dispatch(&mut engine, request, &rx, &mut stdout);

        if is_shutdown {
            info!("shutdown command received, exiting");
            break;
        }
    }

    info!("worker exiting");
}

fn spawn_stdin_reader(stdin: impl BufRead + Send + 'static, tx: Sender<IncomingLine>) {
    thread::spawn(move || {
        let mut stdin = stdin;
        let mut buf = String::new();
        loop {
            buf.clear();
            match stdin.read_line(&mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = buf.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<IncomingLine>(trimmed) {
                        Ok(line) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("failed to parse incoming line: {e}"),
                    }
                }
                Err(_) => break,
            }
        }
    });
}

fn write_response(stdout: &mut impl Write, response: &WorkerResponse) {
    match serde_json::to_string(response) {
        Ok(line) => {
            if writeln!(stdout, "{line}").is_err() || stdout.flush().is_err() {
                error!("failed to write response, stdout closed");
            }
        }
        Err(e) => error!("failed to serialize response: {e}"),
    }
}

fn dispatch<E: LlamaEngine>(
    engine: &mut E,
    request: WorkerRequest,
    stop_rx: &Receiver<IncomingLine>,
    stdout: &mut impl Write,
) {
    let id = request.id.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        handle(engine, &request, stop_rx, &mut *stdout)
    }));

    if let Err(panic) = result {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "worker panicked".to_string());
        error!("handler for {:?} panicked: {message}", request.command);
        write_response(stdout, &WorkerResponse::error(id, message));
    }
}

fn handle<E: LlamaEngine>(
    engine: &mut E,
    request: &WorkerRequest,
    stop_rx: &Receiver<IncomingLine>,
    stdout: &mut impl Write,
) {
    let id = request.id.clone();
    match request.command {
        CommandTag::Load => handle_load(engine, request, stdout),
        CommandTag::Generate => handle_generate(engine, request, stdout),
        CommandTag::GenerateStream => handle_stream(engine, request, stop_rx, stdout),
        CommandTag::Tokenize => handle_tokenize(engine, request, stdout),
        CommandTag::Status => handle_status(engine, request, stdout),
        CommandTag::Heartbeat => write_response(
            stdout,
            &WorkerResponse::result(id, json!({"status": "alive", "pid": std::process::id()})),
        ),
        CommandTag::Shutdown => write_response(stdout, &WorkerResponse::result(id, json!({"status": "shutdown"}))),
    }
}

fn handle_load<E: LlamaEngine>(engine: &mut E, request: &WorkerRequest, stdout: &mut impl Write) {
    let id = request.id.clone();
    if engine.is_loaded() {
        write_response(
            stdout,
            &WorkerResponse::result(id, json!({"status": "already_loaded"})),
        );
        return;
    }

    let Some(model_path) = request.payload.get("model_path").and_then(Value::as_str) else {
        write_response(stdout, &WorkerResponse::error(id, "missing model_path"));
        return;
    };
    let n_ctx = request.payload.get("n_ctx").and_then(Value::as_u64).unwrap_or(4096) as u32;
    let n_gpu_layers = request
        .payload
        .get("n_gpu_layers")
        .and_then(Value::as_i64)
        .unwrap_or(-1) as i32;
    let n_threads = request.payload.get("n_threads").and_then(Value::as_u64).unwrap_or(8) as u32;
    let offload_kqv = request
        .payload
        .get("offload_kqv")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let override_tensor = request
        .payload
        .get("override_tensor")
        .and_then(Value::as_str)
        .map(str::to_string);

    info!(
        "loading model: {model_path} (n_ctx={n_ctx}, n_gpu_layers={n_gpu_layers}, n_threads={n_threads}, override_tensor={override_tensor:?})"
    );

    let params = crate::config::LoadParams {
        n_ctx,
        n_gpu_layers,
        n_threads,
        offload_kqv,
        override_tensor,
    };

    match engine.load(std::path::Path::new(model_path), params) {
        Ok(info) => {
            info!("model loaded: {model_path}");
            write_response(
                stdout,
                &WorkerResponse::result(
                    id,
                    json!({
                        "status": "loaded",
                        "context_length": info.context_length,
                        "general_name": info.general_name,
                    }),
                ),
            );
        }
        Err(e) => write_response(stdout, &WorkerResponse::error(id, e.to_string())),
    }
}

fn handle_generate<E: LlamaEngine>(engine: &mut E, request: &WorkerRequest, stdout: &mut impl Write) {
    let id = request.id.clone();
    if !engine.is_loaded() {
        write_response(stdout, &WorkerResponse::error(id, "Model not loaded"));
        return;
    }
    let Some(prompt) = request.payload.get("prompt").and_then(Value::as_str) else {
        write_response(stdout, &WorkerResponse::error(id, "missing prompt"));
        return;
    };
    let temperature = request.payload.get("temperature").and_then(Value::as_f64).unwrap_or(0.7) as f32;
    let max_tokens = request.payload.get("max_tokens").and_then(Value::as_u64).unwrap_or(2048) as u32;

    match engine.generate(prompt, temperature, max_tokens) {
        Ok(result) => write_response(
            stdout,
            &WorkerResponse::result(
                id,
                json!({
                    "text": result.text,
                    "finish_reason": finish_reason_str(result.finish_reason),
                    "usage": {
                        "prompt_tokens": result.prompt_tokens,
                        "completion_tokens": result.completion_tokens,
                        "total_tokens": result.prompt_tokens + result.completion_tokens,
                    },
                }),
            ),
        ),
        Err(e) => write_response(stdout, &WorkerResponse::error(id, e.to_string())),
    }
}

/// Bridges the stop-signal channel into the engine's [`TokenSink`]
/// callback, polled between tokens (`original_source/model_worker.py`'s
/// `self.stop_event.is_set()` check, made non-blocking here since there is
/// no dedicated event object, just the shared stdin channel).
struct ChunkSink<'a, W> {
    id: String,
    stop_rx: &'a Receiver<IncomingLine>,
    stdout: &'a mut W,
}

impl<'a, W: Write> TokenSink for ChunkSink<'a, W> {
    fn emit(&mut self, token: &str) -> bool {
        if matches!(self.stop_rx.try_recv(), Ok(IncomingLine::Stop(StopSignal { stop: true }))) {
            return true;
        }
        write_response(
            self.stdout,
            &WorkerResponse::chunk(self.id.clone(), json!({"text": token})),
        );
        false
    }
}

fn handle_stream<E: LlamaEngine>(
    engine: &mut E,
    request: &WorkerRequest,
    stop_rx: &Receiver<IncomingLine>,
    stdout: &mut impl Write,
) {
    let id = request.id.clone();
    if !engine.is_loaded() {
        write_response(stdout, &WorkerResponse::error(id, "Model not loaded"));
        return;
    }
    let Some(prompt) = request.payload.get("prompt").and_then(Value::as_str) else {
        write_response(stdout, &WorkerResponse::error(id, "missing prompt"));
        return;
    };
    let temperature = request.payload.get("temperature").and_then(Value::as_f64).unwrap_or(0.7) as f32;
    let max_tokens = request.payload.get("max_tokens").and_then(Value::as_u64).unwrap_or(2048) as u32;

    let mut sink = ChunkSink {
        id: id.clone(),
        stop_rx,
        stdout: &mut *stdout,
    };
    let result = engine.generate_stream(prompt, temperature, max_tokens, &mut sink);

    match result {
        Ok(result) => write_response(
            stdout,
            &WorkerResponse::done(
                id,
                json!({
                    "finish_reason": finish_reason_str(result.finish_reason),
                    "usage": {
                        "prompt_tokens": result.prompt_tokens,
                        "completion_tokens": result.completion_tokens,
                        "total_tokens": result.prompt_tokens + result.completion_tokens,
                    },
                }),
            ),
        ),
        Err(e) => write_response(stdout, &WorkerResponse::error(id, e.to_string())),
    }
}

fn handle_tokenize<E: LlamaEngine>(engine: &E, request: &WorkerRequest, stdout: &mut impl Write) {
    let id = request.id.clone();
    if !engine.is_loaded() {
        write_response(stdout, &WorkerResponse::error(id, "Model not loaded"));
        return;
    }
    let text = request.payload.get("text").and_then(Value::as_str).unwrap_or("");
    let add_bos = request.payload.get("add_bos").and_then(Value::as_bool).unwrap_or(true);

    match engine.tokenize(text, add_bos) {
        Ok(tokens) => {
            let token_count = tokens.len();
            write_response(
                stdout,
                &WorkerResponse::result(
                    id,
                    json!({"tokens": tokens, "token_count": token_count, "n_ctx": engine.n_ctx()}),
                ),
            );
        }
        Err(e) => write_response(stdout, &WorkerResponse::error(id, e.to_string())),
    }
}

fn handle_status<E: LlamaEngine>(engine: &E, request: &WorkerRequest, stdout: &mut impl Write) {
    let id = request.id.clone();
    write_response(
        stdout,
        &WorkerResponse::result(
            id,
            json!({"loaded": engine.is_loaded(), "pid": std::process::id()}),
        ),
    );
}

fn finish_reason_str(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::Cancelled => "cancelled",
    }
}
