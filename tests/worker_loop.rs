//! End-to-end exercise of the worker command loop (SPEC_FULL.md §4.2)
//! against the deterministic mock engine: a full LOAD → GENERATE_STREAM →
//! SHUTDOWN sequence over the same newline-delimited JSON framing a real
//! subprocess would see on stdin/stdout.

use std::io::BufReader;

use llama_gateway_core::config::LoadParams;
use llama_gateway_core::engine::{LlamaEngine, MockLlamaEngine};
use llama_gateway_core::ipc::{CommandTag, ResponseKind, StopSignal, WorkerRequest, WorkerResponse};
use llama_gateway_core::worker::runtime;

fn run_lines(engine: MockLlamaEngine, lines: &[String]) -> Vec<WorkerResponse> {
    let input = lines.join("\n") + "\n";
    let reader = BufReader::new(std::io::Cursor::new(input.into_bytes()));
    let mut out: Vec<u8> = Vec::new();
    runtime::run(engine, reader, &mut out);
    String::from_utf8(out)
        .unwrap()
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn load_then_generate_stream_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("demo.gguf");
    std::fs::write(&model_path, b"").unwrap();

    let lines = vec![
        serde_json::to_string(&WorkerRequest::new(
            "load-1",
            CommandTag::Load,
            serde_json::json!({"model_path": model_path.to_str().unwrap(), "n_ctx": 2048}),
        ))
        .unwrap(),
        serde_json::to_string(&WorkerRequest::new(
            "stream-1",
            CommandTag::GenerateStream,
            serde_json::json!({"prompt": "one two three", "max_tokens": 10}),
        ))
        .unwrap(),
        serde_json::to_string(&WorkerRequest::new("shutdown-1", CommandTag::Shutdown, serde_json::Value::Null))
            .unwrap(),
    ];

    let responses = run_lines(MockLlamaEngine::default(), &lines);

    assert_eq!(responses[0].id, "load-1");
    assert!(matches!(responses[0].kind, ResponseKind::Result));

    let chunks: Vec<_> = responses.iter().filter(|r| r.id == "stream-1" && matches!(r.kind, ResponseKind::Chunk)).collect();
    assert_eq!(chunks.len(), 3, "one chunk per prompt word");

    let done = responses
        .iter()
        .find(|r| r.id == "stream-1" && matches!(r.kind, ResponseKind::Done))
        .expect("stream ends with a DONE frame");
    assert_eq!(done.payload["finish_reason"], "stop");

    let shutdown = responses.last().unwrap();
    assert_eq!(shutdown.id, "shutdown-1");
    assert!(matches!(shutdown.kind, ResponseKind::Result));
}

#[test]
fn stop_signal_mid_stream_yields_cancelled_not_stop() {
    // A StopSignal line sandwiched right after the stream request: the
    // command loop's stdin-reader thread has already buffered it by the
    // time the stream handler's first `try_recv` runs.
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("demo.gguf");
    std::fs::write(&model_path, b"").unwrap();

    let lines = vec![
        serde_json::to_string(&WorkerRequest::new(
            "load-1",
            CommandTag::Load,
            serde_json::json!({"model_path": model_path.to_str().unwrap()}),
        ))
        .unwrap(),
        serde_json::to_string(&WorkerRequest::new(
            "stream-1",
            CommandTag::GenerateStream,
            serde_json::json!({"prompt": "a b c d e f g h", "max_tokens": 8}),
        ))
        .unwrap(),
        serde_json::to_string(&StopSignal { stop: true }).unwrap(),
    ];

    let responses = run_lines(MockLlamaEngine::default(), &lines);

    let done = responses
        .iter()
        .find(|r| r.id == "stream-1" && matches!(r.kind, ResponseKind::Done))
        .expect("a cancelled stream still sends DONE, not ERROR");
    assert_eq!(done.payload["finish_reason"], "cancelled");
}

#[test]
fn load_with_missing_model_file_reports_error_and_keeps_running() {
    let lines = vec![
        serde_json::to_string(&WorkerRequest::new(
            "load-1",
            CommandTag::Load,
            serde_json::json!({"model_path": "/nonexistent/path.gguf"}),
        ))
        .unwrap(),
        serde_json::to_string(&WorkerRequest::new("heartbeat-1", CommandTag::Heartbeat, serde_json::Value::Null))
            .unwrap(),
    ];

    let responses = run_lines(MockLlamaEngine::default(), &lines);
    assert!(matches!(responses[0].kind, ResponseKind::Error));
    // The loop keeps serving requests after a handler error.
    assert!(matches!(responses[1].kind, ResponseKind::Result));
}

#[test]
fn mock_engine_rejects_generation_before_load() {
    let mut engine = MockLlamaEngine::default();
    assert!(engine.tokenize("hi", true).is_err());

    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("demo.gguf");
    std::fs::write(&model_path, b"").unwrap();
    engine
        .load(
            &model_path,
            LoadParams {
                n_ctx: 1024,
                n_gpu_layers: 0,
                n_threads: 2,
                offload_kqv: true,
                override_tensor: None,
            },
        )
        .unwrap();
    assert!(engine.tokenize("hi there", true).is_ok());
}

#[test]
fn tokenize_reports_matching_token_count_and_n_ctx() {
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("demo.gguf");
    std::fs::write(&model_path, b"").unwrap();

    let lines = vec![
        serde_json::to_string(&WorkerRequest::new(
            "load-1",
            CommandTag::Load,
            serde_json::json!({"model_path": model_path.to_str().unwrap(), "n_ctx": 4096}),
        ))
        .unwrap(),
        serde_json::to_string(&WorkerRequest::new(
            "tok-1",
            CommandTag::Tokenize,
            serde_json::json!({"text": "one two three", "add_bos": true}),
        ))
        .unwrap(),
        serde_json::to_string(&WorkerRequest::new(
            "tok-2",
            CommandTag::Tokenize,
            serde_json::json!({"text": "one two three", "add_bos": false}),
        ))
        .unwrap(),
    ];

    let responses = run_lines(MockLlamaEngine::default(), &lines);

    let with_bos = &responses[1];
    let tokens = with_bos.payload["tokens"].as_array().unwrap();
    assert_eq!(with_bos.payload["token_count"], tokens.len() as u64);
    assert_eq!(with_bos.payload["n_ctx"], 4096);

    let without_bos = &responses[2];
    let tokens_no_bos = without_bos.payload["tokens"].as_array().unwrap();
    assert_eq!(tokens.len(), tokens_no_bos.len() + 1, "add_bos adds exactly one leading token");
}
