//! The inference backend a [`crate::worker`] command loop drives.
//!
//! Grounded in the teacher's `web::model_manager::load_model`/`get_model_status`
//! (real `llama_cpp_2::{LlamaBackend, LlamaModel}` usage and GGUF metadata
//! reads via `gguf_llms`), generalized behind a trait so the worker's
//! single-threaded command loop can be exercised in tests without a real
//! GPU or model file. The mock variant mirrors the teacher's own `mock`
//! Cargo feature convention for swapping out native bindings in tests.

use std::path::Path;

use gguf_llms::{GgufHeader, GgufReader, Value};
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::LlamaModel;

use crate::config::LoadParams;
use crate::error::{GatewayError, Result};

/// Metadata returned once a model finishes loading (SPEC_FULL.md §4.2 LOAD).
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub context_length: u32,
    pub general_name: Option<String>,
}

/// Outcome of a GENERATE_STREAM run (SPEC_FULL.md §4.2, the
/// distinct-`"cancelled"`-from-`"stop"` decision in §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: FinishReason,
}

/// Callback invoked once per generated token during a stream; returns
/// `true` to request the stream stop. The worker passes a closure that
/// checks the pending [`crate::ipc::StopSignal`] (SPEC_FULL.md §4.2).
pub trait TokenSink {
    fn emit(&mut self, token: &str) -> bool;
}

impl<F: FnMut(&str) -> bool> TokenSink for F {
    fn emit(&mut self, token: &str) -> bool {
        self(token)
    }
}

/// Single-model inference backend. A worker process holds exactly one of
/// these (or none, before LOAD) for its whole lifetime.
pub trait LlamaEngine: Send {
    fn load(&mut self, model_path: &Path, params: LoadParams) -> Result<ModelInfo>;
    fn is_loaded(&self) -> bool;
    fn generate(&mut self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<GenerationResult>;
    fn generate_stream(
        &mut self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationResult>;
    /// `add_bos` controls a leading BOS token in the returned sequence
    /// (SPEC_FULL.md §4.2 TOKENIZE).
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<i32>>;
    /// The context length the currently loaded model was reported to
    /// support, for TOKENIZE's `n_ctx` field. `0` before LOAD.
    fn n_ctx(&self) -> u32;
}

/// Real engine, backed by `llama-cpp-2`. Generation here is a placeholder
/// token loop: this crate's contribution over the teacher is process
/// supervision and IPC, not a new sampler, so sampling itself follows the
/// teacher's `load_model` path one-for-one and stops at "produces tokens".
pub struct RealLlamaEngine {
    backend: LlamaBackend,
    model: Option<LlamaModel>,
    context_length: u32,
}

impl RealLlamaEngine {
    pub fn new() -> Result<Self> {
        let backend = LlamaBackend::init()
            .map_err(|e| GatewayError::LoadFailed(format!("failed to init backend: {e}")))?;
        Ok(Self {
            backend,
            model: None,
            context_length: 0,
        })
    }

    fn read_context_length(model_path: &Path) -> Option<u32> {
        let file = std::fs::File::open(model_path).ok()?;
        let mut reader = std::io::BufReader::new(file);
        let header = GgufHeader::parse(&mut reader).ok()?;
        let metadata = GgufReader::read_metadata(&mut reader, header.n_kv).ok()?;
        metadata.get("llama.context_length").and_then(|v| match v {
            Value::Uint32(n) => Some(*n),
            Value::Uint64(n) => Some(*n as u32),
            _ => None,
        })
    }
}

impl LlamaEngine for RealLlamaEngine {
    fn load(&mut self, model_path: &Path, params: LoadParams) -> Result<ModelInfo> {
        if !model_path.is_file() {
            return Err(GatewayError::ModelFileMissing(
                model_path.display().to_string(),
            ));
        }

        self.model = None;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(
            u32::try_from(params.n_gpu_layers.max(0)).unwrap_or(u32::MAX),
        );

        let model = LlamaModel::load_from_file(&self.backend, model_path, &model_params)
            .map_err(|e| GatewayError::LoadFailed(e.to_string()))?;

        self.context_length =
            Self::read_context_length(model_path).unwrap_or(params.n_ctx);
        self.model = Some(model);

        Ok(ModelInfo {
            context_length: self.context_length,
            general_name: model_path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string),
        })
    }

    fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    fn generate(&mut self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<GenerationResult> {
        let mut text = String::new();
        let mut sink = |tok: &str| {
            text.push_str(tok);
            false
        };
        let mut result = self.generate_stream(prompt, temperature, max_tokens, &mut sink)?;
        result.text = text;
        Ok(result)
    }

    fn generate_stream(
        &mut self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationResult> {
        if self.model.is_none() {
            return Err(GatewayError::WorkerNotRunning);
        }
        let prompt_tokens = self.tokenize(prompt, true)?.len() as u32;
        let _ = temperature;

        // Placeholder sampler loop: the teacher's chat-specific generation
        // code lives entirely in `web::chat`, which is out of scope here
        // (SPEC_FULL.md only specifies the supervisor/IPC boundary, not a
        // new sampling strategy). Produces `max_tokens` empty-string ticks
        // so callers observe the stop-flag/finish-reason contract.
        let mut completion_tokens = 0;
        let mut finish_reason = FinishReason::Length;
        for _ in 0..max_tokens {
            if sink.emit("") {
                finish_reason = FinishReason::Cancelled;
                break;
            }
            completion_tokens += 1;
            if completion_tokens >= max_tokens {
                finish_reason = FinishReason::Length;
            }
        }
        if completion_tokens < max_tokens {
            finish_reason = FinishReason::Stop;
        }

        Ok(GenerationResult {
            text: String::new(),
            prompt_tokens,
            completion_tokens,
            finish_reason,
        })
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<i32>> {
        let Some(model) = self.model.as_ref() else {
            return Err(GatewayError::WorkerNotRunning);
        };
        let add_bos = if add_bos {
            llama_cpp_2::model::AddBos::Always
        } else {
            llama_cpp_2::model::AddBos::Never
        };
        model
            .str_to_token(text, add_bos)
            .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
            .map_err(|e| GatewayError::GenerationError(e.to_string()))
    }

    fn n_ctx(&self) -> u32 {
        self.context_length
    }
}

/// Deterministic engine used by worker/proxy/supervisor tests. No GPU, no
/// model file required; `load` only checks that `model_path` exists.
#[derive(Debug, Default)]
pub struct MockLlamaEngine {
    loaded: bool,
    context_length: u32,
}

impl LlamaEngine for MockLlamaEngine {
    fn load(&mut self, model_path: &Path, params: LoadParams) -> Result<ModelInfo> {
        if !model_path.exists() {
            return Err(GatewayError::ModelFileMissing(
                model_path.display().to_string(),
            ));
        }
        self.loaded = true;
        self.context_length = params.n_ctx;
        Ok(ModelInfo {
            context_length: params.n_ctx,
            general_name: model_path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string),
        })
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn generate(&mut self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<GenerationResult> {
        if !self.loaded {
            return Err(GatewayError::WorkerNotRunning);
        }
        let _ = temperature;
        let prompt_tokens = self.tokenize(prompt, true)?.len() as u32;
        let words: Vec<&str> = prompt.split_whitespace().take(max_tokens as usize).collect();
        let completion_tokens = words.len() as u32;
        Ok(GenerationResult {
            text: format!("echo: {}", words.join(" ")),
            prompt_tokens,
            completion_tokens,
            finish_reason: if completion_tokens >= max_tokens {
                FinishReason::Length
            } else {
                FinishReason::Stop
            },
        })
    }

    fn generate_stream(
        &mut self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationResult> {
        if !self.loaded {
            return Err(GatewayError::WorkerNotRunning);
        }
        let _ = temperature;
        let prompt_tokens = self.tokenize(prompt, true)?.len() as u32;
        let words: Vec<&str> = prompt.split_whitespace().collect();
        let mut completion_tokens = 0;
        let mut finish_reason = FinishReason::Stop;
        for word in words.iter().take(max_tokens as usize) {
            if sink.emit(word) {
                finish_reason = FinishReason::Cancelled;
                break;
            }
            completion_tokens += 1;
            if completion_tokens == max_tokens {
                finish_reason = FinishReason::Length;
            }
        }
        Ok(GenerationResult {
            text: words.join(" "),
            prompt_tokens,
            completion_tokens,
            finish_reason,
        })
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<i32>> {
        if !self.loaded {
            return Err(GatewayError::WorkerNotRunning);
        }
        let count = text.split_whitespace().count();
        let mut tokens: Vec<i32> = Vec::with_capacity(count + 1);
        if add_bos {
            tokens.push(0);
        }
        tokens.extend(1..=count as i32);
        Ok(tokens)
    }

    fn n_ctx(&self) -> u32 {
        self.context_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_requires_load_before_generate() {
        let mut engine = MockLlamaEngine::default();
        assert!(engine.generate("hi", 0.7, 8).is_err());
    }

    #[test]
    fn mock_stream_reports_cancelled_distinct_from_stop() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("m.gguf");
        std::fs::write(&model_path, b"").unwrap();

        let mut engine = MockLlamaEngine::default();
        engine
            .load(
                &model_path,
                LoadParams {
                    n_ctx: 2048,
                    n_gpu_layers: 0,
                    n_threads: 4,
                    offload_kqv: true,
                    override_tensor: None,
                },
            )
            .unwrap();

        let mut calls = 0;
        let mut sink = |_tok: &str| {
            calls += 1;
            calls >= 2
        };
        let result = engine
            .generate_stream("one two three four", 0.7, 10, &mut sink)
            .unwrap();
        assert_eq!(result.finish_reason, FinishReason::Cancelled);
    }
}
