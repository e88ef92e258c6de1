//! Configuration contract (SPEC_FULL.md §6): a JSON file recognizing exactly
//! the `model_manager.*` and `model_settings.<name>.*` keys. Loading follows
//! the teacher's `web::config::load_config` shape (read-file, then parse)
//! swapped from a SQLite-backed sampler config onto a plain JSON file, since
//! this crate persists nothing (§6 "Persisted state: None") — but unlike
//! `load_config`, a parse error here is propagated as a `Result` rather than
//! swallowed into defaults (see `DESIGN.md`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_n_threads() -> u32 {
    8
}

/// `model_manager.*` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManagerConfig {
    pub models_directory: PathBuf,
    #[serde(default)]
    pub default_model: Option<String>,
    pub n_ctx: u32,
    pub n_gpu_layers: i32,
    #[serde(default = "default_n_threads")]
    pub n_threads: u32,
    pub check_interval: u64,
    pub idle_timeout: u64,
}

/// `model_settings.<name>.*` — any subset of overrides, applied on top of
/// [`ModelManagerConfig`]'s defaults and never propagated cross-model
/// (SPEC_FULL.md §4.3 "Parameter resolution at start").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOverrides {
    #[serde(default)]
    pub n_ctx: Option<u32>,
    #[serde(default)]
    pub n_gpu_layers: Option<i32>,
    #[serde(default)]
    pub n_threads: Option<u32>,
    #[serde(default)]
    pub override_tensor: Option<String>,
    #[serde(default)]
    pub offload_kqv: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub model_manager: ModelManagerConfig,
    #[serde(default)]
    pub model_settings: HashMap<String, ModelOverrides>,
}

/// Effective LOAD parameters for one model: global defaults overlaid with
/// that model's overrides.
#[derive(Debug, Clone)]
pub struct LoadParams {
    pub n_ctx: u32,
    pub n_gpu_layers: i32,
    pub n_threads: u32,
    pub offload_kqv: bool,
    pub override_tensor: Option<String>,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Overlay `model_settings.<name>` onto `model_manager`'s defaults.
    /// Grounded in `original_source/model_proxy.py::_send_load_command`.
    pub fn effective_load_params(&self, model_name: &str) -> LoadParams {
        let overrides = self.model_settings.get(model_name);
        LoadParams {
            n_ctx: overrides
                .and_then(|o| o.n_ctx)
                .unwrap_or(self.model_manager.n_ctx),
            n_gpu_layers: overrides
                .and_then(|o| o.n_gpu_layers)
                .unwrap_or(self.model_manager.n_gpu_layers),
            n_threads: overrides
                .and_then(|o| o.n_threads)
                .unwrap_or(self.model_manager.n_threads),
            offload_kqv: overrides.and_then(|o| o.offload_kqv).unwrap_or(true),
            override_tensor: overrides.and_then(|o| o.override_tensor.clone()),
        }
    }
}
