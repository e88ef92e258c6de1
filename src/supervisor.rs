//! Single-slot model supervisor (SPEC_FULL.md §4.4).
//!
//! Grounded directly in `original_source/model_proxy.py::ModelProxyManager`:
//! one `active_proxy`/`active_model` pair, synchronous shutdown-before-spawn
//! on switch, and the same `get_model`/`unload_model`/`unload_all_models`/
//! `stop_generation`/`unload_idle_models`/`list_models`/`get_model_status`/
//! `update_config` operation set, re-expressed with `tokio::sync::Mutex`
//! and [`GatewayError`] in place of Python exceptions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use tokio::sync::Mutex;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::proxy::Proxy;
use crate::registry::ModelRegistry;

/// Snapshot of one registered model's availability, for STATUS-style
/// listing (SPEC_FULL.md §4.4 "list_models"/"get_model_status").
#[derive(Debug, Clone)]
pub struct ModelStatus {
    pub name: String,
    pub filename: String,
    pub loaded: bool,
    pub idle_seconds: Option<u64>,
}

struct ActiveSlot {
    model_name: String,
    proxy: Arc<Proxy>,
}

struct State {
    config: GatewayConfig,
    config_path: PathBuf,
    registry: ModelRegistry,
    active: Option<ActiveSlot>,
}

/// Owns the single live worker subprocess, if any. All mutation happens
/// through one critical section (`state`), matching the Python original's
/// `with self.lock:` blocks — including the LOAD wait, so concurrent
/// callers observe a model switch atomically rather than racing to spawn
/// two subprocesses for the same target.
pub struct Supervisor {
    state: Mutex<State>,
}

impl Supervisor {
    pub fn new(config: GatewayConfig, config_path: PathBuf) -> Result<Self> {
        let registry = ModelRegistry::scan(&config.model_manager.models_directory)?;
        Ok(Self {
            state: Mutex::new(State {
                config,
                config_path,
                registry,
                active: None,
            }),
        })
    }

    /// Resolve `model_name` (or the configured/discovered default) to a
    /// running [`Proxy`], starting or switching the subprocess as needed.
    pub async fn get_model(&self, model_name: Option<&str>) -> Result<Arc<Proxy>> {
        let mut state = self.state.lock().await;

        let resolved = match model_name {
            Some(name) => name.to_string(),
            None => self.default_model(&state)?,
        };

        if !state.registry.contains(&resolved) {
            return Err(GatewayError::UnknownModel(resolved));
        }

        if let Some(active) = &state.active {
            if active.model_name == resolved && active.proxy.is_alive().await {
                return Ok(Arc::clone(&active.proxy));
            }
        }

        if let Some(active) = state.active.take() {
            info!(
                "switching from {} to {resolved}",
                active.model_name
            );
            active.proxy.shutdown().await;
        }

        let entry = state
            .registry
            .get(&resolved)
            .ok_or_else(|| GatewayError::UnknownModel(resolved.clone()))?
            .clone();

        let proxy = Arc::new(Proxy::new(resolved.clone(), entry.path.clone()));
        // The LOAD wait happens inside this same critical section: a
        // second caller requesting the same model blocks on `state` until
        // this either succeeds (and observes `active`) or fails (and can
        // retry), never spawning a redundant subprocess.
        proxy.start(&state.config, &state.config_path).await?;

        state.active = Some(ActiveSlot {
            model_name: resolved,
            proxy: Arc::clone(&proxy),
        });

        Ok(proxy)
    }

    fn default_model(&self, state: &State) -> Result<String> {
        if let Some(name) = &state.config.model_manager.default_model {
            return Ok(name.trim_end_matches(".gguf").to_string());
        }
        state
            .registry
            .first_alphabetical()
            .map(String::from)
            .ok_or_else(|| GatewayError::UnknownModel("<no models discovered>".to_string()))
    }

    /// Unload `model_name` if it is the active one (or unload the active
    /// model regardless, when `model_name` is `None`). Returns `Ok(true)`
    /// if a subprocess was actually torn down, `Ok(false)` if the named
    /// model is known but not the active one, and `Err(UnknownModel)` if
    /// the name isn't registered at all (SPEC_FULL.md §9 decided Open
    /// Question).
    pub async fn unload_model(&self, model_name: Option<&str>) -> Result<bool> {
        let mut state = self.state.lock().await;

        if let Some(name) = model_name {
            if !state.registry.contains(name) {
                return Err(GatewayError::UnknownModel(name.to_string()));
            }
            let is_active = state.active.as_ref().is_some_and(|a| a.model_name == name);
            if !is_active {
                return Ok(false);
            }
        }

        match state.active.take() {
            Some(active) => {
                active.proxy.shutdown().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn unload_all_models(&self) -> usize {
        match self.unload_model(None).await {
            Ok(true) => 1,
            _ => 0,
        }
    }

    /// Forward a stop signal to the active model's worker. Does not hold
    /// the same lock as `generate`/`generate_stream` on the proxy itself —
    /// only the supervisor's own bookkeeping lock, held briefly to read
    /// `active` (SPEC_FULL.md §4.4/§4.3).
    pub async fn stop_generation(&self) -> Result<bool> {
        let active = { self.state.lock().await.active.as_ref().map(|a| Arc::clone(&a.proxy)) };
        match active {
            Some(proxy) => {
                proxy.stop_generation().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Called periodically by [`crate::reaper`]. Unloads the active model
    /// if it has been idle longer than `idle_timeout`, returning its name
    /// if it was evicted.
    pub async fn unload_idle_models(&self, idle_timeout: Duration) -> Vec<String> {
        let mut state = self.state.lock().await;
        let Some(active) = &state.active else {
            return Vec::new();
        };

        let idle_for = Instant::now().saturating_duration_since(active.proxy.last_used().await);
        if idle_for <= idle_timeout {
            return Vec::new();
        }

        let name = active.model_name.clone();
        info!("auto-unloading '{name}' (idle for {idle_for:?})");
        let active = state.active.take().expect("checked Some above");
        active.proxy.shutdown().await;
        vec![name]
    }

    pub async fn list_models(&self) -> Vec<ModelStatus> {
        self.get_model_status().await
    }

    pub async fn get_model_status(&self) -> Vec<ModelStatus> {
        let state = self.state.lock().await;
        let active_last_used = match &state.active {
            Some(active) => Some(active.proxy.last_used().await),
            None => None,
        };

        let mut statuses = Vec::new();
        for entry in state.registry.iter() {
            let loaded = state.active.as_ref().is_some_and(|a| a.model_name == entry.name);
            let idle_seconds = if loaded {
                active_last_used.map(|last_used| Instant::now().saturating_duration_since(last_used).as_secs())
            } else {
                None
            };
            statuses.push(ModelStatus {
                name: entry.name.clone(),
                filename: entry.filename.clone(),
                loaded,
                idle_seconds,
            });
        }
        statuses
    }

    /// Replace the configuration wholesale and rediscover models,
    /// shutting down any active subprocess first (`update_config` in the
    /// Python original).
    pub async fn update_config(&self, config: GatewayConfig) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(active) = state.active.take() {
            active.proxy.shutdown().await;
        }
        state.registry = ModelRegistry::scan(&config.model_manager.models_directory)?;
        state.config = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelManagerConfig;
    use std::collections::HashMap;

    fn test_config(models_directory: PathBuf) -> GatewayConfig {
        GatewayConfig {
            model_manager: ModelManagerConfig {
                models_directory,
                default_model: None,
                n_ctx: 2048,
                n_gpu_layers: 0,
                n_threads: 4,
                check_interval: 30,
                idle_timeout: 600,
            },
            model_settings: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn unknown_model_name_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.gguf"), b"").unwrap();
        let supervisor = Supervisor::new(test_config(dir.path().to_path_buf()), PathBuf::from("cfg.json")).unwrap();

        let result = supervisor.unload_model(Some("nonexistent")).await;
        assert!(matches!(result, Err(GatewayError::UnknownModel(_))));
    }

    #[tokio::test]
    async fn unload_with_nothing_active_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.gguf"), b"").unwrap();
        let supervisor = Supervisor::new(test_config(dir.path().to_path_buf()), PathBuf::from("cfg.json")).unwrap();

        assert!(!supervisor.unload_model(None).await.unwrap());
    }
}
