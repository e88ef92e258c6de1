//! Configuration and model discovery (SPEC_FULL.md §6), exercised against
//! real temp-directory files rather than mocks, since both are thin
//! wrappers over `std::fs`.

use llama_gateway_core::config::GatewayConfig;
use llama_gateway_core::registry::ModelRegistry;

#[test]
fn config_load_applies_per_model_overrides_only_to_their_model() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    std::fs::write(
        &config_path,
        r#"{
            "model_manager": {
                "models_directory": "/models",
                "default_model": "llama-7b",
                "n_ctx": 4096,
                "n_gpu_layers": -1,
                "n_threads": 8,
                "check_interval": 60,
                "idle_timeout": 900
            },
            "model_settings": {
                "llama-7b": { "n_ctx": 8192, "offload_kqv": false }
            }
        }"#,
    )
    .unwrap();

    let config = GatewayConfig::load(&config_path).unwrap();
    assert_eq!(config.model_manager.default_model.as_deref(), Some("llama-7b"));

    let overridden = config.effective_load_params("llama-7b");
    assert_eq!(overridden.n_ctx, 8192);
    assert!(!overridden.offload_kqv);

    let defaulted = config.effective_load_params("mistral-7b");
    assert_eq!(defaulted.n_ctx, 4096);
    assert!(defaulted.offload_kqv);
}

#[test]
fn config_load_surfaces_parse_errors_rather_than_silently_defaulting() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    std::fs::write(&config_path, b"not json").unwrap();

    assert!(GatewayConfig::load(&config_path).is_err());
}

#[test]
fn registry_scan_ignores_non_gguf_files_and_is_case_sensitive_on_suffix() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("llama-7b.gguf"), b"").unwrap();
    std::fs::write(dir.path().join("mistral-7b.GGUF"), b"").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
    std::fs::create_dir(dir.path().join("subdir.gguf")).unwrap();

    let registry = ModelRegistry::scan(dir.path()).unwrap();
    assert!(registry.contains("llama-7b"));
    assert!(!registry.contains("mistral-7b"), "uppercase .GGUF suffix should not match");
    assert!(!registry.contains("notes"));
    assert_eq!(registry.iter().count(), 1, "directories named *.gguf are not files");
}
