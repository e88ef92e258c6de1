//! Model registry: the mapping from logical model name to on-disk `.gguf`
//! file (SPEC_FULL.md §3, §6 "Models directory format").

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{GatewayError, Result};

/// One `.gguf` file discovered in the models directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub name: String,
    pub path: PathBuf,
    pub filename: String,
}

/// Immutable-between-reloads mapping of logical name to registry entry.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl ModelRegistry {
    /// Scan `models_directory` for regular files ending in `.gguf`. Any file
    /// not matching that suffix is ignored (§6). The returned registry is a
    /// fresh snapshot — callers that need atomic replacement should swap the
    /// whole `ModelRegistry`, not mutate one in place.
    pub fn scan(models_directory: &Path) -> Result<Self> {
        let read_dir = std::fs::read_dir(models_directory).map_err(|e| {
            GatewayError::ModelFileMissing(format!(
                "models directory {} unreadable: {e}",
                models_directory.display()
            ))
        })?;

        let mut entries = BTreeMap::new();
        for dir_entry in read_dir.flatten() {
            let path = dir_entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !filename.ends_with(".gguf") {
                continue;
            }
            let name = filename.trim_end_matches(".gguf").to_string();
            entries.insert(
                name.clone(),
                RegistryEntry {
                    name,
                    path: path.clone(),
                    filename: filename.to_string(),
                },
            );
        }

        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First model alphabetically — the fallback default when no
    /// `model_manager.default_model` key is configured (§6).
    pub fn first_alphabetical(&self) -> Option<&str> {
        self.entries.keys().next().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_picks_up_only_gguf_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.gguf"), b"").unwrap();
        std::fs::write(dir.path().join("b.gguf"), b"").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"").unwrap();

        let registry = ModelRegistry::scan(dir.path()).unwrap();
        assert!(registry.contains("a"));
        assert!(registry.contains("b"));
        assert!(!registry.contains("readme"));
        assert_eq!(registry.iter().count(), 2);
    }

    #[test]
    fn first_alphabetical_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zeta.gguf"), b"").unwrap();
        std::fs::write(dir.path().join("alpha.gguf"), b"").unwrap();

        let registry = ModelRegistry::scan(dir.path()).unwrap();
        assert_eq!(registry.first_alphabetical(), Some("alpha"));
    }
}
