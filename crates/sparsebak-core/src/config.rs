//! On-disk defaults for the three CLI binaries, loaded from an optional
//! `sparsebak.toml`. CLI flags always take precedence over a configured
//! default; this module only supplies what a flag falls back to when
//! omitted.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    pub worker: Option<usize>,
    pub compress: Option<bool>,
    pub chunk_size: Option<u64>,
    pub scratchdir: Option<String>,
    pub socketfile: Option<String>,
}

impl Config {
    /// Loads configuration from `path`. Returns the default (all-`None`)
    /// configuration if `path` does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
        toml::from_str(&text)
            .map_err(|e| Error::config(format!("failed to parse '{}': {e}", path.display())))
    }

    pub fn worker_or(&self, default: usize) -> usize {
        self.worker.unwrap_or(default)
    }

    pub fn compress_or(&self, default: bool) -> bool {
        self.compress.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("sparsebak.toml")).unwrap();
        assert_eq!(config.worker, None);
    }

    #[test]
    fn loads_configured_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sparsebak.toml");
        fs::write(&path, "worker = 4\ncompress = true\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.worker_or(1), 4);
        assert!(config.compress_or(false));
    }
}
