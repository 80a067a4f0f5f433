//! Configuration loading with JSON file support and environment variable overrides.
//!
//! Pattern: `DARRAY_*` environment variables override config file values.
//! Example: `DARRAY_WORLD_SIZE=4` overrides `cluster.world_size`.

use crate::utils::error::{DArrayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Process group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of ranks in the group
    #[serde(default = "default_world_size")]
    pub world_size: usize,

    /// Communication backend ("local" is the in-process backend)
    #[serde(default = "default_backend")]
    pub backend: String,
}

/// Array defaults used by the demo session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayConfig {
    /// Partitioned axis; `None` keeps arrays local
    #[serde(default = "default_partition_dim")]
    pub partition_dim: Option<usize>,

    /// Extents of the demo array
    #[serde(default = "default_extents")]
    pub default_extents: Vec<usize>,
}

/// Dot benchmark sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default = "default_m")]
    pub m: usize,

    #[serde(default = "default_k")]
    pub k: usize,

    #[serde(default = "default_n")]
    pub n: usize,

    #[serde(default = "default_iterations")]
    pub iterations: usize,
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DArrayConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub array: ArrayConfig,

    #[serde(default)]
    pub bench: BenchConfig,

    /// Additional key-value configuration
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_world_size() -> usize { 2 }
fn default_backend() -> String { "local".to_string() }
fn default_partition_dim() -> Option<usize> { Some(0) }
fn default_extents() -> Vec<usize> { vec![8, 4] }
fn default_m() -> usize { 128 }
fn default_k() -> usize { 128 }
fn default_n() -> usize { 128 }
fn default_iterations() -> usize { 5 }

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            world_size: default_world_size(),
            backend: default_backend(),
        }
    }
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            partition_dim: default_partition_dim(),
            default_extents: default_extents(),
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            m: default_m(),
            k: default_k(),
            n: default_n(),
            iterations: default_iterations(),
        }
    }
}

impl DArrayConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| DArrayError::Config(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Nested keys use double underscore: `DARRAY_BENCH__ITERATIONS`.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from environment only (no file).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        for (key, value) in env::vars() {
            let Some(stripped) = key.strip_prefix("DARRAY_") else {
                continue;
            };
            let config_key = stripped.to_lowercase();
            let parts: Vec<&str> = config_key.split("__").collect();

            match parts.as_slice() {
                ["cluster", field] => self.apply_cluster_override(field, &value),
                ["array", field] => self.apply_array_override(field, &value),
                ["bench", field] => self.apply_bench_override(field, &value),
                [field] => {
                    self.apply_cluster_override(field, &value);
                    self.apply_array_override(field, &value);
                    self.apply_bench_override(field, &value);
                }
                _ => {
                    debug!(key = %key, "Unknown config key pattern");
                }
            }
        }
    }

    fn apply_cluster_override(&mut self, field: &str, value: &str) {
        match field {
            "world_size" => if let Ok(v) = value.parse() { self.cluster.world_size = v; }
            "backend" => self.cluster.backend = value.to_string(),
            _ => {}
        }
    }

    fn apply_array_override(&mut self, field: &str, value: &str) {
        match field {
            "partition_dim" => {
                self.array.partition_dim = match value.to_lowercase().as_str() {
                    "none" | "local" | "-1" => None,
                    other => other.parse().ok().or(self.array.partition_dim),
                };
            }
            "default_extents" | "extents" => {
                let parsed: std::result::Result<Vec<usize>, _> =
                    value.split(',').map(|s| s.trim().parse::<usize>()).collect();
                if let Ok(extents) = parsed {
                    self.array.default_extents = extents;
                }
            }
            _ => {}
        }
    }

    fn apply_bench_override(&mut self, field: &str, value: &str) {
        match field {
            "m" => if let Ok(v) = value.parse() { self.bench.m = v; }
            "k" => if let Ok(v) = value.parse() { self.bench.k = v; }
            "n" => if let Ok(v) = value.parse() { self.bench.n = v; }
            "iterations" => if let Ok(v) = value.parse() { self.bench.iterations = v; }
            _ => {}
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.world_size == 0 {
            return Err(DArrayError::Config("world_size must be positive".to_string()));
        }

        if self.cluster.backend != "local" {
            return Err(DArrayError::Config(format!(
                "Unknown backend: {}",
                self.cluster.backend
            )));
        }

        if self.array.default_extents.is_empty() {
            return Err(DArrayError::Config("default_extents must not be empty".to_string()));
        }

        if let Some(dim) = self.array.partition_dim {
            if dim >= self.array.default_extents.len() {
                return Err(DArrayError::Config(format!(
                    "partition_dim ({}) out of range for {} dimensions",
                    dim,
                    self.array.default_extents.len()
                )));
            }
        }

        Ok(())
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DArrayError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = DArrayConfig::default();
        assert_eq!(config.cluster.world_size, 2);
        assert_eq!(config.array.partition_dim, Some(0));
        assert_eq!(config.bench.iterations, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("darray.json");

        let mut config = DArrayConfig::default();
        config.array.default_extents = vec![6, 3, 2];
        config.save(&path)?;

        let loaded = DArrayConfig::from_file(&path)?;
        assert_eq!(loaded.array.default_extents, vec![6, 3, 2]);
        assert_eq!(loaded.cluster.backend, "local");

        Ok(())
    }

    #[test]
    fn test_partial_file_uses_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{"cluster": {"world_size": 4}}"#)?;

        let loaded = DArrayConfig::from_file(&path)?;
        assert_eq!(loaded.cluster.world_size, 4);
        assert_eq!(loaded.bench.m, 128);
        Ok(())
    }

    #[test]
    fn test_env_override() {
        env::set_var("DARRAY_BENCH__ITERATIONS", "11");
        env::set_var("DARRAY_ARRAY__PARTITION_DIM", "none");
        env::set_var("DARRAY_ARRAY__EXTENTS", "3, 5");

        let config = DArrayConfig::from_env();
        assert_eq!(config.bench.iterations, 11);
        assert_eq!(config.array.partition_dim, None);
        assert_eq!(config.array.default_extents, vec![3, 5]);

        env::remove_var("DARRAY_BENCH__ITERATIONS");
        env::remove_var("DARRAY_ARRAY__PARTITION_DIM");
        env::remove_var("DARRAY_ARRAY__EXTENTS");
    }

    #[test]
    fn test_validation() {
        let mut config = DArrayConfig::default();
        config.array.partition_dim = Some(2);
        assert!(config.validate().is_err());

        config.array.partition_dim = Some(1);
        assert!(config.validate().is_ok());

        config.cluster.world_size = 0;
        assert!(config.validate().is_err());
    }
}
