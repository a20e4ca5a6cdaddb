//! Runtime configuration for mesh inference

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// Shape of the device mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Number of data-parallel replicas (splits the batch)
    pub data: usize,
    /// Number of model-parallel ranks (splits the weights)
    pub model: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self { data: 1, model: 1 }
    }
}

impl MeshConfig {
    /// Total number of devices
    pub fn num_devices(&self) -> usize {
        self.data * self.model
    }
}

impl FromStr for MeshConfig {
    type Err = CoreError;

    /// Parse `"DxM"` (data x model) or `"M"` (model axis only)
    fn from_str(s: &str) -> Result<Self> {
        let parse = |part: &str| {
            part.trim()
                .parse::<usize>()
                .map_err(|_| CoreError::InvalidConfig(format!("invalid mesh shape: {s:?}")))
        };

        let config = match s.to_lowercase().split_once('x') {
            Some((data, model)) => Self {
                data: parse(data)?,
                model: parse(model)?,
            },
            None => Self {
                data: 1,
                model: parse(s)?,
            },
        };

        if config.data == 0 || config.model == 0 {
            return Err(CoreError::InvalidConfig(format!(
                "mesh axes must be non-zero, got {s:?}"
            )));
        }
        Ok(config)
    }
}

impl std::fmt::Display for MeshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.data, self.model)
    }
}

/// Sampling and length settings for a generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Softmax temperature (0.0 = greedy)
    pub temperature: f32,
    /// Nucleus sampling mass
    pub top_p: f32,
    /// Maximum tokens to generate (defaults to max_seq_len - 1)
    pub max_gen_len: Option<usize>,
    /// RNG seed for sampling
    pub seed: u64,
    /// Record per-token log probabilities
    pub logprobs: bool,
    /// Include the prompt tokens in the output
    pub echo: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.6,
            top_p: 0.9,
            max_gen_len: None,
            seed: 0,
            logprobs: false,
            echo: false,
        }
    }
}

impl GenerationConfig {
    /// Validate sampling parameters
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature >= 0.0) {
            return Err(CoreError::InvalidConfig(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(CoreError::InvalidConfig(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.max_gen_len == Some(0) {
            return Err(CoreError::InvalidConfig(
                "max_gen_len must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding params.json and *.safetensors
    pub ckpt_dir: PathBuf,
    /// Path to tokenizer.json
    pub tokenizer_path: PathBuf,
    /// Static KV cache length (prompt + generation)
    pub max_seq_len: usize,
    /// Static batch size every forward pass runs with
    pub max_batch_size: usize,
    /// Device mesh shape
    pub mesh: MeshConfig,
    /// Store linear weights as INT8
    pub quantize: bool,
    /// Default generation settings
    pub generation: GenerationConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ckpt_dir: PathBuf::from("llama-2-7b-chat"),
            tokenizer_path: PathBuf::from("llama-2-7b-chat/tokenizer.json"),
            max_seq_len: 1024,
            max_batch_size: 8,
            mesh: MeshConfig::default(),
            quantize: false,
            generation: GenerationConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields from `MESHLM_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("MESHLM_CKPT_DIR") {
            self.ckpt_dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("MESHLM_TOKENIZER") {
            self.tokenizer_path = PathBuf::from(path);
        }
        if let Some(n) = env_parse("MESHLM_MAX_SEQ_LEN") {
            self.max_seq_len = n;
        }
        if let Some(n) = env_parse("MESHLM_MAX_BATCH_SIZE") {
            self.max_batch_size = n;
        }
        if let Ok(mesh) = std::env::var("MESHLM_MESH") {
            match mesh.parse() {
                Ok(m) => self.mesh = m,
                Err(e) => tracing::warn!("Ignoring MESHLM_MESH: {}", e),
            }
        }
        if let Ok(q) = std::env::var("MESHLM_QUANTIZE") {
            self.quantize = matches!(q.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(t) = env_parse("MESHLM_TEMPERATURE") {
            self.generation.temperature = t;
        }
        if let Some(p) = env_parse("MESHLM_TOP_P") {
            self.generation.top_p = p;
        }
        if let Some(seed) = env_parse("MESHLM_SEED") {
            self.generation.seed = seed;
        }
    }

    /// Validate sizes against the mesh
    pub fn validate(&self) -> Result<()> {
        if self.max_seq_len == 0 {
            return Err(CoreError::InvalidConfig("max_seq_len must be positive".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(CoreError::InvalidConfig(
                "max_batch_size must be positive".to_string(),
            ));
        }
        if self.mesh.data == 0 || self.mesh.model == 0 {
            return Err(CoreError::InvalidConfig(format!(
                "mesh axes must be non-zero, got {}x{}",
                self.mesh.data, self.mesh.model
            )));
        }
        if self.max_batch_size % self.mesh.data != 0 {
            return Err(CoreError::InvalidConfig(format!(
                "max_batch_size ({}) must be divisible by the data axis ({})",
                self.max_batch_size, self.mesh.data
            )));
        }
        self.generation.validate()
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CoreError::InvalidConfig(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_parse() {
        assert_eq!("2x4".parse::<MeshConfig>().unwrap(), MeshConfig { data: 2, model: 4 });
        assert_eq!("4".parse::<MeshConfig>().unwrap(), MeshConfig { data: 1, model: 4 });
        assert_eq!("1X8".parse::<MeshConfig>().unwrap(), MeshConfig { data: 1, model: 8 });
        assert!("0x4".parse::<MeshConfig>().is_err());
        assert!("two".parse::<MeshConfig>().is_err());
        assert_eq!(MeshConfig { data: 2, model: 4 }.to_string(), "2x4");
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_seq_len, 1024);
        assert_eq!(config.max_batch_size, 8);
        config.validate().unwrap();
    }

    #[test]
    fn test_batch_must_divide_data_axis() {
        let config = RuntimeConfig {
            max_batch_size: 6,
            mesh: MeshConfig { data: 4, model: 1 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_mesh_axis_from_toml_is_rejected() {
        let config: RuntimeConfig = toml::from_str("[mesh]\ndata = 0\nmodel = 1\n").unwrap();
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig(_))));

        let config: RuntimeConfig = toml::from_str("[mesh]\ndata = 1\nmodel = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig(_))));
    }

    // The only test in this crate that touches MESHLM_* variables
    #[test]
    fn test_env_overrides() {
        std::env::set_var("MESHLM_CKPT_DIR", "/models/llama-2-7b-chat");
        std::env::set_var("MESHLM_MAX_SEQ_LEN", "512");
        std::env::set_var("MESHLM_MAX_BATCH_SIZE", "4");
        std::env::set_var("MESHLM_MESH", "2x2");
        std::env::set_var("MESHLM_QUANTIZE", "TRUE");
        std::env::set_var("MESHLM_TEMPERATURE", "0.5");
        std::env::set_var("MESHLM_SEED", "42");

        let config = RuntimeConfig::from_env();
        assert_eq!(config.ckpt_dir, PathBuf::from("/models/llama-2-7b-chat"));
        assert_eq!(config.max_seq_len, 512);
        assert_eq!(config.max_batch_size, 4);
        assert_eq!(config.mesh, MeshConfig { data: 2, model: 2 });
        assert!(config.quantize);
        assert_eq!(config.generation.temperature, 0.5);
        assert_eq!(config.generation.seed, 42);
        assert_eq!(config.generation.top_p, 0.9);

        // Malformed values leave the previous setting in place
        std::env::set_var("MESHLM_MESH", "2by2");
        std::env::set_var("MESHLM_MAX_SEQ_LEN", "lots");
        let config = RuntimeConfig::from_env();
        assert_eq!(config.mesh, MeshConfig::default());
        assert_eq!(config.max_seq_len, 1024);

        for key in [
            "MESHLM_CKPT_DIR",
            "MESHLM_MAX_SEQ_LEN",
            "MESHLM_MAX_BATCH_SIZE",
            "MESHLM_MESH",
            "MESHLM_QUANTIZE",
            "MESHLM_TEMPERATURE",
            "MESHLM_SEED",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_generation_validation() {
        let mut gen = GenerationConfig::default();
        gen.validate().unwrap();

        gen.top_p = 0.0;
        assert!(gen.validate().is_err());

        gen.top_p = 0.9;
        gen.temperature = -1.0;
        assert!(gen.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshlm.toml");

        let config = RuntimeConfig {
            max_seq_len: 512,
            mesh: MeshConfig { data: 2, model: 2 },
            quantize: true,
            ..Default::default()
        };
        config.to_file(&path).unwrap();

        let loaded = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.max_seq_len, 512);
        assert_eq!(loaded.mesh, MeshConfig { data: 2, model: 2 });
        assert!(loaded.quantize);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RuntimeConfig = toml::from_str("max_batch_size = 4\n").unwrap();
        assert_eq!(config.max_batch_size, 4);
        assert_eq!(config.max_seq_len, 1024);
        assert_eq!(config.generation.top_p, 0.9);
    }
}
