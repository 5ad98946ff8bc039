//! Checkpoint hyperparameter configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::artifact::Metadata;
use crate::error::{ConvertError, Result};

/// Activation function the inference engine implements.
pub const REQUIRED_HIDDEN_ACT: &str = "silu";

/// RMS norm epsilon the inference engine is compiled with.
pub const REQUIRED_RMS_NORM_EPS: f64 = 1e-5;

/// Hyperparameter record as found in a HuggingFace `config.json`.
///
/// Every field is optional at parse time so that a missing field can be
/// reported by name during [`HfConfig::validate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HfConfig {
    /// Hidden size (embedding dimension)
    pub hidden_size: Option<usize>,

    /// Intermediate size (FFN hidden dimension)
    pub intermediate_size: Option<usize>,

    /// Number of transformer layers
    pub num_hidden_layers: Option<usize>,

    /// Number of attention heads
    pub num_attention_heads: Option<usize>,

    /// Number of key-value heads (for GQA)
    pub num_key_value_heads: Option<usize>,

    /// Vocabulary size
    pub vocab_size: Option<usize>,

    /// Beginning-of-sequence token id. Kept as raw JSON because some
    /// checkpoints list several ids here.
    pub bos_token_id: Option<serde_json::Value>,

    /// End-of-sequence token id, same shape as `bos_token_id`
    pub eos_token_id: Option<serde_json::Value>,

    /// Activation function name
    pub hidden_act: Option<String>,

    /// RMS norm epsilon
    pub rms_norm_eps: Option<f64>,

    /// RoPE theta, kept as the literal JSON number
    pub rope_theta: Option<serde_json::Number>,
}

impl HfConfig {
    /// Load config from a JSON file (config.json from HuggingFace)
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        Ok(config)
    }

    /// Check required fields and the hardcoded engine invariants.
    pub fn validate(self) -> Result<ModelConfig> {
        let hidden_act = required(self.hidden_act, "hidden_act")?;
        if hidden_act != REQUIRED_HIDDEN_ACT {
            return Err(ConvertError::config(
                "hidden_act",
                format!("expected \"{}\", got \"{}\"", REQUIRED_HIDDEN_ACT, hidden_act),
            ));
        }

        let rms_norm_eps = required(self.rms_norm_eps, "rms_norm_eps")?;
        if rms_norm_eps != REQUIRED_RMS_NORM_EPS {
            return Err(ConvertError::config(
                "rms_norm_eps",
                format!("expected {:e}, got {:e}", REQUIRED_RMS_NORM_EPS, rms_norm_eps),
            ));
        }

        let config = ModelConfig {
            hidden_size: required(self.hidden_size, "hidden_size")?,
            intermediate_size: required(self.intermediate_size, "intermediate_size")?,
            num_hidden_layers: required(self.num_hidden_layers, "num_hidden_layers")?,
            num_attention_heads: nonzero(self.num_attention_heads, "num_attention_heads")?,
            num_key_value_heads: nonzero(self.num_key_value_heads, "num_key_value_heads")?,
            vocab_size: required(self.vocab_size, "vocab_size")?,
            bos_token_id: token_id(self.bos_token_id, "bos_token_id")?,
            eos_token_id: token_id(self.eos_token_id, "eos_token_id")?,
            hidden_act,
            rms_norm_eps,
            rope_theta: self.rope_theta,
        };

        Ok(config)
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| ConvertError::config(field, "required field is missing"))
}

/// A single non-negative id that fits in `u32`
fn token_id(value: Option<serde_json::Value>, field: &str) -> Result<u32> {
    let value = required(value, field)?;
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| {
            ConvertError::config(field, format!("expected a single token id, got {}", value))
        })
}

fn nonzero(value: Option<usize>, field: &str) -> Result<usize> {
    match required(value, field)? {
        0 => Err(ConvertError::config(field, "must be greater than zero")),
        n => Ok(n),
    }
}

/// Validated model configuration. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub vocab_size: usize,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    pub hidden_act: String,
    pub rms_norm_eps: f64,
    pub rope_theta: Option<serde_json::Number>,
}

impl ModelConfig {
    /// Load and validate a `config.json`
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        HfConfig::from_json_file(path)?.validate()
    }

    /// Customizable fields, stringified for the artifact header.
    ///
    /// `rope_theta` appears only when the source config declares it.
    pub fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("dim".into(), self.hidden_size.to_string());
        metadata.insert("hidden_dim".into(), self.intermediate_size.to_string());
        metadata.insert("n_layers".into(), self.num_hidden_layers.to_string());
        metadata.insert("n_heads".into(), self.num_attention_heads.to_string());
        metadata.insert("n_kv_heads".into(), self.num_key_value_heads.to_string());
        metadata.insert("vocab_size".into(), self.vocab_size.to_string());
        metadata.insert("bos_token_id".into(), self.bos_token_id.to_string());
        metadata.insert("eos_token_id".into(), self.eos_token_id.to_string());
        if let Some(theta) = &self.rope_theta {
            metadata.insert("rope_theta".into(), theta.to_string());
        }
        metadata
    }
}
