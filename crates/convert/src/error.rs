//! Conversion error types

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Config error in `{field}`: {reason}")]
    Config { field: String, reason: String },

    #[error("Tokenizer size error: {0}")]
    TokenizerSize(String),

    #[error("Tokenizer {which} id mismatch: tokenizer has {tokenizer}, config has {config}")]
    TokenizerIdMismatch {
        which: &'static str,
        tokenizer: i64,
        config: i64,
    },

    #[error("Unsupported tokenizer format: {0}")]
    UnsupportedTokenizerFormat(String),

    #[error("Invalid token {id}: {reason}")]
    InvalidToken { id: usize, reason: String },

    #[error("Invalid merge rule #{index} ({rule:?}): {reason}")]
    MergeRule {
        index: usize,
        rule: String,
        reason: String,
    },

    #[error("Unsupported model format: {}", .0.display())]
    UnsupportedModelFormat(PathBuf),

    #[error("Duplicate weight key: {0}")]
    DuplicateWeightKey(String),

    #[error("Missing weight: {0}")]
    MissingWeight(String),

    #[error("Shape error for {name}: {reason}")]
    Shape { name: String, reason: String },

    #[error("Unsupported data type for {name}: {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("Safetensors error: {0}")]
    Safetensors(String),

    #[error("Pickle error: {0}")]
    Pickle(String),

    #[error("Protobuf error: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    pub(crate) fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Shape {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<safetensors::SafeTensorError> for ConvertError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Self::Safetensors(e.to_string())
    }
}

#[cfg(feature = "pytorch")]
impl From<candle_core::Error> for ConvertError {
    fn from(e: candle_core::Error) -> Self {
        Self::Pickle(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;
