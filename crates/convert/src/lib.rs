//! lmpack checkpoint conversion
//!
//! Turns a HuggingFace-layout Llama checkpoint (config.json, a SentencePiece
//! or BPE tokenizer, and one or more weight files) into a single safetensors
//! artifact with tokenizer tensors, renamed weights and string metadata.

mod artifact;
mod config;
mod discover;
mod error;
mod layout;
mod loader;
mod pipeline;
mod sentencepiece;
mod tensor;
mod tokenizer;

pub use artifact::{Artifact, ArtifactSummary, ArtifactWriter, Metadata};
pub use config::{HfConfig, ModelConfig, REQUIRED_HIDDEN_ACT, REQUIRED_RMS_NORM_EPS};
pub use discover::CheckpointFiles;
pub use error::{ConvertError, Result};
pub use layout::{permute, permute_reverse, LayoutTransformer, OutputTensorSet, TENSORS_PER_LAYER};
pub use loader::{WeightFormat, WeightStore};
pub use pipeline::{convert, ConvertOptions, Pipeline};
pub use sentencepiece::{ModelProto, SentencePiece, TrainerSpec, UnigramModel};
pub use tensor::{DType, Tensor, WeightDtype};
pub use tokenizer::{
    BpeModel, TokenRecord, TokenizerSource, Vocabulary, SCORES_TENSOR, TOKENS_TENSOR,
};
