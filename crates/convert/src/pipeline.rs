//! End-to-end checkpoint conversion

use std::path::PathBuf;

use tracing::info;

use crate::artifact::{ArtifactSummary, ArtifactWriter};
use crate::config::ModelConfig;
use crate::discover::CheckpointFiles;
use crate::error::Result;
use crate::layout::{LayoutTransformer, OutputTensorSet};
use crate::loader::WeightStore;
use crate::tensor::WeightDtype;
use crate::tokenizer::{TokenizerSource, Vocabulary};

/// Everything one conversion needs
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Artifact path
    pub output: PathBuf,
    /// Checkpoint inputs
    pub files: CheckpointFiles,
    /// Precision of matmul weights
    pub dtype: WeightDtype,
}

/// Runs config validation, vocabulary and weight loading, layout conversion
/// and artifact writing in order. The first error aborts the run.
pub struct Pipeline {
    options: ConvertOptions,
}

impl Pipeline {
    pub fn new(options: ConvertOptions) -> Self {
        Self { options }
    }

    pub fn run(&self) -> Result<ArtifactSummary> {
        let files = &self.options.files;

        // Reject an unavailable output dtype before reading anything
        let weight_dtype = self.options.dtype;
        weight_dtype.dtype()?;

        info!("Loading config from {}", files.config.display());
        let config = ModelConfig::from_json_file(&files.config)?;
        info!(
            "  dim {}, hidden_dim {}, {} layers, {}/{} heads, vocab {}",
            config.hidden_size,
            config.intermediate_size,
            config.num_hidden_layers,
            config.num_attention_heads,
            config.num_key_value_heads,
            config.vocab_size
        );

        info!("Loading tokenizer from {}", files.tokenizer.display());
        let source = TokenizerSource::from_file(&files.tokenizer)?;
        let vocabulary = Vocabulary::build(&source, &config)?;
        drop(source);

        info!("Loading weights from {} files", files.models.len());
        let weights = WeightStore::from_files(&files.models)?;

        let mut output = OutputTensorSet::new();
        vocabulary.insert_into(&mut output)?;
        LayoutTransformer::new(&config, weight_dtype)?.transform_into(&weights, &mut output)?;
        drop(weights);
        info!(
            "Prepared {} tensors ({:.2} MB)",
            output.len(),
            output.total_size_bytes() as f64 / 1_000_000.0
        );

        ArtifactWriter::new(&self.options.output).write(&output, &config.metadata())
    }
}

/// Convert one checkpoint
pub fn convert(options: ConvertOptions) -> Result<ArtifactSummary> {
    Pipeline::new(options).run()
}
