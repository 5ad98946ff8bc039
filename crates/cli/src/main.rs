//! lmpack CLI
//!
//! Converts a HuggingFace Llama checkpoint into a single lmpack artifact.
//!
//! # Usage
//!
//! ```bash
//! # Autodetect everything inside a checkpoint directory
//! lmpack model.lmpack ./TinyLlama-1.1B-Chat-v1.0
//!
//! # Explicit inputs, fp8 matmul weights
//! lmpack model.lmpack --config config.json --tokenizer tokenizer.model \
//!     --models model-00001.safetensors model-00002.safetensors --dtype fp8
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lmpack_convert::{CheckpointFiles, ConvertOptions, Pipeline, WeightDtype};

#[derive(Parser)]
#[command(name = "lmpack")]
#[command(version)]
#[command(about = "Convert a HuggingFace Llama checkpoint into an lmpack artifact")]
struct Cli {
    /// Output artifact path
    output: PathBuf,

    /// Checkpoint directory to search for inputs not given explicitly
    input_dir: Option<PathBuf>,

    /// Path to config.json
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to tokenizer.model or tokenizer.json
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Weight files (.safetensors or .bin), merged in order
    #[arg(long, num_args = 1..)]
    models: Vec<PathBuf>,

    /// Matmul weight precision: fp16 or fp8
    #[arg(long, env = "LMPACK_DTYPE", default_value = "fp16")]
    dtype: WeightDtype,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lmpack_convert=info,lmpack=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let files = CheckpointFiles::resolve(
        cli.input_dir.as_deref(),
        cli.config,
        cli.tokenizer,
        cli.models,
    )
    .context("failed to locate checkpoint inputs")?;

    tracing::info!("lmpack v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Output dtype: {}", cli.dtype);

    let start = Instant::now();
    let summary = Pipeline::new(ConvertOptions {
        output: cli.output,
        files,
        dtype: cli.dtype,
    })
    .run()
    .context("conversion failed")?;

    tracing::info!(
        "Done: {} tensors, {} bytes in {} ({:.1?})",
        summary.tensor_count,
        summary.file_size_bytes,
        summary.path.display(),
        start.elapsed()
    );
    Ok(())
}
