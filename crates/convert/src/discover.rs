//! Locating checkpoint files in a HuggingFace-style model directory

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ConvertError, Result};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILES: [&str; 2] = ["tokenizer.model", "tokenizer.json"];
const WEIGHT_EXTENSIONS: [&str; 2] = ["safetensors", "bin"];

/// Input files of one conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    /// Weight files in merge order
    pub models: Vec<PathBuf>,
}

impl CheckpointFiles {
    /// Find every input inside `dir`
    pub fn discover<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::resolve(Some(dir.as_ref()), None, None, Vec::new())
    }

    /// Use the explicit paths where given and search `dir` for the rest
    pub fn resolve(
        dir: Option<&Path>,
        config: Option<PathBuf>,
        tokenizer: Option<PathBuf>,
        models: Vec<PathBuf>,
    ) -> Result<Self> {
        let config = match config {
            Some(path) => path,
            None => find_config(require_dir(dir, "config")?)?,
        };
        let tokenizer = match tokenizer {
            Some(path) => path,
            None => find_tokenizer(require_dir(dir, "tokenizer")?)?,
        };
        let models = if models.is_empty() {
            find_models(require_dir(dir, "models")?)?
        } else {
            models
        };

        debug!(
            "Inputs: config {}, tokenizer {}, {} weight files",
            config.display(),
            tokenizer.display(),
            models.len()
        );
        Ok(Self {
            config,
            tokenizer,
            models,
        })
    }
}

fn require_dir<'a>(dir: Option<&'a Path>, field: &str) -> Result<&'a Path> {
    dir.ok_or_else(|| {
        ConvertError::config(field, "must be given explicitly when no input directory is specified")
    })
}

fn find_config(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(CONFIG_FILE);
    if path.is_file() {
        Ok(path)
    } else {
        Err(ConvertError::config(
            "config",
            format!("no {} found in {}", CONFIG_FILE, dir.display()),
        ))
    }
}

/// `tokenizer.model` wins over `tokenizer.json`
fn find_tokenizer(dir: &Path) -> Result<PathBuf> {
    TOKENIZER_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            ConvertError::config(
                "tokenizer",
                format!("no tokenizer.model or tokenizer.json found in {}", dir.display()),
            )
        })
}

/// All `.safetensors` files, or all `.bin` files if there are none, sorted
fn find_models(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            entries.push(path);
        }
    }
    entries.sort();

    for ext in WEIGHT_EXTENSIONS {
        let found: Vec<PathBuf> = entries
            .iter()
            .filter(|p| p.extension().map_or(false, |e| e == ext))
            .cloned()
            .collect();
        if !found.is_empty() {
            return Ok(found);
        }
    }

    Err(ConvertError::config(
        "models",
        format!("no .safetensors or .bin files found in {}", dir.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn test_discover_prefers_safetensors_and_sentencepiece() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "config.json",
            "tokenizer.json",
            "tokenizer.model",
            "model-00002-of-00002.safetensors",
            "model-00001-of-00002.safetensors",
            "pytorch_model.bin",
        ] {
            touch(dir.path(), name);
        }

        let files = CheckpointFiles::discover(dir.path()).unwrap();
        assert_eq!(files.config, dir.path().join("config.json"));
        assert_eq!(files.tokenizer, dir.path().join("tokenizer.model"));
        assert_eq!(
            files.models,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn test_discover_falls_back_to_bin() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["config.json", "tokenizer.json", "pytorch_model.bin", "README.md"] {
            touch(dir.path(), name);
        }
        let files = CheckpointFiles::discover(dir.path()).unwrap();
        assert_eq!(files.tokenizer, dir.path().join("tokenizer.json"));
        assert_eq!(files.models, vec![dir.path().join("pytorch_model.bin")]);
    }

    #[test]
    fn test_discover_reports_what_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json");
        touch(dir.path(), "tokenizer.model");
        match CheckpointFiles::discover(dir.path()) {
            Err(ConvertError::Config { field, .. }) => assert_eq!(field, "models"),
            other => panic!("expected missing models, got {:?}", other),
        }
    }

    #[test]
    fn test_explicit_paths_override() {
        let files = CheckpointFiles::resolve(
            None,
            Some("a/config.json".into()),
            Some("b/tok.json".into()),
            vec!["c/w.safetensors".into()],
        )
        .unwrap();
        assert_eq!(files.tokenizer, PathBuf::from("b/tok.json"));
    }

    #[test]
    fn test_explicit_paths_required_without_dir() {
        let err = CheckpointFiles::resolve(None, Some("config.json".into()), None, Vec::new()).unwrap_err();
        assert!(matches!(err, ConvertError::Config { field, .. } if field == "tokenizer"));
    }
}
