//! Artifact serialization
//!
//! The artifact is a safetensors file: a JSON header listing every tensor's
//! name, dtype, shape and byte range, a `__metadata__` map of strings, then the
//! concatenated tensor data. It is written to a temporary file next to the
//! destination and renamed into place only once complete.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use safetensors::SafeTensors;
use tracing::info;

use crate::error::{ConvertError, Result};
use crate::layout::OutputTensorSet;
use crate::tensor::{DType, Tensor};

/// String-only header metadata
pub type Metadata = BTreeMap<String, String>;

/// What was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSummary {
    pub path: PathBuf,
    pub tensor_count: usize,
    pub file_size_bytes: u64,
}

/// Writes an [`OutputTensorSet`] and its metadata to one file
pub struct ArtifactWriter {
    path: PathBuf,
}

impl ArtifactWriter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize everything, then atomically move it onto the output path.
    ///
    /// On error the temporary file is removed and the output path is untouched.
    pub fn write(&self, tensors: &OutputTensorSet, metadata: &Metadata) -> Result<ArtifactSummary> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let tmp = tempfile::Builder::new()
            .prefix(".lmpack-")
            .suffix(".partial")
            .tempfile_in(dir)?;

        let header: HashMap<String, String> = metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        safetensors::serialize_to_file(tensors.iter(), &Some(header), tmp.path())?;
        tmp.as_file().sync_all()?;

        tmp.persist(&self.path).map_err(|e| ConvertError::Io(e.error))?;
        let file_size_bytes = fs::metadata(&self.path)?.len();

        info!(
            "Wrote {} tensors ({:.2} MB) to {}",
            tensors.len(),
            file_size_bytes as f64 / 1_000_000.0,
            self.path.display()
        );

        Ok(ArtifactSummary {
            path: self.path.clone(),
            tensor_count: tensors.len(),
            file_size_bytes,
        })
    }
}

/// Read-back view of a written artifact
pub struct Artifact {
    data: Vec<u8>,
}

impl Artifact {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path)?;
        // Validate the header once up front
        SafeTensors::deserialize(&data)?;
        Ok(Self { data })
    }

    /// Header metadata; empty if the file has none
    pub fn metadata(&self) -> Result<Metadata> {
        let (_, header) = SafeTensors::read_metadata(&self.data)?;
        Ok(header
            .metadata()
            .as_ref()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    /// Tensor names, sorted
    pub fn tensor_names(&self) -> Result<Vec<String>> {
        let tensors = SafeTensors::deserialize(&self.data)?;
        let mut names: Vec<String> = tensors.names().into_iter().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn tensor(&self, name: &str) -> Result<Tensor> {
        let tensors = SafeTensors::deserialize(&self.data)?;
        let view = tensors
            .tensor(name)
            .map_err(|_| ConvertError::MissingWeight(name.to_string()))?;
        let dtype = DType::from_safetensors(view.dtype());
        Tensor::new(dtype, view.shape().to_vec(), view.data().to_vec())
    }

    pub fn tensor_count(&self) -> Result<usize> {
        Ok(SafeTensors::deserialize(&self.data)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (OutputTensorSet, Metadata) {
        let mut tensors = OutputTensorSet::new();
        tensors
            .insert("tokenizer.tokens", Tensor::from_u8(b"a\0bc\0".to_vec()))
            .unwrap();
        tensors
            .insert("model.norm.weight", Tensor::from_f32(vec![3], &[0.5, 1.0, -1.5]).unwrap())
            .unwrap();
        tensors
            .insert(
                "model.embed.weight",
                Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0])
                    .unwrap()
                    .cast("embed", DType::F16)
                    .unwrap(),
            )
            .unwrap();

        let mut metadata = Metadata::new();
        metadata.insert("dim".into(), "2".into());
        metadata.insert("rope_theta".into(), "10000.0".into());
        (tensors, metadata)
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let (tensors, metadata) = sample();

        let summary = ArtifactWriter::new(&path).write(&tensors, &metadata).unwrap();
        assert_eq!(summary.tensor_count, 3);
        assert!(summary.file_size_bytes > 0);

        let artifact = Artifact::open(&path).unwrap();
        assert_eq!(artifact.metadata().unwrap(), metadata);
        assert_eq!(
            artifact.tensor_names().unwrap(),
            vec!["model.embed.weight", "model.norm.weight", "tokenizer.tokens"]
        );
        for (name, tensor) in tensors.iter() {
            assert_eq!(&artifact.tensor(name).unwrap(), tensor, "{name}");
        }
    }

    #[test]
    fn test_no_partial_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.safetensors");
        let (tensors, metadata) = sample();
        ArtifactWriter::new(&path).write(&tensors, &metadata).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("out.safetensors")]);
    }

    #[test]
    fn test_failed_write_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("out.safetensors");
        let (tensors, metadata) = sample();
        assert!(ArtifactWriter::new(&path).write(&tensors, &metadata).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.safetensors");
        fs::write(&path, b"not a safetensors file").unwrap();
        assert!(Artifact::open(&path).is_err());
    }
}
