//! Checkpoint weight loading
//!
//! Weights may be split across any number of files. Every tensor name must
//! appear exactly once across all of them. Tensors of dtypes the converter
//! cannot decode (integer buffers, masks) are still loaded as raw bytes and
//! only fail if something tries to cast them.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::error::{ConvertError, Result};
use crate::tensor::{DType, Tensor};

/// Recognized weight file encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    /// `.safetensors` container
    Safetensors,
    /// `.bin` PyTorch pickle archive
    Pytorch,
}

impl WeightFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("safetensors") => Ok(Self::Safetensors),
            Some("bin") => Ok(Self::Pytorch),
            _ => Err(ConvertError::UnsupportedModelFormat(path.to_path_buf())),
        }
    }
}

/// Name-keyed tensors merged from every weight file
#[derive(Debug, Default)]
pub struct WeightStore {
    tensors: HashMap<String, Tensor>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and merge `paths` in order
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut store = Self::new();
        for path in paths {
            store.load_file(path.as_ref())?;
        }
        info!(
            "Loaded {} tensors ({:.2} MB) from {} files",
            store.len(),
            store.total_size_bytes() as f64 / 1_000_000.0,
            paths.len()
        );
        Ok(store)
    }

    /// Merge every tensor of one file into the store
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let before = self.len();
        match WeightFormat::from_path(path)? {
            WeightFormat::Safetensors => self.load_safetensors(path)?,
            WeightFormat::Pytorch => self.load_pytorch(path)?,
        }
        debug!("{}: {} tensors", path.display(), self.len() - before);
        Ok(())
    }

    /// Insert one tensor; a name seen before is a collision
    pub fn insert(&mut self, name: String, tensor: Tensor) -> Result<()> {
        match self.tensors.entry(name) {
            Entry::Occupied(entry) => Err(ConvertError::DuplicateWeightKey(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(tensor);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| ConvertError::MissingWeight(name.to_string()))
    }

    /// Tensor names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn total_size_bytes(&self) -> usize {
        self.tensors.values().map(Tensor::size_bytes).sum()
    }

    fn load_safetensors(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and dropped before this function returns
        let mmap = unsafe { Mmap::map(&file)? };
        let safetensors = SafeTensors::deserialize(&mmap).map_err(|e| {
            ConvertError::Safetensors(format!("{}: {}", path.display(), e))
        })?;

        for (name, view) in safetensors.tensors() {
            let dtype = DType::from_safetensors(view.dtype());
            let tensor = Tensor::new(dtype, view.shape().to_vec(), view.data().to_vec())?;
            self.insert(name, tensor)?;
        }
        Ok(())
    }

    #[cfg(feature = "pytorch")]
    fn load_pytorch(&mut self, path: &Path) -> Result<()> {
        let tensors = candle_core::pickle::read_all(path)
            .map_err(|e| ConvertError::Pickle(format!("{}: {}", path.display(), e)))?;
        for (name, tensor) in tensors {
            let tensor = from_candle(&tensor)?;
            self.insert(name, tensor)?;
        }
        Ok(())
    }

    #[cfg(not(feature = "pytorch"))]
    fn load_pytorch(&mut self, path: &Path) -> Result<()> {
        Err(ConvertError::UnsupportedModelFormat(path.to_path_buf()))
    }
}

/// Copy a candle tensor into an owned little-endian buffer
#[cfg(feature = "pytorch")]
fn from_candle(tensor: &candle_core::Tensor) -> Result<Tensor> {
    use byteorder::{ByteOrder, LittleEndian};
    use candle_core::DType as CandleDType;
    use safetensors::Dtype;

    let shape = tensor.dims().to_vec();
    let flat = tensor.flatten_all()?;
    let (dtype, data) = match tensor.dtype() {
        CandleDType::F32 => {
            let values = flat.to_vec1::<f32>()?;
            let mut data = vec![0u8; values.len() * 4];
            LittleEndian::write_f32_into(&values, &mut data);
            (DType::F32, data)
        }
        CandleDType::F64 => {
            let values = flat.to_vec1::<f64>()?;
            let mut data = vec![0u8; values.len() * 8];
            LittleEndian::write_f64_into(&values, &mut data);
            (DType::F64, data)
        }
        CandleDType::F16 => {
            let bits: Vec<u16> = flat.to_vec1::<half::f16>()?.iter().map(|v| v.to_bits()).collect();
            let mut data = vec![0u8; bits.len() * 2];
            LittleEndian::write_u16_into(&bits, &mut data);
            (DType::F16, data)
        }
        CandleDType::BF16 => {
            let bits: Vec<u16> = flat.to_vec1::<half::bf16>()?.iter().map(|v| v.to_bits()).collect();
            let mut data = vec![0u8; bits.len() * 2];
            LittleEndian::write_u16_into(&bits, &mut data);
            (DType::BF16, data)
        }
        CandleDType::U8 => (DType::U8, flat.to_vec1::<u8>()?),
        CandleDType::U32 => {
            let values = flat.to_vec1::<u32>()?;
            let mut data = vec![0u8; values.len() * 4];
            LittleEndian::write_u32_into(&values, &mut data);
            (DType::Other(Dtype::U32), data)
        }
        CandleDType::I64 => {
            let values = flat.to_vec1::<i64>()?;
            let mut data = vec![0u8; values.len() * 8];
            LittleEndian::write_i64_into(&values, &mut data);
            (DType::Other(Dtype::I64), data)
        }
    };
    Tensor::new(dtype, shape, data)
}
