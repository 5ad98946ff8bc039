//! Source-to-artifact tensor mapping
//!
//! Copies each checkpoint tensor to its artifact name, casting matmul weights
//! to the requested low-precision dtype and norm weights to f32. Query and key
//! projections additionally get their per-head row interleaving undone.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::error::{ConvertError, Result};
use crate::loader::WeightStore;
use crate::tensor::{DType, Tensor, WeightDtype};

/// How a source tensor is carried into the artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    /// Cast to the weight dtype
    Matmul,
    /// Cast to the weight dtype after undoing the head permutation
    HeadPermuted(Heads),
    /// Cast to f32
    Norm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Heads {
    Attention,
    KeyValue,
}

/// Per-layer tensors: (checkpoint suffix, artifact suffix, conversion)
const LAYER_TENSORS: [(&str, &str, Conversion); 9] = [
    ("input_layernorm.weight", "attn.norm.weight", Conversion::Norm),
    ("self_attn.q_proj.weight", "attn.wq.weight", Conversion::HeadPermuted(Heads::Attention)),
    ("self_attn.k_proj.weight", "attn.wk.weight", Conversion::HeadPermuted(Heads::KeyValue)),
    ("self_attn.v_proj.weight", "attn.wv.weight", Conversion::Matmul),
    ("self_attn.o_proj.weight", "attn.wo.weight", Conversion::Matmul),
    ("post_attention_layernorm.weight", "mlp.norm.weight", Conversion::Norm),
    ("mlp.gate_proj.weight", "mlp.w1.weight", Conversion::Matmul),
    ("mlp.down_proj.weight", "mlp.w2.weight", Conversion::Matmul),
    ("mlp.up_proj.weight", "mlp.w3.weight", Conversion::Matmul),
];

const EMBEDDING: (&str, &str) = ("model.embed_tokens.weight", "model.embed.weight");
const FINAL_NORM: (&str, &str) = ("model.norm.weight", "model.norm.weight");
const OUTPUT: (&str, &str) = ("lm_head.weight", "model.output.weight");

/// Tensors per transformer layer in the artifact
pub const TENSORS_PER_LAYER: usize = LAYER_TENSORS.len();

/// Artifact tensors keyed by canonical name. Entries are written once.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OutputTensorSet {
    tensors: BTreeMap<String, Tensor>,
}

impl OutputTensorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Result<()> {
        match self.tensors.entry(name.into()) {
            Entry::Occupied(entry) => Err(ConvertError::DuplicateWeightKey(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(tensor);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(name, tensor)| (name.as_str(), tensor))
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
}

/// Maps a [`WeightStore`] onto artifact tensor names
pub struct LayoutTransformer<'a> {
    config: &'a ModelConfig,
    weight_dtype: DType,
}

impl<'a> LayoutTransformer<'a> {
    /// Fails if `weight_dtype` cannot be produced by this build
    pub fn new(config: &'a ModelConfig, weight_dtype: WeightDtype) -> Result<Self> {
        Ok(Self {
            config,
            weight_dtype: weight_dtype.dtype()?,
        })
    }

    /// Convert every required tensor into `output`
    pub fn transform_into(&self, weights: &WeightStore, output: &mut OutputTensorSet) -> Result<()> {
        let num_layers = self.config.num_hidden_layers;
        info!(
            "Converting embeddings, {} layers and output head to {}",
            num_layers, self.weight_dtype
        );

        self.convert(weights, output, EMBEDDING.0, EMBEDDING.1.to_string(), Conversion::Matmul)?;

        for layer in 0..num_layers {
            for (source, target, conversion) in LAYER_TENSORS {
                self.convert(
                    weights,
                    output,
                    &format!("model.layers.{layer}.{source}"),
                    format!("model.layers.{layer}.{target}"),
                    conversion,
                )?;
            }
            debug!("Converted layer {}/{}", layer + 1, num_layers);
        }

        self.convert(weights, output, FINAL_NORM.0, FINAL_NORM.1.to_string(), Conversion::Norm)?;
        self.convert(weights, output, OUTPUT.0, OUTPUT.1.to_string(), Conversion::Matmul)?;
        Ok(())
    }

    /// Convert into a fresh set
    pub fn transform(&self, weights: &WeightStore) -> Result<OutputTensorSet> {
        let mut output = OutputTensorSet::new();
        self.transform_into(weights, &mut output)?;
        Ok(output)
    }

    fn convert(
        &self,
        weights: &WeightStore,
        output: &mut OutputTensorSet,
        source: &str,
        target: String,
        conversion: Conversion,
    ) -> Result<()> {
        let tensor = weights.get(source)?;
        let converted = match conversion {
            Conversion::Norm => tensor.cast(source, DType::F32)?,
            Conversion::Matmul => tensor.cast(source, self.weight_dtype)?,
            Conversion::HeadPermuted(heads) => {
                let heads = match heads {
                    Heads::Attention => self.config.num_attention_heads,
                    Heads::KeyValue => self.config.num_key_value_heads,
                };
                let cast = tensor.cast(source, self.weight_dtype)?;
                permute_reverse(source, &cast, heads)?
            }
        };
        output.insert(target, converted)
    }
}

/// Undo the HuggingFace query/key head permutation.
///
/// Views `(rows, cols)` as `(heads, 2, rows / heads / 2, cols)`, swaps the two
/// middle axes and flattens back to `(rows, cols)`.
pub fn permute_reverse(name: &str, tensor: &Tensor, heads: usize) -> Result<Tensor> {
    permute_rows(name, tensor, heads, |pair, half| {
        // row (pair, i) of the source goes to position (i, pair)
        let (j, i) = (pair / half, pair % half);
        i * 2 + j
    })
}

/// Apply the HuggingFace query/key head permutation; inverse of [`permute_reverse`].
///
/// Views `(rows, cols)` as `(heads, rows / heads / 2, 2, cols)` and swaps the
/// two middle axes.
pub fn permute(name: &str, tensor: &Tensor, heads: usize) -> Result<Tensor> {
    permute_rows(name, tensor, heads, |pair, half| {
        let (i, j) = (pair / 2, pair % 2);
        j * half + i
    })
}

/// Reorder rows within each head block. `target(r, half)` maps the row offset
/// `r` inside a block of `2 * half` rows to its new offset.
fn permute_rows(
    name: &str,
    tensor: &Tensor,
    heads: usize,
    target: impl Fn(usize, usize) -> usize,
) -> Result<Tensor> {
    let (rows, cols) = match *tensor.shape() {
        [rows, cols] => (rows, cols),
        _ => {
            return Err(ConvertError::shape(
                name,
                format!("expected a 2-D weight, got shape {:?}", tensor.shape()),
            ))
        }
    };
    if heads == 0 || rows % (2 * heads) != 0 {
        return Err(ConvertError::shape(
            name,
            format!("{} rows are not divisible by 2 * {} heads", rows, heads),
        ));
    }

    let block = rows / heads;
    let half = block / 2;
    let row_bytes = cols * tensor.dtype().size_bytes();
    let src = tensor.data();
    let mut dst = vec![0u8; src.len()];

    for head in 0..heads {
        for offset in 0..block {
            let from = (head * block + offset) * row_bytes;
            let to = (head * block + target(offset, half)) * row_bytes;
            dst[to..to + row_bytes].copy_from_slice(&src[from..from + row_bytes]);
        }
    }

    Ok(Tensor::from_parts_unchecked(
        tensor.dtype(),
        tensor.shape().to_vec(),
        dst,
    ))
}
