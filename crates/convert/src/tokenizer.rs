//! Vocabulary extraction for the artifact's tokenizer tensors
//!
//! Two tokenizer families are supported:
//! - SentencePiece unigram models (`tokenizer.model`), which carry a score per piece
//! - HuggingFace byte-pair models (`tokenizer.json`), whose piece priority is
//!   encoded by merge order and turned into a score here
//!
//! Both end up as one [`Vocabulary`] with exactly `vocab_size` records.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::error::{ConvertError, Result};
use crate::layout::OutputTensorSet;
use crate::sentencepiece::UnigramModel;
use crate::tensor::Tensor;

/// Whitespace markers rewritten to a plain space
const SENTENCEPIECE_SPACE: char = '\u{2581}';
const GPT2_SPACE: char = '\u{0120}';

/// Artifact tensor holding every token's bytes, each null-terminated
pub const TOKENS_TENSOR: &str = "tokenizer.tokens";
/// Artifact tensor holding one f32 score per token id
pub const SCORES_TENSOR: &str = "tokenizer.scores";

/// Tokenizer source, dispatched once on load
#[derive(Debug, Clone, PartialEq)]
pub enum TokenizerSource {
    Unigram(UnigramModel),
    BytePair(BpeModel),
}

impl TokenizerSource {
    /// Load a tokenizer, choosing the scheme from the file extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("model") => Ok(Self::Unigram(UnigramModel::from_file(path)?)),
            Some("json") => Ok(Self::BytePair(BpeModel::from_file(path)?)),
            _ => Err(ConvertError::UnsupportedTokenizerFormat(format!(
                "{}: expected a .model or .json tokenizer",
                path.display()
            ))),
        }
    }

    pub fn vocab_size(&self) -> usize {
        match self {
            Self::Unigram(model) => model.vocab_size(),
            Self::BytePair(model) => model.vocab.len(),
        }
    }
}

/// Byte-pair vocabulary with ordered merge rules
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BpeModel {
    pub vocab: HashMap<String, u32>,
    pub merges: Vec<(String, String)>,
}

#[derive(Deserialize)]
struct TokenizerJson {
    model: BpeJson,
}

#[derive(Deserialize)]
struct BpeJson {
    vocab: HashMap<String, u32>,
    #[serde(default)]
    merges: Vec<MergeJson>,
}

/// Older files store merges as `"a b"`, newer ones as `["a", "b"]`
#[derive(Deserialize)]
#[serde(untagged)]
enum MergeJson {
    Joined(String),
    Pair(String, String),
}

impl BpeModel {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Parse a HuggingFace `tokenizer.json`
    pub fn from_json_str(content: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        match value.pointer("/model/type").and_then(|t| t.as_str()) {
            None | Some("BPE") => {}
            Some(other) => {
                return Err(ConvertError::UnsupportedTokenizerFormat(format!(
                    "tokenizer.json model type \"{}\", expected BPE",
                    other
                )))
            }
        }

        let parsed: TokenizerJson = serde_json::from_value(value)?;
        let merges = parsed
            .model
            .merges
            .into_iter()
            .enumerate()
            .map(|(index, merge)| match merge {
                MergeJson::Pair(a, b) => Ok((a, b)),
                MergeJson::Joined(rule) => {
                    let mut parts = rule.split(' ');
                    match (parts.next(), parts.next(), parts.next()) {
                        (Some(a), Some(b), None) => Ok((a.to_string(), b.to_string())),
                        _ => Err(ConvertError::MergeRule {
                            index,
                            rule: rule.clone(),
                            reason: "expected two space-separated pieces".into(),
                        }),
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            vocab: parsed.model.vocab,
            merges,
        })
    }
}

/// One vocabulary entry; its id is its position in the [`Vocabulary`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TokenRecord {
    pub bytes: Vec<u8>,
    pub score: f32,
}

/// Canonical `(bytes, score)` list of exactly `vocab_size` entries
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    records: Vec<TokenRecord>,
}

impl Vocabulary {
    /// Build the vocabulary for `config` from either tokenizer scheme
    pub fn build(source: &TokenizerSource, config: &ModelConfig) -> Result<Self> {
        let vocab_size = config.vocab_size;
        if source.vocab_size() > vocab_size {
            return Err(ConvertError::TokenizerSize(format!(
                "tokenizer defines {} tokens but config vocab_size is {}",
                source.vocab_size(),
                vocab_size
            )));
        }
        if source.vocab_size() < vocab_size {
            info!(
                "Tokenizer defines {} of {} tokens, padding the rest",
                source.vocab_size(),
                vocab_size
            );
        }

        let mut pieces = vec![String::new(); vocab_size];
        let mut scores = vec![0.0f32; vocab_size];

        match source {
            TokenizerSource::Unigram(model) => {
                check_special_id("bos", model.bos_id, config.bos_token_id)?;
                check_special_id("eos", model.eos_id, config.eos_token_id)?;

                for (id, (piece, score)) in model.pieces.iter().enumerate() {
                    pieces[id] = piece.clone();
                    scores[id] = *score;
                }
            }
            TokenizerSource::BytePair(model) => {
                for (piece, &id) in &model.vocab {
                    let slot = pieces.get_mut(id as usize).ok_or_else(|| {
                        ConvertError::TokenizerSize(format!(
                            "token {:?} has id {} outside vocab_size {}",
                            piece, id, vocab_size
                        ))
                    })?;
                    *slot = piece.clone();
                }

                // Earlier merges get scores closer to zero; the first rule to
                // produce a piece decides its score
                for (index, (a, b)) in model.merges.iter().enumerate() {
                    let merged = format!("{}{}", a, b);
                    let id = *model.vocab.get(&merged).ok_or_else(|| ConvertError::MergeRule {
                        index,
                        rule: format!("{} {}", a, b),
                        reason: format!("merged piece {:?} is not in the vocabulary", merged),
                    })? as usize;
                    if scores[id] == 0.0 {
                        scores[id] = -(1.0 + index as f32);
                    }
                }
                debug!("Scored {} merge rules", model.merges.len());
            }
        }

        let records = pieces
            .into_iter()
            .zip(scores)
            .enumerate()
            .map(|(id, (piece, score))| {
                Ok(TokenRecord {
                    bytes: canonicalize(id, &piece)?,
                    score,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { records })
    }

    pub fn records(&self) -> &[TokenRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All token bytes, each followed by a terminating zero, as one `u8` tensor
    pub fn tokens_tensor(&self) -> Tensor {
        let total = self.records.iter().map(|r| r.bytes.len() + 1).sum();
        let mut data = Vec::with_capacity(total);
        for record in &self.records {
            data.extend_from_slice(&record.bytes);
            data.push(0);
        }
        Tensor::from_u8(data)
    }

    /// Scores as a `[vocab_size]` f32 tensor
    pub fn scores_tensor(&self) -> Result<Tensor> {
        let scores: Vec<f32> = self.records.iter().map(|r| r.score).collect();
        Tensor::from_f32(vec![scores.len()], &scores)
    }

    /// Add the tokens and scores tensors to the artifact set
    pub fn insert_into(&self, output: &mut OutputTensorSet) -> Result<()> {
        output.insert(TOKENS_TENSOR, self.tokens_tensor())?;
        output.insert(SCORES_TENSOR, self.scores_tensor()?)
    }
}

fn check_special_id(which: &'static str, tokenizer: i64, config: u32) -> Result<()> {
    if tokenizer != config as i64 {
        return Err(ConvertError::TokenizerIdMismatch {
            which,
            tokenizer,
            config: config as i64,
        });
    }
    Ok(())
}

/// Replace whitespace markers with a space and encode as UTF-8
fn canonicalize(id: usize, piece: &str) -> Result<Vec<u8>> {
    let text = piece.replace([SENTENCEPIECE_SPACE, GPT2_SPACE], " ");
    if text.contains('\0') {
        return Err(ConvertError::InvalidToken {
            id,
            reason: format!("{:?} contains a null byte", piece),
        });
    }
    Ok(text.into_bytes())
}
