//! SentencePiece `.model` decoding
//!
//! Only the subset of `ModelProto` needed to recover pieces, scores and the
//! special token ids is declared; every other field is skipped by prost.

use std::path::Path;

use prost::Message;

use crate::error::Result;

/// `SentencePiece.Type.CONTROL`
const PIECE_TYPE_CONTROL: i32 = 3;

#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(message, repeated, tag = "1")]
    pub pieces: Vec<SentencePiece>,
    #[prost(message, optional, tag = "2")]
    pub trainer_spec: Option<TrainerSpec>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SentencePiece {
    #[prost(string, optional, tag = "1")]
    pub piece: Option<String>,
    #[prost(float, optional, tag = "2")]
    pub score: Option<f32>,
    #[prost(int32, optional, tag = "3")]
    pub kind: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TrainerSpec {
    #[prost(string, optional, tag = "46")]
    pub bos_piece: Option<String>,
    #[prost(string, optional, tag = "47")]
    pub eos_piece: Option<String>,
}

/// Unigram vocabulary: one scored piece per id
#[derive(Debug, Clone, PartialEq)]
pub struct UnigramModel {
    pub pieces: Vec<(String, f32)>,
    /// Id of the BOS control piece, or -1 if the model has none
    pub bos_id: i64,
    /// Id of the EOS control piece, or -1 if the model has none
    pub eos_id: i64,
}

impl UnigramModel {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let proto = ModelProto::decode(data)?;
        Ok(Self::from_proto(&proto))
    }

    pub fn from_proto(proto: &ModelProto) -> Self {
        let spec = proto.trainer_spec.clone().unwrap_or_default();
        let bos_piece = spec.bos_piece.as_deref().unwrap_or("<s>");
        let eos_piece = spec.eos_piece.as_deref().unwrap_or("</s>");

        Self {
            pieces: proto
                .pieces
                .iter()
                .map(|p| (p.piece.clone().unwrap_or_default(), p.score.unwrap_or(0.0)))
                .collect(),
            bos_id: control_id(proto, bos_piece),
            eos_id: control_id(proto, eos_piece),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }
}

/// Special ids only count when the piece is a control symbol
fn control_id(proto: &ModelProto, piece: &str) -> i64 {
    proto
        .pieces
        .iter()
        .position(|p| p.piece.as_deref() == Some(piece) && p.kind == Some(PIECE_TYPE_CONTROL))
        .map_or(-1, |id| id as i64)
}
