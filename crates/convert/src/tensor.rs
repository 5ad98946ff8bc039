//! Owned CPU tensors and dtype conversion

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use half::{bf16, f16};
use rayon::prelude::*;
use safetensors::tensor::View;
use safetensors::Dtype;

use crate::error::{ConvertError, Result};

/// Tensor data type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    U8,
    F8E5M2,
    F16,
    BF16,
    F32,
    F64,
    /// Any other safetensors dtype. Carried as raw bytes, never decoded.
    Other(Dtype),
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::U8 | DType::F8E5M2 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
            DType::Other(dtype) => dtype.size(),
        }
    }

    /// Whether values of this dtype can be decoded and cast
    pub fn is_float(&self) -> bool {
        matches!(
            self,
            DType::F8E5M2 | DType::F16 | DType::BF16 | DType::F32 | DType::F64
        )
    }

    pub(crate) fn from_safetensors(dtype: Dtype) -> Self {
        match dtype {
            Dtype::U8 => DType::U8,
            Dtype::F8_E5M2 => DType::F8E5M2,
            Dtype::F16 => DType::F16,
            Dtype::BF16 => DType::BF16,
            Dtype::F32 => DType::F32,
            Dtype::F64 => DType::F64,
            other => DType::Other(other),
        }
    }

    pub(crate) fn to_safetensors(self) -> Dtype {
        match self {
            DType::U8 => Dtype::U8,
            DType::F8E5M2 => Dtype::F8_E5M2,
            DType::F16 => Dtype::F16,
            DType::BF16 => Dtype::BF16,
            DType::F32 => Dtype::F32,
            DType::F64 => Dtype::F64,
            DType::Other(dtype) => dtype,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::U8 => "u8",
            DType::F8E5M2 => "f8_e5m2",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::Other(dtype) => return write!(f, "{:?}", dtype),
        };
        f.write_str(name)
    }
}

/// Storage precision for matmul weights in the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightDtype {
    #[default]
    Fp16,
    Fp8,
}

impl WeightDtype {
    /// Resolve to a concrete dtype, failing if this build cannot emit it.
    pub fn dtype(self) -> Result<DType> {
        match self {
            WeightDtype::Fp16 => Ok(DType::F16),
            WeightDtype::Fp8 if cfg!(feature = "fp8") => Ok(DType::F8E5M2),
            WeightDtype::Fp8 => Err(ConvertError::config(
                "dtype",
                "fp8 output is not available in this build (enable the `fp8` feature)",
            )),
        }
    }
}

impl FromStr for WeightDtype {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fp16" => Ok(WeightDtype::Fp16),
            "fp8" => Ok(WeightDtype::Fp8),
            other => Err(ConvertError::config(
                "dtype",
                format!("unknown weight dtype \"{}\", expected fp16 or fp8", other),
            )),
        }
    }
}

impl fmt::Display for WeightDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightDtype::Fp16 => f.write_str("fp16"),
            WeightDtype::Fp8 => f.write_str("fp8"),
        }
    }
}

/// Contiguous row-major tensor with little-endian element bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    /// Create a tensor from raw bytes, checking the length against the shape
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_bytes();
        if data.len() != expected {
            return Err(ConvertError::shape(
                format!("{:?} tensor", shape),
                format!("expected {} bytes of {}, got {}", expected, dtype, data.len()),
            ));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        Self::new(DType::F32, shape, encode(values, DType::F32))
    }

    /// One-dimensional byte tensor
    pub fn from_u8(data: Vec<u8>) -> Self {
        Self {
            dtype: DType::U8,
            shape: vec![data.len()],
            data,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Decode every element to f32
    pub fn to_f32_vec(&self, name: &str) -> Result<Vec<f32>> {
        let data = &self.data;
        let values = match self.dtype {
            DType::F32 => data.par_chunks_exact(4).map(LittleEndian::read_f32).collect(),
            DType::F64 => data
                .par_chunks_exact(8)
                .map(|b| LittleEndian::read_f64(b) as f32)
                .collect(),
            DType::F16 => data
                .par_chunks_exact(2)
                .map(|b| f16::from_bits(LittleEndian::read_u16(b)).to_f32())
                .collect(),
            DType::BF16 => data
                .par_chunks_exact(2)
                .map(|b| bf16::from_bits(LittleEndian::read_u16(b)).to_f32())
                .collect(),
            DType::F8E5M2 => data.par_iter().map(|&b| e5m2_to_f32(b)).collect(),
            DType::U8 | DType::Other(_) => {
                return Err(ConvertError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype: self.dtype.to_string(),
                })
            }
        };
        Ok(values)
    }

    /// Convert to another float dtype. `name` is only used for error messages.
    pub fn cast(&self, name: &str, target: DType) -> Result<Tensor> {
        if !target.is_float() {
            return Err(ConvertError::UnsupportedDtype {
                name: name.to_string(),
                dtype: target.to_string(),
            });
        }
        if self.dtype == target {
            return Ok(self.clone());
        }
        let values = self.to_f32_vec(name)?;
        Ok(Self {
            dtype: target,
            shape: self.shape.clone(),
            data: encode(&values, target),
        })
    }

    /// Same data under a new shape with the same element count
    pub fn reshape(self, shape: Vec<usize>) -> Result<Tensor> {
        if shape.iter().product::<usize>() != self.numel() {
            return Err(ConvertError::shape(
                format!("{:?} tensor", self.shape),
                format!("cannot reshape to {:?}", shape),
            ));
        }
        Ok(Self { shape, ..self })
    }

    pub(crate) fn from_parts_unchecked(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>() * dtype.size_bytes(), data.len());
        Self { dtype, shape, data }
    }
}

impl View for &Tensor {
    fn dtype(&self) -> Dtype {
        self.dtype.to_safetensors()
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Encode f32 values into `dtype` bytes (round to nearest even)
fn encode(values: &[f32], dtype: DType) -> Vec<u8> {
    let size = dtype.size_bytes();
    let mut out = vec![0u8; values.len() * size];
    let chunks = out.par_chunks_exact_mut(size).zip(values.par_iter());
    match dtype {
        DType::F32 => chunks.for_each(|(dst, &v)| LittleEndian::write_f32(dst, v)),
        DType::F64 => chunks.for_each(|(dst, &v)| LittleEndian::write_f64(dst, v as f64)),
        DType::F16 => chunks.for_each(|(dst, &v)| LittleEndian::write_u16(dst, f16::from_f32(v).to_bits())),
        DType::BF16 => chunks.for_each(|(dst, &v)| LittleEndian::write_u16(dst, bf16::from_f32(v).to_bits())),
        DType::F8E5M2 => chunks.for_each(|(dst, &v)| dst[0] = f32_to_e5m2(v)),
        DType::U8 | DType::Other(_) => unreachable!("{} is not a cast target", dtype),
    }
    out
}

/// FP8 E5M2 shares its layout with the top byte of an IEEE half
fn e5m2_to_f32(bits: u8) -> f32 {
    f16::from_bits((bits as u16) << 8).to_f32()
}

/// Round an f32 to FP8 E5M2 (nearest even, overflow to infinity)
fn f32_to_e5m2(value: f32) -> u8 {
    let sign = ((value.to_bits() >> 24) & 0x80) as u8;
    if value.is_nan() {
        return sign | 0x7F;
    }

    let abs = value.abs();
    // Halfway between the largest finite value (57344) and 2^16
    if abs >= 61440.0 {
        return sign | 0x7C;
    }

    // Subnormals are multiples of 2^-16
    if abs < 2f32.powi(-14) {
        let steps = (abs * 65536.0).round_ties_even() as u8;
        return sign | steps;
    }

    let bits = abs.to_bits();
    let exponent = ((bits >> 23) & 0xFF) as i32 - 127;
    let mantissa = bits & 0x7F_FFFF;

    let mut top = mantissa >> 21;
    let rest = mantissa & 0x1F_FFFF;
    if rest > 0x10_0000 || (rest == 0x10_0000 && top & 1 == 1) {
        top += 1;
    }
    // A carry out of the mantissa bumps the exponent, which is still correct
    let encoded = (((exponent + 15) as u32) << 2) + top;
    sign | encoded.min(0x7C) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_length() {
        assert!(Tensor::new(DType::F16, vec![2, 3], vec![0; 12]).is_ok());
        assert!(matches!(
            Tensor::new(DType::F16, vec![2, 3], vec![0; 11]),
            Err(ConvertError::Shape { .. })
        ));
    }

    #[test]
    fn test_cast_f32_to_f16() {
        let t = Tensor::from_f32(vec![3], &[1.0, -2.5, 0.0]).unwrap();
        let h = t.cast("t", DType::F16).unwrap();
        assert_eq!(h.dtype(), DType::F16);
        assert_eq!(h.shape(), &[3]);
        assert_eq!(h.data(), &[0x00, 0x3C, 0x00, 0xC1, 0x00, 0x00]);
        assert_eq!(h.to_f32_vec("t").unwrap(), vec![1.0, -2.5, 0.0]);
    }

    #[test]
    fn test_bf16_decodes_to_f32() {
        // 1.0 and -1.0 in BF16
        let t = Tensor::new(DType::BF16, vec![2], vec![0x80, 0x3F, 0x80, 0xBF]).unwrap();
        let f = t.cast("t", DType::F32).unwrap();
        assert_eq!(f.to_f32_vec("t").unwrap(), vec![1.0, -1.0]);
    }

    #[test]
    fn test_u8_is_not_a_float_source() {
        let t = Tensor::from_u8(vec![1, 2, 3]);
        assert!(matches!(
            t.cast("tokens", DType::F32),
            Err(ConvertError::UnsupportedDtype { .. })
        ));
    }

    #[test]
    fn test_integer_tensor_is_carried_but_not_cast() {
        let ids = Tensor::new(DType::Other(Dtype::I64), vec![1, 3], vec![0; 24]).unwrap();
        assert_eq!(ids.numel(), 3);
        assert_eq!(DType::from_safetensors(Dtype::I64), DType::Other(Dtype::I64));
        assert_eq!(DType::from_safetensors(Dtype::BOOL).size_bytes(), 1);
        match ids.cast("model.position_ids", DType::F16) {
            Err(ConvertError::UnsupportedDtype { name, dtype }) => {
                assert_eq!(name, "model.position_ids");
                assert_eq!(dtype, "I64");
            }
            other => panic!("expected unsupported dtype, got {:?}", other),
        }
    }

    #[test]
    fn test_e5m2_exact_values() {
        assert_eq!(f32_to_e5m2(0.0), 0x00);
        assert_eq!(f32_to_e5m2(-0.0), 0x80);
        assert_eq!(f32_to_e5m2(1.0), 0x3C);
        assert_eq!(f32_to_e5m2(-2.0), 0xC0);
        assert_eq!(f32_to_e5m2(57344.0), 0x7B);
        assert_eq!(f32_to_e5m2(2f32.powi(-16)), 0x01);
        for bits in 0u8..=0xFF {
            let v = e5m2_to_f32(bits);
            if v.is_finite() {
                assert_eq!(f32_to_e5m2(v), bits, "bits {:#04x}", bits);
            }
        }
    }

    #[test]
    fn test_e5m2_rounding() {
        // 1.125 is halfway between 1.0 (0x3C) and 1.25 (0x3D): ties to even
        assert_eq!(f32_to_e5m2(1.125), 0x3C);
        // 1.375 is halfway between 1.25 (0x3D) and 1.5 (0x3E): ties to even
        assert_eq!(f32_to_e5m2(1.375), 0x3E);
        assert_eq!(f32_to_e5m2(1.2), 0x3D);
        // 1.875 rounds up into the next binade
        assert_eq!(f32_to_e5m2(1.875), 0x40);
        assert_eq!(f32_to_e5m2(70000.0), 0x7C);
        assert_eq!(f32_to_e5m2(f32::NEG_INFINITY), 0xFC);
        assert!(e5m2_to_f32(f32_to_e5m2(f32::NAN)).is_nan());
    }

    #[test]
    fn test_weight_dtype_parse() {
        assert_eq!("fp16".parse::<WeightDtype>().unwrap(), WeightDtype::Fp16);
        assert_eq!("fp8".parse::<WeightDtype>().unwrap(), WeightDtype::Fp8);
        assert!("int4".parse::<WeightDtype>().is_err());
        assert_eq!(WeightDtype::Fp16.dtype().unwrap(), DType::F16);
    }

    #[cfg(feature = "fp8")]
    #[test]
    fn test_fp8_available() {
        assert_eq!(WeightDtype::Fp8.dtype().unwrap(), DType::F8E5M2);
    }

    #[cfg(not(feature = "fp8"))]
    #[test]
    fn test_fp8_rejected_without_feature() {
        assert!(matches!(
            WeightDtype::Fp8.dtype(),
            Err(ConvertError::Config { field, .. }) if field == "dtype"
        ));
    }
}
