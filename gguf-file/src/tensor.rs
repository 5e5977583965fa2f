//! Tensor element types and payload encoding.

use std::borrow::Cow;

use bytemuck::cast_slice;
use half::f16;
use ndarray::ArrayD;

use crate::error::{GgufError, Result};

/// ggml tensor types this crate can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GgmlType {
    F32 = 0,
    F16 = 1,
}

impl GgmlType {
    pub fn from_u32(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::F32),
            1 => Ok(Self::F16),
            other => Err(GgufError::UnsupportedTensorType(other)),
        }
    }

    /// Bytes per element.
    pub fn type_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
        }
    }

    /// Short name used in file names and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
        }
    }

    /// Encode `array` in row-major order as little-endian elements of this type.
    pub fn encode(self, array: &ArrayD<f32>) -> Vec<u8> {
        let values: Cow<'_, [f32]> = match array.as_slice() {
            Some(slice) => Cow::Borrowed(slice),
            None => Cow::Owned(array.iter().copied().collect()),
        };
        match self {
            Self::F32 => cast_slice(&values).to_vec(),
            Self::F16 => {
                let halves: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
                cast_slice(&halves).to_vec()
            }
        }
    }
}

/// Metadata describing one tensor in a GGUF file.
///
/// `shape` is in logical (row-major, outermost first) order; the file stores
/// dimensions innermost first and the reader/writer reverse them.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub ggml_type: GgmlType,
    /// Offset of the payload relative to the start of the data section.
    pub offset: u64,
}

impl TensorInfo {
    /// `None` when the dimensions overflow `usize`.
    pub fn n_elements(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    pub fn n_bytes(&self) -> Option<usize> {
        self.n_elements()?.checked_mul(self.ggml_type.type_size())
    }
}

/// Round `offset` up to the next multiple of `alignment`.
pub fn align_offset(offset: usize, alignment: usize) -> usize {
    offset.div_ceil(alignment) * alignment
}
