use crate::error::{ConvertError, ConvertResult};
use crate::gguf::{GgmlType, MAX_DIMS};
use safetensors::Dtype;

/// A tensor as stored in the source container: row-major, little-endian.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl Tensor {
    pub fn new(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Self {
        Self { dtype, shape, data }
    }

    pub fn from_f32_slice(data: &[f32], shape: Vec<usize>) -> Self {
        let bytes: Vec<u8> = data.iter().flat_map(|f| f.to_le_bytes()).collect();
        Self::new(Dtype::F32, shape, bytes)
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn as_f32_vec(&self) -> Option<Vec<f32>> {
        if self.dtype != Dtype::F32 {
            return None;
        }
        let values = self
            .data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(values)
    }

    /// Dimensions in ggml order. Scalars become a single dimension of 1.
    pub fn ggml_dims(&self) -> Vec<u64> {
        if self.shape.is_empty() {
            return vec![1];
        }
        self.shape.iter().rev().map(|&d| d as u64).collect()
    }

    /// Check that the tensor can be stored as-is under `name`.
    pub fn check_storable(&self, name: &str) -> ConvertResult<GgmlType> {
        let ggml_type = ggml_type_for(self.dtype).ok_or_else(|| {
            ConvertError::unsupported(format!("{name}: tensor dtype {:?} has no GGUF equivalent", self.dtype))
        })?;

        if self.shape.len() > MAX_DIMS {
            return Err(ConvertError::unsupported(format!(
                "{name}: {} dimensions exceed the limit of {MAX_DIMS}",
                self.shape.len()
            )));
        }

        let expected = ggml_type.byte_size(self.element_count() as u64);
        if expected != Some(self.byte_size() as u64) {
            return Err(ConvertError::unsupported(format!(
                "{name}: {} bytes do not match shape {:?} of {:?}",
                self.byte_size(),
                self.shape,
                self.dtype
            )));
        }

        Ok(ggml_type)
    }
}

/// Map a source dtype to the GGUF type that stores it without loss.
pub fn ggml_type_for(dtype: Dtype) -> Option<GgmlType> {
    match dtype {
        Dtype::F32 => Some(GgmlType::F32),
        Dtype::F16 => Some(GgmlType::F16),
        Dtype::BF16 => Some(GgmlType::BF16),
        Dtype::F64 => Some(GgmlType::F64),
        Dtype::I8 => Some(GgmlType::I8),
        // ggml has no unsigned byte type; bytes are copied verbatim.
        Dtype::U8 => Some(GgmlType::I8),
        Dtype::I16 => Some(GgmlType::I16),
        Dtype::I32 => Some(GgmlType::I32),
        Dtype::I64 => Some(GgmlType::I64),
        _ => None,
    }
}
