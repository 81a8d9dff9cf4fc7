//! Tensor metadata and host-side buffers.
//!
//! Buffers are plain little-endian byte vectors; the communicator moves
//! bytes and the model store interprets them through the attached spec.

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float16,
    BFloat16,
    Float32,
    Float64,
    Int8,
    UInt8,
    Int16,
    Int32,
    Int64,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::Bool | DType::Int8 | DType::UInt8 => 1,
            DType::Float16 | DType::BFloat16 | DType::Int16 => 2,
            DType::Float32 | DType::Int32 => 4,
            DType::Float64 | DType::Int64 => 8,
        }
    }

    /// Canonical name, as accepted on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Float16 => "float16",
            DType::BFloat16 => "bfloat16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Int8 => "int8",
            DType::UInt8 => "uint8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Bool => "bool",
        }
    }
}

impl FromStr for DType {
    type Err = Error;

    /// Parses `"float32"` as well as qualified names such as `"torch.float32"`.
    fn from_str(s: &str) -> Result<Self> {
        let name = s.rsplit('.').next().unwrap_or(s).trim();
        match name {
            "float16" | "half" => Ok(DType::Float16),
            "bfloat16" => Ok(DType::BFloat16),
            "float32" | "float" => Ok(DType::Float32),
            "float64" | "double" => Ok(DType::Float64),
            "int8" => Ok(DType::Int8),
            "uint8" => Ok(DType::UInt8),
            "int16" | "short" => Ok(DType::Int16),
            "int32" | "int" => Ok(DType::Int32),
            "int64" | "long" => Ok(DType::Int64),
            "bool" => Ok(DType::Bool),
            _ => Err(Error::UnsupportedDtype(s.to_string())),
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Element type and shape of a tensor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Element type
    pub dtype: DType,
    /// Dimensions, outermost first; empty for a scalar
    pub shape: Vec<u64>,
}

impl TensorSpec {
    /// Create a new tensor spec.
    pub fn new(dtype: DType, shape: Vec<u64>) -> Self {
        Self { dtype, shape }
    }

    /// Number of elements, failing on overflow.
    pub fn numel(&self) -> Result<u64> {
        self.shape.iter().try_fold(1u64, |acc, &dim| {
            acc.checked_mul(dim).ok_or_else(|| {
                Error::InvalidRequest(format!("shape {:?} overflows element count", self.shape))
            })
        })
    }

    /// Size of a dense buffer holding this tensor.
    pub fn byte_len(&self) -> Result<usize> {
        let bytes = self
            .numel()?
            .checked_mul(self.dtype.size_in_bytes() as u64)
            .ok_or_else(|| {
                Error::InvalidRequest(format!("shape {:?} overflows byte size", self.shape))
            })?;
        usize::try_from(bytes)
            .map_err(|_| Error::InvalidRequest(format!("{} bytes do not fit in memory", bytes)))
    }
}

impl std::fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.shape)
    }
}

/// A dense host buffer with its spec.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorBuffer {
    spec: TensorSpec,
    data: Vec<u8>,
}

impl TensorBuffer {
    /// Allocate a zero-filled buffer for `spec`.
    ///
    /// Fails instead of aborting when the allocator cannot provide the
    /// buffer.
    pub fn zeros(spec: TensorSpec) -> Result<Self> {
        let len = spec.byte_len()?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| {
            Error::Engine(format!("cannot allocate {} bytes for {}: {}", len, spec, e))
        })?;
        data.resize(len, 0u8);
        Ok(Self { spec, data })
    }

    /// Wrap raw bytes, checking the length against the spec.
    pub fn from_bytes(spec: TensorSpec, data: Vec<u8>) -> Result<Self> {
        let expected = spec.byte_len()?;
        if data.len() != expected {
            return Err(Error::InvalidRequest(format!(
                "buffer of {} bytes does not match {} ({} bytes)",
                data.len(),
                spec,
                expected
            )));
        }
        Ok(Self { spec, data })
    }

    /// Build a float32 tensor from values.
    pub fn from_f32(shape: Vec<u64>, values: &[f32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(TensorSpec::new(DType::Float32, shape), data)
    }

    /// Read back a float32 tensor.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.spec.dtype != DType::Float32 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len() / self.spec.dtype.size_in_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_parse_qualified() {
        assert_eq!("torch.float32".parse::<DType>().unwrap(), DType::Float32);
        assert_eq!("bfloat16".parse::<DType>().unwrap(), DType::BFloat16);
        assert_eq!("torch.long".parse::<DType>().unwrap(), DType::Int64);
        assert!(matches!(
            "complex64".parse::<DType>(),
            Err(Error::UnsupportedDtype(_))
        ));
    }

    #[test]
    fn test_spec_sizes() {
        let spec = TensorSpec::new(DType::Float32, vec![4, 4]);
        assert_eq!(spec.numel().unwrap(), 16);
        assert_eq!(spec.byte_len().unwrap(), 64);

        let scalar = TensorSpec::new(DType::BFloat16, vec![]);
        assert_eq!(scalar.numel().unwrap(), 1);
        assert_eq!(scalar.byte_len().unwrap(), 2);
    }

    #[test]
    fn test_spec_overflow_rejected() {
        let spec = TensorSpec::new(DType::Float64, vec![u64::MAX, 2]);
        assert!(spec.numel().is_err());
        assert!(spec.byte_len().is_err());
    }

    #[test]
    fn test_buffer_f32_values() {
        let buf = TensorBuffer::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(buf.numel(), 4);
        assert_eq!(buf.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_buffer_length_checked() {
        let spec = TensorSpec::new(DType::Int32, vec![3]);
        assert!(TensorBuffer::from_bytes(spec.clone(), vec![0u8; 11]).is_err());
        let zeros = TensorBuffer::zeros(spec).unwrap();
        assert_eq!(zeros.as_bytes().len(), 12);
        assert!(zeros.to_f32_vec().is_none());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_zeros_allocation_failure_is_an_error() {
        // Fits in usize, but no allocator can hand out 2^63 bytes.
        let spec = TensorSpec::new(DType::Int8, vec![1 << 63]);
        assert!(spec.byte_len().is_ok());
        assert!(matches!(TensorBuffer::zeros(spec), Err(Error::Engine(_))));
    }
}
