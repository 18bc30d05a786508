//! Load tensors from .safetensors files

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use burn::prelude::*;
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Unsupported dtype for {name}: {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },

    #[error("Rank mismatch for {name}: expected {expected}, got shape {actual:?}")]
    RankMismatch {
        name: String,
        expected: usize,
        actual: Vec<usize>,
    },

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// Header entry for one tensor, with its byte range inside the mapping
#[derive(Debug, Clone)]
struct TensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

/// A memory-mapped safetensors file
///
/// The header is parsed once on open; tensor bytes are decoded on demand.
pub struct SafeTensorFile {
    mmap: Mmap,
    tensors: BTreeMap<String, TensorInfo>,
}

impl SafeTensorFile {
    /// Open and index a safetensors file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let file = File::open(path.as_ref())?;
        // Safety: the mapping is read-only and owned by the returned value
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let tensors: BTreeMap<String, TensorInfo> = {
            let st = SafeTensors::deserialize(&mmap)?;
            let base = mmap.as_ptr() as usize;
            st.tensors()
                .into_iter()
                .map(|(name, view)| {
                    let start = view.data().as_ptr() as usize - base;
                    let info = TensorInfo {
                        dtype: view.dtype(),
                        shape: view.shape().to_vec(),
                        start,
                        end: start + view.data().len(),
                    };
                    (name, info)
                })
                .collect()
        };

        tracing::debug!(
            path = %path.as_ref().display(),
            tensors = tensors.len(),
            "indexed safetensors file"
        );

        Ok(Self { mmap, tensors })
    }

    /// Tensor names in lexicographic order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    /// Names under `prefix.`, with the prefix and dot stripped
    pub fn names_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> {
        self.tensors
            .keys()
            .filter_map(move |name| name.strip_prefix(prefix)?.strip_prefix('.'))
    }

    /// Number of tensors in the file
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    pub fn dtype(&self, name: &str) -> Option<Dtype> {
        self.tensors.get(name).map(|t| t.dtype)
    }

    fn info(&self, name: &str) -> Result<&TensorInfo, LoadError> {
        self.tensors
            .get(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))
    }

    /// Load a tensor as f32, converting from f16/bf16 if needed
    pub fn load_f32<B: Backend, const D: usize>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let info = self.info(name)?;

        let shape: [usize; D] = info.shape.as_slice().try_into().map_err(|_| {
            LoadError::RankMismatch {
                name: name.to_string(),
                expected: D,
                actual: info.shape.clone(),
            }
        })?;

        let floats = decode_f32(name, info.dtype, &self.mmap[info.start..info.end])?;

        Ok(Tensor::from_data(TensorData::new(floats, shape), device))
    }

    /// Load a tensor and verify its exact shape
    pub fn load_f32_checked<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected_shape: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let info = self.info(name)?;

        if info.shape.as_slice() != expected_shape.as_slice() {
            return Err(LoadError::ShapeMismatch {
                name: name.to_string(),
                expected: expected_shape.to_vec(),
                actual: info.shape.clone(),
            });
        }

        self.load_f32::<B, D>(name, device)
    }
}

/// Decode little-endian tensor bytes into f32 values
///
/// Mapped data is not guaranteed to be aligned, so values are read
/// chunk by chunk rather than reinterpreted in place.
fn decode_f32(name: &str, dtype: Dtype, bytes: &[u8]) -> Result<Vec<f32>, LoadError> {
    let floats = match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
        dtype => {
            return Err(LoadError::UnsupportedDtype {
                name: name.to_string(),
                dtype,
            });
        }
    };
    Ok(floats)
}
