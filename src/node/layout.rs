//! Cache geometry derivation.

use crate::error::{Error, Result};
use crate::tensor::{DType, Tensor};

/// Trailing bytes of every quantized cache lane, holding the lane's
/// dequantization metadata: scale then zero-point, both f32 little-endian.
/// Fixed width, not parameterizable.
pub const QUANT_METADATA_BYTES: usize = 8;

/// Cache geometry derived from the paged cache tensors.
///
/// Head count, block count and block capacity are read off the key cache;
/// the head dimension comes from the value cache's trailing axis, minus the
/// metadata lane when the cache stores quantized values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub num_blocks: usize,
    pub num_heads: usize,
    pub block_capacity: usize,
    pub head_dim: usize,
    pub is_quantized: bool,
}

impl CacheLayout {
    /// Derive geometry from the cache tensors and cross-check the pair.
    pub fn inspect(key_cache: &Tensor, value_cache: &Tensor) -> Result<Self> {
        if key_cache.dtype() != value_cache.dtype() {
            return Err(Error::UnsupportedOperation {
                reason: format!(
                    "key and value cache dtypes differ: {} vs {}",
                    key_cache.dtype(),
                    value_cache.dtype()
                ),
            });
        }
        key_cache.assert_dims(&[0, 0, 0, 0])?;
        value_cache.assert_dims(&[0, 0, 0, 0])?;

        let is_quantized = key_cache.dtype() == DType::U8;
        let metadata = if is_quantized { QUANT_METADATA_BYTES } else { 0 };

        let num_blocks = key_cache.size(0);
        let num_heads = key_cache.size(1);
        let block_capacity = key_cache.size(2);
        let trailing = value_cache.size(3);
        if trailing <= metadata {
            return Err(Error::ShapeMismatch {
                expected: format!("[?, ?, ?, > {metadata}]"),
                actual: format!("{:?}", value_cache.dims()),
            });
        }
        let head_dim = trailing - metadata;

        key_cache.assert_dims(&[0, num_heads, 0, head_dim + metadata])?;
        value_cache.assert_dims(&[num_blocks, num_heads, block_capacity, head_dim + metadata])?;

        Ok(Self {
            num_blocks,
            num_heads,
            block_capacity,
            head_dim,
            is_quantized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_layout() {
        let k_cache = Tensor::zeros(DType::F32, &[4, 2, 16, 64]);
        let v_cache = Tensor::zeros(DType::F32, &[4, 2, 16, 64]);
        let layout = CacheLayout::inspect(&k_cache, &v_cache).unwrap();
        assert_eq!(
            layout,
            CacheLayout {
                num_blocks: 4,
                num_heads: 2,
                block_capacity: 16,
                head_dim: 64,
                is_quantized: false,
            }
        );
    }

    #[test]
    fn test_quantized_layout_subtracts_metadata() {
        // head_dim 64 stored as 72-wide u8 lanes.
        let k_cache = Tensor::zeros(DType::U8, &[4, 2, 16, 72]);
        let v_cache = Tensor::zeros(DType::U8, &[4, 2, 16, 72]);
        let layout = CacheLayout::inspect(&k_cache, &v_cache).unwrap();
        assert_eq!(layout.head_dim, 64);
        assert!(layout.is_quantized);
    }

    #[test]
    fn test_value_cache_geometry_must_match() {
        let k_cache = Tensor::zeros(DType::F32, &[4, 2, 16, 64]);
        let wrong_blocks = Tensor::zeros(DType::F32, &[5, 2, 16, 64]);
        assert!(CacheLayout::inspect(&k_cache, &wrong_blocks).is_err());

        let wrong_capacity = Tensor::zeros(DType::F32, &[4, 2, 8, 64]);
        assert!(CacheLayout::inspect(&k_cache, &wrong_capacity).is_err());
    }

    #[test]
    fn test_cache_dtype_mismatch() {
        let k_cache = Tensor::zeros(DType::F32, &[4, 2, 16, 64]);
        let v_cache = Tensor::zeros(DType::U8, &[4, 2, 16, 72]);
        assert!(CacheLayout::inspect(&k_cache, &v_cache).is_err());
    }

    #[test]
    fn test_quantized_lane_too_narrow() {
        let k_cache = Tensor::zeros(DType::U8, &[4, 2, 16, 8]);
        let v_cache = Tensor::zeros(DType::U8, &[4, 2, 16, 8]);
        assert!(CacheLayout::inspect(&k_cache, &v_cache).is_err());
    }
}
