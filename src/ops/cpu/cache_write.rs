//! Scatter-write of new K/V tokens into paged cache blocks.
//!
//! Two on-disk layouts share one addressing scheme: a slot index maps to
//! `(slot / block_capacity, slot % block_capacity)` inside the cache, and a
//! negative slot is a padding sentinel that leaves the cache untouched. The
//! plain path copies one head-vector lane per (batch, head, token); the
//! quantized path compresses the lane to u8 and stores scale/zero-point in
//! the trailing metadata bytes of the destination lane.
//!
//! Writes to distinct tokens land in distinct lanes (the slot mapping is
//! injective within one call), so the (batch, head) outer loop runs in
//! parallel without locking. Debug builds verify the injectivity.

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::node::layout::QUANT_METADATA_BYTES;
use crate::tensor::{DType, FloatElement, Tensor};

use half::{bf16, f16};

/// Fold new K/V views into the paged caches, dispatching on the activation
/// and cache element types.
///
/// `new_k`/`new_v` must be `[batch, num_heads, new_tokens, head_dim]` views
/// (unit stride on the last axis); the caches must carry the matching
/// geometry per [`CacheLayout::inspect`](crate::node::layout::CacheLayout).
pub fn scatter_update(
    new_k: &Tensor,
    new_v: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    slot_mapping: &Tensor,
) -> Result<()> {
    match (new_k.dtype(), key_cache.dtype()) {
        (DType::F32, DType::U8) => {
            write_quantized::<f32>(new_k, new_v, key_cache, value_cache, slot_mapping)
        }
        (DType::BF16, DType::U8) => {
            write_quantized::<bf16>(new_k, new_v, key_cache, value_cache, slot_mapping)
        }
        (DType::F16, DType::U8) => {
            write_quantized::<f16>(new_k, new_v, key_cache, value_cache, slot_mapping)
        }
        (DType::F32, DType::F32) => {
            write_plain::<f32, f32>(new_k, new_v, key_cache, value_cache, slot_mapping)
        }
        (DType::F32, DType::BF16) => {
            write_plain::<f32, bf16>(new_k, new_v, key_cache, value_cache, slot_mapping)
        }
        (DType::F32, DType::F16) => {
            write_plain::<f32, f16>(new_k, new_v, key_cache, value_cache, slot_mapping)
        }
        (DType::BF16, DType::F32) => {
            write_plain::<bf16, f32>(new_k, new_v, key_cache, value_cache, slot_mapping)
        }
        (DType::BF16, DType::BF16) => {
            write_plain::<bf16, bf16>(new_k, new_v, key_cache, value_cache, slot_mapping)
        }
        (DType::BF16, DType::F16) => {
            write_plain::<bf16, f16>(new_k, new_v, key_cache, value_cache, slot_mapping)
        }
        (DType::F16, DType::F32) => {
            write_plain::<f16, f32>(new_k, new_v, key_cache, value_cache, slot_mapping)
        }
        (DType::F16, DType::BF16) => {
            write_plain::<f16, bf16>(new_k, new_v, key_cache, value_cache, slot_mapping)
        }
        (DType::F16, DType::F16) => {
            write_plain::<f16, f16>(new_k, new_v, key_cache, value_cache, slot_mapping)
        }
        (activation, cache) => Err(Error::UnsupportedOperation {
            reason: format!("cannot cache {activation} activations in a {cache} cache"),
        }),
    }
}

/// Plain scatter-write: copy each mapped head-vector lane into the cache,
/// converting between floating widths element-wise.
pub fn write_plain<T: FloatElement, C: FloatElement>(
    new_k: &Tensor,
    new_v: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    slot_mapping: &Tensor,
) -> Result<()> {
    let (batch, heads, tokens, head_dim) = write_dims(new_k, new_v)?;
    key_cache.assert_dims(&[0, heads, 0, head_dim])?;
    value_cache.assert_dims(&[key_cache.size(0), heads, key_cache.size(2), head_dim])?;
    let slots = mapped_slots(slot_mapping, batch, tokens)?;
    let slot_stride = slot_mapping.size(1);
    let block_capacity = key_cache.size(2);

    (0..batch * heads).into_par_iter().for_each(|bh| {
        let (b, h) = (bh / heads, bh % heads);
        for m in 0..tokens {
            let slot = slots[b * slot_stride + m];
            if slot < 0 {
                continue;
            }
            let slot = slot as usize;
            let (block, offset) = (slot / block_capacity, slot % block_capacity);
            // Safety: slots are pairwise distinct within a call, so every
            // destination lane is touched by exactly one (b, h, m) triple.
            unsafe {
                copy_lane::<T, C>(
                    new_k.lane::<T>(&[b, h, m, 0], head_dim),
                    key_cache.lane_mut::<C>(&[block, h, offset, 0], head_dim),
                );
                copy_lane::<T, C>(
                    new_v.lane::<T>(&[b, h, m, 0], head_dim),
                    value_cache.lane_mut::<C>(&[block, h, offset, 0], head_dim),
                );
            }
        }
    });
    Ok(())
}

/// Quantize-on-write scatter: same addressing as [`write_plain`], but each
/// lane is compressed to u8 with per-lane scale/zero-point metadata.
pub fn write_quantized<T: FloatElement>(
    new_k: &Tensor,
    new_v: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    slot_mapping: &Tensor,
) -> Result<()> {
    let (batch, heads, tokens, head_dim) = write_dims(new_k, new_v)?;
    let lane_width = head_dim + QUANT_METADATA_BYTES;
    key_cache.assert_dims(&[0, heads, 0, lane_width])?;
    value_cache.assert_dims(&[key_cache.size(0), heads, key_cache.size(2), lane_width])?;
    let slots = mapped_slots(slot_mapping, batch, tokens)?;
    let slot_stride = slot_mapping.size(1);
    let block_capacity = key_cache.size(2);

    (0..batch * heads).into_par_iter().for_each(|bh| {
        let (b, h) = (bh / heads, bh % heads);
        for m in 0..tokens {
            let slot = slots[b * slot_stride + m];
            if slot < 0 {
                continue;
            }
            let slot = slot as usize;
            let (block, offset) = (slot / block_capacity, slot % block_capacity);
            // Safety: as in write_plain — lanes are slot-disjoint.
            unsafe {
                quantize_lane(
                    new_k.lane::<T>(&[b, h, m, 0], head_dim),
                    key_cache.lane_mut::<u8>(&[block, h, offset, 0], lane_width),
                );
                quantize_lane(
                    new_v.lane::<T>(&[b, h, m, 0], head_dim),
                    value_cache.lane_mut::<u8>(&[block, h, offset, 0], lane_width),
                );
            }
        }
    });
    Ok(())
}

/// Common view checks for both write paths. Fails before any byte is
/// written: a mismatch must never leave a partially updated cache.
fn write_dims(new_k: &Tensor, new_v: &Tensor) -> Result<(usize, usize, usize, usize)> {
    new_k.assert_dims(&[0, 0, 0, 0])?;
    new_v.assert_dims(new_k.dims())?;
    Ok((new_k.size(0), new_k.size(1), new_k.size(2), new_k.size(3)))
}

fn mapped_slots(slot_mapping: &Tensor, batch: usize, tokens: usize) -> Result<&[i32]> {
    slot_mapping.assert_dims(&[batch, 0])?;
    if slot_mapping.size(1) < tokens {
        return Err(Error::ShapeMismatch {
            expected: format!("[{batch}, >= {tokens}]"),
            actual: format!("{:?}", slot_mapping.dims()),
        });
    }
    let slots = slot_mapping.as_slice::<i32>();
    #[cfg(debug_assertions)]
    validate_slot_disjointness(slots, slot_mapping.size(1), batch, tokens);
    Ok(slots)
}

/// Slot reuse within one call is a data race, not a recoverable error, so
/// the check runs in debug builds only.
#[cfg(debug_assertions)]
fn validate_slot_disjointness(slots: &[i32], slot_stride: usize, batch: usize, tokens: usize) {
    let mut seen = std::collections::HashSet::new();
    for b in 0..batch {
        for m in 0..tokens {
            let slot = slots[b * slot_stride + m];
            if slot >= 0 {
                assert!(
                    seen.insert(slot),
                    "slot mapping assigns slot {slot} to more than one token in one call",
                );
            }
        }
    }
}

#[inline]
fn copy_lane<T: FloatElement, C: FloatElement>(src: &[T], dst: &mut [C]) {
    for (d, &x) in dst.iter_mut().zip(src) {
        *d = C::from_f32(x.to_f32());
    }
}

/// Compress one head-vector lane into `dst`: `head_dim` u8 values followed
/// by the 8 metadata bytes (scale then zero-point, f32 LE).
///
/// Asymmetric per-lane quantization: `q = round(x / scale + zp)` with
/// `scale = (max - min) / 255`. A constant lane gets scale 1.0 so the round
/// trip is exact.
fn quantize_lane<T: FloatElement>(src: &[T], dst: &mut [u8]) {
    let (values, metadata) = dst.split_at_mut(src.len());

    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &x in src {
        let x = x.to_f32();
        min = min.min(x);
        max = max.max(x);
    }
    let range = max - min;
    let scale = if range > 0.0 { range / 255.0 } else { 1.0 };
    let zero_point = -min / scale;

    for (q, &x) in values.iter_mut().zip(src) {
        *q = (x.to_f32() / scale + zero_point).round().clamp(0.0, 255.0) as u8;
    }
    metadata[..4].copy_from_slice(&scale.to_le_bytes());
    metadata[4..8].copy_from_slice(&zero_point.to_le_bytes());
}

/// Reconstruct one quantized lane into f32 using its stored metadata.
/// `lane` is the full cache lane (`out.len()` values plus metadata).
pub fn dequantize_lane(lane: &[u8], out: &mut [f32]) {
    let (values, metadata) = lane.split_at(out.len());
    let scale = f32::from_le_bytes([metadata[0], metadata[1], metadata[2], metadata[3]]);
    let zero_point = f32::from_le_bytes([metadata[4], metadata[5], metadata[6], metadata[7]]);
    for (o, &q) in out.iter_mut().zip(values) {
        *o = (q as f32 - zero_point) * scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det_values(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 * 0.37).sin() * 2.0).collect()
    }

    // [B, L, H*S] activations reshaped/permuted to the [B, H, L, S] view the
    // writer consumes.
    fn kv_view(data: &[f32], b: usize, l: usize, h: usize, s: usize) -> Tensor {
        Tensor::from_slice(data, &[b, l, h * s])
            .reshape(&[b, l, h, s])
            .unwrap()
            .permute(&[0, 2, 1, 3])
            .unwrap()
    }

    #[test]
    fn test_plain_write_roundtrip() {
        let (b, l, h, s) = (2, 3, 2, 8);
        let k_data = det_values(b * l * h * s);
        let v_data: Vec<f32> = k_data.iter().map(|x| x * -1.5).collect();
        let new_k = kv_view(&k_data, b, l, h, s);
        let new_v = kv_view(&v_data, b, l, h, s);

        let key_cache = Tensor::zeros(DType::F32, &[4, h, 4, s]);
        let value_cache = Tensor::zeros(DType::F32, &[4, h, 4, s]);
        // Batch 0 -> slots 0,1,2; batch 1 -> slots 8,9,10 (block 2).
        let slot_mapping =
            Tensor::from_slice(&[0i32, 1, 2, -1, 8, 9, 10, -1], &[b, 4]);

        scatter_update(&new_k, &new_v, &key_cache, &value_cache, &slot_mapping).unwrap();

        // Exact round trip at every mapped slot, for every head.
        for (bi, base_slot) in [(0usize, 0usize), (1, 8)] {
            for m in 0..l {
                let slot = base_slot + m;
                let (block, offset) = (slot / 4, slot % 4);
                for hi in 0..h {
                    let src = unsafe { new_k.lane::<f32>(&[bi, hi, m, 0], s) };
                    let dst = unsafe { key_cache.lane::<f32>(&[block, hi, offset, 0], s) };
                    assert_eq!(src, dst, "batch {bi} head {hi} token {m}");
                }
            }
        }
    }

    #[test]
    fn test_sentinel_slots_leave_cache_bytes_unchanged() {
        let (b, l, h, s) = (1, 2, 1, 4);
        let new_k = kv_view(&det_values(b * l * h * s), b, l, h, s);
        let new_v = kv_view(&det_values(b * l * h * s), b, l, h, s);

        // Pre-fill the cache with a recognizable pattern.
        let pattern: Vec<f32> = (0..2 * h * 4 * s).map(|i| i as f32).collect();
        let key_cache = Tensor::from_slice(&pattern, &[2, h, 4, s]);
        let value_cache = Tensor::from_slice(&pattern, &[2, h, 4, s]);
        let before_k = key_cache.to_bytes();

        // Only token 1 is written; token 0 is padding.
        let slot_mapping = Tensor::from_slice(&[-1i32, 5], &[1, 2]);
        scatter_update(&new_k, &new_v, &key_cache, &value_cache, &slot_mapping).unwrap();

        let after_k = key_cache.to_bytes();
        let lane_bytes = s * 4;
        let slot5_start = (h * 4 * s + s) * 4; // block 1, head 0, offset 1
        for (i, (pre, post)) in before_k.iter().zip(&after_k).enumerate() {
            if i >= slot5_start && i < slot5_start + lane_bytes {
                continue; // the one mapped lane
            }
            assert_eq!(pre, post, "unmapped byte {i} changed");
        }
    }

    #[test]
    fn test_quantized_write_bounded_error() {
        let (b, l, h, s) = (1, 2, 2, 16);
        let k_data = det_values(b * l * h * s);
        let new_k = kv_view(&k_data, b, l, h, s);
        let new_v = kv_view(&k_data, b, l, h, s);

        let key_cache = Tensor::zeros(DType::U8, &[2, h, 4, s + QUANT_METADATA_BYTES]);
        let value_cache = Tensor::zeros(DType::U8, &[2, h, 4, s + QUANT_METADATA_BYTES]);
        let slot_mapping = Tensor::from_slice(&[2i32, 7], &[1, 2]);

        scatter_update(&new_k, &new_v, &key_cache, &value_cache, &slot_mapping).unwrap();

        let mut restored = vec![0.0f32; s];
        for (m, slot) in [(0usize, 2usize), (1, 7)] {
            let (block, offset) = (slot / 4, slot % 4);
            for hi in 0..h {
                let lane = unsafe {
                    key_cache.lane::<u8>(&[block, hi, offset, 0], s + QUANT_METADATA_BYTES)
                };
                dequantize_lane(lane, &mut restored);
                let src = unsafe { new_k.lane::<f32>(&[0, hi, m, 0], s) };

                let scale =
                    f32::from_le_bytes([lane[s], lane[s + 1], lane[s + 2], lane[s + 3]]);
                let tolerance = scale * 0.5 + 1e-6;
                for (x, y) in src.iter().zip(&restored) {
                    assert!(
                        (x - y).abs() <= tolerance,
                        "quantization error {} above {}",
                        (x - y).abs(),
                        tolerance,
                    );
                }
            }
        }
    }

    #[test]
    fn test_quantized_constant_lane_is_exact() {
        let mut lane = vec![0u8; 4 + QUANT_METADATA_BYTES];
        quantize_lane(&[-3.25f32; 4], &mut lane);
        let mut restored = [0.0f32; 4];
        dequantize_lane(&lane, &mut restored);
        assert_eq!(restored, [-3.25; 4]);
    }

    #[test]
    fn test_bf16_activations_into_f32_cache() {
        use half::bf16;
        let (b, l, h, s) = (1, 1, 1, 4);
        let values = [0.5f32, -1.0, 2.0, 0.0];
        let data: Vec<bf16> = values.iter().map(|&x| bf16::from_f32(x)).collect();
        let new_k = Tensor::from_slice(&data, &[b, l, h * s])
            .reshape(&[b, l, h, s])
            .unwrap()
            .permute(&[0, 2, 1, 3])
            .unwrap();
        let new_v = new_k.clone();

        let key_cache = Tensor::zeros(DType::F32, &[1, h, 2, s]);
        let value_cache = Tensor::zeros(DType::F32, &[1, h, 2, s]);
        let slot_mapping = Tensor::from_slice(&[1i32], &[1, 1]);

        scatter_update(&new_k, &new_v, &key_cache, &value_cache, &slot_mapping).unwrap();
        let lane = unsafe { key_cache.lane::<f32>(&[0, 0, 1, 0], s) };
        assert_eq!(lane, &values); // all four are exactly representable in bf16
    }

    #[test]
    fn test_geometry_mismatch_rejected_before_writing() {
        let (b, l, h, s) = (1, 1, 2, 8);
        let new_k = kv_view(&det_values(b * l * h * s), b, l, h, s);
        let new_v = new_k.clone();

        // Cache declares 4 heads; activations carry 2.
        let key_cache = Tensor::zeros(DType::F32, &[2, 4, 4, s]);
        let value_cache = Tensor::zeros(DType::F32, &[2, 4, 4, s]);
        let slot_mapping = Tensor::from_slice(&[0i32], &[1, 1]);

        let result = scatter_update(&new_k, &new_v, &key_cache, &value_cache, &slot_mapping);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
        assert!(key_cache.to_bytes().iter().all(|&byte| byte == 0));
    }
}
