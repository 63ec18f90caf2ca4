//! Reference CPU attention executor.
//!
//! Scalar single-pass attention over paged KV blocks: per (batch, head),
//! score the query against cached keys gathered through the block table,
//! softmax in f32, then weighted-sum the cached values. Precision-generic
//! over the activation float type; quantized caches are dequantized lane by
//! lane using the per-slot metadata. Correct rather than fast — a fused
//! SIMD plan can replace it behind the same trait.

use std::marker::PhantomData;
use std::sync::Arc;

use half::{bf16, f16};
use log::trace;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::node::layout::{CacheLayout, QUANT_METADATA_BYTES};
use crate::ops::cpu::cache_write::dequantize_lane;
use crate::ops::traits::executor::operand::*;
use crate::ops::traits::PagedAttentionExecutor;
use crate::tensor::{DType, FloatElement, Tensor};

/// Build an execution plan for a (compute precision, cache precision) pair.
///
/// Compute precision must be f32 or bf16 (the only outputs of the precision
/// policy); caches may hold any floating width or quantized u8.
pub fn make_pa_executor(
    compute: DType,
    cache: DType,
) -> Result<Arc<dyn PagedAttentionExecutor>> {
    match (compute, cache) {
        (DType::F32, DType::F32) => Ok(Arc::new(RefAttentionExecutor::<f32, _>::new(
            PlainLane::<f32>::new(),
        ))),
        (DType::F32, DType::BF16) => Ok(Arc::new(RefAttentionExecutor::<f32, _>::new(
            PlainLane::<bf16>::new(),
        ))),
        (DType::F32, DType::F16) => Ok(Arc::new(RefAttentionExecutor::<f32, _>::new(
            PlainLane::<f16>::new(),
        ))),
        (DType::F32, DType::U8) => {
            Ok(Arc::new(RefAttentionExecutor::<f32, _>::new(QuantLane)))
        }
        (DType::BF16, DType::F32) => Ok(Arc::new(RefAttentionExecutor::<bf16, _>::new(
            PlainLane::<f32>::new(),
        ))),
        (DType::BF16, DType::BF16) => Ok(Arc::new(RefAttentionExecutor::<bf16, _>::new(
            PlainLane::<bf16>::new(),
        ))),
        (DType::BF16, DType::F16) => Ok(Arc::new(RefAttentionExecutor::<bf16, _>::new(
            PlainLane::<f16>::new(),
        ))),
        (DType::BF16, DType::U8) => {
            Ok(Arc::new(RefAttentionExecutor::<bf16, _>::new(QuantLane)))
        }
        _ => Err(Error::PlanConstructionFailure { precision: compute }),
    }
}

/// How one cache lane becomes f32 values.
trait CacheLane: Send + Sync + 'static {
    /// # Safety
    ///
    /// `(block, head, offset)` must address a lane inside `cache` and no
    /// thread may concurrently write it.
    unsafe fn load(&self, cache: &Tensor, block: usize, head: usize, offset: usize, out: &mut [f32]);
}

/// Full-precision lane of element type `C`.
struct PlainLane<C: FloatElement>(PhantomData<fn() -> C>);

impl<C: FloatElement> PlainLane<C> {
    fn new() -> Self {
        Self(PhantomData)
    }
}

impl<C: FloatElement> CacheLane for PlainLane<C> {
    #[inline]
    unsafe fn load(&self, cache: &Tensor, block: usize, head: usize, offset: usize, out: &mut [f32]) {
        let lane = cache.lane::<C>(&[block, head, offset, 0], out.len());
        for (o, &x) in out.iter_mut().zip(lane) {
            *o = x.to_f32();
        }
    }
}

/// Quantized u8 lane with trailing scale/zero-point metadata.
struct QuantLane;

impl CacheLane for QuantLane {
    #[inline]
    unsafe fn load(&self, cache: &Tensor, block: usize, head: usize, offset: usize, out: &mut [f32]) {
        let lane = cache.lane::<u8>(&[block, head, offset, 0], out.len() + QUANT_METADATA_BYTES);
        dequantize_lane(lane, out);
    }
}

/// Reference plan: `T` is the activation/compute element, `lane` reads the
/// cache representation. Stateless between calls; reachable only through
/// [`make_pa_executor`].
struct RefAttentionExecutor<T: FloatElement, L: CacheLane> {
    lane: L,
    _element: PhantomData<fn() -> T>,
}

impl<T: FloatElement, L: CacheLane> RefAttentionExecutor<T, L> {
    fn new(lane: L) -> Self {
        Self {
            lane,
            _element: PhantomData,
        }
    }
}

impl<T: FloatElement, L: CacheLane> PagedAttentionExecutor for RefAttentionExecutor<T, L> {
    fn execute(&self, inputs: &[Tensor], output: &Tensor) -> Result<()> {
        let query = &inputs[ID_Q];
        let k_cache = &inputs[ID_KCACHE];
        let v_cache = &inputs[ID_VCACHE];
        let layout = CacheLayout::inspect(k_cache, v_cache)?;

        let batch = query.size(0);
        let q_tokens = query.size(1);
        let heads = layout.num_heads;
        let head_dim = layout.head_dim;
        query.assert_dims(&[batch, q_tokens, heads * head_dim])?;
        output.assert_dims(&[batch, q_tokens, heads * head_dim])?;

        let is_prompt = inputs[ID_IS_PROMPT].scalar::<u8>()? != 0;
        let context_lens = &inputs[ID_CONTEXT_LENS];
        context_lens.assert_dims(&[batch])?;
        let context_lens = context_lens.as_slice::<i32>();
        let block_tables = &inputs[ID_BLOCK_TABLES];
        block_tables.assert_dims(&[batch, 0])?;
        let max_blocks = block_tables.size(1);
        let block_tables = block_tables.as_slice::<i32>();
        let scale = inputs[ID_SCALE].scalar::<f32>()?;
        let sliding_window = inputs[ID_SLIDING_WINDOW].scalar::<i32>()?.max(0) as usize;

        let alibi = &inputs[ID_ALIBI_SLOPES];
        let alibi_slopes = if alibi.numel() > 0 {
            alibi.assert_dims(&[heads])?;
            Some(alibi.as_slice::<f32>())
        } else {
            None
        };

        let subsequence_lens = match inputs.get(ID_SUBSEQUENCE_LENS) {
            Some(lens) => {
                lens.assert_dims(&[batch])?;
                Some(lens.as_slice::<i32>())
            }
            None => None,
        };

        // Validate lengths and block-table entries up front; the parallel
        // sweep below must not fail.
        for b in 0..batch {
            let context_len = context_lens[b] as usize;
            let q_len = query_len(subsequence_lens, b, q_tokens);
            if context_lens[b] < 0 || context_len < q_len {
                return Err(Error::ShapeMismatch {
                    expected: format!("context_lens[{b}] >= {q_len}"),
                    actual: context_lens[b].to_string(),
                });
            }
            let blocks_needed = context_len.div_ceil(layout.block_capacity);
            if blocks_needed > max_blocks {
                return Err(Error::ShapeMismatch {
                    expected: format!("[{batch}, >= {blocks_needed}]"),
                    actual: format!("{:?}", [batch, max_blocks]),
                });
            }
            for logical in 0..blocks_needed {
                let physical = block_tables[b * max_blocks + logical];
                if physical < 0 || physical as usize >= layout.num_blocks {
                    return Err(Error::ShapeMismatch {
                        expected: format!("block index in 0..{}", layout.num_blocks),
                        actual: physical.to_string(),
                    });
                }
            }
        }

        trace!(
            "paged attention: batch={batch} q_tokens={q_tokens} heads={heads} prompt={is_prompt}"
        );

        (0..batch * heads).into_par_iter().for_each(|bh| {
            let (b, h) = (bh / heads, bh % heads);
            let context_len = context_lens[b] as usize;
            let q_len = query_len(subsequence_lens, b, q_tokens);
            let table = &block_tables[b * max_blocks..(b + 1) * max_blocks];

            let mut lane_buf = vec![0.0f32; head_dim];
            let mut acc = vec![0.0f32; head_dim];
            let mut scores: Vec<f32> = Vec::with_capacity(context_len);

            for qi in 0..q_tokens {
                // Safety: (b, qi, head range) lanes are disjoint across the
                // (b, h) parallel sweep.
                let out_lane = unsafe {
                    output.lane_mut::<T>(&[b, qi, h * head_dim], head_dim)
                };
                if qi >= q_len {
                    out_lane.fill(T::from_f32(0.0));
                    continue;
                }

                // Align the query window to the end of the context: query qi
                // sits at absolute position ctx - q_len + qi. Decode
                // (q_len == 1) thereby attends to the whole context.
                let q_pos = context_len - q_len + qi;
                let end = q_pos + 1;
                let start = if sliding_window > 0 {
                    end.saturating_sub(sliding_window)
                } else {
                    0
                };

                let q_lane =
                    unsafe { query.lane::<T>(&[b, qi, h * head_dim], head_dim) };

                scores.clear();
                let mut max_score = f32::NEG_INFINITY;
                for pos in start..end {
                    let block = table[pos / layout.block_capacity] as usize;
                    let offset = pos % layout.block_capacity;
                    unsafe { self.lane.load(k_cache, block, h, offset, &mut lane_buf) };
                    let mut dot = 0.0f32;
                    for d in 0..head_dim {
                        dot += q_lane[d].to_f32() * lane_buf[d];
                    }
                    let mut score = dot * scale;
                    if let Some(slopes) = alibi_slopes {
                        score += slopes[h] * (pos as f32 - q_pos as f32);
                    }
                    scores.push(score);
                    max_score = max_score.max(score);
                }

                let mut sum = 0.0f32;
                for score in scores.iter_mut() {
                    *score = (*score - max_score).exp();
                    sum += *score;
                }
                let inv_sum = 1.0 / sum;

                acc.fill(0.0);
                for pos in start..end {
                    let block = table[pos / layout.block_capacity] as usize;
                    let offset = pos % layout.block_capacity;
                    unsafe { self.lane.load(v_cache, block, h, offset, &mut lane_buf) };
                    let weight = scores[pos - start] * inv_sum;
                    for d in 0..head_dim {
                        acc[d] += weight * lane_buf[d];
                    }
                }
                for (o, &x) in out_lane.iter_mut().zip(&acc) {
                    *o = T::from_f32(x);
                }
            }
        });

        Ok(())
    }
}

#[inline]
fn query_len(subsequence_lens: Option<&[i32]>, b: usize, q_tokens: usize) -> usize {
    match subsequence_lens {
        Some(lens) => (lens[b].max(0) as usize).min(q_tokens),
        None => q_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_i32(v: i32) -> Tensor {
        Tensor::from_slice(&[v], &[])
    }

    fn scalar_u8(v: u8) -> Tensor {
        Tensor::from_slice(&[v], &[])
    }

    fn scalar_f32(v: f32) -> Tensor {
        Tensor::from_slice(&[v], &[])
    }

    /// One sequence, one head, head_dim 2, two context tokens already in
    /// block 0 of the cache.
    fn tiny_operands(scale: f32, sliding_window: i32) -> Vec<Tensor> {
        let head_dim = 2;
        let query = Tensor::from_slice(&[1.0f32, 0.0], &[1, 1, head_dim]);
        let new_k = Tensor::zeros(DType::F32, &[1, 1, head_dim]);
        let new_v = Tensor::zeros(DType::F32, &[1, 1, head_dim]);

        // keys: pos0 = [1, 0], pos1 = [0, 1]; values: pos0 = [2, 0], pos1 = [0, 4]
        let k_cache = Tensor::from_slice(&[1.0f32, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0], &[1, 1, 4, head_dim]);
        let v_cache = Tensor::from_slice(&[2.0f32, 0.0, 0.0, 4.0, 0.0, 0.0, 0.0, 0.0], &[1, 1, 4, head_dim]);

        vec![
            query,
            new_k,
            new_v,
            k_cache,
            v_cache,
            scalar_u8(0),
            Tensor::from_slice(&[-1i32, -1], &[1, 2]),
            scalar_i32(2),
            Tensor::from_slice(&[2i32], &[1]),
            Tensor::from_slice(&[0i32], &[1, 1]),
            scalar_f32(scale),
            Tensor::from_slice(&[0.0f32; 0], &[0]),
            scalar_i32(sliding_window),
        ]
    }

    #[test]
    fn test_decode_attends_whole_context() {
        let inputs = tiny_operands(1.0, 0);
        let output = Tensor::zeros(DType::F32, &[1, 1, 2]);
        let plan = make_pa_executor(DType::F32, DType::F32).unwrap();
        plan.execute(&inputs, &output).unwrap();

        // scores = [q.k0, q.k1] = [1, 0]; softmax = [e/(e+1), 1/(e+1)]
        let w0 = 1.0f32.exp() / (1.0f32.exp() + 1.0);
        let w1 = 1.0 - w0;
        let out = output.as_slice::<f32>();
        assert!((out[0] - 2.0 * w0).abs() < 1e-6);
        assert!((out[1] - 4.0 * w1).abs() < 1e-6);
    }

    #[test]
    fn test_sliding_window_drops_old_positions() {
        let inputs = tiny_operands(1.0, 1);
        let output = Tensor::zeros(DType::F32, &[1, 1, 2]);
        let plan = make_pa_executor(DType::F32, DType::F32).unwrap();
        plan.execute(&inputs, &output).unwrap();

        // Window of 1 keeps only the newest position: output = v1 exactly.
        let out = output.as_slice::<f32>();
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_alibi_bias_shifts_weights() {
        let mut inputs = tiny_operands(1.0, 0);
        let baseline = Tensor::zeros(DType::F32, &[1, 1, 2]);
        let plan = make_pa_executor(DType::F32, DType::F32).unwrap();
        plan.execute(&inputs, &baseline).unwrap();

        // A strong slope penalizes the older position (distance -1).
        inputs[ID_ALIBI_SLOPES] = Tensor::from_slice(&[8.0f32], &[1]);
        let biased = Tensor::zeros(DType::F32, &[1, 1, 2]);
        plan.execute(&inputs, &biased).unwrap();

        let base = baseline.as_slice::<f32>();
        let bias = biased.as_slice::<f32>();
        assert!(bias[1] > base[1], "newest position should gain weight");
        assert!(bias[0] < base[0], "oldest position should lose weight");
    }

    #[test]
    fn test_block_table_out_of_range_rejected() {
        let mut inputs = tiny_operands(1.0, 0);
        inputs[ID_BLOCK_TABLES] = Tensor::from_slice(&[7i32], &[1, 1]);
        let output = Tensor::zeros(DType::F32, &[1, 1, 2]);
        let plan = make_pa_executor(DType::F32, DType::F32).unwrap();
        assert!(plan.execute(&inputs, &output).is_err());
    }

    #[test]
    fn test_unsupported_compute_precision() {
        assert!(matches!(
            make_pa_executor(DType::F16, DType::F32),
            Err(Error::PlanConstructionFailure { precision: DType::F16 }),
        ));
    }
}
