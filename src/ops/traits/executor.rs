//! Attention execution plan seam.
//!
//! A plan is an opaque, precision-specialized compute capability. It is
//! constructed at most once per distinct compute precision, shared between
//! the plan cache and every node bound to it, and holds no per-call state.

use crate::error::Result;
use crate::tensor::Tensor;

/// Operand ordinals of the paged-attention operator.
///
/// Positions are fixed by the host graph contract: three activation inputs,
/// the two cache tensors, then ID-addressed metadata. `ID_SUBSEQUENCE_LENS`
/// exists only in the 14-operand form.
pub mod operand {
    /// Query; its element type establishes the requested precision.
    pub const ID_Q: usize = 0;
    /// New key tokens, `[batch, new_tokens, num_heads * head_dim]`.
    pub const ID_K: usize = 1;
    /// New value tokens, same shape as `ID_K`.
    pub const ID_V: usize = 2;
    /// Paged key cache, `[num_blocks, num_heads, block_capacity, head_dim(+8)]`.
    pub const ID_KCACHE: usize = 3;
    /// Paged value cache, same shape as `ID_KCACHE`.
    pub const ID_VCACHE: usize = 4;
    /// Phase flag, u8 scalar: non-zero during prompt processing.
    pub const ID_IS_PROMPT: usize = 5;
    /// `i32 [batch, max_context_len]`; negative entries mean "no write".
    pub const ID_SLOT_MAPPING: usize = 6;
    /// i32 scalar; also the row stride of the slot mapping.
    pub const ID_MAX_CONTEXT_LEN: usize = 7;
    /// `i32 [batch]`, total context length per sequence.
    pub const ID_CONTEXT_LENS: usize = 8;
    /// `i32 [batch, max_blocks_per_request]`, logical-to-physical block map.
    pub const ID_BLOCK_TABLES: usize = 9;
    /// f32 scalar score scale.
    pub const ID_SCALE: usize = 10;
    /// `f32 [num_heads]` ALiBi slopes, may be empty.
    pub const ID_ALIBI_SLOPES: usize = 11;
    /// i32 scalar; zero disables the window.
    pub const ID_SLIDING_WINDOW: usize = 12;
    /// `i32 [batch]`, optional 14th operand capping per-sequence query count.
    pub const ID_SUBSEQUENCE_LENS: usize = 13;
}

/// Precision-specialized attention execution plan.
pub trait PagedAttentionExecutor: Send + Sync {
    /// Run attention over the full (cache + new) context.
    ///
    /// `inputs` is the complete operand set in ordinal order; the caches must
    /// already contain the current call's new K/V. `output` is
    /// `[batch, new_tokens, num_heads * head_dim]` in the plan's compute
    /// precision and is overwritten entirely.
    fn execute(&self, inputs: &[Tensor], output: &Tensor) -> Result<()>;
}
