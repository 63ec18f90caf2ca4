//! Paged-attention node: operand validation, cache update, plan dispatch.
//!
//! Lifecycle within one model instance: construction validates the declared
//! operand descriptors and resolves the compute precision; the first
//! successful `run` binds the execution plan through the shared plan cache;
//! every later `run` reuses the bound plan. There is no transition back.

use std::sync::{Arc, OnceLock};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node::executor_cache::{ExecutorCache, PlanKey};
use crate::node::layout::CacheLayout;
use crate::node::precision::{resolve_precision, HostCapabilities};
use crate::ops::cpu::attention::make_pa_executor;
use crate::ops::cpu::cache_write;
use crate::ops::traits::executor::operand::*;
use crate::ops::traits::PagedAttentionExecutor;
use crate::tensor::{DType, Tensor};

/// Declared element type of one operand, as negotiated with the host graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandDesc {
    pub dtype: DType,
}

/// Static description of one paged-attention node: the declared input
/// operand types in ordinal order, 13 or 14 entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedAttentionDesc {
    pub inputs: Vec<OperandDesc>,
}

impl PagedAttentionDesc {
    /// Descriptor for the common case: activations in `activation`, caches
    /// in `cache`, metadata operands at their contract types.
    pub fn new(activation: DType, cache: DType, with_subsequence_lens: bool) -> Self {
        let mut inputs = vec![
            OperandDesc { dtype: activation }, // query
            OperandDesc { dtype: activation }, // new K
            OperandDesc { dtype: activation }, // new V
            OperandDesc { dtype: cache },      // key cache
            OperandDesc { dtype: cache },      // value cache
            OperandDesc { dtype: DType::U8 },  // is_prompt
            OperandDesc { dtype: DType::I32 }, // slot_mapping
            OperandDesc { dtype: DType::I32 }, // max_context_len
            OperandDesc { dtype: DType::I32 }, // context_lens
            OperandDesc { dtype: DType::I32 }, // block_tables
            OperandDesc { dtype: DType::F32 }, // scale
            OperandDesc { dtype: DType::F32 }, // alibi_slopes
            OperandDesc { dtype: DType::I32 }, // sliding_window
        ];
        if with_subsequence_lens {
            inputs.push(OperandDesc { dtype: DType::I32 });
        }
        Self { inputs }
    }
}

/// The paged-attention node.
///
/// Per `run`: fold the call's new K/V into the paged caches at the mapped
/// slots, then hand the full operand set to the precision-keyed execution
/// plan. Cache mutation always completes before the plan reads the caches.
pub struct PagedAttention {
    desc: PagedAttentionDesc,
    compute_precision: DType,
    cache_precision: DType,
    executor_cache: Arc<ExecutorCache>,
    plan: OnceLock<Arc<dyn PagedAttentionExecutor>>,
}

impl PagedAttention {
    /// Validate the descriptor and resolve the compute precision.
    ///
    /// Fails with [`Error::InvalidOperandCount`] unless exactly 13 or 14
    /// operands are declared, and with [`Error::UnsupportedOperation`] when
    /// a declared type violates the operator contract. Nothing executes
    /// before these checks pass.
    pub fn new(
        desc: PagedAttentionDesc,
        caps: HostCapabilities,
        executor_cache: Arc<ExecutorCache>,
    ) -> Result<Self> {
        let count = desc.inputs.len();
        if count != ID_SLIDING_WINDOW + 1 && count != ID_SUBSEQUENCE_LENS + 1 {
            return Err(Error::InvalidOperandCount { got: count });
        }
        validate_operand_types(&desc)?;

        let requested = desc.inputs[ID_Q].dtype;
        let compute_precision = resolve_precision(requested, caps);
        let cache_precision = desc.inputs[ID_KCACHE].dtype;

        Ok(Self {
            desc,
            compute_precision,
            cache_precision,
            executor_cache,
            plan: OnceLock::new(),
        })
    }

    /// The precision the plan computes in; activation operands and the
    /// output are delivered in this type after layout negotiation.
    pub fn compute_precision(&self) -> DType {
        self.compute_precision
    }

    pub fn cache_precision(&self) -> DType {
        self.cache_precision
    }

    /// Update the caches with the call's new K/V, then run attention over
    /// the full context. Returns the output tensor,
    /// `[batch, new_tokens, num_heads * head_dim]` in the compute precision.
    pub fn run(&self, inputs: &[Tensor]) -> Result<Tensor> {
        if inputs.len() != self.desc.inputs.len() {
            return Err(Error::InvalidOperandCount { got: inputs.len() });
        }
        for (ordinal, tensor) in inputs.iter().enumerate() {
            let expected = self.negotiated_dtype(ordinal);
            if tensor.dtype() != expected {
                return Err(Error::UnsupportedOperation {
                    reason: format!(
                        "operand {ordinal} arrived as {}, negotiated {expected}",
                        tensor.dtype()
                    ),
                });
            }
        }

        self.fold_new_kv(inputs)?;
        let plan = self.bind_plan()?;

        let query = &inputs[ID_Q];
        let output = Tensor::zeros(self.compute_precision, query.dims());
        plan.execute(inputs, &output)?;
        Ok(output)
    }

    /// The element type each operand must arrive in at run time. Activation
    /// operands follow the resolved compute precision (the host graph
    /// converts them when the policy fell back); the rest keep their
    /// declared types.
    fn negotiated_dtype(&self, ordinal: usize) -> DType {
        match ordinal {
            ID_Q | ID_K | ID_V => self.compute_precision,
            _ => self.desc.inputs[ordinal].dtype,
        }
    }

    /// Scatter the new K/V tokens into the paged caches. Runs to completion
    /// before plan dispatch; the plan reads the post-write cache state.
    fn fold_new_kv(&self, inputs: &[Tensor]) -> Result<()> {
        let new_k = &inputs[ID_K];
        let new_v = &inputs[ID_V];
        let key_cache = &inputs[ID_KCACHE];
        let value_cache = &inputs[ID_VCACHE];
        let slot_mapping = &inputs[ID_SLOT_MAPPING];

        let layout = CacheLayout::inspect(key_cache, value_cache)?;
        let batch = new_k.size(0);
        let new_tokens = new_k.size(1);
        let (heads, head_dim) = (layout.num_heads, layout.head_dim);

        new_k.assert_dims(&[batch, new_tokens, heads * head_dim])?;
        new_v.assert_dims(&[batch, new_tokens, heads * head_dim])?;
        // The slot mapping's row stride is the declared max context length.
        let max_context_len = inputs[ID_MAX_CONTEXT_LEN].scalar::<i32>()?.max(0) as usize;
        slot_mapping.assert_dims(&[batch, max_context_len])?;
        if new_tokens > max_context_len {
            return Err(Error::ShapeMismatch {
                expected: format!("[{batch}, >= {new_tokens}]"),
                actual: format!("{:?}", slot_mapping.dims()),
            });
        }

        let new_k = new_k.reshape(&[batch, new_tokens, heads, head_dim])?.permute(&[0, 2, 1, 3])?;
        let new_v = new_v.reshape(&[batch, new_tokens, heads, head_dim])?.permute(&[0, 2, 1, 3])?;
        cache_write::scatter_update(&new_k, &new_v, key_cache, value_cache, slot_mapping)
    }

    /// Bind the execution plan on first use; reuse it afterwards.
    fn bind_plan(&self) -> Result<Arc<dyn PagedAttentionExecutor>> {
        if let Some(plan) = self.plan.get() {
            return Ok(Arc::clone(plan));
        }
        let key = PlanKey {
            precision: self.compute_precision,
        };
        let (plan, was_cached) = self.executor_cache.get_or_create(key, || {
            make_pa_executor(self.compute_precision, self.cache_precision)
        })?;
        debug!(
            "paged attention plan bound: precision={} cache={} shared={was_cached}",
            self.compute_precision, self.cache_precision
        );
        Ok(Arc::clone(self.plan.get_or_init(|| plan)))
    }
}

fn validate_operand_types(desc: &PagedAttentionDesc) -> Result<()> {
    let dtype = |ordinal: usize| desc.inputs[ordinal].dtype;
    let reject = |reason: String| Err(Error::UnsupportedOperation { reason });

    for ordinal in [ID_Q, ID_K, ID_V] {
        if !dtype(ordinal).is_float() {
            return reject(format!(
                "operand {ordinal} must be a floating type, got {}",
                dtype(ordinal)
            ));
        }
    }
    if dtype(ID_K) != dtype(ID_Q) || dtype(ID_V) != dtype(ID_Q) {
        return reject("query, new-K and new-V precisions must agree".to_string());
    }

    let cache = dtype(ID_KCACHE);
    if !cache.is_float() && cache != DType::U8 {
        return reject(format!("cache dtype {cache} is not storable"));
    }
    if dtype(ID_VCACHE) != cache {
        return reject(format!(
            "key cache {cache} and value cache {} must match",
            dtype(ID_VCACHE)
        ));
    }

    if dtype(ID_IS_PROMPT) != DType::U8 {
        return reject(format!("is_prompt must be u8, got {}", dtype(ID_IS_PROMPT)));
    }
    let mut int_operands = vec![
        ID_SLOT_MAPPING,
        ID_MAX_CONTEXT_LEN,
        ID_CONTEXT_LENS,
        ID_BLOCK_TABLES,
        ID_SLIDING_WINDOW,
    ];
    if desc.inputs.len() == ID_SUBSEQUENCE_LENS + 1 {
        int_operands.push(ID_SUBSEQUENCE_LENS);
    }
    for ordinal in int_operands {
        if dtype(ordinal) != DType::I32 {
            return reject(format!(
                "operand {ordinal} must be i32, got {}",
                dtype(ordinal)
            ));
        }
    }
    for ordinal in [ID_SCALE, ID_ALIBI_SLOPES] {
        if dtype(ordinal) != DType::F32 {
            return reject(format!(
                "operand {ordinal} must be f32, got {}",
                dtype(ordinal)
            ));
        }
    }
    Ok(())
}
