//! # pagedattn
//!
//! **Serving-time update-and-dispatch core for a block-paged attention KV
//! cache.**
//!
//! Per inference step, an attention layer hands this crate the freshly
//! computed key/value tensors for the current batch plus the layer's paged
//! caches and addressing metadata. The node scatter-writes the new tokens
//! into their physical cache slots — plain or quantize-on-write, depending
//! on the cache's element type — and then dispatches a precision-keyed
//! execution plan over the full (cache + new) context.
//!
//! ```text
//! operands ──► PagedAttention node
//!                ├─ precision policy   (bf16 only when requested AND native)
//!                ├─ layout inspection  (blocks, heads, capacity, head_dim)
//!                ├─ cache writer       (slot-mapped scatter, in place)
//!                └─ ExecutorCache ───► plan.execute(...) ──► output
//! ```
//!
//! ## Design
//!
//! - **Views, not copies**: `Tensor` is a strided view over shared storage;
//!   reshape/permute re-describe the same bytes.
//! - **Slot-disjoint writes**: the writer parallelizes over (batch, head)
//!   and mutates the caches without locking, relying on the documented
//!   injectivity of the slot mapping within one call.
//! - **One plan per precision**: plans are memoized in an injected,
//!   instance-owned `ExecutorCache`, never a process singleton.
//! - **Explicit capability gating**: reduced-precision compute is chosen by
//!   a pure policy over an injected hardware flag — no silent emulation,
//!   no silent fallback inside the plan.

pub mod error;
pub mod node;
pub mod ops;
pub mod tensor;

pub use error::{Error, Result};
pub use node::{
    CacheLayout, ExecutorCache, HostCapabilities, OperandDesc, PagedAttention,
    PagedAttentionDesc, PlanKey,
};
pub use ops::PagedAttentionExecutor;
pub use tensor::{DType, Tensor};
