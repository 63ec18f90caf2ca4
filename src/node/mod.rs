pub mod executor_cache;
pub mod layout;
pub mod paged_attention;
pub mod precision;

pub use executor_cache::{ExecutorCache, PlanKey};
pub use layout::{CacheLayout, QUANT_METADATA_BYTES};
pub use paged_attention::{OperandDesc, PagedAttention, PagedAttentionDesc};
pub use precision::{resolve_precision, HostCapabilities};
