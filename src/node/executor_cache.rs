//! Precision-keyed execution-plan cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::ops::traits::PagedAttentionExecutor;
use crate::tensor::DType;

/// Identity of a memoized execution plan.
///
/// The cache precision is fixed for a model instance, so the runtime compute
/// precision alone identifies a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanKey {
    pub precision: DType,
}

/// Plan cache owned by the model-instance context and injected into every
/// node — not a process-wide singleton.
///
/// `get_or_create` holds the map lock across the builder call, so a plan is
/// constructed at most once per distinct key; concurrent callers for the
/// same key block until the first construction finishes, then share the same
/// `Arc`. A builder failure inserts nothing, leaving the key free for a
/// later retry.
#[derive(Default)]
pub struct ExecutorCache {
    plans: Mutex<HashMap<PlanKey, Arc<dyn PagedAttentionExecutor>>>,
}

impl ExecutorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the plan for `key` and whether it was already present.
    pub fn get_or_create<F>(
        &self,
        key: PlanKey,
        builder: F,
    ) -> Result<(Arc<dyn PagedAttentionExecutor>, bool)>
    where
        F: FnOnce() -> Result<Arc<dyn PagedAttentionExecutor>>,
    {
        let mut plans = self.plans.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(plan) = plans.get(&key) {
            return Ok((Arc::clone(plan), true));
        }
        let plan = builder()?;
        plans.insert(key, Arc::clone(&plan));
        Ok((plan, false))
    }

    /// Number of distinct plans constructed so far.
    pub fn len(&self) -> usize {
        self.plans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
