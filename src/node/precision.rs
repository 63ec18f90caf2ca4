//! Runtime compute-precision policy.

use serde::{Deserialize, Serialize};

use crate::tensor::DType;

/// Host capability signal consumed by the precision policy.
///
/// Injected at node construction rather than probed inline, so the policy is
/// testable with a mocked flag.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HostCapabilities {
    /// The CPU executes bf16 arithmetic natively.
    pub bf16_native: bool,
}

impl HostCapabilities {
    /// Probe the running CPU.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        let bf16_native = std::arch::is_x86_feature_detected!("avx512bf16");
        #[cfg(not(target_arch = "x86_64"))]
        let bf16_native = false;
        Self { bf16_native }
    }
}

/// Resolve the compute precision for a requested activation precision.
///
/// BF16 compute is used only when it is both requested and natively
/// supported; every other combination falls back to f32. Reduced precision
/// is never emulated and never silently substituted the other way. Pure and
/// total — no error path.
pub fn resolve_precision(requested: DType, caps: HostCapabilities) -> DType {
    if requested == DType::BF16 && caps.bf16_native {
        DType::BF16
    } else {
        DType::F32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_truth_table() {
        let native = HostCapabilities { bf16_native: true };
        let plain = HostCapabilities { bf16_native: false };

        assert_eq!(resolve_precision(DType::BF16, native), DType::BF16);
        assert_eq!(resolve_precision(DType::BF16, plain), DType::F32);
        assert_eq!(resolve_precision(DType::F32, native), DType::F32);
        assert_eq!(resolve_precision(DType::F32, plain), DType::F32);
        // Non-bf16 reduced types fall back as well.
        assert_eq!(resolve_precision(DType::F16, native), DType::F32);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let caps = HostCapabilities { bf16_native: true };
        for _ in 0..4 {
            assert_eq!(resolve_precision(DType::BF16, caps), DType::BF16);
        }
    }
}
