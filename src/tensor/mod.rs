//! Strided tensor views over shared byte storage.
//!
//! `Tensor` is a cheap handle: element type, dimension vector, stride vector
//! and an offset into a reference-counted byte buffer. `reshape` and `permute`
//! return new views over the same storage; nothing here copies element data.
//!
//! Cache tensors are long-lived and mutated in place by the cache writer
//! through shared views, so the backing storage uses interior mutability.
//! Mutation goes through `unsafe` lane accessors whose callers must keep
//! concurrently written byte ranges disjoint (the slot-mapping disjointness
//! invariant); the type does not lock.

pub mod dtype;

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::error::{Error, Result};

pub use dtype::{DType, Element, FloatElement};

/// Reference-counted byte buffer backing one or more tensor views.
///
/// Backed by `u64` words so every element type up to 8 bytes reads and
/// writes aligned through the base pointer.
pub struct TensorStorage {
    words: UnsafeCell<Box<[u64]>>,
    len_bytes: usize,
}

// Safety: mutation is only reachable through `Tensor`'s unsafe accessors,
// whose contract requires disjoint byte ranges across threads.
unsafe impl Send for TensorStorage {}
unsafe impl Sync for TensorStorage {}

impl TensorStorage {
    fn zeroed(len_bytes: usize) -> Self {
        let words = vec![0u64; len_bytes.div_ceil(8)].into_boxed_slice();
        Self {
            words: UnsafeCell::new(words),
            len_bytes,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    pub(crate) fn ptr(&self) -> *mut u8 {
        unsafe { (*self.words.get()).as_mut_ptr().cast::<u8>() }
    }
}

/// Strided view of shared storage.
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<TensorStorage>,
    dtype: DType,
    dims: Vec<usize>,
    /// Element-unit strides, row-major at construction.
    strides: Vec<usize>,
    /// Element-unit offset of the view's first element.
    offset: usize,
}

fn contiguous_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

fn format_dims(dims: &[usize]) -> String {
    let parts: Vec<String> = dims
        .iter()
        .map(|&d| {
            if d == 0 {
                "?".to_string()
            } else {
                d.to_string()
            }
        })
        .collect();
    format!("[{}]", parts.join(", "))
}

impl Tensor {
    /// Allocate a zero-filled, contiguous tensor.
    pub fn zeros(dtype: DType, dims: &[usize]) -> Self {
        let numel: usize = dims.iter().product();
        let storage = Arc::new(TensorStorage::zeroed(numel * dtype.size_in_bytes()));
        Self {
            storage,
            dtype,
            dims: dims.to_vec(),
            strides: contiguous_strides(dims),
            offset: 0,
        }
    }

    /// Allocate a contiguous tensor initialized from `data`.
    ///
    /// `data.len()` must equal the product of `dims`.
    pub fn from_slice<T: Element>(data: &[T], dims: &[usize]) -> Self {
        let numel: usize = dims.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "from_slice: {} elements for shape {}",
            data.len(),
            format_dims(dims),
        );
        let tensor = Self::zeros(T::DTYPE, dims);
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr().cast::<u8>(),
                tensor.storage.ptr(),
                std::mem::size_of_val(data),
            );
        }
        tensor
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn size(&self, axis: usize) -> usize {
        self.dims[axis]
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_contiguous(&self) -> bool {
        self.strides == contiguous_strides(&self.dims)
    }

    /// True when two views share one storage allocation.
    pub fn same_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Contiguous view with a new shape over the same storage.
    pub fn reshape(&self, dims: &[usize]) -> Result<Tensor> {
        if !self.is_contiguous() || self.numel() != dims.iter().product::<usize>() {
            return Err(Error::ShapeMismatch {
                expected: format_dims(dims),
                actual: format_dims(&self.dims),
            });
        }
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            dtype: self.dtype,
            dims: dims.to_vec(),
            strides: contiguous_strides(dims),
            offset: self.offset,
        })
    }

    /// Axis-permuted view over the same storage.
    ///
    /// `order[i]` names the source axis that becomes axis `i`.
    pub fn permute(&self, order: &[usize]) -> Result<Tensor> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        let valid = order.len() == rank
            && order.iter().all(|&axis| {
                if axis >= rank || seen[axis] {
                    false
                } else {
                    seen[axis] = true;
                    true
                }
            });
        if !valid {
            return Err(Error::ShapeMismatch {
                expected: format!("permutation of {rank} axes"),
                actual: format!("{order:?}"),
            });
        }
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            dtype: self.dtype,
            dims: order.iter().map(|&axis| self.dims[axis]).collect(),
            strides: order.iter().map(|&axis| self.strides[axis]).collect(),
            offset: self.offset,
        })
    }

    /// Check rank and a subset of dimensions.
    ///
    /// An `expected` entry of `0` is a wildcard: the axis may have any size,
    /// and the actual value stays readable from `dims()`.
    pub fn assert_dims(&self, expected: &[usize]) -> Result<()> {
        let ok = expected.len() == self.rank()
            && expected
                .iter()
                .zip(&self.dims)
                .all(|(&want, &got)| want == 0 || want == got);
        if ok {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                expected: format_dims(expected),
                actual: format_dims(&self.dims),
            })
        }
    }

    /// Element offset (in element units from the storage base) of `index`.
    fn element_offset(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.rank(), "index rank mismatch");
        debug_assert!(
            index.iter().zip(&self.dims).all(|(&i, &d)| i < d),
            "index {index:?} out of range for {}",
            format_dims(&self.dims),
        );
        self.offset
            + index
                .iter()
                .zip(&self.strides)
                .map(|(&i, &stride)| i * stride)
                .sum::<usize>()
    }

    /// Whole tensor as a typed slice. Requires a contiguous view of the
    /// matching element type.
    pub fn as_slice<T: Element>(&self) -> &[T] {
        assert_eq!(T::DTYPE, self.dtype, "as_slice dtype mismatch");
        assert!(self.is_contiguous(), "as_slice requires a contiguous view");
        let base = self.storage.ptr() as *const T;
        unsafe { std::slice::from_raw_parts(base.add(self.offset), self.numel()) }
    }

    /// Read a one-element tensor (rank 0 or any all-ones shape).
    pub fn scalar<T: Element>(&self) -> Result<T> {
        assert_eq!(T::DTYPE, self.dtype, "scalar dtype mismatch");
        if self.numel() != 1 {
            return Err(Error::ShapeMismatch {
                expected: "scalar".to_string(),
                actual: format_dims(&self.dims),
            });
        }
        let base = self.storage.ptr() as *const T;
        Ok(unsafe { *base.add(self.offset) })
    }

    /// `len` consecutive elements starting at `index` (full-rank, the last
    /// entry addressing within the last axis).
    ///
    /// # Safety
    ///
    /// The lane must lie inside the view and no thread may concurrently
    /// write bytes overlapping it.
    pub unsafe fn lane<T: Element>(&self, index: &[usize], len: usize) -> &[T] {
        debug_assert_eq!(T::DTYPE, self.dtype, "lane dtype mismatch");
        debug_assert_eq!(*self.strides.last().unwrap_or(&1), 1, "lane needs unit stride");
        let base = self.storage.ptr() as *const T;
        std::slice::from_raw_parts(base.add(self.element_offset(index)), len)
    }

    /// Mutable counterpart of [`lane`](Self::lane).
    ///
    /// # Safety
    ///
    /// As for `lane`, and additionally no other live reference (shared or
    /// mutable) may overlap the lane — callers rely on slot-mapping
    /// disjointness, not locking.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn lane_mut<T: Element>(&self, index: &[usize], len: usize) -> &mut [T] {
        debug_assert_eq!(T::DTYPE, self.dtype, "lane dtype mismatch");
        debug_assert_eq!(*self.strides.last().unwrap_or(&1), 1, "lane needs unit stride");
        let base = self.storage.ptr() as *mut T;
        std::slice::from_raw_parts_mut(base.add(self.element_offset(index)), len)
    }

    /// Copy of the whole (contiguous) tensor as raw bytes. Test support for
    /// byte-identity checks on unwritten cache regions.
    pub fn to_bytes(&self) -> Vec<u8> {
        assert!(self.is_contiguous(), "to_bytes requires a contiguous view");
        let byte_len = self.numel() * self.dtype.size_in_bytes();
        let start = self.offset * self.dtype.size_in_bytes();
        let mut out = vec![0u8; byte_len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.storage.ptr().add(start), out.as_mut_ptr(), byte_len);
        }
        out
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("dims", &self.dims)
            .field("strides", &self.strides)
            .field("offset", &self.offset)
            .finish()
    }
}
