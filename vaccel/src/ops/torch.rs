//! Torch operations: jit-load + forward, and SGEMM.

#![allow(unsafe_code)]

use std::ffi::{c_int, c_void};
use std::sync::Arc;

use tracing::error;

use crate::ops::{self, OpType};
use crate::profiling::ProfRegion;
use crate::resource::{Resource, ResourceType};
use crate::session::Session;
use crate::{Error, Result, error};

static TORCH_FORWARD_STATS: ProfRegion = ProfRegion::new("vaccel_torch_jitload_forward_op");
static TORCH_SGEMM_STATS: ProfRegion = ProfRegion::new("vaccel_torch_sgemm_op");

/// Torch element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u32)]
pub enum TorchType {
    /// 8-bit unsigned integer.
    Byte = 1,
    /// 8-bit signed integer.
    Char = 2,
    /// 16-bit signed integer.
    Short = 3,
    /// 32-bit signed integer.
    Int = 4,
    /// 64-bit signed integer.
    Long = 5,
    /// 16-bit float.
    Half = 6,
    /// 32-bit float.
    Float = 7,
}

/// An opaque byte buffer handed to the plugin (e.g. run options).
#[repr(C)]
#[derive(Debug)]
pub struct TorchBuffer {
    data: *mut c_void,
    size: usize,
}

impl TorchBuffer {
    /// Creates a buffer owning `data`.
    pub fn new(data: Vec<u8>) -> Self {
        let boxed = data.into_boxed_slice();
        let size = boxed.len();
        Self {
            data: Box::into_raw(boxed).cast(),
            size,
        }
    }

    /// Returns the buffer contents.
    pub fn data(&self) -> &[u8] {
        if self.data.is_null() {
            return &[];
        }
        // SAFETY: data/size were produced by `new`.
        unsafe { std::slice::from_raw_parts(self.data.cast(), self.size) }
    }
}

impl Drop for TorchBuffer {
    fn drop(&mut self) {
        if !self.data.is_null() {
            // SAFETY: produced by Box::into_raw in `new`.
            drop(unsafe {
                Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.data.cast::<u8>(),
                    self.size,
                ))
            });
        }
    }
}

/// A Torch tensor: typed data plus a shape.
#[repr(C)]
#[derive(Debug)]
pub struct TorchTensor {
    data: *mut c_void,
    size: usize,
    owned: bool,
    nr_dims: c_int,
    dims: *mut i64,
    data_type: TorchType,
}

impl TorchTensor {
    /// Creates a tensor with the given shape and no data.
    pub fn new(dims: &[i64], data_type: TorchType) -> Box<Self> {
        let boxed_dims = dims.to_vec().into_boxed_slice();
        let nr_dims = c_int::try_from(dims.len()).unwrap_or(c_int::MAX);
        Box::new(Self {
            data: std::ptr::null_mut(),
            size: 0,
            owned: false,
            nr_dims,
            dims: Box::into_raw(boxed_dims).cast(),
            data_type,
        })
    }

    /// Replaces the tensor data with an owned buffer.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.free_data();
        let boxed = data.into_boxed_slice();
        self.size = boxed.len();
        self.data = Box::into_raw(boxed).cast();
        self.owned = true;
    }

    /// Returns the tensor data.
    pub fn data(&self) -> &[u8] {
        if self.data.is_null() {
            return &[];
        }
        // SAFETY: data/size are either null or a valid owned allocation.
        unsafe { std::slice::from_raw_parts(self.data.cast(), self.size) }
    }

    /// Returns the tensor shape.
    pub fn dims(&self) -> &[i64] {
        if self.dims.is_null() {
            return &[];
        }
        // SAFETY: produced from a boxed slice in `new`.
        unsafe { std::slice::from_raw_parts(self.dims, self.nr_dims as usize) }
    }

    /// Takes ownership of a plugin-allocated tensor.
    ///
    /// # Safety
    ///
    /// `ptr` must originate from [`TorchTensor::new`] and not be aliased.
    pub unsafe fn from_raw(ptr: *mut TorchTensor) -> Box<TorchTensor> {
        // SAFETY: forwarded contract.
        unsafe { Box::from_raw(ptr) }
    }

    fn free_data(&mut self) {
        if self.owned && !self.data.is_null() {
            // SAFETY: owned data is produced by Box::into_raw in set_data.
            drop(unsafe {
                Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.data.cast::<u8>(),
                    self.size,
                ))
            });
        }
        self.data = std::ptr::null_mut();
        self.size = 0;
        self.owned = false;
    }
}

impl Drop for TorchTensor {
    fn drop(&mut self) {
        self.free_data();
        if !self.dims.is_null() {
            // SAFETY: produced from a boxed slice in `new`.
            drop(unsafe {
                Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.dims,
                    self.nr_dims as usize,
                ))
            });
            self.dims = std::ptr::null_mut();
        }
    }
}

type JitloadForwardFn = unsafe extern "C" fn(
    sess: *mut Session,
    model: *const Resource,
    run_options: *const TorchBuffer,
    in_tensors: *const *const TorchTensor,
    nr_inputs: c_int,
    out_tensors: *mut *mut TorchTensor,
    nr_outputs: c_int,
) -> c_int;

type TorchSgemmFn = unsafe extern "C" fn(
    sess: *mut Session,
    m: i64,
    n: i64,
    k: i64,
    alpha: f32,
    a: *const f32,
    lda: i64,
    b: *const f32,
    ldb: i64,
    beta: f32,
    c: *mut f32,
    ldc: i64,
) -> c_int;

/// Loads a jit-traced model from a registered resource and runs a forward
/// pass.
///
/// Returns one output tensor per requested output; tensors are
/// plugin-allocated and become caller-owned.
pub fn jitload_forward(
    sess: &Session,
    model: &Arc<Resource>,
    run_options: Option<&TorchBuffer>,
    in_tensors: &[&TorchTensor],
    nr_outputs: usize,
) -> Result<Vec<Box<TorchTensor>>> {
    if model.resource_type() != ResourceType::Model {
        error!("Invalid resource type: expected model");
        return Err(Error::InvalidArgument);
    }
    if !sess.has_resource(model) {
        error!(
            "Resource {} is not registered to session {}",
            model.id(),
            sess.id()
        );
        return Err(Error::PermissionDenied);
    }
    if in_tensors.is_empty() || nr_outputs == 0 {
        return Err(Error::InvalidArgument);
    }

    let _sample = TORCH_FORWARD_STATS.enter();

    let func = ops::resolve(OpType::TorchJitloadForward, sess)?;
    // SAFETY: ops registered under OpType::TorchJitloadForward carry this
    // signature.
    let func: JitloadForwardFn = unsafe { std::mem::transmute(func) };

    let in_ptrs: Vec<*const TorchTensor> =
        in_tensors.iter().map(|t| std::ptr::from_ref(*t)).collect();
    let mut out_ptrs: Vec<*mut TorchTensor> = vec![std::ptr::null_mut(); nr_outputs];

    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            Arc::as_ptr(model),
            run_options.map_or(std::ptr::null(), std::ptr::from_ref),
            in_ptrs.as_ptr(),
            c_int::try_from(in_ptrs.len()).map_err(|_| Error::InvalidArgument)?,
            out_ptrs.as_mut_ptr(),
            c_int::try_from(nr_outputs).map_err(|_| Error::InvalidArgument)?,
        )
    })?;

    Ok(out_ptrs
        .into_iter()
        .filter(|ptr| !ptr.is_null())
        // SAFETY: plugins allocate outputs through TorchTensor::new.
        .map(|ptr| unsafe { TorchTensor::from_raw(ptr) })
        .collect())
}

/// Dispatches `C = alpha * A x B + beta * C` through a Torch backend.
#[allow(clippy::too_many_arguments)]
pub fn sgemm(
    sess: &Session,
    m: i64,
    n: i64,
    k: i64,
    alpha: f32,
    a: &[f32],
    lda: i64,
    b: &[f32],
    ldb: i64,
    beta: f32,
    c: &mut [f32],
    ldc: i64,
) -> Result<()> {
    let _sample = TORCH_SGEMM_STATS.enter();

    let func = ops::resolve(OpType::TorchSgemm, sess)?;
    // SAFETY: ops registered under OpType::TorchSgemm carry this signature.
    let func: TorchSgemmFn = unsafe { std::mem::transmute(func) };
    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            m,
            n,
            k,
            alpha,
            a.as_ptr(),
            lda,
            b.as_ptr(),
            ldb,
            beta,
            c.as_mut_ptr(),
            ldc,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_roundtrip() {
        let mut tensor = TorchTensor::new(&[1, 3, 224, 224], TorchType::Float);
        assert_eq!(tensor.dims(), &[1, 3, 224, 224]);
        tensor.set_data(vec![1; 16]);
        assert_eq!(tensor.data(), &[1; 16]);
    }
}
