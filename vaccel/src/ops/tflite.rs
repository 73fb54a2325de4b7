//! TensorFlow Lite session operations.
//!
//! Same shape as the TensorFlow family, without node names: tensors are fed
//! and fetched by position.

#![allow(unsafe_code)]

use std::ffi::{c_int, c_void};
use std::sync::Arc;

use tracing::error;

use crate::ops::{self, OpType};
use crate::profiling::ProfRegion;
use crate::resource::{Resource, ResourceType};
use crate::session::Session;
use crate::{Error, Result, error};

static TFLITE_LOAD_STATS: ProfRegion = ProfRegion::new("vaccel_tflite_session_load");
static TFLITE_RUN_STATS: ProfRegion = ProfRegion::new("vaccel_tflite_session_run");
static TFLITE_DELETE_STATS: ProfRegion = ProfRegion::new("vaccel_tflite_session_delete");

/// TensorFlow Lite element types; values mirror `TfLiteType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u32)]
pub enum TfliteType {
    /// Untyped.
    NoType = 0,
    /// 32-bit float.
    Float32 = 1,
    /// 32-bit signed integer.
    Int32 = 2,
    /// 8-bit unsigned integer.
    UInt8 = 3,
    /// 64-bit signed integer.
    Int64 = 4,
    /// String elements.
    String = 5,
    /// Boolean.
    Bool = 6,
    /// 16-bit signed integer.
    Int16 = 7,
    /// Single-precision complex.
    Complex64 = 8,
    /// 8-bit signed integer.
    Int8 = 9,
    /// 16-bit float.
    Float16 = 10,
    /// 64-bit float.
    Float64 = 11,
}

/// A TensorFlow Lite tensor: typed data plus a 32-bit shape.
#[repr(C)]
#[derive(Debug)]
pub struct TfliteTensor {
    data: *mut c_void,
    size: usize,
    owned: bool,
    nr_dims: c_int,
    dims: *mut i32,
    data_type: TfliteType,
}

impl TfliteTensor {
    /// Creates a tensor with the given shape and no data.
    pub fn new(dims: &[i32], data_type: TfliteType) -> Box<Self> {
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

    /// Creates a tensor with the given shape and `total_size` zeroed bytes.
    pub fn allocate(dims: &[i32], data_type: TfliteType, total_size: usize) -> Box<Self> {
        let mut tensor = Self::new(dims, data_type);
        if total_size > 0 {
            tensor.set_data(vec![0u8; total_size]);
        }
        tensor
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
    pub fn dims(&self) -> &[i32] {
        if self.dims.is_null() {
            return &[];
        }
        // SAFETY: produced from a boxed slice in `new`.
        unsafe { std::slice::from_raw_parts(self.dims, self.nr_dims as usize) }
    }

    /// Returns the element type.
    pub fn data_type(&self) -> TfliteType {
        self.data_type
    }

    /// Takes ownership of a plugin-allocated tensor.
    ///
    /// # Safety
    ///
    /// `ptr` must originate from [`TfliteTensor::new`] /
    /// [`TfliteTensor::allocate`] and not be aliased.
    pub unsafe fn from_raw(ptr: *mut TfliteTensor) -> Box<TfliteTensor> {
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

impl Drop for TfliteTensor {
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

type SessionLoadFn = unsafe extern "C" fn(sess: *mut Session, model: *mut Resource) -> c_int;

type SessionRunFn = unsafe extern "C" fn(
    sess: *mut Session,
    model: *const Resource,
    in_tensors: *const *const TfliteTensor,
    nr_inputs: c_int,
    out_tensors: *mut *mut TfliteTensor,
    nr_outputs: c_int,
    status: *mut u8,
) -> c_int;

type SessionDeleteFn = unsafe extern "C" fn(sess: *mut Session, model: *mut Resource) -> c_int;

/// Validates that `model` is a model resource registered with `sess`.
fn check_model(sess: &Session, model: &Arc<Resource>) -> Result<()> {
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
    Ok(())
}

/// Loads a TensorFlow Lite session from a registered model resource.
pub fn session_load(sess: &Session, model: &Arc<Resource>) -> Result<()> {
    check_model(sess, model)?;
    let _sample = TFLITE_LOAD_STATS.enter();

    let func = ops::resolve(OpType::TfliteSessionLoad, sess)?;
    // SAFETY: ops registered under OpType::TfliteSessionLoad carry this
    // signature.
    let func: SessionLoadFn = unsafe { std::mem::transmute(func) };
    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            Arc::as_ptr(model).cast_mut(),
        )
    })
}

/// Runs a loaded TensorFlow Lite session.
///
/// Returns the fetched tensors and the interpreter status byte. Output
/// tensors are plugin-allocated and become caller-owned.
pub fn session_run(
    sess: &Session,
    model: &Arc<Resource>,
    in_tensors: &[&TfliteTensor],
    nr_outputs: usize,
) -> Result<(Vec<Box<TfliteTensor>>, u8)> {
    if in_tensors.is_empty() || nr_outputs == 0 {
        return Err(Error::InvalidArgument);
    }
    check_model(sess, model)?;
    let _sample = TFLITE_RUN_STATS.enter();

    let func = ops::resolve(OpType::TfliteSessionRun, sess)?;
    // SAFETY: ops registered under OpType::TfliteSessionRun carry this
    // signature.
    let func: SessionRunFn = unsafe { std::mem::transmute(func) };

    let in_ptrs: Vec<*const TfliteTensor> =
        in_tensors.iter().map(|t| std::ptr::from_ref(*t)).collect();
    let mut out_ptrs: Vec<*mut TfliteTensor> = vec![std::ptr::null_mut(); nr_outputs];
    let mut status = 0u8;

    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            Arc::as_ptr(model),
            in_ptrs.as_ptr(),
            c_int::try_from(in_ptrs.len()).map_err(|_| Error::InvalidArgument)?,
            out_ptrs.as_mut_ptr(),
            c_int::try_from(nr_outputs).map_err(|_| Error::InvalidArgument)?,
            &raw mut status,
        )
    })?;

    let outputs = out_ptrs
        .into_iter()
        .filter(|ptr| !ptr.is_null())
        // SAFETY: plugins allocate outputs through TfliteTensor
        // constructors.
        .map(|ptr| unsafe { TfliteTensor::from_raw(ptr) })
        .collect();
    Ok((outputs, status))
}

/// Deletes a loaded TensorFlow Lite session.
pub fn session_delete(sess: &Session, model: &Arc<Resource>) -> Result<()> {
    check_model(sess, model)?;
    let _sample = TFLITE_DELETE_STATS.enter();

    let func = ops::resolve(OpType::TfliteSessionDelete, sess)?;
    // SAFETY: ops registered under OpType::TfliteSessionDelete carry this
    // signature.
    let func: SessionDeleteFn = unsafe { std::mem::transmute(func) };
    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            Arc::as_ptr(model).cast_mut(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_roundtrip() {
        let mut tensor = TfliteTensor::new(&[1, 224, 224, 3], TfliteType::Float32);
        assert_eq!(tensor.dims(), &[1, 224, 224, 3]);
        assert!(tensor.data().is_empty());

        tensor.set_data(vec![5; 12]);
        assert_eq!(tensor.data(), &[5; 12]);
    }

    #[test]
    fn allocate_zeroes() {
        let tensor = TfliteTensor::allocate(&[4], TfliteType::Int8, 4);
        assert_eq!(tensor.data(), &[0, 0, 0, 0]);
    }
}
