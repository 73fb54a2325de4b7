//! TensorFlow session operations and the tensor types crossing the plugin
//! boundary.
//!
//! The struct layouts here are part of the plugin ABI. Output tensors of
//! [`session_run`] are allocated by the plugin through the constructors of
//! this module and become caller-owned.

#![allow(unsafe_code)]

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::sync::Arc;

use tracing::error;

use crate::ops::{self, OpType};
use crate::profiling::ProfRegion;
use crate::resource::{Resource, ResourceType};
use crate::session::Session;
use crate::{Error, Result, error};

static TF_LOAD_STATS: ProfRegion = ProfRegion::new("vaccel_tf_session_load");
static TF_RUN_STATS: ProfRegion = ProfRegion::new("vaccel_tf_session_run");
static TF_DELETE_STATS: ProfRegion = ProfRegion::new("vaccel_tf_session_delete");

/// TensorFlow element types; values mirror `TF_DataType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u32)]
pub enum TfDataType {
    /// 32-bit float.
    Float = 1,
    /// 64-bit float.
    Double = 2,
    /// 32-bit signed integer.
    Int32 = 3,
    /// 8-bit unsigned integer.
    UInt8 = 4,
    /// 16-bit signed integer.
    Int16 = 5,
    /// 8-bit signed integer.
    Int8 = 6,
    /// String elements.
    String = 7,
    /// Single-precision complex.
    Complex64 = 8,
    /// 64-bit signed integer.
    Int64 = 9,
    /// Boolean.
    Bool = 10,
    /// Quantized int8.
    QInt8 = 11,
    /// Quantized uint8.
    QUInt8 = 12,
    /// Quantized int32.
    QInt32 = 13,
    /// Float32 truncated to 16 bits.
    BFloat16 = 14,
    /// Quantized int16.
    QInt16 = 15,
    /// Quantized uint16.
    QUInt16 = 16,
    /// 16-bit unsigned integer.
    UInt16 = 17,
    /// Double-precision complex.
    Complex128 = 18,
    /// 16-bit float.
    Half = 19,
    /// Resource handle.
    Resource = 20,
    /// Variant.
    Variant = 21,
    /// 32-bit unsigned integer.
    UInt32 = 22,
    /// 64-bit unsigned integer.
    UInt64 = 23,
}

/// An opaque byte buffer handed to the plugin (e.g. run options).
#[repr(C)]
#[derive(Debug)]
pub struct TfBuffer {
    data: *mut c_void,
    size: usize,
}

impl TfBuffer {
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

    /// Returns the buffer size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for TfBuffer {
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

/// A named graph node.
#[repr(C)]
#[derive(Debug)]
pub struct TfNode {
    name: *mut c_char,
    id: c_int,
}

impl TfNode {
    /// Creates a node from a name and an output index.
    pub fn new(name: &str, id: i32) -> Result<Self> {
        let name = CString::new(name).map_err(|_| Error::InvalidArgument)?;
        Ok(Self {
            name: name.into_raw(),
            id,
        })
    }

    /// Returns the node name.
    pub fn name(&self) -> &str {
        // SAFETY: produced by CString::into_raw in `new`.
        unsafe { CStr::from_ptr(self.name) }.to_str().unwrap_or("")
    }

    /// Returns the node output index.
    pub fn id(&self) -> i32 {
        self.id
    }
}

impl Drop for TfNode {
    fn drop(&mut self) {
        if !self.name.is_null() {
            // SAFETY: produced by CString::into_raw in `new`.
            drop(unsafe { CString::from_raw(self.name) });
        }
    }
}

/// A tensor: typed data plus a shape.
#[repr(C)]
#[derive(Debug)]
pub struct TfTensor {
    data: *mut c_void,
    size: usize,
    owned: bool,
    nr_dims: c_int,
    dims: *mut i64,
    data_type: TfDataType,
}

impl TfTensor {
    /// Creates a tensor with the given shape and no data.
    pub fn new(dims: &[i64], data_type: TfDataType) -> Box<Self> {
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
    pub fn allocate(dims: &[i64], data_type: TfDataType, total_size: usize) -> Box<Self> {
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
    pub fn dims(&self) -> &[i64] {
        if self.dims.is_null() {
            return &[];
        }
        // SAFETY: produced from a boxed slice in `new`.
        unsafe { std::slice::from_raw_parts(self.dims, self.nr_dims as usize) }
    }

    /// Returns the element type.
    pub fn data_type(&self) -> TfDataType {
        self.data_type
    }

    /// Takes ownership of a plugin-allocated tensor.
    ///
    /// # Safety
    ///
    /// `ptr` must originate from [`TfTensor::new`]/[`TfTensor::allocate`]
    /// (plugins allocate output tensors through these) and not be aliased.
    pub unsafe fn from_raw(ptr: *mut TfTensor) -> Box<TfTensor> {
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

impl Drop for TfTensor {
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

/// Status block filled by the plugin.
#[repr(C)]
#[derive(Debug)]
pub struct TfStatus {
    /// TensorFlow error code; 0 is success.
    pub error_code: u8,
    /// TensorFlow error message; owned by the plugin.
    message: *const c_char,
}

impl TfStatus {
    /// Creates an empty (success) status.
    pub fn new() -> Self {
        Self {
            error_code: 0,
            message: std::ptr::null(),
        }
    }

    /// Returns the plugin-reported message, if any.
    pub fn message(&self) -> Option<String> {
        if self.message.is_null() {
            return None;
        }
        // SAFETY: the plugin stores a NUL-terminated string.
        let s = unsafe { CStr::from_ptr(self.message) };
        s.to_str().ok().map(str::to_owned)
    }
}

impl Default for TfStatus {
    fn default() -> Self {
        Self::new()
    }
}

type SessionLoadFn =
    unsafe extern "C" fn(sess: *mut Session, model: *mut Resource, status: *mut TfStatus) -> c_int;

type SessionRunFn = unsafe extern "C" fn(
    sess: *mut Session,
    model: *const Resource,
    run_options: *const TfBuffer,
    in_nodes: *const TfNode,
    in_tensors: *const *const TfTensor,
    nr_inputs: c_int,
    out_nodes: *const TfNode,
    out_tensors: *mut *mut TfTensor,
    nr_outputs: c_int,
    status: *mut TfStatus,
) -> c_int;

type SessionDeleteFn =
    unsafe extern "C" fn(sess: *mut Session, model: *mut Resource, status: *mut TfStatus) -> c_int;

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

/// Loads a TensorFlow session from a registered model resource.
pub fn session_load(sess: &Session, model: &Arc<Resource>, status: &mut TfStatus) -> Result<()> {
    check_model(sess, model)?;
    let _sample = TF_LOAD_STATS.enter();

    let func = ops::resolve(OpType::TfSessionLoad, sess)?;
    // SAFETY: ops registered under OpType::TfSessionLoad carry this
    // signature.
    let func: SessionLoadFn = unsafe { std::mem::transmute(func) };
    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            Arc::as_ptr(model).cast_mut(),
            std::ptr::from_mut(status),
        )
    })
}

/// Runs a loaded TensorFlow session.
///
/// Feeds `in_tensors` into `in_nodes` and fetches one output tensor per
/// entry of `out_nodes`. Returned tensors are plugin-allocated and become
/// caller-owned.
pub fn session_run(
    sess: &Session,
    model: &Arc<Resource>,
    run_options: Option<&TfBuffer>,
    in_nodes: &[TfNode],
    in_tensors: &[&TfTensor],
    out_nodes: &[TfNode],
    status: &mut TfStatus,
) -> Result<Vec<Box<TfTensor>>> {
    if in_nodes.len() != in_tensors.len() || out_nodes.is_empty() {
        return Err(Error::InvalidArgument);
    }
    check_model(sess, model)?;
    let _sample = TF_RUN_STATS.enter();

    let func = ops::resolve(OpType::TfSessionRun, sess)?;
    // SAFETY: ops registered under OpType::TfSessionRun carry this
    // signature.
    let func: SessionRunFn = unsafe { std::mem::transmute(func) };

    let in_ptrs: Vec<*const TfTensor> =
        in_tensors.iter().map(|t| std::ptr::from_ref(*t)).collect();
    let mut out_ptrs: Vec<*mut TfTensor> = vec![std::ptr::null_mut(); out_nodes.len()];

    let nr_inputs = c_int::try_from(in_nodes.len()).map_err(|_| Error::InvalidArgument)?;
    let nr_outputs = c_int::try_from(out_nodes.len()).map_err(|_| Error::InvalidArgument)?;

    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            Arc::as_ptr(model),
            run_options.map_or(std::ptr::null(), std::ptr::from_ref),
            in_nodes.as_ptr(),
            in_ptrs.as_ptr(),
            nr_inputs,
            out_nodes.as_ptr(),
            out_ptrs.as_mut_ptr(),
            nr_outputs,
            std::ptr::from_mut(status),
        )
    })?;

    Ok(out_ptrs
        .into_iter()
        .filter(|ptr| !ptr.is_null())
        // SAFETY: plugins allocate outputs through TfTensor constructors.
        .map(|ptr| unsafe { TfTensor::from_raw(ptr) })
        .collect())
}

/// Deletes a loaded TensorFlow session.
pub fn session_delete(sess: &Session, model: &Arc<Resource>, status: &mut TfStatus) -> Result<()> {
    check_model(sess, model)?;
    let _sample = TF_DELETE_STATS.enter();

    let func = ops::resolve(OpType::TfSessionDelete, sess)?;
    // SAFETY: ops registered under OpType::TfSessionDelete carry this
    // signature.
    let func: SessionDeleteFn = unsafe { std::mem::transmute(func) };
    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            Arc::as_ptr(model).cast_mut(),
            std::ptr::from_mut(status),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_roundtrip() {
        let mut tensor = TfTensor::new(&[1, 2, 3], TfDataType::Float);
        assert_eq!(tensor.dims(), &[1, 2, 3]);
        assert_eq!(tensor.data_type(), TfDataType::Float);
        assert!(tensor.data().is_empty());

        tensor.set_data(vec![1, 2, 3, 4]);
        assert_eq!(tensor.data(), &[1, 2, 3, 4]);

        tensor.set_data(vec![9; 8]);
        assert_eq!(tensor.data().len(), 8);
    }

    #[test]
    fn tensor_allocate_zeroes() {
        let tensor = TfTensor::allocate(&[2, 2], TfDataType::Int32, 16);
        assert_eq!(tensor.data(), &[0u8; 16]);
    }

    #[test]
    fn buffer_owns_bytes() {
        let buffer = TfBuffer::new(vec![7, 8, 9]);
        assert_eq!(buffer.data(), &[7, 8, 9]);
        assert_eq!(buffer.size(), 3);
    }

    #[test]
    fn node_name_roundtrip() {
        let node = TfNode::new("serving_default_input", 0).unwrap();
        assert_eq!(node.name(), "serving_default_input");
        assert_eq!(node.id(), 0);
    }

    #[test]
    fn status_message_absent_by_default() {
        let status = TfStatus::new();
        assert_eq!(status.error_code, 0);
        assert!(status.message().is_none());
    }
}
