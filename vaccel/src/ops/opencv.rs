//! OpenCV generic operation: an argument-vector passthrough.

#![allow(unsafe_code)]

use std::ffi::c_int;

use crate::arg::Arg;
use crate::ops::{self, OpType};
use crate::plugin::ffi::{self, FfiArg};
use crate::profiling::ProfRegion;
use crate::session::Session;
use crate::{Result, error};

static OPENCV_STATS: ProfRegion = ProfRegion::new("vaccel_opencv_op");

/// Plugin entry point signature.
type OpencvFn = unsafe extern "C" fn(
    sess: *mut Session,
    read: *mut FfiArg,
    nr_read: usize,
    write: *mut FfiArg,
    nr_write: usize,
) -> c_int;

/// Dispatches a generic OpenCV operation; the plugin interprets the
/// argument vectors.
pub fn opencv(sess: &Session, read: &mut [Arg], write: &mut [Arg]) -> Result<()> {
    let _sample = OPENCV_STATS.enter();

    let func = ops::resolve(OpType::Opencv, sess)?;
    // SAFETY: ops registered under OpType::Opencv carry this signature.
    let func: OpencvFn = unsafe { std::mem::transmute(func) };

    let mut ffi_read = ffi::args_to_ffi(read);
    let mut ffi_write = ffi::args_to_ffi(write);
    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            ffi_read.as_mut_ptr(),
            ffi_read.len(),
            ffi_write.as_mut_ptr(),
            ffi_write.len(),
        )
    })
}

/// Generic-gateway unpacker: forwards both vectors verbatim.
pub(crate) fn unpack(sess: &Session, read: &mut [Arg], write: &mut [Arg]) -> Result<()> {
    opencv(sess, read, write)
}
