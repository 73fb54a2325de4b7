//! Debug no-op operation.

#![allow(unsafe_code)]

use std::ffi::c_int;

use tracing::error;

use crate::arg::Arg;
use crate::ops::{self, OpType};
use crate::profiling::ProfRegion;
use crate::session::Session;
use crate::{Error, Result, error};

static NOOP_STATS: ProfRegion = ProfRegion::new("vaccel_noop_op");

/// Plugin entry point signature.
type NoopFn = unsafe extern "C" fn(sess: *mut Session) -> c_int;

/// Dispatches the no-op operation.
pub fn noop(sess: &Session) -> Result<()> {
    let _sample = NOOP_STATS.enter();

    let func = ops::resolve(OpType::Noop, sess)?;
    // SAFETY: ops registered under OpType::Noop carry this signature.
    let func: NoopFn = unsafe { std::mem::transmute(func) };
    error::check(unsafe { func(std::ptr::from_ref(sess).cast_mut()) })
}

/// Generic-gateway unpacker: no arguments on either side.
pub(crate) fn unpack(sess: &Session, read: &mut [Arg], write: &mut [Arg]) -> Result<()> {
    if !read.is_empty() {
        error!("Wrong number of read arguments in noop: {}", read.len());
        return Err(Error::InvalidArgument);
    }
    if !write.is_empty() {
        error!("Wrong number of write arguments in noop: {}", write.len());
        return Err(Error::InvalidArgument);
    }
    noop(sess)
}
