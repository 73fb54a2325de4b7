//! Library-exec operations: run an arbitrary symbol from a shared object.

#![allow(unsafe_code)]

use std::ffi::{CString, c_char, c_int};
use std::sync::Arc;

use tracing::error;

use crate::arg::Arg;
use crate::ops::{self, OpType};
use crate::plugin::ffi::{self, FfiArg};
use crate::profiling::ProfRegion;
use crate::resource::{self, Resource, ResourceType};
use crate::session::Session;
use crate::{Error, Result, error};

static EXEC_STATS: ProfRegion = ProfRegion::new("vaccel_exec_op");
static EXEC_RES_STATS: ProfRegion = ProfRegion::new("vaccel_exec_with_resource_op");

/// Plugin entry point signature for exec.
type ExecFn = unsafe extern "C" fn(
    sess: *mut Session,
    library: *const c_char,
    fn_symbol: *const c_char,
    read: *mut FfiArg,
    nr_read: usize,
    write: *mut FfiArg,
    nr_write: usize,
) -> c_int;

/// Plugin entry point signature for exec-with-resource.
type ExecWithResourceFn = unsafe extern "C" fn(
    sess: *mut Session,
    object: *mut Resource,
    fn_symbol: *const c_char,
    read: *mut FfiArg,
    nr_read: usize,
    write: *mut FfiArg,
    nr_write: usize,
) -> c_int;

/// Executes `fn_symbol` from the shared library at `library`.
///
/// The plugin is responsible for loading the library, resolving the symbol
/// and invoking it with the read/write argument vectors.
pub fn exec(
    sess: &Session,
    library: &str,
    fn_symbol: &str,
    read: &mut [Arg],
    write: &mut [Arg],
) -> Result<()> {
    let _sample = EXEC_STATS.enter();

    let func = ops::resolve(OpType::Exec, sess)?;
    // SAFETY: ops registered under OpType::Exec carry this signature.
    let func: ExecFn = unsafe { std::mem::transmute(func) };

    let c_library = CString::new(library).map_err(|_| Error::InvalidArgument)?;
    let c_symbol = CString::new(fn_symbol).map_err(|_| Error::InvalidArgument)?;
    let mut ffi_read = ffi::args_to_ffi(read);
    let mut ffi_write = ffi::args_to_ffi(write);

    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            c_library.as_ptr(),
            c_symbol.as_ptr(),
            ffi_read.as_mut_ptr(),
            ffi_read.len(),
            ffi_write.as_mut_ptr(),
            ffi_write.len(),
        )
    })
}

/// Executes `fn_symbol` from a registered shared-object resource.
pub fn exec_with_resource(
    sess: &Session,
    object: &Arc<Resource>,
    fn_symbol: &str,
    read: &mut [Arg],
    write: &mut [Arg],
) -> Result<()> {
    if object.resource_type() != ResourceType::Lib {
        error!("Invalid resource type: expected lib");
        return Err(Error::InvalidArgument);
    }
    if !sess.has_resource(object) {
        error!(
            "Resource {} is not registered to session {}",
            object.id(),
            sess.id()
        );
        return Err(Error::PermissionDenied);
    }

    let _sample = EXEC_RES_STATS.enter();

    let func = ops::resolve(OpType::ExecWithResource, sess)?;
    // SAFETY: ops registered under OpType::ExecWithResource carry this
    // signature.
    let func: ExecWithResourceFn = unsafe { std::mem::transmute(func) };

    let c_symbol = CString::new(fn_symbol).map_err(|_| Error::InvalidArgument)?;
    let mut ffi_read = ffi::args_to_ffi(read);
    let mut ffi_write = ffi::args_to_ffi(write);

    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            Arc::as_ptr(object).cast_mut(),
            c_symbol.as_ptr(),
            ffi_read.as_mut_ptr(),
            ffi_read.len(),
            ffi_write.as_mut_ptr(),
            ffi_write.len(),
        )
    })
}

/// Generic-gateway unpacker: `read[0..1]` are library path and symbol, the
/// rest of the reads and all writes are forwarded verbatim.
pub(crate) fn unpack(sess: &Session, read: &mut [Arg], write: &mut [Arg]) -> Result<()> {
    if read.len() < 2 {
        error!("Wrong number of read arguments in exec: {}", read.len());
        return Err(Error::InvalidArgument);
    }

    let library = string_arg(&read[0])?;
    let fn_symbol = string_arg(&read[1])?;
    exec(sess, &library, &fn_symbol, &mut read[2..], write)
}

/// Generic-gateway unpacker: `read[0]` is a resource id, `read[1]` the
/// symbol.
pub(crate) fn unpack_with_resource(
    sess: &Session,
    read: &mut [Arg],
    write: &mut [Arg],
) -> Result<()> {
    if read.len() < 2 {
        error!("Wrong number of read arguments in exec: {}", read.len());
        return Err(Error::InvalidArgument);
    }

    let id_bytes: [u8; 8] = read[0]
        .data()
        .try_into()
        .map_err(|_| Error::InvalidArgument)?;
    let object = resource::get_by_id(i64::from_ne_bytes(id_bytes)).inspect_err(|e| {
        error!("cannot find resource: {e}");
    })?;

    let fn_symbol = string_arg(&read[1])?;
    exec_with_resource(sess, &object, &fn_symbol, &mut read[2..], write)
}

/// Reads a NUL-terminated string argument.
fn string_arg(arg: &Arg) -> Result<String> {
    let bytes = arg.data();
    let Some((&0, content)) = bytes.split_last() else {
        return Err(Error::InvalidArgument);
    };
    std::str::from_utf8(content)
        .map(str::to_owned)
        .map_err(|_| Error::InvalidArgument)
}
