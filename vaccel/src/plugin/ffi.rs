//! Frozen plugin ABI.
//!
//! The descriptor layout, the `vaccel_plugin` export symbol, and the
//! operation function-pointer signatures in this module are the binary
//! contract with plugin shared libraries and must not change. All unsafe
//! symbol handling is confined here.

#![allow(unsafe_code)]

use std::ffi::{CStr, c_char, c_int, c_void};
use std::path::Path;

use libloading::Library;

use crate::arg::Arg;
use crate::resource::Resource;
use crate::session::Session;
use crate::{Error, Result};

/// Type-erased operation entry point.
///
/// Stored type-erased in the op tables; dispatch transmutes to the concrete
/// per-operation signature exactly once per call site.
pub type OpFn = unsafe extern "C" fn();

/// Plugin lifecycle hook.
pub type LifecycleFn = unsafe extern "C" fn() -> c_int;

/// Session lifecycle hook offloaded to a VirtIO plugin.
pub type SessionInitFn = unsafe extern "C" fn(sess: *mut Session, flags: u32) -> c_int;
/// Session update hook offloaded to a VirtIO plugin.
pub type SessionUpdateFn = unsafe extern "C" fn(sess: *mut Session, flags: u32) -> c_int;
/// Session teardown hook offloaded to a VirtIO plugin.
pub type SessionReleaseFn = unsafe extern "C" fn(sess: *mut Session) -> c_int;
/// Resource registration hook offloaded to a VirtIO plugin; must assign a
/// positive remote id to the resource.
pub type ResourceRegisterFn =
    unsafe extern "C" fn(res: *mut Resource, sess: *mut Session) -> c_int;
/// Resource unregistration hook offloaded to a VirtIO plugin.
pub type ResourceUnregisterFn =
    unsafe extern "C" fn(res: *mut Resource, sess: *mut Session) -> c_int;

/// Plugin information block referenced by a [`PluginDescriptor`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginInfo {
    /// Plugin name.
    pub name: *const c_char,
    /// Human-readable plugin version.
    pub version: *const c_char,
    /// Runtime version the plugin was built against (`X.Y.Z[-extra]`).
    pub vaccel_version: *const c_char,
    /// Initialization hook, called after registration.
    pub init: Option<LifecycleFn>,
    /// Teardown hook, called at unregistration.
    pub fini: Option<LifecycleFn>,
    /// Set by VirtIO transport plugins.
    pub is_virtio: bool,
    /// Backend-type bitmask (see the `hint` constants).
    pub type_mask: u32,
    /// Session lifecycle offload; providing both this and
    /// `session_release` classes the plugin as VirtIO.
    pub session_init: Option<SessionInitFn>,
    /// Session update offload.
    pub session_update: Option<SessionUpdateFn>,
    /// Session teardown offload.
    pub session_release: Option<SessionReleaseFn>,
    /// Resource registration offload.
    pub resource_register: Option<ResourceRegisterFn>,
    /// Resource unregistration offload.
    pub resource_unregister: Option<ResourceUnregisterFn>,
}

// Raw pointers are only read behind the registry lock.
unsafe impl Send for PluginInfo {}
unsafe impl Sync for PluginInfo {}

/// Plugin descriptor: the object a shared library exports through the
/// `vaccel_plugin` symbol.
///
/// The two link fields exist for layout compatibility with descriptors
/// built by the legacy C macro; the runtime keeps its own bookkeeping and
/// never follows them.
#[repr(C)]
#[derive(Debug)]
pub struct PluginDescriptor {
    /// Library handle slot (legacy; unused by this runtime).
    pub dl_handle: *mut c_void,
    /// Registry list link (legacy layout slot).
    pub entry: [*mut c_void; 2],
    /// Op list link (legacy layout slot).
    pub ops: [*mut c_void; 2],
    /// Plugin information.
    pub info: *const PluginInfo,
}

unsafe impl Send for PluginDescriptor {}
unsafe impl Sync for PluginDescriptor {}

impl PluginDescriptor {
    /// Builds a descriptor for an in-language plugin.
    pub const fn new(info: &'static PluginInfo) -> Self {
        Self {
            dl_handle: std::ptr::null_mut(),
            entry: [std::ptr::null_mut(); 2],
            ops: [std::ptr::null_mut(); 2],
            info,
        }
    }
}

/// One operation implementation, linked to its owner plugin.
#[repr(C)]
#[derive(Debug)]
pub struct VaccelOp {
    /// Operation type code (see [`crate::ops::OpType`]).
    pub op_type: u32,
    /// Implementation entry point.
    pub func: Option<OpFn>,
    /// Owning plugin descriptor.
    pub owner: *const PluginDescriptor,
    /// Plugin op-list link (legacy layout slot).
    pub plugin_entry: [*mut c_void; 2],
    /// Per-type op-table link (legacy layout slot).
    pub func_entry: [*mut c_void; 2],
}

unsafe impl Send for VaccelOp {}
unsafe impl Sync for VaccelOp {}

impl VaccelOp {
    /// Builds an op record for an in-language plugin.
    pub const fn new(op_type: u32, func: OpFn, owner: &'static PluginDescriptor) -> Self {
        Self {
            op_type,
            func: Some(func),
            owner,
            plugin_entry: [std::ptr::null_mut(); 2],
            func_entry: [std::ptr::null_mut(); 2],
        }
    }
}

/// Argument layout crossing the plugin boundary.
///
/// Mirrors the C `struct vaccel_arg`; dispatch materializes a transient
/// array of these pointing into the Rust-owned [`Arg`] buffers.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FfiArg {
    /// Argument bytes.
    pub buf: *mut c_void,
    /// Size of the argument bytes.
    pub size: usize,
    /// Wire type code ([`crate::arg::ArgType`]).
    pub arg_type: u32,
    /// Custom type id.
    pub custom_type_id: u32,
    /// Whether the runtime owns the bytes (always true here).
    pub owned: bool,
}

/// Builds the transient FFI view of `args`.
///
/// The returned vector borrows each argument's bytes; it must not outlive
/// `args`, and plugins may write through the `buf` pointers of write-args.
pub(crate) fn args_to_ffi(args: &mut [Arg]) -> Vec<FfiArg> {
    args.iter_mut()
        .map(|arg| FfiArg {
            arg_type: arg.arg_type() as u32,
            custom_type_id: arg.custom_type_id(),
            size: arg.size(),
            buf: arg.data_mut().as_mut_ptr().cast(),
            owned: true,
        })
        .collect()
}

/// Converts a C string field of a plugin info block into an owned string.
pub(crate) fn info_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null, NUL-terminated by the plugin ABI contract.
    let s = unsafe { CStr::from_ptr(ptr) };
    s.to_str().ok().map(str::to_owned)
}

/// Loads a plugin shared library and resolves its descriptor.
///
/// The `vaccel_plugin` symbol is a pointer to the descriptor; the returned
/// library handle must stay alive as long as the descriptor is referenced.
pub(crate) fn open_library(path: &Path) -> Result<(Library, &'static PluginDescriptor)> {
    // SAFETY: plugin libraries are trusted code, as in any dlopen host.
    let library = unsafe { Library::new(path) }?;

    let descriptor = {
        // SAFETY: the symbol resolves to a `const struct vaccel_plugin *`.
        let symbol = unsafe { library.get::<*const *const PluginDescriptor>(b"vaccel_plugin\0") }?;
        let ptr: *const PluginDescriptor = unsafe { **symbol };
        if ptr.is_null() {
            return Err(Error::BadLibrary);
        }
        // SAFETY: the descriptor is static data inside the library, which
        // the caller keeps loaded for the registration lifetime.
        unsafe { &*ptr }
    };

    Ok((library, descriptor))
}
