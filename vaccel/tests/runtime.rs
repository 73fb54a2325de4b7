//! End-to-end runtime scenarios: dispatch, resource registration, and
//! VirtIO lifecycle offload, driven through statically registered plugins.

#![allow(unsafe_code)]

use std::ffi::{CStr, c_char, c_int};
use std::sync::atomic::{AtomicU32, Ordering};

use serial_test::serial;
use vaccel::plugin::ffi::{FfiArg, PluginDescriptor, PluginInfo, VaccelOp};
use vaccel::plugin::{self, hint};
use vaccel::resource::{self, PathType, Resource, ResourceType};
use vaccel::session::Session;
use vaccel::{ArgArray, BlobKind, Error, OpType};

// ---------------------------------------------------------------------------
// A local debug plugin implementing noop and exec
// ---------------------------------------------------------------------------

static NOOP_CALLS: AtomicU32 = AtomicU32::new(0);

extern "C" fn plugin_init() -> c_int {
    0
}

extern "C" fn plugin_fini() -> c_int {
    0
}

unsafe extern "C" fn noop_impl(_sess: *mut Session) -> c_int {
    NOOP_CALLS.fetch_add(1, Ordering::SeqCst);
    0
}

/// Doubles the i32 in `read[0]` into `write[0]` when asked for
/// `mytestfunc`, standing in for a user shared object.
unsafe extern "C" fn exec_impl(
    _sess: *mut Session,
    _library: *const c_char,
    fn_symbol: *const c_char,
    read: *mut FfiArg,
    nr_read: usize,
    write: *mut FfiArg,
    nr_write: usize,
) -> c_int {
    let symbol = unsafe { CStr::from_ptr(fn_symbol) };
    if symbol.to_bytes() != b"mytestfunc" {
        return Error::NoExec.to_code();
    }
    if nr_read != 1 || nr_write != 1 {
        return Error::InvalidArgument.to_code();
    }

    let read = unsafe { std::slice::from_raw_parts(read, nr_read) };
    let write = unsafe { std::slice::from_raw_parts_mut(write, nr_write) };
    if read[0].size != 4 || write[0].size != 4 {
        return Error::InvalidArgument.to_code();
    }

    // Argument buffers are byte vectors; read/write unaligned.
    let input = unsafe { read[0].buf.cast::<i32>().read_unaligned() };
    unsafe { write[0].buf.cast::<i32>().write_unaligned(input * 2) };
    0
}

static LOCAL_INFO: PluginInfo = PluginInfo {
    name: c"test-local".as_ptr(),
    version: c"0.1.0".as_ptr(),
    vaccel_version: c"0.7.0".as_ptr(),
    init: Some(plugin_init),
    fini: Some(plugin_fini),
    is_virtio: false,
    type_mask: hint::CPU | hint::DEBUG,
    session_init: None,
    session_update: None,
    session_release: None,
    resource_register: None,
    resource_unregister: None,
};

static LOCAL: PluginDescriptor = PluginDescriptor::new(&LOCAL_INFO);

type NoopFn = unsafe extern "C" fn(*mut Session) -> c_int;
type ExecFn = unsafe extern "C" fn(
    *mut Session,
    *const c_char,
    *const c_char,
    *mut FfiArg,
    usize,
    *mut FfiArg,
    usize,
) -> c_int;

static LOCAL_OPS: [VaccelOp; 2] = [
    VaccelOp::new(
        OpType::Noop as u32,
        // SAFETY: dispatch transmutes back to NoopFn.
        unsafe { std::mem::transmute::<NoopFn, plugin::OpFn>(noop_impl) },
        &LOCAL,
    ),
    VaccelOp::new(
        OpType::Exec as u32,
        // SAFETY: dispatch transmutes back to ExecFn.
        unsafe { std::mem::transmute::<ExecFn, plugin::OpFn>(exec_impl) },
        &LOCAL,
    ),
];

fn register_local_plugin() {
    plugin::register(&LOCAL).unwrap();
    plugin::register_ops(&LOCAL_OPS).unwrap();
}

// ---------------------------------------------------------------------------
// A mock VirtIO plugin
// ---------------------------------------------------------------------------

static VIRTIO_SESSION_INITS: AtomicU32 = AtomicU32::new(0);
static VIRTIO_NOOP_CALLS: AtomicU32 = AtomicU32::new(0);

unsafe extern "C" fn virtio_session_init(sess: *mut Session, _flags: u32) -> c_int {
    VIRTIO_SESSION_INITS.fetch_add(1, Ordering::SeqCst);
    let sess = unsafe { &*sess };
    sess.set_remote_id(1000 + sess.id());
    0
}

unsafe extern "C" fn virtio_session_update(_sess: *mut Session, _flags: u32) -> c_int {
    0
}

unsafe extern "C" fn virtio_session_release(_sess: *mut Session) -> c_int {
    0
}

unsafe extern "C" fn virtio_resource_register(res: *mut Resource, _sess: *mut Session) -> c_int {
    let res = unsafe { &*res };
    res.set_remote_id(2000 + res.id());
    0
}

unsafe extern "C" fn virtio_resource_unregister(
    _res: *mut Resource,
    _sess: *mut Session,
) -> c_int {
    0
}

unsafe extern "C" fn virtio_noop_impl(_sess: *mut Session) -> c_int {
    VIRTIO_NOOP_CALLS.fetch_add(1, Ordering::SeqCst);
    0
}

static VIRTIO_INFO: PluginInfo = PluginInfo {
    name: c"test-virtio".as_ptr(),
    version: c"0.1.0".as_ptr(),
    vaccel_version: c"0.7.0".as_ptr(),
    init: Some(plugin_init),
    fini: Some(plugin_fini),
    is_virtio: true,
    type_mask: hint::GENERIC,
    session_init: Some(virtio_session_init),
    session_update: Some(virtio_session_update),
    session_release: Some(virtio_session_release),
    resource_register: Some(virtio_resource_register),
    resource_unregister: Some(virtio_resource_unregister),
};

static VIRTIO: PluginDescriptor = PluginDescriptor::new(&VIRTIO_INFO);

static VIRTIO_OPS: [VaccelOp; 1] = [VaccelOp::new(
    OpType::Noop as u32,
    // SAFETY: dispatch transmutes back to NoopFn.
    unsafe { std::mem::transmute::<NoopFn, plugin::OpFn>(virtio_noop_impl) },
    &VIRTIO,
)];

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
#[serial(runtime)]
fn exec_round_trip_doubles_input() {
    vaccel::bootstrap().unwrap();
    register_local_plugin();

    let sess = Session::new(hint::DEBUG).unwrap();

    let mut read = ArgArray::new(1);
    read.add_i32(10).unwrap();
    let mut write = ArgArray::new(1);
    write.add_i32(0).unwrap();

    vaccel::ops::exec::exec(
        &sess,
        "libmytestlib.so",
        "mytestfunc",
        read.args_mut(),
        write.args_mut(),
    )
    .unwrap();

    assert_eq!(write.get_i32().unwrap(), 20);

    // The session's registered-resources lists are untouched by exec.
    assert_eq!(sess.resource_count(ResourceType::Lib), 0);
    assert_eq!(sess.resource_count(ResourceType::Data), 0);
    assert_eq!(sess.resource_count(ResourceType::Model), 0);

    sess.release().unwrap();
    vaccel::cleanup().unwrap();
}

#[test]
#[serial(runtime)]
fn genop_matches_typed_entry_point() {
    vaccel::bootstrap().unwrap();
    register_local_plugin();

    let sess = Session::new(hint::DEBUG).unwrap();

    // Typed call.
    NOOP_CALLS.store(0, Ordering::SeqCst);
    vaccel::ops::noop::noop(&sess).unwrap();
    assert_eq!(NOOP_CALLS.load(Ordering::SeqCst), 1);

    // Generic gateway: read[0] is the op code, nothing else.
    let mut read = ArgArray::new(1);
    read.add_raw(&(OpType::Noop as u32).to_ne_bytes()).unwrap();
    vaccel::genop(&sess, read.args_mut(), &mut []).unwrap();
    assert_eq!(NOOP_CALLS.load(Ordering::SeqCst), 2);

    // Generic exec: [op, library, symbol, input], write = [output].
    let mut read = ArgArray::new(4);
    read.add_raw(&(OpType::Exec as u32).to_ne_bytes()).unwrap();
    read.add_string("libmytestlib.so").unwrap();
    read.add_string("mytestfunc").unwrap();
    read.add_i32(21).unwrap();
    let mut write = ArgArray::new(1);
    write.add_i32(0).unwrap();

    vaccel::genop(&sess, read.args_mut(), write.args_mut()).unwrap();
    assert_eq!(write.get_i32().unwrap(), 42);

    sess.release().unwrap();
    vaccel::cleanup().unwrap();
}

#[test]
#[serial(runtime)]
fn genop_rejects_unknown_and_missing_op() {
    vaccel::bootstrap().unwrap();
    register_local_plugin();

    let sess = Session::new(hint::DEBUG).unwrap();

    assert!(matches!(
        vaccel::genop(&sess, &mut [], &mut []),
        Err(Error::InvalidArgument)
    ));

    let mut read = ArgArray::new(1);
    read.add_raw(&999u32.to_ne_bytes()).unwrap();
    assert!(matches!(
        vaccel::genop(&sess, read.args_mut(), &mut []),
        Err(Error::InvalidArgument)
    ));

    sess.release().unwrap();
    vaccel::cleanup().unwrap();
}

#[test]
#[serial(runtime)]
fn saved_model_directory_registration() {
    vaccel::bootstrap().unwrap();
    register_local_plugin();

    let model_dir = tempfile::tempdir().unwrap();
    for name in [
        "saved_model.pb",
        "variables.data-00000-of-00001",
        "variables.index",
    ] {
        std::fs::write(model_dir.path().join(name), b"model-bytes").unwrap();
    }

    let sess = Session::new(0).unwrap();
    let res = Resource::new(model_dir.path().to_str().unwrap(), ResourceType::Model).unwrap();
    let id = res.id();

    assert!(id > 0);
    assert_eq!(res.remote_id(), -1);
    assert_eq!(res.refcount(), 0);
    assert_eq!(res.path_type(), PathType::LocalDir);
    assert_eq!(resource::get_by_id(id).unwrap().id(), id);

    res.register(&sess).unwrap();
    assert_eq!(res.refcount(), 1);
    assert_eq!(res.nr_blobs(), 3);
    assert!(sess.has_resource(&res));
    assert_eq!(sess.resource_count(ResourceType::Model), 1);

    res.with_blobs(|blobs| {
        let expected = [
            "saved_model.pb",
            "variables.data-00000-of-00001",
            "variables.index",
        ];
        for blob in blobs {
            assert_eq!(blob.kind(), BlobKind::File);
            assert!(expected.contains(&blob.name()));
        }
    });

    // Double registration with the same session is rejected.
    assert!(res.register(&sess).is_err());
    assert_eq!(res.refcount(), 1);

    res.unregister(&sess).unwrap();
    assert_eq!(res.refcount(), 0);
    assert!(!sess.has_resource(&res));

    res.release().unwrap();
    assert!(matches!(resource::get_by_id(id), Err(Error::NotFound)));

    sess.release().unwrap();
    vaccel::cleanup().unwrap();
}

#[test]
#[serial(runtime)]
fn release_of_registered_resource_is_busy() {
    vaccel::bootstrap().unwrap();
    register_local_plugin();

    let sess = Session::new(0).unwrap();
    let res = Resource::from_buf(b"payload", ResourceType::Data, Some("data.bin"), true).unwrap();

    res.register(&sess).unwrap();
    assert!(matches!(res.release(), Err(Error::Busy)));

    res.unregister(&sess).unwrap();
    res.release().unwrap();
    // A second release is rejected.
    assert!(matches!(res.release(), Err(Error::InvalidArgument)));

    sess.release().unwrap();
    vaccel::cleanup().unwrap();
}

#[test]
#[serial(runtime)]
fn mem_only_buffer_resource_stays_off_disk() {
    vaccel::bootstrap().unwrap();
    register_local_plugin();

    let sess = Session::new(0).unwrap();
    let res = Resource::from_buf(b"in-memory weights", ResourceType::Data, None, true).unwrap();

    // No rundir, a single buffer blob holding the caller's bytes.
    assert!(res.directory().is_err());
    assert_eq!(res.nr_blobs(), 1);
    res.with_blobs(|blobs| {
        assert_eq!(blobs[0].kind(), BlobKind::Buffer);
        assert_eq!(blobs[0].data().unwrap(), b"in-memory weights");
        assert!(blobs[0].path().is_none());
    });

    res.register(&sess).unwrap();
    assert_eq!(res.refcount(), 1);
    // Registration created no filesystem artifact for the resource.
    assert!(res.directory().is_err());

    res.unregister(&sess).unwrap();
    res.release().unwrap();
    sess.release().unwrap();
    vaccel::cleanup().unwrap();
}

#[test]
#[serial(runtime)]
fn persisted_buffer_resource_lands_in_rundir() {
    vaccel::bootstrap().unwrap();
    register_local_plugin();

    let res =
        Resource::from_buf(b"weights", ResourceType::Model, Some("weights.bin"), false).unwrap();

    let dir = res.directory().unwrap();
    assert!(dir.is_dir());
    assert_eq!(
        dir.file_name().unwrap().to_str().unwrap(),
        format!("resource.{}", res.id())
    );
    res.with_blobs(|blobs| {
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].kind(), BlobKind::Mapped);
        assert_eq!(blobs[0].path().unwrap(), dir.join("weights.bin"));
        assert_eq!(blobs[0].data().unwrap(), b"weights");
    });

    res.release().unwrap();
    assert!(!dir.exists());
    vaccel::cleanup().unwrap();
}

#[test]
#[serial(runtime)]
fn virtio_override_without_remote_bit() {
    vaccel::bootstrap().unwrap();

    // The VirtIO plugin is the only plugin loaded.
    plugin::register(&VIRTIO).unwrap();
    plugin::register_ops(&VIRTIO_OPS).unwrap();
    VIRTIO_SESSION_INITS.store(0, Ordering::SeqCst);
    VIRTIO_NOOP_CALLS.store(0, Ordering::SeqCst);

    let sess = Session::new(0).unwrap();
    assert!(sess.is_virtio());
    assert_eq!(VIRTIO_SESSION_INITS.load(Ordering::SeqCst), 1);
    assert_eq!(sess.remote_id(), 1000 + sess.id());

    // Dispatch routes to the VirtIO implementation.
    vaccel::ops::noop::noop(&sess).unwrap();
    assert_eq!(VIRTIO_NOOP_CALLS.load(Ordering::SeqCst), 1);

    // Resource registration is offloaded and assigns a remote id.
    let res = Resource::from_buf(b"remote data", ResourceType::Data, None, true).unwrap();
    res.register(&sess).unwrap();
    assert_eq!(res.remote_id(), 2000 + res.id());

    res.unregister(&sess).unwrap();
    res.release().unwrap();
    sess.release().unwrap();
    vaccel::cleanup().unwrap();
}

static OLD_MAJOR_INFO: PluginInfo = PluginInfo {
    name: c"test-old-major".as_ptr(),
    version: c"0.1.0".as_ptr(),
    vaccel_version: c"1.2.3".as_ptr(),
    init: Some(plugin_init),
    fini: Some(plugin_fini),
    is_virtio: false,
    type_mask: hint::CPU,
    session_init: None,
    session_update: None,
    session_release: None,
    resource_register: None,
    resource_unregister: None,
};

static OLD_MAJOR: PluginDescriptor = PluginDescriptor::new(&OLD_MAJOR_INFO);

#[test]
#[serial(runtime)]
fn version_ignore_allows_major_mismatch() {
    let config = vaccel::Config::new(None, vaccel::LogLevel::default(), None, false, true);
    vaccel::bootstrap_with_config(&config).unwrap();

    plugin::register(&OLD_MAJOR).unwrap();
    assert_eq!(plugin::nr_plugins(), 1);

    vaccel::cleanup().unwrap();

    // Without the override the same plugin is rejected.
    vaccel::bootstrap().unwrap();
    assert!(plugin::register(&OLD_MAJOR).is_err());
    vaccel::cleanup().unwrap();
}

#[test]
#[serial(runtime)]
fn remote_hint_without_virtio_plugin_fails() {
    vaccel::bootstrap().unwrap();
    register_local_plugin();

    assert!(matches!(
        Session::new(hint::REMOTE),
        Err(Error::NotSupported)
    ));

    vaccel::cleanup().unwrap();
}

#[test]
#[serial(runtime)]
fn local_plugin_wins_over_virtio_when_both_loaded() {
    vaccel::bootstrap().unwrap();
    register_local_plugin();
    plugin::register(&VIRTIO).unwrap();
    plugin::register_ops(&VIRTIO_OPS).unwrap();

    NOOP_CALLS.store(0, Ordering::SeqCst);
    VIRTIO_NOOP_CALLS.store(0, Ordering::SeqCst);

    // No REMOTE bit and no matching type bits: first local implementation.
    let sess = Session::new(0).unwrap();
    assert!(!sess.is_virtio());
    vaccel::ops::noop::noop(&sess).unwrap();
    assert_eq!(NOOP_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(VIRTIO_NOOP_CALLS.load(Ordering::SeqCst), 0);

    // The REMOTE bit routes to the VirtIO implementation.
    let remote = Session::new(hint::REMOTE).unwrap();
    assert!(remote.is_virtio());
    vaccel::ops::noop::noop(&remote).unwrap();
    assert_eq!(VIRTIO_NOOP_CALLS.load(Ordering::SeqCst), 1);

    remote.release().unwrap();
    sess.release().unwrap();
    vaccel::cleanup().unwrap();
}

#[test]
#[serial(runtime)]
fn dispatch_without_implementation_is_not_supported() {
    vaccel::bootstrap().unwrap();
    register_local_plugin();

    let sess = Session::new(hint::DEBUG).unwrap();
    let mut out = vec![0f64; 4];
    assert!(matches!(
        vaccel::ops::minmax::minmax(&sess, &[1.0, 2.0, 3.0, 4.0], 0, 0, &mut out),
        Err(Error::NotSupported)
    ));

    sess.release().unwrap();
    vaccel::cleanup().unwrap();
}

#[test]
#[serial(runtime)]
fn session_release_unregisters_resources() {
    vaccel::bootstrap().unwrap();
    register_local_plugin();

    let sess = Session::new(0).unwrap();
    let res = Resource::from_buf(b"shared", ResourceType::Data, None, true).unwrap();
    res.register(&sess).unwrap();
    assert_eq!(res.refcount(), 1);

    sess.release().unwrap();
    assert_eq!(res.refcount(), 0);

    res.release().unwrap();
    vaccel::cleanup().unwrap();
}

#[test]
#[serial(runtime)]
fn exec_with_unregistered_resource_is_denied() {
    vaccel::bootstrap().unwrap();
    register_local_plugin();

    let scratch = tempfile::tempdir().unwrap();
    let lib_path = scratch.path().join("libtest.so");
    std::fs::write(&lib_path, b"not really elf").unwrap();

    let sess = Session::new(hint::DEBUG).unwrap();
    let res = Resource::new(lib_path.to_str().unwrap(), ResourceType::Lib).unwrap();

    let mut read = ArgArray::new(1);
    read.add_i32(1).unwrap();
    assert!(matches!(
        vaccel::ops::exec::exec_with_resource(
            &sess,
            &res,
            "mytestfunc",
            read.args_mut(),
            &mut [],
        ),
        Err(Error::PermissionDenied)
    ));

    res.release().unwrap();
    sess.release().unwrap();
    vaccel::cleanup().unwrap();
}
