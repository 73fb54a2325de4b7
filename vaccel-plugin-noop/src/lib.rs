//! Debug software-fallback plugin.
//!
//! Implements the generically dispatchable operations in plain software:
//! useful for exercising dispatch, the exec path, and client plumbing
//! without an accelerator. Exported through the frozen `vaccel_plugin`
//! symbol.

#![allow(unsafe_code)]
#![allow(clippy::missing_safety_doc)]

use std::ffi::{CStr, c_char, c_int, c_uchar, c_void};

use tracing::{debug, warn};
use vaccel::Error;
use vaccel::plugin::ffi::{FfiArg, PluginDescriptor, PluginInfo, VaccelOp};
use vaccel::plugin::hint;
use vaccel::session::Session;

/// Classification tag returned by the dummy image ops.
const IMAGE_TAG: &[u8] = b"This is a dummy classification tag!";
/// Output image name returned by the dummy image ops.
const IMAGE_NAME: &[u8] = b"noop_image";

extern "C" fn init() -> c_int {
    match vaccel::plugin::register_ops(&OPS) {
        Ok(()) => 0,
        Err(e) => e.to_code(),
    }
}

extern "C" fn fini() -> c_int {
    0
}

unsafe extern "C" fn noop(sess: *mut Session) -> c_int {
    let Some(sess) = (unsafe { sess.as_ref() }) else {
        return Error::InvalidArgument.to_code();
    };
    debug!("[noop] session:{} noop", sess.id());
    0
}

#[allow(clippy::many_single_char_names)]
unsafe extern "C" fn sgemm(
    sess: *mut Session,
    m: i64,
    n: i64,
    k: i64,
    alpha: f32,
    a: *const f32,
    _lda: i64,
    b: *const f32,
    _ldb: i64,
    beta: f32,
    c: *mut f32,
    _ldc: i64,
) -> c_int {
    if sess.is_null() || a.is_null() || b.is_null() || c.is_null() || m < 0 || n < 0 || k < 0 {
        return Error::InvalidArgument.to_code();
    }
    let (m, n, k) = (m as usize, n as usize, k as usize);
    let a = unsafe { std::slice::from_raw_parts(a, m * k) };
    let b = unsafe { std::slice::from_raw_parts(b, k * n) };
    let c = unsafe { std::slice::from_raw_parts_mut(c, m * n) };

    for i in 0..m {
        for j in 0..n {
            let mut acc = 0f32;
            for l in 0..k {
                acc += a[i * k + l] * b[l * n + j];
            }
            c[i * n + j] = alpha * acc + beta * c[i * n + j];
        }
    }
    0
}

/// Copies `src` into a caller buffer, truncating and NUL-terminating.
unsafe fn fill_name(dst: *mut c_uchar, len: usize, src: &[u8]) {
    if dst.is_null() || len == 0 {
        return;
    }
    let out = unsafe { std::slice::from_raw_parts_mut(dst, len) };
    let n = src.len().min(len - 1);
    out[..n].copy_from_slice(&src[..n]);
    out[n] = 0;
}

unsafe extern "C" fn image_classify(
    sess: *mut Session,
    img: *const c_void,
    out_text: *mut c_uchar,
    out_imgname: *mut c_uchar,
    len_img: usize,
    len_out_text: usize,
    len_out_imgname: usize,
) -> c_int {
    let Some(sess) = (unsafe { sess.as_ref() }) else {
        return Error::InvalidArgument.to_code();
    };
    if img.is_null() || len_img == 0 {
        return Error::InvalidArgument.to_code();
    }
    debug!("[noop] session:{} classifying {len_img} bytes", sess.id());
    unsafe {
        fill_name(out_text, len_out_text, IMAGE_TAG);
        fill_name(out_imgname, len_out_imgname, IMAGE_NAME);
    }
    0
}

unsafe extern "C" fn image_no_text(
    sess: *mut Session,
    img: *const c_void,
    out_imgname: *mut c_uchar,
    len_img: usize,
    len_out_imgname: usize,
) -> c_int {
    let Some(sess) = (unsafe { sess.as_ref() }) else {
        return Error::InvalidArgument.to_code();
    };
    if img.is_null() || len_img == 0 {
        return Error::InvalidArgument.to_code();
    }
    debug!("[noop] session:{} processing {len_img} bytes", sess.id());
    unsafe { fill_name(out_imgname, len_out_imgname, IMAGE_NAME) };
    0
}

/// Signature of symbols invoked through exec.
type UserFn =
    unsafe extern "C" fn(read: *mut FfiArg, nr_read: usize, write: *mut FfiArg, nr_write: usize)
        -> c_int;

unsafe extern "C" fn exec(
    sess: *mut Session,
    library: *const c_char,
    fn_symbol: *const c_char,
    read: *mut FfiArg,
    nr_read: usize,
    write: *mut FfiArg,
    nr_write: usize,
) -> c_int {
    if sess.is_null() || library.is_null() || fn_symbol.is_null() {
        return Error::InvalidArgument.to_code();
    }
    let library = unsafe { CStr::from_ptr(library) };
    let fn_symbol = unsafe { CStr::from_ptr(fn_symbol) };

    let lib = match unsafe { libloading::Library::new(library.to_string_lossy().as_ref()) } {
        Ok(lib) => lib,
        Err(e) => {
            warn!("[noop] could not load {library:?}: {e}");
            return Error::BadLibrary.to_code();
        }
    };
    let func = match unsafe { lib.get::<UserFn>(fn_symbol.to_bytes_with_nul()) } {
        Ok(func) => func,
        Err(e) => {
            warn!("[noop] could not resolve {fn_symbol:?}: {e}");
            return Error::NoExec.to_code();
        }
    };

    unsafe { func(read, nr_read, write, nr_write) }
}

unsafe extern "C" fn minmax(
    sess: *mut Session,
    indata: *const f64,
    ndata: c_int,
    _low_threshold: c_int,
    _high_threshold: c_int,
    outdata: *mut f64,
    min: *mut f64,
    max: *mut f64,
) -> c_int {
    if sess.is_null() || indata.is_null() || ndata <= 0 {
        return Error::InvalidArgument.to_code();
    }
    let n = ndata as usize;
    let input = unsafe { std::slice::from_raw_parts(indata, n) };

    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for &v in input {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if !outdata.is_null() {
        unsafe { std::slice::from_raw_parts_mut(outdata, n) }.copy_from_slice(input);
    }
    if !min.is_null() {
        unsafe { *min = lo };
    }
    if !max.is_null() {
        unsafe { *max = hi };
    }
    0
}

unsafe extern "C" fn fpga_arraycopy(
    sess: *mut Session,
    array: *const c_int,
    out_array: *mut c_int,
    len_array: usize,
) -> c_int {
    if sess.is_null() || array.is_null() || out_array.is_null() {
        return Error::InvalidArgument.to_code();
    }
    unsafe {
        std::slice::from_raw_parts_mut(out_array, len_array)
            .copy_from_slice(std::slice::from_raw_parts(array, len_array));
    }
    0
}

unsafe extern "C" fn fpga_mmult(
    sess: *mut Session,
    a: *const f32,
    b: *const f32,
    c: *mut f32,
    len_a: usize,
) -> c_int {
    if sess.is_null() || a.is_null() || b.is_null() || c.is_null() {
        return Error::InvalidArgument.to_code();
    }
    // Square matrices; len_a is the element count.
    let n = (len_a as f64).sqrt() as usize;
    if n * n != len_a {
        return Error::InvalidArgument.to_code();
    }
    let a = unsafe { std::slice::from_raw_parts(a, len_a) };
    let b = unsafe { std::slice::from_raw_parts(b, len_a) };
    let c = unsafe { std::slice::from_raw_parts_mut(c, len_a) };

    for i in 0..n {
        for j in 0..n {
            let mut acc = 0f32;
            for l in 0..n {
                acc += a[i * n + l] * b[l * n + j];
            }
            c[i * n + j] = acc;
        }
    }
    0
}

unsafe extern "C" fn fpga_vadd(
    sess: *mut Session,
    a: *const f32,
    b: *const f32,
    c: *mut f32,
    len_a: usize,
    len_b: usize,
) -> c_int {
    if sess.is_null() || a.is_null() || b.is_null() || c.is_null() || len_a != len_b {
        return Error::InvalidArgument.to_code();
    }
    let a = unsafe { std::slice::from_raw_parts(a, len_a) };
    let b = unsafe { std::slice::from_raw_parts(b, len_b) };
    let c = unsafe { std::slice::from_raw_parts_mut(c, len_a) };
    for ((out, &x), &y) in c.iter_mut().zip(a).zip(b) {
        *out = x + y;
    }
    0
}

unsafe extern "C" fn fpga_parallel(
    sess: *mut Session,
    a: *const f32,
    b: *const f32,
    add_output: *mut f32,
    mult_output: *mut f32,
    len_a: usize,
) -> c_int {
    if sess.is_null() || a.is_null() || b.is_null() || add_output.is_null() || mult_output.is_null()
    {
        return Error::InvalidArgument.to_code();
    }
    let a = unsafe { std::slice::from_raw_parts(a, len_a) };
    let b = unsafe { std::slice::from_raw_parts(b, len_a) };
    let add = unsafe { std::slice::from_raw_parts_mut(add_output, len_a) };
    let mult = unsafe { std::slice::from_raw_parts_mut(mult_output, len_a) };
    for i in 0..len_a {
        add[i] = a[i] + b[i];
        mult[i] = a[i] * b[i];
    }
    0
}

static INFO: PluginInfo = PluginInfo {
    name: c"noop".as_ptr(),
    version: c"0.7.0".as_ptr(),
    vaccel_version: c"0.7.0".as_ptr(),
    init: Some(init),
    fini: Some(fini),
    is_virtio: false,
    type_mask: hint::CPU | hint::GENERIC | hint::DEBUG,
    session_init: None,
    session_update: None,
    session_release: None,
    resource_register: None,
    resource_unregister: None,
};

static PLUGIN: PluginDescriptor = PluginDescriptor::new(&INFO);

/// Type-erases an op implementation for the op table.
macro_rules! op {
    ($code:expr, $func:expr, $ty:ty) => {
        VaccelOp::new(
            $code,
            // SAFETY: dispatch transmutes back to the same signature.
            unsafe { std::mem::transmute::<$ty, vaccel::plugin::OpFn>($func) },
            &PLUGIN,
        )
    };
}

type NoopFn = unsafe extern "C" fn(*mut Session) -> c_int;
type SgemmFn = unsafe extern "C" fn(
    *mut Session,
    i64,
    i64,
    i64,
    f32,
    *const f32,
    i64,
    *const f32,
    i64,
    f32,
    *mut f32,
    i64,
) -> c_int;
type ClassifyFn = unsafe extern "C" fn(
    *mut Session,
    *const c_void,
    *mut c_uchar,
    *mut c_uchar,
    usize,
    usize,
    usize,
) -> c_int;
type ImageFn =
    unsafe extern "C" fn(*mut Session, *const c_void, *mut c_uchar, usize, usize) -> c_int;
type ExecFn = unsafe extern "C" fn(
    *mut Session,
    *const c_char,
    *const c_char,
    *mut FfiArg,
    usize,
    *mut FfiArg,
    usize,
) -> c_int;
type MinmaxFn = unsafe extern "C" fn(
    *mut Session,
    *const f64,
    c_int,
    c_int,
    c_int,
    *mut f64,
    *mut f64,
    *mut f64,
) -> c_int;
type ArraycopyFn = unsafe extern "C" fn(*mut Session, *const c_int, *mut c_int, usize) -> c_int;
type MmultFn =
    unsafe extern "C" fn(*mut Session, *const f32, *const f32, *mut f32, usize) -> c_int;
type ParallelFn = unsafe extern "C" fn(
    *mut Session,
    *const f32,
    *const f32,
    *mut f32,
    *mut f32,
    usize,
) -> c_int;
type VaddFn =
    unsafe extern "C" fn(*mut Session, *const f32, *const f32, *mut f32, usize, usize) -> c_int;

static OPS: [VaccelOp; 13] = [
    op!(0, noop, NoopFn),
    op!(1, sgemm, SgemmFn),
    op!(2, image_classify, ClassifyFn),
    op!(3, image_no_text, ImageFn),
    op!(4, image_no_text, ImageFn),
    op!(5, image_no_text, ImageFn),
    op!(6, image_no_text, ImageFn),
    op!(7, exec, ExecFn),
    op!(15, minmax, MinmaxFn),
    op!(16, fpga_arraycopy, ArraycopyFn),
    op!(17, fpga_mmult, MmultFn),
    op!(18, fpga_parallel, ParallelFn),
    op!(19, fpga_vadd, VaddFn),
];

/// The descriptor exported to the plugin loader.
#[unsafe(no_mangle)]
#[allow(non_upper_case_globals)]
pub static vaccel_plugin: &PluginDescriptor = &PLUGIN;
