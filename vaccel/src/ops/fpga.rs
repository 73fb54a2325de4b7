//! FPGA primitive operations.

#![allow(unsafe_code)]

use std::ffi::c_int;

use tracing::error;

use crate::arg::Arg;
use crate::ops::{self, OpType};
use crate::profiling::ProfRegion;
use crate::session::Session;
use crate::{Error, Result, error};

static ARRAYCOPY_STATS: ProfRegion = ProfRegion::new("vaccel_fpga_arraycopy_op");
static MMULT_STATS: ProfRegion = ProfRegion::new("vaccel_fpga_mmult_op");
static PARALLEL_STATS: ProfRegion = ProfRegion::new("vaccel_fpga_parallel_op");
static VADD_STATS: ProfRegion = ProfRegion::new("vaccel_fpga_vadd_op");

type ArraycopyFn = unsafe extern "C" fn(
    sess: *mut Session,
    array: *const c_int,
    out_array: *mut c_int,
    len_array: usize,
) -> c_int;

type MmultFn = unsafe extern "C" fn(
    sess: *mut Session,
    a: *const f32,
    b: *const f32,
    c: *mut f32,
    len_a: usize,
) -> c_int;

type ParallelFn = unsafe extern "C" fn(
    sess: *mut Session,
    a: *const f32,
    b: *const f32,
    add_output: *mut f32,
    mult_output: *mut f32,
    len_a: usize,
) -> c_int;

type VaddFn = unsafe extern "C" fn(
    sess: *mut Session,
    a: *const f32,
    b: *const f32,
    c: *mut f32,
    len_a: usize,
    len_b: usize,
) -> c_int;

/// Copies `array` into `out_array` on the accelerator.
pub fn arraycopy(sess: &Session, array: &[i32], out_array: &mut [i32]) -> Result<()> {
    let _sample = ARRAYCOPY_STATS.enter();

    let func = ops::resolve(OpType::FpgaArraycopy, sess)?;
    // SAFETY: ops registered under OpType::FpgaArraycopy carry this
    // signature.
    let func: ArraycopyFn = unsafe { std::mem::transmute(func) };
    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            array.as_ptr(),
            out_array.as_mut_ptr(),
            array.len(),
        )
    })
}

/// Multiplies the square matrices `a` and `b` into `c`.
pub fn mmult(sess: &Session, a: &[f32], b: &[f32], c: &mut [f32]) -> Result<()> {
    let _sample = MMULT_STATS.enter();

    let func = ops::resolve(OpType::FpgaMmult, sess)?;
    // SAFETY: ops registered under OpType::FpgaMmult carry this signature.
    let func: MmultFn = unsafe { std::mem::transmute(func) };
    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            a.as_ptr(),
            b.as_ptr(),
            c.as_mut_ptr(),
            a.len(),
        )
    })
}

/// Computes elementwise add and multiply of `a` and `b` in one pass.
pub fn parallel(
    sess: &Session,
    a: &[f32],
    b: &[f32],
    add_output: &mut [f32],
    mult_output: &mut [f32],
) -> Result<()> {
    let _sample = PARALLEL_STATS.enter();

    let func = ops::resolve(OpType::FpgaParallel, sess)?;
    // SAFETY: ops registered under OpType::FpgaParallel carry this
    // signature.
    let func: ParallelFn = unsafe { std::mem::transmute(func) };
    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            a.as_ptr(),
            b.as_ptr(),
            add_output.as_mut_ptr(),
            mult_output.as_mut_ptr(),
            a.len(),
        )
    })
}

/// Adds the vectors `a` and `b` into `c`.
pub fn vadd(sess: &Session, a: &[f32], b: &[f32], c: &mut [f32]) -> Result<()> {
    let _sample = VADD_STATS.enter();

    let func = ops::resolve(OpType::FpgaVectoradd, sess)?;
    // SAFETY: ops registered under OpType::FpgaVectoradd carry this
    // signature.
    let func: VaddFn = unsafe { std::mem::transmute(func) };
    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            a.as_ptr(),
            b.as_ptr(),
            c.as_mut_ptr(),
            a.len(),
            b.len(),
        )
    })
}

/// Generic-gateway unpacker: `read = [array]`, `write = [out_array]`.
pub(crate) fn unpack_arraycopy(sess: &Session, read: &mut [Arg], write: &mut [Arg]) -> Result<()> {
    check_arity("fpga_arraycopy", read, 1, write, 1)?;

    let array = i32_slice(&read[0])?;
    let mut out = i32_slice(&write[0])?;
    arraycopy(sess, &array, &mut out)?;
    write_i32s(&mut write[0], &out)
}

/// Generic-gateway unpacker: `read = [a, b]`, `write = [c]`.
pub(crate) fn unpack_mmult(sess: &Session, read: &mut [Arg], write: &mut [Arg]) -> Result<()> {
    check_arity("fpga_mmult", read, 2, write, 1)?;

    let a = f32_slice(&read[0])?;
    let b = f32_slice(&read[1])?;
    let mut c = f32_slice(&write[0])?;
    mmult(sess, &a, &b, &mut c)?;
    write_f32s(&mut write[0], &c)
}

/// Generic-gateway unpacker: `read = [a, b]`,
/// `write = [add_output, mult_output]`.
pub(crate) fn unpack_parallel(sess: &Session, read: &mut [Arg], write: &mut [Arg]) -> Result<()> {
    check_arity("fpga_parallel", read, 2, write, 2)?;

    let a = f32_slice(&read[0])?;
    let b = f32_slice(&read[1])?;
    let mut add_out = f32_slice(&write[0])?;
    let mut mult_out = f32_slice(&write[1])?;
    parallel(sess, &a, &b, &mut add_out, &mut mult_out)?;
    write_f32s(&mut write[0], &add_out)?;
    write_f32s(&mut write[1], &mult_out)
}

/// Generic-gateway unpacker: `read = [a, b]`, `write = [c]`.
pub(crate) fn unpack_vadd(sess: &Session, read: &mut [Arg], write: &mut [Arg]) -> Result<()> {
    check_arity("fpga_vector_add", read, 2, write, 1)?;

    let a = f32_slice(&read[0])?;
    let b = f32_slice(&read[1])?;
    let mut c = f32_slice(&write[0])?;
    vadd(sess, &a, &b, &mut c)?;
    write_f32s(&mut write[0], &c)
}

fn check_arity(
    op: &str,
    read: &[Arg],
    nr_read: usize,
    write: &[Arg],
    nr_write: usize,
) -> Result<()> {
    if read.len() != nr_read {
        error!("Wrong number of read arguments in {op}: {}", read.len());
        return Err(Error::InvalidArgument);
    }
    if write.len() != nr_write {
        error!("Wrong number of write arguments in {op}: {}", write.len());
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

fn i32_slice(arg: &Arg) -> Result<Vec<i32>> {
    if arg.size() % size_of::<i32>() != 0 {
        return Err(Error::InvalidArgument);
    }
    Ok(arg
        .data()
        .chunks_exact(size_of::<i32>())
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect())
}

fn f32_slice(arg: &Arg) -> Result<Vec<f32>> {
    if arg.size() % size_of::<f32>() != 0 {
        return Err(Error::InvalidArgument);
    }
    Ok(arg
        .data()
        .chunks_exact(size_of::<f32>())
        .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
        .collect())
}

fn write_i32s(arg: &mut Arg, values: &[i32]) -> Result<()> {
    let out = arg.data_mut();
    if out.len() != values.len() * size_of::<i32>() {
        return Err(Error::InvalidArgument);
    }
    for (chunk, v) in out.chunks_exact_mut(size_of::<i32>()).zip(values) {
        chunk.copy_from_slice(&v.to_ne_bytes());
    }
    Ok(())
}

fn write_f32s(arg: &mut Arg, values: &[f32]) -> Result<()> {
    let out = arg.data_mut();
    if out.len() != values.len() * size_of::<f32>() {
        return Err(Error::InvalidArgument);
    }
    for (chunk, v) in out.chunks_exact_mut(size_of::<f32>()).zip(values) {
        chunk.copy_from_slice(&v.to_ne_bytes());
    }
    Ok(())
}
