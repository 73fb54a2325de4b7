//! BLAS SGEMM operation.

#![allow(unsafe_code)]

use std::ffi::c_int;

use tracing::error;

use crate::arg::Arg;
use crate::ops::{self, OpType};
use crate::profiling::ProfRegion;
use crate::session::Session;
use crate::{Error, Result, error};

static BLAS_STATS: ProfRegion = ProfRegion::new("vaccel_blas_op");

/// Plugin entry point signature.
type SgemmFn = unsafe extern "C" fn(
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

/// Dispatches `C = alpha * A x B + beta * C`.
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
    let _sample = BLAS_STATS.enter();

    let func = ops::resolve(OpType::BlasSgemm, sess)?;
    // SAFETY: ops registered under OpType::BlasSgemm carry this signature.
    let func: SgemmFn = unsafe { std::mem::transmute(func) };
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

/// Generic-gateway unpacker.
///
/// `read = [m, n, k, alpha, a, b, beta]`, `write = [c]`; the leading
/// dimensions are recovered from the matrix argument sizes.
pub(crate) fn unpack(sess: &Session, read: &mut [Arg], write: &mut [Arg]) -> Result<()> {
    if read.len() != 7 {
        error!("Wrong number of read arguments in SGEMM: {}", read.len());
        return Err(Error::InvalidArgument);
    }
    if write.len() != 1 {
        error!("Wrong number of write arguments in SGEMM: {}", write.len());
        return Err(Error::InvalidArgument);
    }

    let m = scalar_i64(&read[0])?;
    let n = scalar_i64(&read[1])?;
    let k = scalar_i64(&read[2])?;
    let alpha = scalar_f32(&read[3])?;
    let lda = read[4].size() as i64;
    let a = slice_f32(&read[4])?;
    let ldb = read[5].size() as i64;
    let b = slice_f32(&read[5])?;
    let beta = scalar_f32(&read[6])?;

    let ldc = write[0].size() as i64;
    let mut c = slice_f32(&write[0])?;

    sgemm(sess, m, n, k, alpha, &a, lda, &b, ldb, beta, &mut c, ldc)?;

    let mut bytes = Vec::with_capacity(c.len() * size_of::<f32>());
    for v in &c {
        bytes.extend_from_slice(&v.to_ne_bytes());
    }
    write[0].data_mut().copy_from_slice(&bytes);
    Ok(())
}

fn scalar_i64(arg: &Arg) -> Result<i64> {
    let bytes: [u8; 8] = arg.data().try_into().map_err(|_| Error::InvalidArgument)?;
    Ok(i64::from_ne_bytes(bytes))
}

fn scalar_f32(arg: &Arg) -> Result<f32> {
    let bytes: [u8; 4] = arg.data().try_into().map_err(|_| Error::InvalidArgument)?;
    Ok(f32::from_ne_bytes(bytes))
}

fn slice_f32(arg: &Arg) -> Result<Vec<f32>> {
    if arg.size() % size_of::<f32>() != 0 {
        return Err(Error::InvalidArgument);
    }
    Ok(arg
        .data()
        .chunks_exact(size_of::<f32>())
        .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
        .collect())
}

