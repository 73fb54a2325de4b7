//! MinMax reduction operation.

#![allow(unsafe_code)]

use std::ffi::c_int;

use tracing::error;

use crate::arg::Arg;
use crate::ops::{self, OpType};
use crate::profiling::ProfRegion;
use crate::session::Session;
use crate::{Error, Result, error};

static MINMAX_STATS: ProfRegion = ProfRegion::new("vaccel_minmax_op");

/// Plugin entry point signature.
type MinmaxFn = unsafe extern "C" fn(
    sess: *mut Session,
    indata: *const f64,
    ndata: c_int,
    low_threshold: c_int,
    high_threshold: c_int,
    outdata: *mut f64,
    min: *mut f64,
    max: *mut f64,
) -> c_int;

/// Dispatches the MinMax reduction; fills `outdata` and returns the
/// observed `(min, max)`.
pub fn minmax(
    sess: &Session,
    indata: &[f64],
    low_threshold: i32,
    high_threshold: i32,
    outdata: &mut [f64],
) -> Result<(f64, f64)> {
    let _sample = MINMAX_STATS.enter();

    let func = ops::resolve(OpType::Minmax, sess)?;
    // SAFETY: ops registered under OpType::Minmax carry this signature.
    let func: MinmaxFn = unsafe { std::mem::transmute(func) };

    let ndata = c_int::try_from(indata.len()).map_err(|_| Error::InvalidArgument)?;
    let mut min = 0f64;
    let mut max = 0f64;
    error::check(unsafe {
        func(
            std::ptr::from_ref(sess).cast_mut(),
            indata.as_ptr(),
            ndata,
            low_threshold,
            high_threshold,
            outdata.as_mut_ptr(),
            &raw mut min,
            &raw mut max,
        )
    })?;
    Ok((min, max))
}

/// Generic-gateway unpacker.
///
/// `read = [indata, ndata, low_threshold, high_threshold]`,
/// `write = [outdata, min, max]`. The redundant `ndata` argument is kept
/// for wire compatibility.
pub(crate) fn unpack(sess: &Session, read: &mut [Arg], write: &mut [Arg]) -> Result<()> {
    if read.len() != 4 {
        error!("Wrong number of read arguments in MinMax: {}", read.len());
        return Err(Error::InvalidArgument);
    }
    if write.len() != 3 {
        error!("Wrong number of write arguments in MinMax: {}", write.len());
        return Err(Error::InvalidArgument);
    }

    let indata = f64_slice(&read[0])?;
    let ndata = i32_scalar(&read[1])?;
    if ndata as usize != indata.len() {
        return Err(Error::InvalidArgument);
    }
    let low_threshold = i32_scalar(&read[2])?;
    let high_threshold = i32_scalar(&read[3])?;

    let mut outdata = f64_slice(&write[0])?;
    let (min, max) = minmax(sess, &indata, low_threshold, high_threshold, &mut outdata)?;

    write_f64s(&mut write[0], &outdata)?;
    write_f64s(&mut write[1], &[min])?;
    write_f64s(&mut write[2], &[max])?;
    Ok(())
}

fn i32_scalar(arg: &Arg) -> Result<i32> {
    let bytes: [u8; 4] = arg.data().try_into().map_err(|_| Error::InvalidArgument)?;
    Ok(i32::from_ne_bytes(bytes))
}

fn f64_slice(arg: &Arg) -> Result<Vec<f64>> {
    if arg.size() % size_of::<f64>() != 0 {
        return Err(Error::InvalidArgument);
    }
    Ok(arg
        .data()
        .chunks_exact(size_of::<f64>())
        .map(|c| f64::from_ne_bytes(c.try_into().unwrap()))
        .collect())
}

fn write_f64s(arg: &mut Arg, values: &[f64]) -> Result<()> {
    let out = arg.data_mut();
    if out.len() != values.len() * size_of::<f64>() {
        return Err(Error::InvalidArgument);
    }
    for (chunk, v) in out.chunks_exact_mut(size_of::<f64>()).zip(values) {
        chunk.copy_from_slice(&v.to_ne_bytes());
    }
    Ok(())
}
