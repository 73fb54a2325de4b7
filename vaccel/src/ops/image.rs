//! Image inference operations.
//!
//! Classification returns both a text label and an output-image name; the
//! other image ops return only an output-image name. Outputs land in
//! caller-provided buffers.

#![allow(unsafe_code)]

use std::ffi::{c_int, c_uchar, c_void};

use tracing::error;

use crate::arg::Arg;
use crate::ops::{self, OpType};
use crate::profiling::ProfRegion;
use crate::session::Session;
use crate::{Error, Result, error};

static IMAGE_STATS: ProfRegion = ProfRegion::new("vaccel_image_op");

/// Plugin signature for ops with a text output (classification).
type ImageOpFn = unsafe extern "C" fn(
    sess: *mut Session,
    img: *const c_void,
    out_text: *mut c_uchar,
    out_imgname: *mut c_uchar,
    len_img: usize,
    len_out_text: usize,
    len_out_imgname: usize,
) -> c_int;

/// Plugin signature for ops without a text output.
type ImageOpNoTextFn = unsafe extern "C" fn(
    sess: *mut Session,
    img: *const c_void,
    out_imgname: *mut c_uchar,
    len_img: usize,
    len_out_imgname: usize,
) -> c_int;

/// Dispatches one of the image ops.
///
/// The two-write (classification) shape is selected when `out_text` is
/// non-empty; the plugin receives the matching function signature.
fn image_op(
    op: OpType,
    sess: &Session,
    img: &[u8],
    out_text: Option<&mut [u8]>,
    out_imgname: &mut [u8],
) -> Result<()> {
    let _sample = IMAGE_STATS.enter();

    let func = ops::resolve(op, sess)?;
    let sess_ptr = std::ptr::from_ref(sess).cast_mut();

    let ret = match out_text {
        Some(text) if !text.is_empty() => {
            // SAFETY: two-write image ops carry the text-output signature.
            let func: ImageOpFn = unsafe { std::mem::transmute(func) };
            unsafe {
                func(
                    sess_ptr,
                    img.as_ptr().cast(),
                    text.as_mut_ptr(),
                    out_imgname.as_mut_ptr(),
                    img.len(),
                    text.len(),
                    out_imgname.len(),
                )
            }
        }
        _ => {
            // SAFETY: one-write image ops carry the no-text signature.
            let func: ImageOpNoTextFn = unsafe { std::mem::transmute(func) };
            unsafe {
                func(
                    sess_ptr,
                    img.as_ptr().cast(),
                    out_imgname.as_mut_ptr(),
                    img.len(),
                    out_imgname.len(),
                )
            }
        }
    };
    error::check(ret)
}

/// Classifies an image; fills a text label and an output-image name.
pub fn classify(
    sess: &Session,
    img: &[u8],
    out_text: &mut [u8],
    out_imgname: &mut [u8],
) -> Result<()> {
    image_op(OpType::ImageClassify, sess, img, Some(out_text), out_imgname)
}

/// Runs object detection; fills an output-image name.
pub fn detect(sess: &Session, img: &[u8], out_imgname: &mut [u8]) -> Result<()> {
    image_op(OpType::ImageDetect, sess, img, None, out_imgname)
}

/// Runs segmentation; fills an output-image name.
pub fn segment(sess: &Session, img: &[u8], out_imgname: &mut [u8]) -> Result<()> {
    image_op(OpType::ImageSegment, sess, img, None, out_imgname)
}

/// Runs pose estimation; fills an output-image name.
pub fn pose(sess: &Session, img: &[u8], out_imgname: &mut [u8]) -> Result<()> {
    image_op(OpType::ImagePose, sess, img, None, out_imgname)
}

/// Runs depth estimation; fills an output-image name.
pub fn depth(sess: &Session, img: &[u8], out_imgname: &mut [u8]) -> Result<()> {
    image_op(OpType::ImageDepth, sess, img, None, out_imgname)
}

/// Generic-gateway unpacker for the image ops.
///
/// `read = [img]`; classification expects `write = [out_text, out_imgname]`,
/// the rest `write = [out_imgname]`.
pub(crate) fn unpack(
    op: OpType,
    sess: &Session,
    read: &mut [Arg],
    write: &mut [Arg],
) -> Result<()> {
    let nr_write_req = if op == OpType::ImageClassify { 2 } else { 1 };

    if read.len() != 1 {
        error!(
            "Wrong number of read arguments in {op}: {} (expected 1)",
            read.len()
        );
        return Err(Error::InvalidArgument);
    }
    if write.len() != nr_write_req {
        error!(
            "Wrong number of write arguments in {op}: {} (expected {nr_write_req})",
            write.len()
        );
        return Err(Error::InvalidArgument);
    }

    let img = read[0].data().to_vec();
    if nr_write_req == 2 {
        let (text, name) = write.split_at_mut(1);
        image_op(
            op,
            sess,
            &img,
            Some(text[0].data_mut()),
            name[0].data_mut(),
        )
    } else {
        image_op(op, sess, &img, None, write[0].data_mut())
    }
}
