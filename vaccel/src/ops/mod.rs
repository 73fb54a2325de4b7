//! Operation dispatch: typed entry points, unpackers, and the generic
//! opcode gateway.

use tracing::{debug, error};

use crate::arg::Arg;
use crate::plugin::{self, OpFn};
use crate::session::Session;
use crate::{Error, Result};

pub mod blas;
pub mod exec;
pub mod fpga;
pub mod image;
pub mod minmax;
pub mod noop;
pub mod opencv;
pub mod tf;
pub mod tflite;
pub mod torch;

/// Stable operation type codes; used on the wire by generic dispatch and
/// the VirtIO transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u32)]
pub enum OpType {
    /// Debug no-op.
    Noop = 0,
    /// BLAS single-precision matrix multiply.
    BlasSgemm = 1,
    /// Image classification (label + output image name).
    ImageClassify = 2,
    /// Image object detection.
    ImageDetect = 3,
    /// Image segmentation.
    ImageSegment = 4,
    /// Image pose estimation.
    ImagePose = 5,
    /// Image depth estimation.
    ImageDepth = 6,
    /// Execute a symbol from a shared library.
    Exec = 7,
    /// TensorFlow model create (legacy slot).
    TfModelNew = 8,
    /// TensorFlow model destroy (legacy slot).
    TfModelDestroy = 9,
    /// TensorFlow model register (legacy slot).
    TfModelRegister = 10,
    /// TensorFlow model unregister (legacy slot).
    TfModelUnregister = 11,
    /// TensorFlow session load.
    TfSessionLoad = 12,
    /// TensorFlow session run.
    TfSessionRun = 13,
    /// TensorFlow session delete.
    TfSessionDelete = 14,
    /// MinMax reduction.
    Minmax = 15,
    /// FPGA array copy.
    FpgaArraycopy = 16,
    /// FPGA matrix multiply.
    FpgaMmult = 17,
    /// FPGA parallel add/multiply.
    FpgaParallel = 18,
    /// FPGA vector add.
    FpgaVectoradd = 19,
    /// Execute a symbol from a registered shared-object resource.
    ExecWithResource = 20,
    /// Torch jit-load + forward.
    TorchJitloadForward = 21,
    /// Torch single-precision matrix multiply.
    TorchSgemm = 22,
    /// OpenCV generic operation.
    Opencv = 23,
    /// TensorFlow Lite session load.
    TfliteSessionLoad = 24,
    /// TensorFlow Lite session run.
    TfliteSessionRun = 25,
    /// TensorFlow Lite session delete.
    TfliteSessionDelete = 26,
}

impl OpType {
    /// Number of operation types.
    pub const COUNT: usize = 27;

    /// Maps a wire code back to an operation type.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Noop,
            1 => Self::BlasSgemm,
            2 => Self::ImageClassify,
            3 => Self::ImageDetect,
            4 => Self::ImageSegment,
            5 => Self::ImagePose,
            6 => Self::ImageDepth,
            7 => Self::Exec,
            8 => Self::TfModelNew,
            9 => Self::TfModelDestroy,
            10 => Self::TfModelRegister,
            11 => Self::TfModelUnregister,
            12 => Self::TfSessionLoad,
            13 => Self::TfSessionRun,
            14 => Self::TfSessionDelete,
            15 => Self::Minmax,
            16 => Self::FpgaArraycopy,
            17 => Self::FpgaMmult,
            18 => Self::FpgaParallel,
            19 => Self::FpgaVectoradd,
            20 => Self::ExecWithResource,
            21 => Self::TorchJitloadForward,
            22 => Self::TorchSgemm,
            23 => Self::Opencv,
            24 => Self::TfliteSessionLoad,
            25 => Self::TfliteSessionRun,
            26 => Self::TfliteSessionDelete,
            _ => return None,
        })
    }

    /// Human-readable operation name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::BlasSgemm => "sgemm",
            Self::ImageClassify => "image classification",
            Self::ImageDetect => "image detection",
            Self::ImageSegment => "image segmentation",
            Self::ImagePose => "image pose estimation",
            Self::ImageDepth => "image depth estimation",
            Self::Exec => "exec",
            Self::TfModelNew => "TensorFlow model create",
            Self::TfModelDestroy => "TensorFlow model destroy",
            Self::TfModelRegister => "TensorFlow model register",
            Self::TfModelUnregister => "TensorFlow model unregister",
            Self::TfSessionLoad => "TensorFlow session load",
            Self::TfSessionRun => "TensorFlow session run",
            Self::TfSessionDelete => "TensorFlow session delete",
            Self::Minmax => "MinMax",
            Self::FpgaArraycopy => "Array copy",
            Self::FpgaMmult => "Matrix multiplication",
            Self::FpgaParallel => "Parallel acceleration",
            Self::FpgaVectoradd => "Vector Add",
            Self::ExecWithResource => "Exec with resource",
            Self::TorchJitloadForward => "Torch jitload_forward function",
            Self::TorchSgemm => "Torch SGEMM",
            Self::Opencv => "OpenCV Generic",
            Self::TfliteSessionLoad => "TensorFlow Lite session load",
            Self::TfliteSessionRun => "TensorFlow Lite session run",
            Self::TfliteSessionDelete => "TensorFlow Lite session delete",
        }
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolves the implementation of `op` for the session's hint.
pub(crate) fn resolve(op: OpType, sess: &Session) -> Result<OpFn> {
    debug!(
        "session:{} Looking for plugin implementing {op}",
        sess.id()
    );
    plugin::get_op_func(op, sess.hint()).ok_or(Error::NotSupported)
}

/// Generic operation gateway.
///
/// `read[0]` carries the operation type code; the remaining read and all
/// write arguments are interpreted by the operation's unpacker, which
/// forwards to the typed entry point. This is the call protocol the VirtIO
/// transport replays on the host side.
pub fn genop(sess: &Session, read: &mut [Arg], write: &mut [Arg]) -> Result<()> {
    let Some((op_arg, rest)) = read.split_first_mut() else {
        error!("Missing operation type");
        return Err(Error::InvalidArgument);
    };

    let code_bytes: [u8; 4] = op_arg
        .data()
        .try_into()
        .map_err(|_| Error::InvalidArgument)?;
    let code = u32::from_ne_bytes(code_bytes);
    let Some(op) = OpType::from_code(code) else {
        error!("Invalid operation type {code}");
        return Err(Error::InvalidArgument);
    };

    match op {
        OpType::Noop => noop::unpack(sess, rest, write),
        OpType::BlasSgemm => blas::unpack(sess, rest, write),
        OpType::ImageClassify
        | OpType::ImageDetect
        | OpType::ImageSegment
        | OpType::ImagePose
        | OpType::ImageDepth => image::unpack(op, sess, rest, write),
        OpType::Exec => exec::unpack(sess, rest, write),
        OpType::ExecWithResource => exec::unpack_with_resource(sess, rest, write),
        OpType::Minmax => minmax::unpack(sess, rest, write),
        OpType::FpgaArraycopy => fpga::unpack_arraycopy(sess, rest, write),
        OpType::FpgaMmult => fpga::unpack_mmult(sess, rest, write),
        OpType::FpgaParallel => fpga::unpack_parallel(sess, rest, write),
        OpType::FpgaVectoradd => fpga::unpack_vadd(sess, rest, write),
        OpType::Opencv => opencv::unpack(sess, rest, write),
        _ => {
            error!("Operation not implemented for {op}");
            Err(Error::NotSupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_codes_are_stable() {
        assert_eq!(OpType::Noop as u32, 0);
        assert_eq!(OpType::Exec as u32, 7);
        assert_eq!(OpType::Minmax as u32, 15);
        assert_eq!(OpType::ExecWithResource as u32, 20);
        assert_eq!(OpType::Opencv as u32, 23);
        assert_eq!(OpType::TfliteSessionDelete as u32, 26);
        assert_eq!(OpType::from_code(19), Some(OpType::FpgaVectoradd));
        assert_eq!(OpType::from_code(27), None);
    }
}
