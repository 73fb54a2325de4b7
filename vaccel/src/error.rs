//! Error types for vAccel operations.

use std::io;

/// Alias for `Result<T, vaccel::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the vAccel runtime.
///
/// Every variant maps to a stable positive integer code mirroring the
/// equivalent POSIX errno value (see [`Error::to_code`]); the codes are part
/// of the wire ABI used by generic dispatch and remote backends.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid argument: null/empty required input, wrong type, bad state.
    #[error("invalid argument")]
    InvalidArgument,

    /// Allocation failure.
    #[error("out of memory")]
    OutOfMemory,

    /// No loaded plugin implements the requested operation.
    #[error("operation not supported")]
    NotSupported,

    /// Operation now in progress.
    #[error("operation in progress")]
    InProgress,

    /// Resource is still registered with at least one session.
    #[error("device or resource busy")]
    Busy,

    /// Entity already exists (e.g. plugin registered twice).
    #[error("already exists")]
    Exists,

    /// Lookup miss: no such session, resource or file.
    #[error("no such entity")]
    NotFound,

    /// A plugin shared library is corrupted or malformed.
    #[error("corrupted shared library")]
    BadLibrary,

    /// Failed to load or resolve a plugin shared library.
    #[error(transparent)]
    Library(#[from] libloading::Error),

    /// No such device.
    #[error("no such device")]
    NoDevice,

    /// An I/O error from filesystem, mmap or download operations.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The session is broken: the sessions subsystem is not initialized or
    /// the remote end went away.
    #[error("session broken")]
    SessionBroken,

    /// A backend plugin misbehaved (protocol error).
    #[error("backend error")]
    Backend,

    /// Exec format error while invoking a loaded function.
    #[error("exec format error")]
    NoExec,

    /// A composed path would exceed the platform path limit.
    #[error("file name too long")]
    NameTooLong,

    /// The id pool has no free ids left.
    #[error("id pool exhausted")]
    IdPoolExhausted,

    /// Operation on a resource that is not registered with the session.
    #[error("operation not permitted")]
    PermissionDenied,

    /// Too many levels of symbolic links.
    #[error("too many symbolic links")]
    Loop,

    /// Too many links.
    #[error("too many links")]
    TooManyLinks,

    /// No space left on device.
    #[error("no space left on device")]
    NoSpace,

    /// Path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Read-only filesystem.
    #[error("read-only file system")]
    ReadOnly,

    /// Permission denied by the filesystem.
    #[error("access denied")]
    AccessDenied,

    /// Bad file descriptor.
    #[error("bad file descriptor")]
    BadFileDescriptor,

    /// I/O error reported by the remote end.
    #[error("remote i/o error")]
    RemoteIo,

    /// Argument-array access past the end of the array.
    #[error("argument out of range")]
    OutOfRange,
}

impl Error {
    /// Returns the stable positive integer code for this error.
    ///
    /// Codes mirror POSIX errno values; `0` is reserved for success and is
    /// never returned here.
    pub fn to_code(&self) -> i32 {
        match self {
            Self::InvalidArgument => libc::EINVAL,
            Self::OutOfMemory => libc::ENOMEM,
            Self::NotSupported => libc::ENOTSUP,
            Self::InProgress => libc::EINPROGRESS,
            Self::Busy => libc::EBUSY,
            Self::Exists => libc::EEXIST,
            Self::NotFound => libc::ENOENT,
            Self::BadLibrary | Self::Library(_) => libc::ELIBBAD,
            Self::NoDevice => libc::ENODEV,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::SessionBroken => libc::ECONNRESET,
            Self::Backend => libc::EPROTO,
            Self::NoExec => libc::ENOEXEC,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::IdPoolExhausted => libc::EUSERS,
            Self::PermissionDenied => libc::EPERM,
            Self::Loop => libc::ELOOP,
            Self::TooManyLinks => libc::EMLINK,
            Self::NoSpace => libc::ENOSPC,
            Self::NotDirectory => libc::ENOTDIR,
            Self::ReadOnly => libc::EROFS,
            Self::AccessDenied => libc::EACCES,
            Self::BadFileDescriptor => libc::EBADF,
            Self::RemoteIo => libc::EREMOTEIO,
            Self::OutOfRange => libc::ERANGE,
        }
    }

    /// Reconstructs an [`Error`] from a wire code.
    ///
    /// Unknown codes (and `io::Error`-carried codes) come back as
    /// [`Error::Io`] with the matching OS errno.
    pub fn from_code(code: i32) -> Self {
        match code {
            c if c == libc::EINVAL => Self::InvalidArgument,
            c if c == libc::ENOMEM => Self::OutOfMemory,
            c if c == libc::ENOTSUP => Self::NotSupported,
            c if c == libc::EINPROGRESS => Self::InProgress,
            c if c == libc::EBUSY => Self::Busy,
            c if c == libc::EEXIST => Self::Exists,
            c if c == libc::ENOENT => Self::NotFound,
            c if c == libc::ELIBBAD => Self::BadLibrary,
            c if c == libc::ENODEV => Self::NoDevice,
            c if c == libc::ECONNRESET => Self::SessionBroken,
            c if c == libc::EPROTO => Self::Backend,
            c if c == libc::ENOEXEC => Self::NoExec,
            c if c == libc::ENAMETOOLONG => Self::NameTooLong,
            c if c == libc::EUSERS => Self::IdPoolExhausted,
            c if c == libc::EPERM => Self::PermissionDenied,
            c if c == libc::ELOOP => Self::Loop,
            c if c == libc::EMLINK => Self::TooManyLinks,
            c if c == libc::ENOSPC => Self::NoSpace,
            c if c == libc::ENOTDIR => Self::NotDirectory,
            c if c == libc::EROFS => Self::ReadOnly,
            c if c == libc::EACCES => Self::AccessDenied,
            c if c == libc::EBADF => Self::BadFileDescriptor,
            c if c == libc::EREMOTEIO => Self::RemoteIo,
            c if c == libc::ERANGE => Self::OutOfRange,
            c => Self::Io(io::Error::from_raw_os_error(c)),
        }
    }
}

/// Converts a plugin return code into a [`Result`].
pub(crate) fn check(code: i32) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(Error::from_code(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_roundtrip() {
        for err in [
            Error::InvalidArgument,
            Error::Busy,
            Error::NotFound,
            Error::NameTooLong,
            Error::IdPoolExhausted,
            Error::OutOfRange,
        ] {
            let code = err.to_code();
            assert!(code > 0);
            assert_eq!(Error::from_code(code).to_code(), code);
        }
    }

    #[test]
    fn io_code_preserves_errno() {
        let err = Error::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.to_code(), libc::ENOSPC);
    }
}
