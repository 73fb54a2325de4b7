//! Named byte containers backing resources.
//!
//! A blob is the runtime's unit of file and buffer handling: every byte that
//! reaches the filesystem on behalf of a resource moves through here.

use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::warn;

use crate::{Error, Result, fs};

/// Storage class of a [`Blob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BlobKind {
    /// Not initialized.
    None,
    /// Backed by an existing file the runtime does not own; contents are
    /// loaded on demand.
    File,
    /// Backed by an in-memory buffer.
    Buffer,
    /// Backed by a file with its contents memory-mapped.
    Mapped,
}

/// Blob contents.
#[derive(Debug)]
enum Bytes {
    /// No contents loaded.
    None,
    /// Heap copy of the contents.
    Owned(Vec<u8>),
    /// Private read/write mapping of the backing file.
    Mapped(MmapMut),
}

/// A named sequence of bytes, backed by a file, a buffer, or a mapping.
#[derive(Debug)]
pub struct Blob {
    kind: BlobKind,
    /// Name of the blob, derived from the path basename or caller-supplied.
    name: String,
    /// Path of the backing file, if any.
    path: Option<PathBuf>,
    /// Whether the runtime created (and must remove) the backing file.
    path_owned: bool,
    bytes: Bytes,
}

impl Blob {
    /// Creates a blob over an existing file the caller owns.
    pub fn from_path(path: &Path) -> Result<Self> {
        if !fs::path_is_file(path) {
            return Err(Error::InvalidArgument);
        }

        Ok(Self {
            kind: BlobKind::File,
            name: fs::file_name(path)?,
            path: Some(path.to_owned()),
            path_owned: false,
            bytes: Bytes::None,
        })
    }

    /// Creates a blob holding a copy of `buf`.
    ///
    /// With a `dir` the blob is immediately persisted there (see
    /// [`Blob::persist`]); otherwise it stays a pure buffer blob.
    pub fn from_buf(buf: &[u8], name: &str, dir: Option<&Path>, randomize: bool) -> Result<Self> {
        if buf.is_empty() || name.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let mut blob = Self {
            kind: BlobKind::Buffer,
            name: name.to_owned(),
            path: None,
            path_owned: false,
            bytes: Bytes::Owned(buf.to_vec()),
        };
        if let Some(dir) = dir {
            blob.persist(dir, name, randomize)?;
        }
        Ok(blob)
    }

    /// Writes the blob contents to a new file under `dir` and re-maps them
    /// from it.
    ///
    /// Fails with [`Error::InvalidArgument`] if the blob already has a
    /// backing path. With `randomize` (or when `dir/name` already exists)
    /// the file name gets a random suffix. On success the blob owns the new
    /// file and its kind becomes [`BlobKind::Mapped`].
    pub fn persist(&mut self, dir: &Path, name: &str, randomize: bool) -> Result<()> {
        if self.path.is_some() {
            return Err(Error::InvalidArgument);
        }
        let Bytes::Owned(data) = &self.bytes else {
            return Err(Error::InvalidArgument);
        };

        if !fs::path_is_dir(dir) {
            return Err(Error::NotDirectory);
        }

        let plain = fs::path_from_parts(&[dir, Path::new(name)])?;
        let (mut file, path) = if randomize || fs::path_exists(&plain) {
            fs::file_create_unique(dir, name)?
        } else {
            (fs::file_create(&plain)?, plain)
        };

        use std::io::Write as _;
        file.write_all(data)?;
        file.flush()?;
        drop(file);

        let map = fs::file_read_mmap(&path)?;
        self.bytes = Bytes::Mapped(map);
        self.path = Some(path);
        self.path_owned = true;
        self.kind = BlobKind::Mapped;
        Ok(())
    }

    /// Loads the contents of a file-backed blob by memory-mapping it.
    ///
    /// A no-op for blobs that already hold their contents.
    pub fn read(&mut self) -> Result<()> {
        match self.kind {
            BlobKind::Buffer | BlobKind::Mapped => Ok(()),
            BlobKind::File => {
                let path = self.path.as_deref().ok_or(Error::InvalidArgument)?;
                let map = fs::file_read_mmap(path)?;
                self.bytes = Bytes::Mapped(map);
                self.kind = BlobKind::Mapped;
                Ok(())
            }
            BlobKind::None => Err(Error::InvalidArgument),
        }
    }

    /// Returns the blob contents, if loaded.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.bytes {
            Bytes::None => None,
            Bytes::Owned(v) => Some(v),
            Bytes::Mapped(m) => Some(&m[..]),
        }
    }

    /// Returns the size of the loaded contents, or 0.
    pub fn size(&self) -> usize {
        self.data().map_or(0, <[u8]>::len)
    }

    /// Returns the blob name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the backing file path, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the storage class.
    pub fn kind(&self) -> BlobKind {
        self.kind
    }

    /// Returns `true` if the blob is usable: a path for file blobs, contents
    /// for buffer blobs, both for mapped blobs.
    pub fn initialized(&self) -> bool {
        match self.kind {
            BlobKind::None => false,
            BlobKind::File => self.path.is_some(),
            BlobKind::Buffer => matches!(self.bytes, Bytes::Owned(_)),
            BlobKind::Mapped => self.path.is_some() && !matches!(self.bytes, Bytes::None),
        }
    }

    /// Marks the backing file as runtime-owned, so it is removed when the
    /// blob drops. Used for downloaded blobs.
    pub(crate) fn set_path_owned(&mut self) {
        self.path_owned = true;
    }

    /// Copies this blob into a new one.
    ///
    /// File and mapped blobs are re-opened from their path; buffer blobs are
    /// copied byte-for-byte.
    pub fn duplicate(&self) -> Result<Self> {
        match self.kind {
            BlobKind::Buffer => {
                let data = self.data().ok_or(Error::InvalidArgument)?;
                Self::from_buf(data, &self.name, None, false)
            }
            BlobKind::File | BlobKind::Mapped => {
                let path = self.path.as_deref().ok_or(Error::InvalidArgument)?;
                Self::from_path(path)
            }
            BlobKind::None => Err(Error::InvalidArgument),
        }
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        // Unmap before removing the backing file.
        self.bytes = Bytes::None;
        if self.path_owned
            && let Some(path) = &self.path
            && let Err(e) = fs::file_remove(path)
        {
            warn!("Could not remove blob file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;

    #[test]
    fn file_blob_reads_lazily() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("weights.bin");
        stdfs::write(&path, b"weights").unwrap();

        let mut blob = Blob::from_path(&path).unwrap();
        assert_eq!(blob.kind(), BlobKind::File);
        assert_eq!(blob.name(), "weights.bin");
        assert!(blob.data().is_none());

        blob.read().unwrap();
        assert_eq!(blob.kind(), BlobKind::Mapped);
        assert_eq!(blob.data().unwrap(), b"weights");

        drop(blob);
        // The runtime does not own the caller's file.
        assert!(path.exists());
    }

    #[test]
    fn from_path_requires_existing_file() {
        assert!(Blob::from_path(Path::new("/nonexistent/blob")).is_err());
    }

    #[test]
    fn buffer_blob_holds_copy() {
        let blob = Blob::from_buf(b"payload", "payload.bin", None, false).unwrap();
        assert_eq!(blob.kind(), BlobKind::Buffer);
        assert!(blob.path().is_none());
        assert_eq!(blob.data().unwrap(), b"payload");
        assert!(blob.initialized());
    }

    #[test]
    fn persist_maps_and_owns_file() {
        let scratch = tempfile::tempdir().unwrap();
        let mut blob = Blob::from_buf(b"persisted", "out.bin", None, false).unwrap();
        blob.persist(scratch.path(), "out.bin", false).unwrap();

        assert_eq!(blob.kind(), BlobKind::Mapped);
        let path = blob.path().unwrap().to_owned();
        assert_eq!(path, scratch.path().join("out.bin"));
        assert_eq!(stdfs::read(&path).unwrap(), b"persisted");
        assert_eq!(blob.data().unwrap(), b"persisted");

        drop(blob);
        // Owned file is removed on release.
        assert!(!path.exists());
    }

    #[test]
    fn persist_randomizes_on_collision() {
        let scratch = tempfile::tempdir().unwrap();
        stdfs::write(scratch.path().join("out.bin"), b"existing").unwrap();

        let mut blob = Blob::from_buf(b"fresh", "out.bin", None, false).unwrap();
        blob.persist(scratch.path(), "out.bin", false).unwrap();

        let name = blob.path().unwrap().file_name().unwrap().to_str().unwrap();
        assert_ne!(name, "out.bin");
        assert!(name.starts_with("out_"));
        assert!(name.ends_with(".bin"));
    }

    #[test]
    fn persist_twice_fails() {
        let scratch = tempfile::tempdir().unwrap();
        let mut blob = Blob::from_buf(b"x", "x.bin", Some(scratch.path()), false).unwrap();
        assert!(blob.persist(scratch.path(), "x.bin", false).is_err());
    }

    #[test]
    fn duplicate_buffer_blob() {
        let blob = Blob::from_buf(b"dup", "d.bin", None, false).unwrap();
        let copy = blob.duplicate().unwrap();
        assert_eq!(copy.data().unwrap(), b"dup");
        assert_eq!(copy.kind(), BlobKind::Buffer);
    }
}
