//! Filesystem and path helpers.
//!
//! All blob and rundir filesystem traffic goes through this module; the
//! rest of the runtime composes paths and hands them here.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

/// Mode for every file and directory the runtime creates.
const RUN_MODE: u32 = 0o700;

/// Number of random characters in unique file and directory names.
const RAND_CHARS: usize = 6;

/// Joins `parts` with `/`, failing with [`Error::NameTooLong`] if the result
/// would exceed the platform path limit.
pub fn path_from_parts<P: AsRef<Path>>(parts: &[P]) -> Result<PathBuf> {
    if parts.is_empty() {
        return Err(Error::InvalidArgument);
    }

    let mut path = PathBuf::new();
    for part in parts {
        path.push(part);
    }

    if path.as_os_str().len() >= libc::PATH_MAX as usize {
        return Err(Error::NameTooLong);
    }
    Ok(path)
}

/// Extracts the final component of `path` as an owned string.
pub fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or(Error::InvalidArgument)
}

/// Returns `true` if `path` exists and is a directory.
pub fn path_is_dir(path: &Path) -> bool {
    path.is_dir()
}

/// Returns `true` if `path` exists and is a regular file.
pub fn path_is_file(path: &Path) -> bool {
    path.is_file()
}

/// Returns `true` if `path` exists.
pub fn path_exists(path: &Path) -> bool {
    path.exists()
}

/// Recursively creates `path` (and missing parents) with mode 0700.
pub fn dir_create(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(RUN_MODE)
        .create(path)
        .map_err(Error::from)
}

/// Creates a unique directory from `template`.
///
/// The final component of `template` is used as a prefix and extended with
/// six random alphanumeric characters; missing parents are created first.
/// Returns the path of the created directory (mode 0700).
pub fn dir_create_unique(template: &Path) -> Result<PathBuf> {
    let prefix = file_name(template)?;
    let parent = template.parent().ok_or(Error::InvalidArgument)?;
    if !parent.as_os_str().is_empty() {
        dir_create(parent)?;
    }

    let dir = tempfile::Builder::new()
        .prefix(&prefix)
        .rand_bytes(RAND_CHARS)
        .tempdir_in(if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        })?;
    Ok(dir.keep())
}

/// Creates a directory with a fully random 6-character name under
/// `parent`, creating `parent` (mode 0700) first if needed.
pub fn dir_create_random(parent: &Path) -> Result<PathBuf> {
    dir_create(parent)?;
    let dir = tempfile::Builder::new()
        .prefix("")
        .rand_bytes(RAND_CHARS)
        .tempdir_in(parent)?;
    Ok(dir.keep())
}

/// Creates `path` exclusively (O_CREAT|O_RDWR|O_EXCL, mode 0700).
pub fn file_create(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(RUN_MODE)
        .open(path)
        .map_err(Error::from)
}

/// Creates a uniquely named file under `dir`.
///
/// Six random characters are inserted between the stem of `name` and its
/// extension (`model.pb` becomes `model_XXXXXX.pb`). Returns the open file
/// and its final path.
pub fn file_create_unique(dir: &Path, name: &str) -> Result<(File, PathBuf)> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (name, String::new()),
    };

    let file = tempfile::Builder::new()
        .prefix(&format!("{stem}_"))
        .suffix(&ext)
        .rand_bytes(RAND_CHARS)
        .tempfile_in(dir)?;
    let (file, path) = file.keep().map_err(|e| Error::Io(e.error))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(RUN_MODE))?;
    Ok((file, path))
}

/// Reads the whole file at `path` into a heap buffer.
pub fn file_read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(Error::from)
}

/// Memory-maps the file at `path` (read/write, private).
///
/// Writes through the mapping are not carried back to the file.
pub fn file_read_mmap(path: &Path) -> Result<MmapMut> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Err(Error::InvalidArgument);
    }
    // MAP_PRIVATE + PROT_READ|PROT_WRITE.
    let map = unsafe { MmapOptions::new().map_copy(&file)? };
    Ok(map)
}

/// Removes the (empty) directory at `path`.
pub fn dir_remove(path: &Path) -> Result<()> {
    fs::remove_dir(path).map_err(Error::from)
}

/// Recursively removes the directory at `path` and its contents.
pub fn dir_remove_all(path: &Path) -> Result<()> {
    fs::remove_dir_all(path).map_err(Error::from)
}

/// Removes the file at `path`.
pub fn file_remove(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(Error::from)
}

/// Enumerates the regular files directly under `dir`, sorted by name.
pub fn dir_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::NotDirectory);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_from_parts_joins() {
        let path = path_from_parts(&["/run/user", "1000", "vaccel"]).unwrap();
        assert_eq!(path, PathBuf::from("/run/user/1000/vaccel"));
    }

    #[test]
    fn path_from_parts_overflow() {
        let long = "a".repeat(libc::PATH_MAX as usize);
        assert!(matches!(
            path_from_parts(&[long.as_str()]),
            Err(Error::NameTooLong)
        ));
    }

    #[test]
    fn dir_create_unique_appends_random_suffix() {
        let scratch = tempfile::tempdir().unwrap();
        let template = scratch.path().join("vaccel_test_");
        let created = dir_create_unique(&template).unwrap();

        let name = created.file_name().unwrap().to_str().unwrap();
        let suffix = name.strip_prefix("vaccel_test_").unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(char::is_alphanumeric));
        assert!(created.is_dir());

        let mode = fs::metadata(&created).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn file_create_unique_keeps_extension() {
        let scratch = tempfile::tempdir().unwrap();
        let (_file, path) = file_create_unique(scratch.path(), "model.pb").unwrap();

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("model_"));
        assert!(name.ends_with(".pb"));
        assert_eq!(name.len(), "model_".len() + 6 + ".pb".len());
    }

    #[test]
    fn file_create_refuses_existing() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("blob");
        file_create(&path).unwrap();
        assert!(file_create(&path).is_err());
    }

    #[test]
    fn mmap_read_sees_contents() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("data");
        fs::write(&path, b"hello mmap").unwrap();

        let map = file_read_mmap(&path).unwrap();
        assert_eq!(&map[..], b"hello mmap");
    }

    #[test]
    fn dir_files_lists_only_regular_files() {
        let scratch = tempfile::tempdir().unwrap();
        fs::write(scratch.path().join("b.bin"), b"b").unwrap();
        fs::write(scratch.path().join("a.bin"), b"a").unwrap();
        fs::create_dir(scratch.path().join("sub")).unwrap();

        let files = dir_files(scratch.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["a.bin", "b.bin"]);
    }
}
