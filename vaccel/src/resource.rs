//! Shareable, refcounted resource handles.
//!
//! A resource is one logical artifact (a model, a shared object, a data
//! set) composed of one or more blobs. Resources live in a global registry,
//! are shared between sessions through registration, and materialize their
//! blobs lazily at first registration.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, warn};

use crate::blob::{Blob, BlobKind};
use crate::id_pool::{Id, IdPool};
use crate::session::Session;
use crate::{Error, Result, fs, net, runtime};

/// Maximum number of live resources.
const RESOURCES_MAX: usize = 2048;

/// Kind of artifact a resource represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u32)]
pub enum ResourceType {
    /// A shared object with executable code.
    Lib = 0,
    /// An opaque data set.
    Data = 1,
    /// A machine-learning model.
    Model = 2,
}

impl ResourceType {
    /// Number of resource types.
    pub const COUNT: usize = 3;
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Lib => "lib",
            Self::Data => "data",
            Self::Model => "model",
        })
    }
}

/// Classification of the path(s) a resource was constructed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PathType {
    /// One or more local regular files.
    LocalFile,
    /// A single local directory.
    LocalDir,
    /// One or more remote URLs.
    RemoteFile,
}

/// A refcounted, session-shareable artifact handle.
#[derive(Debug)]
pub struct Resource {
    /// Unique id, from the resources pool; never 0.
    id: Id,
    /// Id assigned by the VirtIO backend at remote registration, -1 before.
    ///
    /// A resource keeps a single remote id; co-registration with more than
    /// one VirtIO backend is not supported.
    remote_id: AtomicI64,
    kind: ResourceType,
    path_type: PathType,
    /// Paths the resource was constructed from; empty for buffer resources.
    paths: Vec<PathBuf>,
    /// True for buffer resources that must never touch the filesystem.
    mem_only: bool,
    /// Per-resource scratch directory, created on demand.
    rundir: Mutex<Option<PathBuf>>,
    /// Blobs composing the artifact; populated lazily at first register.
    blobs: Mutex<Vec<Blob>>,
    /// Ids of the sessions this resource is registered with.
    sessions: Mutex<Vec<Id>>,
    /// Number of sessions currently registered.
    refcount: AtomicU32,
    released: AtomicBool,
}

/// Global live-resources registry.
///
/// Holds weak references: the owning handles are the user's `Arc` and the
/// session registration lists, so an unregistered resource dropped by its
/// creator disappears from the registry on its own.
#[derive(Debug)]
struct Registry {
    pool: IdPool,
    by_type: [Vec<(Id, Weak<Resource>)>; ResourceType::COUNT],
}

static REGISTRY: Mutex<Option<Registry>> = Mutex::new(None);

/// Initializes the resources subsystem.
pub(crate) fn bootstrap() -> Result<()> {
    let mut guard = REGISTRY.lock().expect("resources registry lock poisoned");
    *guard = Some(Registry {
        pool: IdPool::new(RESOURCES_MAX)?,
        by_type: [Vec::new(), Vec::new(), Vec::new()],
    });
    Ok(())
}

/// Drops the registry, releasing every resource the runtime still owns.
pub(crate) fn cleanup() -> Result<()> {
    debug!("Cleaning up resources");
    let mut guard = REGISTRY.lock().expect("resources registry lock poisoned");
    if let Some(registry) = guard.take() {
        for (id, res) in registry.by_type.iter().flatten() {
            if res.upgrade().is_some_and(|res| res.refcount() > 0) {
                warn!("Resource {id} still registered at cleanup");
            }
        }
    }
    Ok(())
}

fn with_registry<T>(f: impl FnOnce(&mut Registry) -> Result<T>) -> Result<T> {
    let mut guard = REGISTRY.lock().expect("resources registry lock poisoned");
    let registry = guard.as_mut().ok_or(Error::PermissionDenied)?;
    f(registry)
}

/// Looks up a live resource by id.
pub fn get_by_id(id: Id) -> Result<Arc<Resource>> {
    with_registry(|registry| {
        registry
            .by_type
            .iter()
            .flatten()
            .find(|(res_id, _)| *res_id == id)
            .and_then(|(_, res)| res.upgrade())
            .ok_or(Error::NotFound)
    })
}

/// Returns the first live resource of the given type.
pub fn get_by_type(kind: ResourceType) -> Result<Arc<Resource>> {
    with_registry(|registry| {
        registry.by_type[kind as usize]
            .iter()
            .find_map(|(_, res)| res.upgrade())
            .ok_or(Error::NotFound)
    })
}

/// Returns all live resources of the given type.
pub fn get_all_by_type(kind: ResourceType) -> Result<Vec<Arc<Resource>>> {
    with_registry(|registry| {
        Ok(registry.by_type[kind as usize]
            .iter()
            .filter_map(|(_, res)| res.upgrade())
            .collect())
    })
}

/// Classifies a single construction path.
fn classify(path: &str) -> Result<PathType> {
    if net::is_url(path) {
        return Ok(PathType::RemoteFile);
    }
    let p = Path::new(path);
    if fs::path_is_dir(p) {
        return Ok(PathType::LocalDir);
    }
    if fs::path_is_file(p) {
        return Ok(PathType::LocalFile);
    }
    error!("Invalid resource path {path}");
    Err(Error::NotFound)
}

impl Resource {
    fn alloc(
        kind: ResourceType,
        path_type: PathType,
        paths: Vec<PathBuf>,
        mem_only: bool,
        blobs: Vec<Blob>,
        rundir: Option<PathBuf>,
    ) -> Result<Arc<Self>> {
        runtime::ensure_bootstrapped()?;

        with_registry(|registry| {
            let id = registry.pool.get();
            if id == 0 {
                return Err(Error::IdPoolExhausted);
            }

            let res = Arc::new(Self {
                id,
                remote_id: AtomicI64::new(-1),
                kind,
                path_type,
                paths,
                mem_only,
                rundir: Mutex::new(rundir),
                blobs: Mutex::new(blobs),
                sessions: Mutex::new(Vec::new()),
                refcount: AtomicU32::new(0),
                released: AtomicBool::new(false),
            });
            registry.by_type[kind as usize].push((id, Arc::downgrade(&res)));
            debug!("Initialized resource {}", res.id);
            Ok(res)
        })
    }

    /// Creates a resource from a single path: a local file, a local
    /// directory, or a URL.
    pub fn new(path: &str, kind: ResourceType) -> Result<Arc<Self>> {
        runtime::ensure_bootstrapped()?;
        let path_type = classify(path)?;
        Self::alloc(
            kind,
            path_type,
            vec![PathBuf::from(path)],
            false,
            Vec::new(),
            None,
        )
    }

    /// Creates a resource from multiple local file paths.
    pub fn from_paths(paths: &[&str], kind: ResourceType) -> Result<Arc<Self>> {
        runtime::ensure_bootstrapped()?;
        if paths.is_empty() {
            return Err(Error::InvalidArgument);
        }
        for path in paths {
            if !fs::path_is_file(Path::new(path)) {
                error!("Invalid resource path {path}");
                return Err(Error::NotFound);
            }
        }
        Self::alloc(
            kind,
            PathType::LocalFile,
            paths.iter().map(|p| PathBuf::from(*p)).collect(),
            false,
            Vec::new(),
            None,
        )
    }

    /// Creates a resource from an in-memory buffer.
    ///
    /// With `mem_only` the bytes stay a buffer blob and no filesystem
    /// artifact is ever created; otherwise the buffer is persisted into a
    /// fresh per-resource rundir under `filename` (or a randomized
    /// placeholder name).
    pub fn from_buf(
        buf: &[u8],
        kind: ResourceType,
        filename: Option<&str>,
        mem_only: bool,
    ) -> Result<Arc<Self>> {
        runtime::ensure_bootstrapped()?;
        if buf.is_empty() {
            return Err(Error::InvalidArgument);
        }

        if mem_only {
            let blob = Blob::from_buf(buf, filename.unwrap_or("file"), None, false)?;
            return Self::alloc(kind, PathType::LocalFile, Vec::new(), true, vec![blob], None);
        }

        let res = Self::alloc(kind, PathType::LocalFile, Vec::new(), false, Vec::new(), None)?;
        let rundir = res.create_rundir()?;
        let blob = match filename {
            Some(name) => Blob::from_buf(buf, name, Some(&rundir), false),
            None => Blob::from_buf(buf, "file", Some(&rundir), true),
        };
        match blob {
            Ok(blob) => {
                res.blobs
                    .lock()
                    .expect("resource blobs lock poisoned")
                    .push(blob);
                Ok(res)
            }
            Err(e) => {
                let _ = res.release();
                Err(e)
            }
        }
    }

    /// Creates a resource from copies of existing blobs.
    pub fn from_blobs(blobs: &[Blob], kind: ResourceType) -> Result<Arc<Self>> {
        runtime::ensure_bootstrapped()?;
        if blobs.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let copies: Vec<Blob> = blobs
            .iter()
            .map(Blob::duplicate)
            .collect::<Result<_>>()?;

        let needs_rundir = copies.iter().any(|b| b.kind() != BlobKind::Buffer);
        let res = Self::alloc(kind, PathType::LocalFile, Vec::new(), false, copies, None)?;
        if needs_rundir {
            res.create_rundir()?;
        }
        Ok(res)
    }

    /// Returns the resource id.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the remote id assigned by the VirtIO backend, or -1.
    pub fn remote_id(&self) -> Id {
        self.remote_id.load(Ordering::Acquire)
    }

    /// Records the remote id; called by the VirtIO plugin during
    /// resource registration.
    pub fn set_remote_id(&self, remote_id: Id) {
        self.remote_id.store(remote_id, Ordering::Release);
    }

    /// Returns the resource type.
    pub fn resource_type(&self) -> ResourceType {
        self.kind
    }

    /// Returns the path classification.
    pub fn path_type(&self) -> PathType {
        self.path_type
    }

    /// Returns the construction paths.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Returns the number of sessions the resource is registered with.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Returns the number of materialized blobs.
    pub fn nr_blobs(&self) -> usize {
        self.blobs.lock().expect("resource blobs lock poisoned").len()
    }

    /// Runs `f` over the materialized blobs.
    pub fn with_blobs<R>(&self, f: impl FnOnce(&[Blob]) -> R) -> R {
        let blobs = self.blobs.lock().expect("resource blobs lock poisoned");
        f(&blobs)
    }

    /// Returns the directory backing this resource: the source directory
    /// for directory resources, else the rundir if one was created.
    pub fn directory(&self) -> Result<PathBuf> {
        if self.path_type == PathType::LocalDir {
            return self.paths.first().cloned().ok_or(Error::InvalidArgument);
        }
        self.rundir
            .lock()
            .expect("resource rundir lock poisoned")
            .clone()
            .ok_or(Error::NotFound)
    }

    /// Creates (once) and returns the per-resource rundir.
    ///
    /// Memory-only resources must never produce filesystem artifacts.
    fn create_rundir(&self) -> Result<PathBuf> {
        if self.mem_only {
            return Err(Error::InvalidArgument);
        }
        let mut rundir = self.rundir.lock().expect("resource rundir lock poisoned");
        if let Some(dir) = rundir.as_ref() {
            return Ok(dir.clone());
        }

        let dir = fs::path_from_parts(&[
            runtime::rundir()?,
            PathBuf::from(format!("resource.{}", self.id)),
        ])?;
        fs::dir_create(&dir)?;
        debug!("New rundir for resource {}: {}", self.id, dir.display());
        *rundir = Some(dir.clone());
        Ok(dir)
    }

    /// Materializes the blob list, if not already present.
    ///
    /// For VirtIO sessions the blob bytes are additionally loaded so the
    /// remote end can see them.
    fn materialize(&self, read_data: bool) -> Result<()> {
        let mut blobs = self.blobs.lock().expect("resource blobs lock poisoned");
        if !blobs.is_empty() {
            if read_data {
                for blob in blobs.iter_mut() {
                    if blob.kind() == BlobKind::File {
                        blob.read()?;
                    }
                }
            }
            return Ok(());
        }

        let mut fresh = Vec::new();
        match self.path_type {
            PathType::LocalFile => {
                for path in &self.paths {
                    fresh.push(Blob::from_path(path)?);
                }
            }
            PathType::LocalDir => {
                let dir = self.paths.first().ok_or(Error::InvalidArgument)?;
                for path in fs::dir_files(dir)? {
                    fresh.push(Blob::from_path(&path)?);
                }
                if fresh.is_empty() {
                    error!("Directory resource {} has no files", self.id);
                    return Err(Error::InvalidArgument);
                }
            }
            PathType::RemoteFile => {
                drop(blobs);
                let rundir = self.create_rundir()?;
                blobs = self.blobs.lock().expect("resource blobs lock poisoned");
                for url in &self.paths {
                    let url = url.to_str().ok_or(Error::InvalidArgument)?;
                    let name = url.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("file");
                    let target = fs::path_from_parts(&[rundir.as_path(), Path::new(name)])?;
                    net::download(url, &target)?;
                    let mut blob = Blob::from_path(&target)?;
                    blob.set_path_owned();
                    fresh.push(blob);
                }
            }
        }

        if read_data {
            for blob in &mut fresh {
                blob.read()?;
            }
        }
        *blobs = fresh;
        Ok(())
    }

    /// Registers the resource with a session.
    ///
    /// Materializes the blobs on first registration, offloads to the VirtIO
    /// backend for VirtIO sessions, links both sides, and bumps the
    /// refcount. A resource can be registered with a session at most once.
    pub fn register(self: &Arc<Self>, sess: &Session) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument);
        }

        if self.nr_blobs() == 0 || sess.is_virtio() {
            self.materialize(sess.is_virtio())?;
        }

        if sess.is_virtio() {
            sess.virtio_resource_register(self)?;
            if self.remote_id() <= 0 {
                error!("Could not register remote resource");
                return Err(Error::Backend);
            }
        }

        // Canonical lock order: the resource's session list first, then the
        // session's resource lists.
        {
            let mut sessions = self.sessions.lock().expect("resource sessions lock poisoned");
            if sessions.contains(&sess.id()) {
                error!(
                    "session:{} Resource {} already registered",
                    sess.id(),
                    self.id
                );
                return Err(Error::InvalidArgument);
            }
            sess.link_resource(self)?;
            sessions.push(sess.id());
        }
        self.refcount.fetch_add(1, Ordering::AcqRel);

        if sess.is_virtio() {
            debug!(
                "session:{} Registered resource {} with remote (id: {})",
                sess.id(),
                self.id,
                self.remote_id()
            );
        } else {
            debug!("session:{} Registered resource {}", sess.id(), self.id);
        }
        Ok(())
    }

    /// Unregisters the resource from a session, undoing [`Resource::register`].
    pub fn unregister(self: &Arc<Self>, sess: &Session) -> Result<()> {
        {
            let mut sessions = self.sessions.lock().expect("resource sessions lock poisoned");
            let Some(idx) = sessions.iter().position(|&id| id == sess.id()) else {
                error!("session:{} Resource {} not registered", sess.id(), self.id);
                return Err(Error::InvalidArgument);
            };
            sess.unlink_resource(self)?;
            sessions.remove(idx);
        }
        self.refcount.fetch_sub(1, Ordering::AcqRel);

        if sess.is_virtio() {
            sess.virtio_resource_unregister(self)?;
        }

        debug!("session:{} Unregistered resource {}", sess.id(), self.id);
        Ok(())
    }

    /// Releases the resource: frees its blobs, removes its rundir, and
    /// returns its id to the pool.
    ///
    /// Fails with [`Error::Busy`] while any session still has the resource
    /// registered, and with [`Error::InvalidArgument`] on a re-release.
    pub fn release(self: &Arc<Self>) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidArgument);
        }

        if self.refcount() > 0 {
            self.released.store(false, Ordering::Release);
            return Err(Error::Busy);
        }

        self.blobs
            .lock()
            .expect("resource blobs lock poisoned")
            .clear();
        self.remove_rundir();

        with_registry(|registry| {
            registry.by_type[self.kind as usize].retain(|(id, _)| *id != self.id);
            if registry.pool.put(self.id).is_err() {
                warn!("Could not return resource id {} to pool", self.id);
            }
            Ok(())
        })?;

        debug!("Released resource {}", self.id);
        Ok(())
    }

    fn remove_rundir(&self) {
        let mut rundir = self.rundir.lock().expect("resource rundir lock poisoned");
        if let Some(dir) = rundir.take()
            && let Err(e) = fs::dir_remove_all(&dir)
        {
            warn!("Could not remove rundir {}: {e}", dir.display());
        }
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        // Dropped without an explicit release: blobs drop on their own;
        // clean up the scratch directory and the registry slot.
        self.remove_rundir();
        let _ = with_registry(|registry| {
            registry.by_type[self.kind as usize].retain(|(id, _)| *id != self.id);
            if registry.pool.put(self.id).is_err() {
                debug!("Resource id {} leaked back to the pool", self.id);
            }
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_codes_are_stable() {
        assert_eq!(ResourceType::Lib as u32, 0);
        assert_eq!(ResourceType::Data as u32, 1);
        assert_eq!(ResourceType::Model as u32, 2);
    }

    #[test]
    fn classify_paths() {
        let scratch = tempfile::tempdir().unwrap();
        let file = scratch.path().join("model.pb");
        std::fs::write(&file, b"model").unwrap();

        assert_eq!(
            classify("https://host/model.pb").unwrap(),
            PathType::RemoteFile
        );
        assert_eq!(
            classify(scratch.path().to_str().unwrap()).unwrap(),
            PathType::LocalDir
        );
        assert_eq!(classify(file.to_str().unwrap()).unwrap(), PathType::LocalFile);
        assert!(classify("/nonexistent/path").is_err());
    }
}
