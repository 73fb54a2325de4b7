//! Client sessions: identity, placement hint, and registered resources.

#![allow(unsafe_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::id_pool::{Id, IdPool};
use crate::plugin::{self, PluginView, hint};
use crate::resource::{Resource, ResourceType};
use crate::{Error, Result, error, fs, runtime};

/// Maximum number of live sessions.
const SESSIONS_MAX: usize = 1024;

/// Per-type lists of the resources registered with a session.
type ResourceLists = [Vec<Arc<Resource>>; ResourceType::COUNT];

/// Session id bookkeeping.
#[derive(Debug)]
struct SessionsState {
    pool: IdPool,
    live: Vec<Id>,
}

static STATE: Mutex<Option<SessionsState>> = Mutex::new(None);

/// Initializes the sessions subsystem.
pub(crate) fn bootstrap() -> Result<()> {
    let mut guard = STATE.lock().expect("sessions state lock poisoned");
    *guard = Some(SessionsState {
        pool: IdPool::new(SESSIONS_MAX)?,
        live: Vec::new(),
    });
    Ok(())
}

/// Shuts the sessions subsystem down.
///
/// Sessions are caller-owned values released on drop; any still alive here
/// are logged, not freed.
pub(crate) fn cleanup() -> Result<()> {
    let mut guard = STATE.lock().expect("sessions state lock poisoned");
    if let Some(state) = guard.take() {
        for id in &state.live {
            warn!("Session {id} still alive at cleanup");
        }
    }
    Ok(())
}

fn with_state<T>(f: impl FnOnce(&mut SessionsState) -> Result<T>) -> Result<T> {
    let mut guard = STATE.lock().expect("sessions state lock poisoned");
    let state = guard.as_mut().ok_or(Error::SessionBroken)?;
    f(state)
}

/// Returns an id to the pool on construction failure paths.
fn put_id(id: Id) {
    let _ = with_state(|state| {
        if state.pool.put(id).is_err() {
            warn!("Could not return session id {id} to pool");
        }
        Ok(())
    });
}

/// A client identity with a placement hint and a set of registered
/// resources.
///
/// A session either delegates its whole lifecycle to the VirtIO plugin or
/// runs locally; the choice is made at construction and never changes.
#[derive(Debug)]
pub struct Session {
    /// Session id; never 0.
    id: Id,
    /// Id of the host-side session for VirtIO sessions, -1 otherwise.
    remote_id: AtomicI64,
    /// Placement hint bitmask guiding plugin selection.
    hint: AtomicU32,
    /// True iff lifecycle is offloaded to the VirtIO plugin.
    is_virtio: bool,
    /// The owning VirtIO plugin for VirtIO sessions.
    plugin: Option<PluginView>,
    /// Registered resources, one list per resource type.
    resources: Mutex<ResourceLists>,
    /// Per-session scratch directory.
    rundir: PathBuf,
    released: AtomicBool,
}

impl Session {
    /// Creates a session.
    ///
    /// `flags` is the placement hint; with the [`hint::REMOTE`] bit set (or
    /// when the only loaded plugin is VirtIO) the session is offloaded to
    /// the VirtIO plugin, which assigns its remote id.
    pub fn new(flags: u32) -> Result<Self> {
        runtime::ensure_bootstrapped()?;

        let id = with_state(|state| {
            let id = state.pool.get();
            if id == 0 {
                return Err(Error::IdPoolExhausted);
            }
            Ok(id)
        })?;

        let virtio = plugin::get_virtio();
        let wants_virtio =
            flags & hint::REMOTE != 0 || (plugin::nr_plugins() == 1 && virtio.is_some());

        let mut sess = Self {
            id,
            remote_id: AtomicI64::new(-1),
            hint: AtomicU32::new(flags),
            is_virtio: false,
            plugin: None,
            resources: Mutex::new(ResourceLists::default()),
            rundir: PathBuf::new(),
            released: AtomicBool::new(false),
        };

        if wants_virtio {
            let Some(view) = virtio else {
                error!("Could not initialize VirtIO session, no VirtIO plugin loaded yet");
                put_id(id);
                return Err(Error::NotSupported);
            };
            let Some(session_init) = view.session_init else {
                put_id(id);
                return Err(Error::NotSupported);
            };

            // SAFETY: the plugin only sees the session through its accessors.
            let ret =
                unsafe { session_init(std::ptr::from_mut(&mut sess), flags & !hint::REMOTE) };
            if let Err(e) = error::check(ret) {
                error!("Could not create host-side session");
                put_id(id);
                return Err(e);
            }
            sess.is_virtio = true;
            sess.plugin = Some(view);
        }

        match sess.create_rundir() {
            Ok(()) => {}
            Err(e) => {
                if sess.is_virtio {
                    sess.virtio_release();
                }
                put_id(id);
                return Err(e);
            }
        }

        with_state(|state| {
            state.live.push(id);
            Ok(())
        })?;

        if sess.is_virtio {
            debug!(
                "Initialized session {} with remote (id: {})",
                sess.id,
                sess.remote_id()
            );
        } else {
            debug!("Initialized session {}", sess.id);
        }
        Ok(sess)
    }

    fn create_rundir(&mut self) -> Result<()> {
        let dir = fs::path_from_parts(&[
            runtime::rundir()?,
            PathBuf::from(format!("session.{}", self.id)),
        ])?;
        fs::dir_create(&dir)?;
        debug!("New rundir for session {}: {}", self.id, dir.display());
        self.rundir = dir;
        Ok(())
    }

    /// Returns the session id.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the remote session id, or -1 for local sessions.
    pub fn remote_id(&self) -> Id {
        self.remote_id.load(Ordering::Acquire)
    }

    /// Records the remote session id; called by the VirtIO plugin during
    /// session initialization.
    pub fn set_remote_id(&self, remote_id: Id) {
        self.remote_id.store(remote_id, Ordering::Release);
    }

    /// Returns the placement hint.
    pub fn hint(&self) -> u32 {
        self.hint.load(Ordering::Acquire)
    }

    /// Returns `true` for sessions offloaded to the VirtIO plugin.
    pub fn is_virtio(&self) -> bool {
        self.is_virtio
    }

    /// Returns the per-session scratch directory.
    pub fn rundir(&self) -> &std::path::Path {
        &self.rundir
    }

    /// Updates the session with new flags.
    ///
    /// VirtIO sessions forward the update to the plugin; local sessions
    /// replace their placement hint.
    pub fn update(&self, flags: u32) -> Result<()> {
        if self.is_virtio {
            let session_update = self
                .plugin
                .as_ref()
                .and_then(|p| p.session_update)
                .ok_or(Error::NotSupported)?;
            // SAFETY: plugin hook over an accessor-only session handle.
            let ret = unsafe {
                session_update(
                    std::ptr::from_ref(self).cast_mut(),
                    flags & !hint::REMOTE,
                )
            };
            error::check(ret).inspect_err(|_| error!("Could not update host-side session"))?;
        } else {
            self.hint.store(flags, Ordering::Release);
        }

        debug!("session:{} Updated with flags: {flags}", self.id);
        Ok(())
    }

    /// Releases the session: unregisters every still-registered resource,
    /// removes the rundir (best effort), offloads teardown for VirtIO
    /// sessions, and returns the id.
    ///
    /// Invoked automatically on drop; a second call returns
    /// [`Error::InvalidArgument`].
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidArgument);
        }

        let registered: Vec<Arc<Resource>> = {
            let lists = self.resources.lock().expect("session resources lock poisoned");
            lists.iter().flatten().cloned().collect()
        };
        for res in registered {
            if let Err(e) = res.unregister(self) {
                error!("Could not unregister resource from session: {e}");
                self.released.store(false, Ordering::Release);
                return Err(e);
            }
        }

        // Best effort; warn and continue on failure.
        if let Err(e) = fs::dir_remove_all(&self.rundir) {
            warn!(
                "Could not cleanup rundir '{}' for session {}: {e}",
                self.rundir.display(),
                self.id
            );
        }

        if self.is_virtio {
            self.virtio_release();
        }

        with_state(|state| {
            state.live.retain(|&id| id != self.id);
            if state.pool.put(self.id).is_err() {
                warn!("Could not return session id {} to pool", self.id);
            }
            Ok(())
        })?;

        debug!("Released session {}", self.id);
        Ok(())
    }

    fn virtio_release(&self) {
        let Some(session_release) = self.plugin.as_ref().and_then(|p| p.session_release) else {
            error!("Could not release VirtIO session, no VirtIO plugin loaded yet");
            return;
        };
        // SAFETY: plugin hook over an accessor-only session handle.
        let ret = unsafe { session_release(std::ptr::from_ref(self).cast_mut()) };
        if ret != 0 {
            warn!("Could not release host-side session");
        }
    }

    /// Returns `true` iff `res` is registered with this session.
    pub fn has_resource(&self, res: &Arc<Resource>) -> bool {
        let lists = self.resources.lock().expect("session resources lock poisoned");
        lists[res.resource_type() as usize]
            .iter()
            .any(|r| r.id() == res.id())
    }

    /// Returns the registered resource with the given id.
    pub fn resource_by_id(&self, id: Id) -> Result<Arc<Resource>> {
        let lists = self.resources.lock().expect("session resources lock poisoned");
        lists
            .iter()
            .flatten()
            .find(|r| r.id() == id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Returns the first registered resource of the given type.
    pub fn resource_by_type(&self, kind: ResourceType) -> Result<Arc<Resource>> {
        let lists = self.resources.lock().expect("session resources lock poisoned");
        lists[kind as usize].first().cloned().ok_or(Error::NotFound)
    }

    /// Returns all registered resources of the given type.
    pub fn resources_by_type(&self, kind: ResourceType) -> Vec<Arc<Resource>> {
        let lists = self.resources.lock().expect("session resources lock poisoned");
        lists[kind as usize].clone()
    }

    /// Returns the number of registered resources of the given type.
    pub fn resource_count(&self, kind: ResourceType) -> usize {
        let lists = self.resources.lock().expect("session resources lock poisoned");
        lists[kind as usize].len()
    }

    /// Links a resource into this session's lists. Called by
    /// [`Resource::register`] with the resource's session lock held.
    pub(crate) fn link_resource(&self, res: &Arc<Resource>) -> Result<()> {
        let mut lists = self.resources.lock().expect("session resources lock poisoned");
        lists[res.resource_type() as usize].push(Arc::clone(res));
        Ok(())
    }

    /// Unlinks a resource from this session's lists. Called by
    /// [`Resource::unregister`] with the resource's session lock held.
    pub(crate) fn unlink_resource(&self, res: &Arc<Resource>) -> Result<()> {
        let mut lists = self.resources.lock().expect("session resources lock poisoned");
        let list = &mut lists[res.resource_type() as usize];
        let Some(idx) = list.iter().position(|r| r.id() == res.id()) else {
            return Err(Error::InvalidArgument);
        };
        list.remove(idx);
        Ok(())
    }

    /// Offloads resource registration to the VirtIO plugin.
    pub(crate) fn virtio_resource_register(&self, res: &Arc<Resource>) -> Result<()> {
        let register = self
            .plugin
            .as_ref()
            .and_then(|p| p.resource_register)
            .ok_or_else(|| {
                error!(
                    "Could not register resource to virtio session, \
                     no VirtIO plugin loaded yet"
                );
                Error::NotSupported
            })?;
        // SAFETY: plugin hooks see accessor-only handles.
        let ret = unsafe {
            register(
                Arc::as_ptr(res).cast_mut(),
                std::ptr::from_ref(self).cast_mut(),
            )
        };
        error::check(ret)
    }

    /// Offloads resource unregistration to the VirtIO plugin.
    pub(crate) fn virtio_resource_unregister(&self, res: &Arc<Resource>) -> Result<()> {
        let unregister = self
            .plugin
            .as_ref()
            .and_then(|p| p.resource_unregister)
            .ok_or(Error::NotSupported)?;
        // SAFETY: plugin hooks see accessor-only handles.
        let ret = unsafe {
            unregister(
                Arc::as_ptr(res).cast_mut(),
                std::ptr::from_ref(self).cast_mut(),
            )
        };
        error::check(ret)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire)
            && let Err(e) = self.release()
        {
            warn!("Could not release session {}: {e}", self.id);
        }
    }
}
