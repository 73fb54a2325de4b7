//! Plugin registration, version checking, and op selection.
//!
//! Plugins enter the registry either by dynamic loading
//! ([`load`]/[`parse_and_load`]) or by direct registration of an
//! in-language descriptor ([`register`]). Operation implementations are
//! looked up by `(op type, session hint)` through [`get_op_func`].

#![allow(unsafe_code)]

pub mod ffi;

use std::path::Path;
use std::sync::Mutex;

use libloading::Library;
use tracing::{debug, error, info, warn};

use crate::ops::OpType;
use crate::{Error, Result};
pub use ffi::{FfiArg, OpFn, PluginDescriptor, PluginInfo, VaccelOp};

/// Session placement-hint bits; plugins advertise the same bits in their
/// `type_mask`.
pub mod hint {
    /// CPU backend.
    pub const CPU: u32 = 0x0001;
    /// GPU backend.
    pub const GPU: u32 = 0x0002;
    /// FPGA backend.
    pub const FPGA: u32 = 0x0004;
    /// Software (reference) backend.
    pub const SOFTWARE: u32 = 0x0008;
    /// TensorFlow backend.
    pub const TENSORFLOW: u32 = 0x0010;
    /// Torch backend.
    pub const TORCH: u32 = 0x0020;
    /// Jetson backend.
    pub const JETSON: u32 = 0x0040;
    /// Generic backend.
    pub const GENERIC: u32 = 0x0080;
    /// Debug backend.
    pub const DEBUG: u32 = 0x0100;
    /// Route to the VirtIO (remote) plugin.
    pub const REMOTE: u32 = 0x4000;
    /// Every backend bit.
    pub const ALL: u32 = 0xffff;
}

/// Runtime version plugins are checked against.
pub const VACCEL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Key identifying a registered plugin (its descriptor address).
pub(crate) type PluginKey = usize;

/// Safe snapshot of a registered plugin's info block.
#[derive(Debug, Clone)]
pub(crate) struct PluginView {
    /// Registry key of the plugin.
    pub key: PluginKey,
    /// Plugin name.
    pub name: String,
    /// Backend-type bitmask.
    pub type_mask: u32,
    /// True iff the plugin offloads session lifecycle (VirtIO).
    pub is_virtio: bool,
    /// Session lifecycle offload hooks.
    pub session_init: Option<ffi::SessionInitFn>,
    /// Session update offload hook.
    pub session_update: Option<ffi::SessionUpdateFn>,
    /// Session teardown offload hook.
    pub session_release: Option<ffi::SessionReleaseFn>,
    /// Resource registration offload hook.
    pub resource_register: Option<ffi::ResourceRegisterFn>,
    /// Resource unregistration offload hook.
    pub resource_unregister: Option<ffi::ResourceUnregisterFn>,
}

/// One registered plugin.
#[derive(Debug)]
struct Entry {
    key: PluginKey,
    view: PluginView,
    fini: ffi::LifecycleFn,
    /// Keeps a dynamically loaded library alive; dropping closes it.
    library: Option<Library>,
}

/// One registered op implementation.
#[derive(Debug, Clone, Copy)]
struct OpImpl {
    func: OpFn,
    owner: PluginKey,
}

/// Registry state; `None` until the subsystem bootstraps.
#[derive(Debug)]
struct State {
    plugins: Vec<Entry>,
    /// Key of the designated VirtIO plugin, if any.
    virtio: Option<PluginKey>,
    /// Implementations per op type code, in registration order.
    ops: Vec<Vec<OpImpl>>,
}

static STATE: Mutex<Option<State>> = Mutex::new(None);

fn with_state<T>(f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
    let mut guard = STATE.lock().expect("plugin registry lock poisoned");
    let state = guard.as_mut().ok_or(Error::Backend)?;
    f(state)
}

/// Initializes the plugin subsystem.
pub(crate) fn bootstrap() -> Result<()> {
    let mut guard = STATE.lock().expect("plugin registry lock poisoned");
    *guard = Some(State {
        plugins: Vec::new(),
        virtio: None,
        ops: vec![Vec::new(); OpType::COUNT],
    });
    Ok(())
}

/// Unregisters every plugin and shuts the subsystem down.
pub(crate) fn cleanup() -> Result<()> {
    debug!("Cleaning up plugins");

    let entries = {
        let mut guard = STATE.lock().expect("plugin registry lock poisoned");
        match guard.take() {
            Some(state) => state.plugins,
            None => return Ok(()),
        }
    };

    for entry in entries {
        // SAFETY: fini is a valid plugin hook for as long as `library` is
        // alive; the library drops after the call.
        let ret = unsafe { (entry.fini)() };
        if ret != 0 {
            warn!("Plugin {} fini failed with code {ret}", entry.view.name);
        }
        debug!("Unregistered plugin {}", entry.view.name);
        drop(entry.library);
    }
    Ok(())
}

/// Parses `X.Y.Z[-extra]` (optionally `vX.Y.Z[-extra]`) version strings.
pub(crate) fn parse_version(s: &str) -> Result<(u32, u32, u32, String)> {
    let s = s.strip_prefix('v').unwrap_or(s);
    let mut parts = s.splitn(3, '.');
    let major = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(Error::InvalidArgument)?;
    let minor = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(Error::InvalidArgument)?;
    let rest = parts.next().ok_or(Error::InvalidArgument)?;

    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return Err(Error::InvalidArgument);
    }
    let patch = rest[..digits].parse().map_err(|_| Error::InvalidArgument)?;
    Ok((major, minor, patch, rest[digits..].to_owned()))
}

/// Validates a plugin's built-against runtime version.
fn check_version(name: &str, vaccel_version: &str) -> Result<()> {
    if crate::runtime::version_ignore() {
        return Ok(());
    }

    let (major, minor, patch, extra) = parse_version(vaccel_version).map_err(|e| {
        error!("Could not parse plugin's vaccel version '{vaccel_version}'");
        e
    })?;
    let (vmajor, vminor, vpatch, vextra) =
        parse_version(VACCEL_VERSION).map_err(|e| {
            error!("Could not parse runtime version '{VACCEL_VERSION}'");
            e
        })?;

    if major != vmajor {
        error!(
            "Plugin {name} is incompatible with this runtime \
             (built w/ {vaccel_version}, used w/ {VACCEL_VERSION})"
        );
        return Err(Error::InvalidArgument);
    }

    if minor != vminor || patch != vpatch || extra != vextra {
        warn!(
            "Plugin {name} may be incompatible with this runtime \
             (built w/ {vaccel_version}, used w/ {VACCEL_VERSION})"
        );
    }
    Ok(())
}

/// Builds the registry view of a descriptor, validating its info block.
fn view_of(key: PluginKey, info: &PluginInfo) -> Result<(PluginView, ffi::LifecycleFn)> {
    let Some(name) = ffi::info_str(info.name) else {
        error!("Plugin needs to have a name");
        return Err(Error::InvalidArgument);
    };
    if ffi::info_str(info.version).is_none() {
        error!("Plugin needs to have a version");
        return Err(Error::InvalidArgument);
    }
    if info.init.is_none() {
        error!("Plugin needs to expose an init function");
        return Err(Error::InvalidArgument);
    }
    let Some(fini) = info.fini else {
        error!("Plugin needs to expose a fini function");
        return Err(Error::InvalidArgument);
    };
    let Some(vaccel_version) = ffi::info_str(info.vaccel_version) else {
        error!("Plugin {name} has no vaccel version set");
        return Err(Error::InvalidArgument);
    };

    check_version(&name, &vaccel_version)?;

    let is_virtio = info.session_init.is_some() && info.session_release.is_some();
    Ok((
        PluginView {
            key,
            name,
            type_mask: info.type_mask,
            is_virtio,
            session_init: info.session_init,
            session_update: info.session_update,
            session_release: info.session_release,
            resource_register: info.resource_register,
            resource_unregister: info.resource_unregister,
        },
        fini,
    ))
}

fn register_inner(
    descriptor: &'static PluginDescriptor,
    library: Option<Library>,
) -> Result<()> {
    let key = std::ptr::from_ref(descriptor) as PluginKey;
    if descriptor.info.is_null() {
        error!("Plugin is missing its info block");
        return Err(Error::InvalidArgument);
    }
    // SAFETY: non-null; points at static data in the plugin image.
    let info = unsafe { &*descriptor.info };
    let (view, fini) = view_of(key, info)?;
    let init = info.init.ok_or(Error::InvalidArgument)?;

    with_state(|state| {
        if state.plugins.iter().any(|p| p.key == key) {
            error!("Plugin {} already registered", view.name);
            return Err(Error::Exists);
        }

        info!(
            "Registered plugin {} {}",
            view.name,
            ffi::info_str(info.version).unwrap_or_default()
        );

        if view.is_virtio {
            debug!("{} is a VirtIO plugin", view.name);
            if state.virtio.is_some() {
                warn!("A VirtIO plugin is already registered, ignoring {}", view.name);
            } else {
                state.virtio = Some(key);
            }
        }

        state.plugins.push(Entry {
            key,
            view,
            fini,
            library,
        });
        Ok(())
    })?;

    // Run the plugin's init hook outside the registry lock; it typically
    // calls back into register_ops().
    // SAFETY: init is a valid plugin hook, library is held by the registry.
    let ret = unsafe { init() };
    if ret != 0 {
        error!("Plugin init failed with code {ret}");
        remove_plugin(key);
        return Err(Error::from_code(ret));
    }
    Ok(())
}

/// Drops a plugin and its ops from the registry (without calling fini).
fn remove_plugin(key: PluginKey) {
    let mut guard = STATE.lock().expect("plugin registry lock poisoned");
    if let Some(state) = guard.as_mut() {
        for impls in &mut state.ops {
            impls.retain(|op| op.owner != key);
        }
        if state.virtio == Some(key) {
            state.virtio = None;
        }
        state.plugins.retain(|p| p.key != key);
    }
}

/// Registers an in-language plugin descriptor and runs its init hook.
pub fn register(descriptor: &'static PluginDescriptor) -> Result<()> {
    register_inner(descriptor, None)
}

/// Unregisters a plugin, dropping its ops and calling its fini hook.
pub fn unregister(descriptor: &'static PluginDescriptor) -> Result<()> {
    let key = std::ptr::from_ref(descriptor) as PluginKey;
    let entry = with_state(|state| {
        if !state.plugins.iter().any(|p| p.key == key) {
            return Err(Error::NotFound);
        }
        for impls in &mut state.ops {
            impls.retain(|op| op.owner != key);
        }
        if state.virtio == Some(key) {
            state.virtio = None;
        }
        let idx = state
            .plugins
            .iter()
            .position(|p| p.key == key)
            .ok_or(Error::NotFound)?;
        Ok(state.plugins.remove(idx))
    })?;

    // SAFETY: fini is valid while the library handle is still alive.
    let ret = unsafe { (entry.fini)() };
    if ret != 0 {
        warn!("Plugin {} fini failed with code {ret}", entry.view.name);
    }
    debug!("Unregistered plugin {}", entry.view.name);
    drop(entry.library);
    Ok(())
}

/// Registers one operation implementation.
///
/// The op's `owner` must be an already-registered plugin descriptor.
pub fn register_op(op: &'static VaccelOp) -> Result<()> {
    let Some(func) = op.func else {
        error!("Invalid vaccel function");
        return Err(Error::InvalidArgument);
    };
    let op_type = OpType::from_code(op.op_type).ok_or_else(|| {
        error!("Unknown function type {}", op.op_type);
        Error::InvalidArgument
    })?;
    let owner = op.owner as PluginKey;

    with_state(|state| {
        let Some(entry) = state.plugins.iter().find(|p| p.key == owner) else {
            error!("Unknown plugin");
            return Err(Error::InvalidArgument);
        };
        debug!(
            "Registered function {} from plugin {}",
            op_type, entry.view.name
        );
        state.ops[op_type as usize].push(OpImpl { func, owner });
        Ok(())
    })
}

/// Registers a batch of operation implementations.
pub fn register_ops(ops: &'static [VaccelOp]) -> Result<()> {
    for op in ops {
        register_op(op)?;
    }
    Ok(())
}

/// Loads a plugin shared library, registers it, and runs its init hook.
pub fn load(path: &Path) -> Result<()> {
    debug!("Loading plugin library {}", path.display());
    let (library, descriptor) = ffi::open_library(path)?;
    register_inner(descriptor, Some(library))
}

/// Loads each library of a colon-separated list.
pub fn parse_and_load(libs: &str) -> Result<()> {
    for lib in libs.split(':').filter(|s| !s.is_empty()) {
        load(Path::new(lib))?;
    }
    Ok(())
}

/// Returns the number of registered plugins.
pub fn nr_plugins() -> usize {
    STATE
        .lock()
        .expect("plugin registry lock poisoned")
        .as_ref()
        .map_or(0, |s| s.plugins.len())
}

/// Returns a snapshot of the designated VirtIO plugin, if any.
pub(crate) fn get_virtio() -> Option<PluginView> {
    let guard = STATE.lock().expect("plugin registry lock poisoned");
    let state = guard.as_ref()?;
    let key = state.virtio?;
    state
        .plugins
        .iter()
        .find(|p| p.key == key)
        .map(|p| p.view.clone())
}

/// Resolves the best implementation of `op_type` for a session hint.
///
/// Selection, in order: a VirtIO-owned implementation when the hint carries
/// the REMOTE bit; an implementation whose owner matches the hint's backend
/// bits; the first non-VirtIO implementation (or any, if only one plugin is
/// loaded). Insertion order breaks ties.
pub(crate) fn get_op_func(op_type: OpType, op_hint: u32) -> Option<OpFn> {
    let guard = STATE.lock().expect("plugin registry lock poisoned");
    let state = guard.as_ref()?;
    let impls = &state.ops[op_type as usize];

    if impls.is_empty() {
        warn!("None of the loaded plugins implement {op_type}");
        return None;
    }

    let owner_of = |op: &OpImpl| state.plugins.iter().find(|p| p.key == op.owner);

    if op_hint & hint::REMOTE != 0 {
        for op in impls {
            if let Some(owner) = owner_of(op)
                && owner.view.is_virtio
            {
                debug!("Returning {op_type} implementation from plugin {}", owner.view.name);
                return Some(op.func);
            }
        }
        error!("Could not return func, no VirtIO plugin loaded yet");
        return None;
    }

    let priority = op_hint & !hint::REMOTE;
    if priority != 0 {
        for op in impls {
            if let Some(owner) = owner_of(op)
                && owner.view.type_mask & priority != 0
            {
                debug!("Returning {op_type} implementation from plugin {}", owner.view.name);
                return Some(op.func);
            }
        }
    }

    for op in impls {
        if let Some(owner) = owner_of(op)
            && (!owner.view.is_virtio || state.plugins.len() == 1)
        {
            debug!("Returning {op_type} implementation from plugin {}", owner.view.name);
            return Some(op.func);
        }
    }

    error!("Could not return func, no local plugin loaded yet");
    None
}

/// Logs every registered implementation of `op_type` at debug level.
pub fn print_all_by_op_type(op_type: OpType) {
    let guard = STATE.lock().expect("plugin registry lock poisoned");
    let Some(state) = guard.as_ref() else {
        return;
    };
    for op in &state.ops[op_type as usize] {
        if let Some(owner) = state.plugins.iter().find(|p| p.key == op.owner) {
            debug!(
                "Found implementation of {op_type} in {} plugin (type mask {:#x})",
                owner.view.name, owner.view.type_mask
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::ffi::c_int;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) static INIT_CALLS: AtomicU32 = AtomicU32::new(0);

    extern "C" fn test_init() -> c_int {
        INIT_CALLS.fetch_add(1, Ordering::SeqCst);
        0
    }

    extern "C" fn test_fini() -> c_int {
        0
    }

    static GOOD_INFO: PluginInfo = PluginInfo {
        name: c"test-cpu".as_ptr(),
        version: c"0.1.0".as_ptr(),
        vaccel_version: c"0.7.0".as_ptr(),
        init: Some(test_init),
        fini: Some(test_fini),
        is_virtio: false,
        type_mask: hint::CPU | hint::DEBUG,
        session_init: None,
        session_update: None,
        session_release: None,
        resource_register: None,
        resource_unregister: None,
    };

    static GOOD: PluginDescriptor = PluginDescriptor::new(&GOOD_INFO);

    static OLD_MAJOR_INFO: PluginInfo = PluginInfo {
        name: c"test-old".as_ptr(),
        version: c"0.1.0".as_ptr(),
        vaccel_version: c"1.4.2".as_ptr(),
        init: Some(test_init),
        fini: Some(test_fini),
        is_virtio: false,
        type_mask: hint::CPU,
        session_init: None,
        session_update: None,
        session_release: None,
        resource_register: None,
        resource_unregister: None,
    };

    static OLD_MAJOR: PluginDescriptor = PluginDescriptor::new(&OLD_MAJOR_INFO);

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("0.7.0").unwrap(), (0, 7, 0, String::new()));
        assert_eq!(
            parse_version("1.2.3-rc1").unwrap(),
            (1, 2, 3, "-rc1".to_owned())
        );
        assert_eq!(parse_version("v0.6.1").unwrap(), (0, 6, 1, String::new()));
        assert!(parse_version("0.7").is_err());
        assert!(parse_version("a.b.c").is_err());
    }

    #[test]
    #[serial_test::serial(runtime)]
    fn register_and_select() {
        bootstrap().unwrap();
        INIT_CALLS.store(0, Ordering::SeqCst);

        register(&GOOD).unwrap();
        assert_eq!(INIT_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(nr_plugins(), 1);

        // Double registration is rejected.
        assert!(matches!(register(&GOOD), Err(Error::Exists)));

        unregister(&GOOD).unwrap();
        assert_eq!(nr_plugins(), 0);
        cleanup().unwrap();
    }

    #[test]
    #[serial_test::serial(runtime)]
    fn major_version_mismatch_is_rejected() {
        bootstrap().unwrap();
        assert!(register(&OLD_MAJOR).is_err());
        assert_eq!(nr_plugins(), 0);
        cleanup().unwrap();
    }

    #[test]
    #[serial_test::serial(runtime)]
    fn register_without_bootstrap_fails() {
        let _ = cleanup();
        assert!(matches!(register(&GOOD), Err(Error::Backend)));
    }
}
