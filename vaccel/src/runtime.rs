//! Ordered runtime bootstrap and teardown.
//!
//! Bootstrap initializes logging, creates the per-process run directory,
//! brings up the sessions/resources/plugins subsystems, and loads the
//! plugins named by the configuration. Teardown reverses the order; the
//! logging subscriber stays installed (global dispatch cannot be
//! re-initialized).

#![allow(unsafe_code)]

use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::{self, Config};
use crate::plugin::VACCEL_VERSION;
use crate::{Error, Result, fs, plugin, profiling, resource, session};

/// Live runtime state.
#[derive(Debug)]
struct RuntimeState {
    config: Config,
    rundir: PathBuf,
}

static STATE: Mutex<Option<RuntimeState>> = Mutex::new(None);
static LOG_INIT: Once = Once::new();

/// Installs the global tracing subscriber, once per process.
fn log_init(config: &Config) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::new(format!("vaccel={}", config.log_level.as_filter()));

        let writer = match config.log_file.as_deref() {
            None => BoxMakeWriter::new(std::io::stdout),
            Some(p) if p == std::path::Path::new("/dev/stdout") => {
                BoxMakeWriter::new(std::io::stdout)
            }
            Some(p) if p == std::path::Path::new("/dev/stderr") => {
                BoxMakeWriter::new(std::io::stderr)
            }
            Some(path) => match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(file) => BoxMakeWriter::new(std::sync::Arc::new(file)),
                Err(e) => {
                    eprintln!("Error: could not open log file {}: {e}", path.display());
                    BoxMakeWriter::new(std::io::stdout)
                }
            },
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(false)
            .try_init();
    });
}

/// Picks the base directory for the runtime root rundir.
///
/// The user runtime dir (`/run/user/<uid>`) when available, else a
/// user-scoped directory under the system temp dir.
fn runtime_base() -> PathBuf {
    if let Some(dir) = dirs::runtime_dir() {
        return dir;
    }
    // SAFETY: getuid has no preconditions.
    let uid = unsafe { libc::getuid() };
    let run_user = PathBuf::from(format!("/run/user/{uid}"));
    if fs::path_is_dir(&run_user) {
        return run_user;
    }
    std::env::temp_dir().join(format!("user-{uid}"))
}

/// Creates the unique per-process root rundir
/// (`<base>/vaccel/<6-char-random>`).
fn create_rundir() -> Result<PathBuf> {
    let parent = runtime_base().join("vaccel");
    let rundir = fs::dir_create_random(&parent)?;
    debug!("Created top-level rundir: {}", rundir.display());
    Ok(rundir)
}

fn do_bootstrap(config: Config) -> Result<()> {
    {
        let state = STATE.lock().expect("runtime state lock poisoned");
        if state.is_some() {
            drop(state);
            debug!("Reloading vAccel");
            do_cleanup()?;
        } else {
            drop(state);
            log_init(&config);
        }
    }

    debug!("Initializing vAccel");
    info!("vAccel {VACCEL_VERSION}");
    config.print_debug();

    profiling::set_enabled(config.profiling_enabled);

    let rundir = create_rundir()?;
    session::bootstrap()?;
    resource::bootstrap()?;
    plugin::bootstrap()?;

    let plugins = config.plugins.clone();
    {
        let mut state = STATE.lock().expect("runtime state lock poisoned");
        *state = Some(RuntimeState { config, rundir });
    }

    if let Some(libs) = plugins {
        plugin::parse_and_load(&libs)?;
    }
    Ok(())
}

fn do_cleanup() -> Result<()> {
    debug!("Cleaning up vAccel");

    session::cleanup()?;
    resource::cleanup()?;
    plugin::cleanup()?;

    let mut state = STATE.lock().expect("runtime state lock poisoned");
    if let Some(state) = state.take() {
        // Best effort; warn and continue on failure.
        if let Err(e) = fs::dir_remove_all(&state.rundir) {
            warn!("Could not remove rundir {}: {e}", state.rundir.display());
        }
    }
    Ok(())
}

/// Initializes the runtime from the `VACCEL_*` environment.
///
/// Bootstrapping an already-initialized runtime tears it down and brings it
/// back up with a freshly read configuration.
pub fn bootstrap() -> Result<()> {
    do_bootstrap(Config::from_env())
}

/// Initializes the runtime from an explicit configuration.
pub fn bootstrap_with_config(config: &Config) -> Result<()> {
    do_bootstrap(config.clone())
}

/// Tears the runtime down; a no-op when not initialized.
pub fn cleanup() -> Result<()> {
    if !is_initialized() {
        return Ok(());
    }
    do_cleanup()
}

/// Returns `true` if the runtime is initialized.
pub fn is_initialized() -> bool {
    STATE
        .lock()
        .expect("runtime state lock poisoned")
        .is_some()
}

/// Returns the per-process root rundir.
pub fn rundir() -> Result<PathBuf> {
    STATE
        .lock()
        .expect("runtime state lock poisoned")
        .as_ref()
        .map(|s| s.rundir.clone())
        .ok_or(Error::PermissionDenied)
}

/// Returns a snapshot of the active configuration.
pub fn active_config() -> Option<Config> {
    STATE
        .lock()
        .expect("runtime state lock poisoned")
        .as_ref()
        .map(|s| s.config.clone())
}

/// Returns whether plugin version mismatches are ignored.
pub(crate) fn version_ignore() -> bool {
    active_config().is_some_and(|c| c.version_ignore)
}

/// Bootstraps lazily on the first runtime entry point, unless disabled via
/// `VACCEL_BOOTSTRAP_ENABLED=0`.
pub(crate) fn ensure_bootstrapped() -> Result<()> {
    if is_initialized() {
        return Ok(());
    }
    if std::env::var(config::BOOTSTRAP_ENABLED_ENV).is_ok_and(|v| v == "0") {
        return Err(Error::PermissionDenied);
    }
    bootstrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial(runtime)]
    fn bootstrap_creates_and_cleanup_removes_rundir() {
        bootstrap().unwrap();
        assert!(is_initialized());

        let rundir = rundir().unwrap();
        assert!(rundir.is_dir());
        let name = rundir.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 6);
        assert!(name.chars().all(char::is_alphanumeric));
        assert_eq!(rundir.parent().unwrap().file_name().unwrap(), "vaccel");

        cleanup().unwrap();
        assert!(!is_initialized());
        assert!(!rundir.exists());
    }

    #[test]
    #[serial_test::serial(runtime)]
    fn rebootstrap_recreates_rundir() {
        bootstrap().unwrap();
        let first = rundir().unwrap();

        bootstrap().unwrap();
        let second = rundir().unwrap();
        assert_ne!(first, second);
        assert!(!first.exists());
        assert!(second.is_dir());

        cleanup().unwrap();
    }

    #[test]
    #[serial_test::serial(runtime)]
    fn cleanup_without_bootstrap_is_noop() {
        let _ = cleanup();
        assert!(cleanup().is_ok());
    }
}
