//! Runtime configuration, from explicit values or the environment.

use std::env;
use std::path::PathBuf;

use tracing::{debug, warn};

/// Environment variable naming the plugins to load (colon-separated).
pub const PLUGINS_ENV: &str = "VACCEL_PLUGINS";
/// Legacy name of [`PLUGINS_ENV`].
pub const PLUGINS_OLD_ENV: &str = "VACCEL_BACKENDS";
/// Environment variable selecting the log level.
pub const LOG_LEVEL_ENV: &str = "VACCEL_LOG_LEVEL";
/// Legacy name of [`LOG_LEVEL_ENV`].
pub const LOG_LEVEL_OLD_ENV: &str = "VACCEL_DEBUG_LEVEL";
/// Environment variable naming the log file.
pub const LOG_FILE_ENV: &str = "VACCEL_LOG_FILE";
/// Environment variable enabling profiling regions.
pub const PROFILING_ENABLED_ENV: &str = "VACCEL_PROFILING_ENABLED";
/// Environment variable skipping the plugin version check.
pub const VERSION_IGNORE_ENV: &str = "VACCEL_VERSION_IGNORE";
/// Legacy name of [`VERSION_IGNORE_ENV`].
pub const VERSION_IGNORE_OLD_ENV: &str = "VACCEL_IGNORE_VERSION";
/// Environment variable disabling implicit bootstrap when set to `0`.
pub const BOOTSTRAP_ENABLED_ENV: &str = "VACCEL_BOOTSTRAP_ENABLED";
/// Environment variable disabling implicit cleanup when set to `0`.
pub const CLEANUP_ENABLED_ENV: &str = "VACCEL_CLEANUP_ENABLED";

/// Severity threshold for runtime diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[non_exhaustive]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Errors and warnings.
    #[default]
    Warn,
    /// Errors, warnings, and informational messages.
    Info,
    /// Full debug output.
    Debug,
}

impl LogLevel {
    /// Parses a level name or the legacy numeric form (1..4).
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ERROR" | "1" => Some(Self::Error),
            "WARN" | "2" => Some(Self::Warn),
            "INFO" | "3" => Some(Self::Info),
            "DEBUG" | "4" => Some(Self::Debug),
            _ => None,
        }
    }

    /// Returns the matching `tracing` filter directive.
    pub(crate) fn as_filter(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        })
    }
}

/// User-configurable runtime options.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Config {
    /// Colon-separated list of plugin shared libraries to load at bootstrap.
    pub plugins: Option<String>,
    /// Diagnostics severity threshold.
    pub log_level: LogLevel,
    /// Log file path; `None` (or `/dev/stdout` / `/dev/stderr`) logs to the
    /// matching standard stream.
    pub log_file: Option<PathBuf>,
    /// Whether profiling regions collect samples.
    pub profiling_enabled: bool,
    /// Whether a plugin built against a different major runtime version may
    /// still be loaded.
    pub version_ignore: bool,
}

impl Config {
    /// Creates a config from explicit values.
    pub fn new(
        plugins: Option<String>,
        log_level: LogLevel,
        log_file: Option<PathBuf>,
        profiling_enabled: bool,
        version_ignore: bool,
    ) -> Self {
        Self {
            plugins,
            log_level,
            log_file,
            profiling_enabled,
            version_ignore,
        }
    }

    /// Builds a config from the `VACCEL_*` environment variables,
    /// honoring the legacy names with a deprecation warning.
    pub fn from_env() -> Self {
        let log_level = env_with_fallback(LOG_LEVEL_ENV, LOG_LEVEL_OLD_ENV)
            .and_then(|v| {
                let parsed = LogLevel::parse(&v);
                if parsed.is_none() {
                    warn!("Invalid {LOG_LEVEL_ENV} value '{v}', using default");
                }
                parsed
            })
            .unwrap_or_default();

        Self {
            plugins: env_with_fallback(PLUGINS_ENV, PLUGINS_OLD_ENV),
            log_level,
            log_file: env::var(LOG_FILE_ENV).ok().map(PathBuf::from),
            profiling_enabled: env_bool(PROFILING_ENABLED_ENV),
            version_ignore: env_with_fallback(VERSION_IGNORE_ENV, VERSION_IGNORE_OLD_ENV)
                .is_some_and(|v| is_true(&v)),
        }
    }

    /// Dumps the effective configuration at debug level.
    pub fn print_debug(&self) {
        debug!("Config:");
        debug!("  plugins: {}", self.plugins.as_deref().unwrap_or("(none)"));
        debug!("  log_level: {}", self.log_level);
        debug!(
            "  log_file: {}",
            self.log_file
                .as_deref()
                .map_or_else(|| "(none)".into(), |p| p.display().to_string())
        );
        debug!("  profiling_enabled: {}", self.profiling_enabled);
        debug!("  version_ignore: {}", self.version_ignore);
    }
}

/// Returns `true` for the accepted truthy spellings.
fn is_true(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
}

/// Reads a boolean environment variable.
fn env_bool(name: &str) -> bool {
    env::var(name).is_ok_and(|v| is_true(&v))
}

/// Reads `name`, falling back to the deprecated `old_name`.
fn env_with_fallback(name: &str, old_name: &str) -> Option<String> {
    if let Ok(v) = env::var(name) {
        return Some(v);
    }
    if let Ok(v) = env::var(old_name) {
        warn!("{old_name} is deprecated, please use {name} instead");
        return Some(v);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_parses_names_and_digits() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("1"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("3"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    #[serial_test::serial(runtime)]
    fn from_env_reads_new_and_legacy_names() {
        // SAFETY: test-only process environment mutation, serialized.
        unsafe {
            env::set_var(LOG_LEVEL_OLD_ENV, "4");
            env::set_var(PLUGINS_ENV, "/usr/lib/libvaccel-noop.so");
            env::set_var(PROFILING_ENABLED_ENV, "true");
            env::remove_var(LOG_LEVEL_ENV);
            env::remove_var(VERSION_IGNORE_ENV);
            env::remove_var(VERSION_IGNORE_OLD_ENV);
        }

        let config = Config::from_env();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.plugins.as_deref(), Some("/usr/lib/libvaccel-noop.so"));
        assert!(config.profiling_enabled);
        assert!(!config.version_ignore);

        unsafe {
            env::remove_var(LOG_LEVEL_OLD_ENV);
            env::remove_var(PLUGINS_ENV);
            env::remove_var(PROFILING_ENABLED_ENV);
        }
    }

    #[test]
    #[serial_test::serial(runtime)]
    fn new_name_wins_over_legacy() {
        unsafe {
            env::set_var(VERSION_IGNORE_ENV, "0");
            env::set_var(VERSION_IGNORE_OLD_ENV, "1");
        }

        let config = Config::from_env();
        assert!(!config.version_ignore);

        unsafe {
            env::remove_var(VERSION_IGNORE_ENV);
            env::remove_var(VERSION_IGNORE_OLD_ENV);
        }
    }
}
