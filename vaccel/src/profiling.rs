//! Lightweight accumulating profiling regions.
//!
//! Dispatch wraps every operation in a named region. Regions are inert
//! unless profiling was enabled at bootstrap (`VACCEL_PROFILING_ENABLED`).

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

/// Process-wide profiling switch, set at bootstrap.
static ENABLED: AtomicBool = AtomicBool::new(false);

/// Enables or disables profiling for the whole process.
pub(crate) fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Release);
}

/// Returns `true` if profiling regions are collecting samples.
pub fn enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

/// Accumulated samples of one region.
#[derive(Debug, Default, Clone, Copy)]
struct Stats {
    total: Duration,
    count: u64,
}

/// A named profiling region accumulating total time and sample count.
#[derive(Debug)]
pub struct ProfRegion {
    name: &'static str,
    stats: Mutex<Stats>,
}

impl ProfRegion {
    /// Creates a region; usable in statics.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            stats: Mutex::new(Stats {
                total: Duration::ZERO,
                count: 0,
            }),
        }
    }

    /// Starts a sample; the elapsed time is recorded when the returned
    /// guard drops. Returns an inert guard when profiling is disabled.
    pub fn enter(&self) -> ProfSample<'_> {
        ProfSample {
            region: self,
            start: enabled().then(Instant::now),
        }
    }

    /// Logs the accumulated totals at debug level.
    pub fn print(&self) {
        let stats = *self.stats.lock().expect("profiling stats lock poisoned");
        if stats.count > 0 {
            debug!(
                "[prof] {}: total_time: {} nsec nr_entries: {}",
                self.name,
                stats.total.as_nanos(),
                stats.count
            );
        }
    }

    fn record(&self, elapsed: Duration) {
        let mut stats = self.stats.lock().expect("profiling stats lock poisoned");
        stats.total += elapsed;
        stats.count += 1;
    }
}

/// RAII sample of a [`ProfRegion`].
#[derive(Debug)]
pub struct ProfSample<'a> {
    region: &'a ProfRegion,
    start: Option<Instant>,
}

impl Drop for ProfSample<'_> {
    fn drop(&mut self) {
        if let Some(start) = self.start {
            self.region.record(start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial(runtime)]
    fn disabled_region_records_nothing() {
        set_enabled(false);
        let region = ProfRegion::new("test_off");
        drop(region.enter());
        assert_eq!(region.stats.lock().unwrap().count, 0);
    }

    #[test]
    #[serial_test::serial(runtime)]
    fn enabled_region_accumulates() {
        set_enabled(true);
        let region = ProfRegion::new("test_on");
        drop(region.enter());
        drop(region.enter());
        let stats = *region.stats.lock().unwrap();
        assert_eq!(stats.count, 2);
        set_enabled(false);
    }
}
