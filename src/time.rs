//! Clock access and time conversion helpers.
//!
//! All timestamps in the profiling core are signed nanosecond counts.
//! Monotonic clocks drive sampling cadence and wall-time deltas; the
//! realtime clock only appears in profile start/finish timestamps and in
//! the monotonic-to-epoch conversion used for timeline events.

use serde::Serialize;

/// Sentinel for "no timestamp recorded yet" / "not inside a window".
///
/// Matches the convention used by per-thread sampling state: cpu and wall
/// timestamps start out invalid and become valid on first use.
pub const INVALID_TIME: i64 = -1;

/// Nanoseconds in one second.
pub const SECONDS_AS_NS: i64 = 1_000_000_000;

/// Nanoseconds in one millisecond.
pub const MILLIS_AS_NS: i64 = 1_000_000;

fn retrieve_clock_as_ns(clock_id: libc::clockid_t) -> i64 {
    let mut clock_value = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    // Safety: clock_gettime only writes to the timespec we hand it.
    let result = unsafe { libc::clock_gettime(clock_id, &mut clock_value) };
    if result != 0 {
        // Callers treat 0 as "reading failed"; none of the supported clocks
        // can legitimately return 0 ns since boot/epoch.
        return 0;
    }

    clock_value.tv_nsec as i64 + clock_value.tv_sec as i64 * SECONDS_AS_NS
}

/// Current monotonic clock reading, in nanoseconds. Returns 0 on failure.
pub fn monotonic_now_ns() -> i64 {
    retrieve_clock_as_ns(libc::CLOCK_MONOTONIC)
}

/// Current coarse monotonic clock reading, in nanoseconds.
///
/// Cheaper than [`monotonic_now_ns`] but with tick-level granularity; used
/// where a fast approximate reading is enough.
pub fn monotonic_coarse_now_ns() -> i64 {
    #[cfg(target_os = "linux")]
    {
        retrieve_clock_as_ns(libc::CLOCK_MONOTONIC_COARSE)
    }
    #[cfg(not(target_os = "linux"))]
    {
        retrieve_clock_as_ns(libc::CLOCK_MONOTONIC)
    }
}

/// Current realtime (system epoch) clock reading, in nanoseconds.
pub fn system_epoch_now_ns() -> i64 {
    retrieve_clock_as_ns(libc::CLOCK_REALTIME)
}

/// Reads a per-thread cpu-time clock, in nanoseconds. Returns `None` when
/// the clock cannot be read (e.g. the thread exited).
pub fn thread_cpu_clock_now_ns(clock_id: libc::clockid_t) -> Option<i64> {
    let mut clock_value = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: as above, clock_gettime only writes to the out-param.
    let result = unsafe { libc::clock_gettime(clock_id, &mut clock_value) };
    if result != 0 {
        return None;
    }
    Some(clock_value.tv_nsec as i64 + clock_value.tv_sec as i64 * SECONDS_AS_NS)
}

/// Stateful converter from monotonic timestamps to system-epoch timestamps.
///
/// On first use it anchors the monotonic clock against the realtime clock
/// and afterwards converts by applying the cached delta. The anchor is
/// re-established when the coarse realtime reading drifts away from what
/// the cached delta predicts, so that system clock adjustments do not
/// permanently skew timeline timestamps.
///
/// State must be reset after fork; the child process re-anchors on first
/// use.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MonotonicToSystemEpoch {
    system_epoch_ns_reference: i64,
    delta_to_epoch_ns: i64,
}

impl MonotonicToSystemEpoch {
    /// A converter with no anchor; the first conversion establishes one.
    pub const fn new() -> Self {
        Self {
            system_epoch_ns_reference: INVALID_TIME,
            delta_to_epoch_ns: INVALID_TIME,
        }
    }

    /// Drop the anchor, forcing the next conversion to re-establish it.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Convert a monotonic timestamp into a system-epoch timestamp.
    ///
    /// Returns 0 when the clocks cannot be read.
    pub fn convert(&mut self, monotonic_wall_time_ns: i64) -> i64 {
        let current_epoch_ns = monotonic_coarse_epoch_hint();

        if self.system_epoch_ns_reference == INVALID_TIME
            || reference_looks_stale(self.system_epoch_ns_reference, current_epoch_ns)
        {
            let epoch_now = system_epoch_now_ns();
            let monotonic_now = monotonic_now_ns();
            if epoch_now == 0 || monotonic_now == 0 {
                return 0;
            }
            self.system_epoch_ns_reference = epoch_now;
            self.delta_to_epoch_ns = epoch_now - monotonic_now;
        }

        monotonic_wall_time_ns + self.delta_to_epoch_ns
    }
}

impl Default for MonotonicToSystemEpoch {
    fn default() -> Self {
        Self::new()
    }
}

fn monotonic_coarse_epoch_hint() -> i64 {
    #[cfg(target_os = "linux")]
    {
        retrieve_clock_as_ns(libc::CLOCK_REALTIME_COARSE)
    }
    #[cfg(not(target_os = "linux"))]
    {
        system_epoch_now_ns()
    }
}

// The reference is considered stale when the system clock has moved more
// than one coarse tick's worth backwards, or jumped more than a minute
// forward, relative to the anchor.
fn reference_looks_stale(reference_ns: i64, current_epoch_ns: i64) -> bool {
    if current_epoch_ns == 0 {
        return false;
    }
    current_epoch_ns < reference_ns - MILLIS_AS_NS * 10
        || current_epoch_ns > reference_ns + 60 * SECONDS_AS_NS
}
