//! Paces periodic sampling so profiling overhead stays under a target.
//!
//! Instead of sampling on a fixed period, the sampler observes how long
//! each sample took and computes the earliest wall time at which the next
//! sample may run, such that the steady-state fraction of wall time spent
//! sampling does not exceed the configured overhead target. The worker
//! asks [`DynamicSamplingRate::should_sample`] before each tick and uses
//! [`DynamicSamplingRate::get_sleep`] to pick a safe, interruptible sleep.
//!
//! With a 2% target and samples costing 1ms, the delay between samples
//! works out to `100 * 1ms / 2 - 1ms = 49ms`.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::config::DEFAULT_OVERHEAD_TARGET_PERCENTAGE;
use crate::time::{MILLIS_AS_NS, SECONDS_AS_NS};

/// The sampler may be trying to stop, so sleeps are capped regardless of
/// how far away the next sample is.
pub const MAX_SLEEP_TIME_NS: i64 = 100 * MILLIS_AS_NS;

/// An unexpectedly slow sample (suspended laptop, paused VM) must not
/// push the next sample arbitrarily far out.
pub const MAX_TIME_UNTIL_NEXT_SAMPLE_NS: i64 = 10 * SECONDS_AS_NS;

const EMA_SMOOTHING_FACTOR: f64 = 0.2;

#[derive(Debug)]
struct PacingState {
    /// Moving average of the time between consecutive should_sample calls.
    tick_time_ns: f64,
    last_check_time_ns: i64,
}

/// Overhead-targeted pacing for the continuous (timer-driven) sampler.
#[derive(Debug)]
pub struct DynamicSamplingRate {
    /// Read by the worker thread while the sampling thread updates it.
    next_sample_after_monotonic_wall_time_ns: AtomicI64,
    overhead_target_percentage: f64,
    pacing: Mutex<PacingState>,
}

impl DynamicSamplingRate {
    /// A controller targeting `overhead_target_percentage` percent of wall
    /// time spent sampling.
    pub fn new(overhead_target_percentage: f64) -> Self {
        Self {
            next_sample_after_monotonic_wall_time_ns: AtomicI64::new(0),
            overhead_target_percentage,
            pacing: Mutex::new(PacingState {
                tick_time_ns: 0.0,
                last_check_time_ns: 0,
            }),
        }
    }

    /// Clear all pacing state (used after fork).
    pub fn reset(&self) {
        self.next_sample_after_monotonic_wall_time_ns
            .store(0, Ordering::SeqCst);
        let mut pacing = self.pacing.lock();
        pacing.tick_time_ns = 0.0;
        pacing.last_check_time_ns = 0;
    }

    /// How long the worker may sleep before it should look again, capped
    /// at [`MAX_SLEEP_TIME_NS`]. Worst case the worker wakes up early and
    /// [`Self::should_sample`] still says no, preserving the intended
    /// pacing.
    pub fn get_sleep(&self, current_monotonic_wall_time_ns: i64) -> i64 {
        let next_sample_after_ns = self
            .next_sample_after_monotonic_wall_time_ns
            .load(Ordering::SeqCst);
        let delta_ns = next_sample_after_ns - current_monotonic_wall_time_ns;

        if delta_ns > 0 && next_sample_after_ns > 0 {
            delta_ns.min(MAX_SLEEP_TIME_NS)
        } else {
            0
        }
    }

    /// Whether enough time has passed for the next sample. Also feeds the
    /// tick-time moving average.
    pub fn should_sample(&self, wall_time_ns_before_sample: i64) -> bool {
        let mut pacing = self.pacing.lock();
        let latest_tick_time_ns = (wall_time_ns_before_sample - pacing.last_check_time_ns).max(0);
        pacing.tick_time_ns = EMA_SMOOTHING_FACTOR * latest_tick_time_ns as f64
            + (1.0 - EMA_SMOOTHING_FACTOR) * pacing.tick_time_ns;
        pacing.last_check_time_ns = wall_time_ns_before_sample;
        drop(pacing);

        wall_time_ns_before_sample
            >= self
                .next_sample_after_monotonic_wall_time_ns
                .load(Ordering::SeqCst)
    }

    /// Feed back the cost of a completed sample and schedule the earliest
    /// allowed time for the next one.
    ///
    /// Solving `sampling_time / (sampling_time + sleeping_time)` for the
    /// overhead target gives
    /// `sleeping_time = 100 * sampling_time / target - sampling_time`.
    pub fn after_sample(&self, wall_time_ns_after_sample: i64, sampling_time_ns: i64) {
        let overhead_target = self.overhead_target_percentage;

        let time_to_sleep_ns =
            (100.0 * sampling_time_ns as f64 / overhead_target - sampling_time_ns as f64).max(0.0);
        let time_to_sleep_ns = (time_to_sleep_ns as i64).min(MAX_TIME_UNTIL_NEXT_SAMPLE_NS);

        self.next_sample_after_monotonic_wall_time_ns
            .store(wall_time_ns_after_sample + time_to_sleep_ns, Ordering::SeqCst);
    }

    /// The configured overhead target, in percent.
    pub fn overhead_target_percentage(&self) -> f64 {
        self.overhead_target_percentage
    }
}

impl Default for DynamicSamplingRate {
    fn default() -> Self {
        Self::new(DEFAULT_OVERHEAD_TARGET_PERCENTAGE)
    }
}
