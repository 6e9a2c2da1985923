//! Overhead-targeted sampling of discrete, application-driven events.
//!
//! Allocation events cannot be paused or delayed the way timer ticks can:
//! the sampler must decide per event, cheaply, whether to sample. Rather
//! than tossing a coin on every allocation, this sampler does systematic
//! sampling -- every k-th event -- where k is re-derived once per
//! adjustment window from moving averages of the observed event rate and
//! per-sample cost, so that sampling time stays within a target fraction
//! of wall time. Systematic selection can be biased for perfectly regular
//! allocation patterns, but the dynamic interval and the irregularity of
//! real workloads keep that in check, and the per-event cost is a single
//! counter bump.
//!
//! An adaptive `target_overhead_adjustment` in `[-target, 0]` compensates
//! for persistent overshoot caused by bursty event arrival.

use crate::error::{ProfilingError, Result};
use crate::time::SECONDS_AS_NS;

const BASE_OVERHEAD_PCT: f64 = 1.0;

/// Sampling parameters are re-derived at most once per this window.
const ADJUSTMENT_WINDOW_NS: i64 = SECONDS_AS_NS;

const EMA_SMOOTHING_FACTOR: f64 = 0.6;

fn exp_moving_average(last: f64, average: f64) -> f64 {
    (1.0 - EMA_SMOOTHING_FACTOR) * average + EMA_SMOOTHING_FACTOR * last
}

/// Event-driven sampler with systematic skipping.
///
/// All entry points take an explicit `now_ns` so behavior is fully
/// deterministic under test; production callers pass the monotonic clock.
#[derive(Debug)]
pub struct DiscreteDynamicSampler {
    /// Identifies this sampler in debug logs.
    id: &'static str,
    /// Fraction of wall time we are willing to spend sampling, in percent.
    target_overhead: f64,

    /// Moving average of events per nanosecond over the recent past.
    events_per_ns: f64,
    /// Moving average of the cost of sampling one event.
    sampling_time_ns: i64,
    /// Probability equivalent of the current interval.
    sampling_probability: f64,
    /// Sample every `sampling_interval`-th event. An inverted view of the
    /// probability; 0 only before the first readjustment.
    sampling_interval: usize,

    /// Events seen since the last sampled one (inclusive of the current
    /// event while inside `should_sample`).
    events_since_last_sample: usize,
    /// When the last true-returning `should_sample` happened; lets
    /// `after_sample` compute the sample's cost.
    sample_start_time_ns: i64,

    last_readjust_time_ns: i64,
    events_since_last_readjustment: usize,
    samples_since_last_readjustment: usize,
    sampling_time_since_last_readjustment_ns: i64,
    /// Negative padding added to `target_overhead` to correct observed
    /// overshoot.
    target_overhead_adjustment: f64,
}

impl DiscreteDynamicSampler {
    /// A sampler with the base 1% overhead target.
    pub fn new(id: &'static str) -> Self {
        let mut sampler = Self {
            id,
            target_overhead: BASE_OVERHEAD_PCT,
            events_per_ns: 0.0,
            sampling_time_ns: 0,
            sampling_probability: 0.0,
            sampling_interval: 0,
            events_since_last_sample: 0,
            sample_start_time_ns: 0,
            last_readjust_time_ns: 0,
            events_since_last_readjustment: 0,
            samples_since_last_readjustment: 0,
            sampling_time_since_last_readjustment_ns: 0,
            target_overhead_adjustment: 0.0,
        };
        sampler
            .reset(BASE_OVERHEAD_PCT)
            .expect("base overhead target is valid");
        sampler
    }

    /// Clear all state and set a new overhead target (percent, in
    /// `]0, 100]`).
    pub fn reset(&mut self, target_overhead: f64) -> Result<()> {
        if !(target_overhead > 0.0 && target_overhead <= 100.0) {
            return Err(ProfilingError::invalid_config(format!(
                "target overhead must be in ]0, 100], was {target_overhead}"
            )));
        }
        *self = Self {
            id: self.id,
            target_overhead,
            events_per_ns: 0.0,
            sampling_time_ns: 0,
            sampling_probability: 0.0,
            sampling_interval: 0,
            events_since_last_sample: 0,
            sample_start_time_ns: 0,
            last_readjust_time_ns: 0,
            events_since_last_readjustment: 0,
            samples_since_last_readjustment: 0,
            sampling_time_since_last_readjustment_ns: 0,
            target_overhead_adjustment: 0.0,
        };
        Ok(())
    }

    /// Decide whether the event happening now should be sampled.
    pub fn should_sample(&mut self, now_ns: i64) -> bool {
        self.events_since_last_sample += 1;
        self.events_since_last_readjustment += 1;
        let should_sample = self.events_since_last_sample >= self.sampling_interval;

        self.maybe_readjust(now_ns);

        if should_sample {
            self.sample_start_time_ns = now_ns;
        }

        should_sample
    }

    /// Report that the sample decided by the last true-returning
    /// [`Self::should_sample`] finished now. Returns the sample's cost.
    pub fn after_sample(&mut self, now_ns: i64) -> i64 {
        let last_sampling_time_ns = if self.sample_start_time_ns == 0 {
            0
        } else {
            (now_ns - self.sample_start_time_ns).max(0)
        };
        self.samples_since_last_readjustment += 1;
        self.sampling_time_since_last_readjustment_ns += last_sampling_time_ns;
        self.events_since_last_sample = 0;

        self.maybe_readjust(now_ns);

        last_sampling_time_ns
    }

    /// Events represented by the sample being taken right now: the current
    /// event plus every event skipped since the previous sample. Read
    /// between `should_sample() == true` and `after_sample()`.
    pub fn events_since_last_sample(&self) -> usize {
        self.events_since_last_sample
    }

    /// Observed event rate, in events per second.
    pub fn event_rate(&self) -> f64 {
        self.events_per_ns * 1e9
    }

    /// Current sampling probability, in percent.
    pub fn probability(&self) -> f64 {
        self.sampling_probability * 100.0
    }

    /// Moving average cost of sampling one event, in nanoseconds.
    pub fn sampling_time_ns(&self) -> i64 {
        self.sampling_time_ns
    }

    /// Current overshoot correction, in percent (always `<= 0`).
    pub fn target_overhead_adjustment(&self) -> f64 {
        self.target_overhead_adjustment * 100.0
    }

    fn maybe_readjust(&mut self, now: i64) {
        let window_time_ns = if self.last_readjust_time_ns == 0 {
            ADJUSTMENT_WINDOW_NS
        } else {
            now - self.last_readjust_time_ns
        };

        if window_time_ns < ADJUSTMENT_WINDOW_NS {
            return;
        }

        // Refresh the moving averages with this window's observations.
        self.events_per_ns = exp_moving_average(
            self.events_since_last_readjustment as f64 / window_time_ns as f64,
            self.events_per_ns,
        );

        let sampling_window_time_ns = self.sampling_time_since_last_readjustment_ns;
        if self.samples_since_last_readjustment > 0 {
            let avg_sampling_time_in_window_ns =
                sampling_window_time_ns / self.samples_since_last_readjustment as i64;
            self.sampling_time_ns = exp_moving_average(
                avg_sampling_time_in_window_ns as f64,
                self.sampling_time_ns as f64,
            ) as i64;
        }

        // Did we overshoot the target in practice? Bursty event patterns
        // can make us consistently exceed the plan; fold the observed
        // overshoot back into the target as negative padding.
        let reference_target_sampling_time_ns =
            (window_time_ns as f64 * (self.target_overhead / 100.0)) as i64;
        let sampling_overshoot_time_ns =
            self.sampling_time_since_last_readjustment_ns - reference_target_sampling_time_ns;
        let last_target_overhead_adjustment = (-sampling_overshoot_time_ns as f64 * 100.0
            / window_time_ns as f64)
            .min(0.0)
            .max(-self.target_overhead);
        self.target_overhead_adjustment = exp_moving_average(
            last_target_overhead_adjustment,
            self.target_overhead_adjustment,
        );

        let target_overhead = self.target_overhead + self.target_overhead_adjustment;
        let target_sampling_time_ns = (window_time_ns as f64 * (target_overhead / 100.0)) as i64;

        // sampling_probability = max_allowed_time_for_sampling
        //                      / time_to_sample_all_events
        // where time_to_sample_all_events assumes every event in the
        // working part of the window would be sampled at the average cost.
        let working_window_time_ns = window_time_ns - sampling_window_time_ns;
        let max_allowed_time_for_sampling_ns = target_sampling_time_ns;
        let time_to_sample_all_events_ns = (self.events_per_ns
            * working_window_time_ns as f64
            * self.sampling_time_ns as f64) as i64;
        self.sampling_probability = if time_to_sample_all_events_ns == 0 {
            1.0
        } else {
            (max_allowed_time_for_sampling_ns as f64 / time_to_sample_all_events_ns as f64).min(1.0)
        };

        // The sampling interval must be an integer; ceiling loses a bit of
        // precision for probabilities above 50% but always errs on the
        // side of sampling less.
        self.sampling_interval = (1.0 / self.sampling_probability).ceil() as usize;

        tracing::trace!(
            id = self.id,
            window_time_ns,
            events_per_sec = self.events_per_ns * 1e9,
            sampling_time_ns = self.sampling_time_ns,
            sampling_interval = self.sampling_interval,
            sampling_probability = self.sampling_probability,
            target_overhead_adjustment = self.target_overhead_adjustment,
            "readjusted discrete sampler"
        );

        self.events_since_last_readjustment = 0;
        self.samples_since_last_readjustment = 0;
        self.sampling_time_since_last_readjustment_ns = 0;
        self.last_readjust_time_ns = now;
    }
}
