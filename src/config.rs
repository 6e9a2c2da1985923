//! Profiler configuration.
//!
//! All option validation happens here, at initialization time. Once a
//! [`Settings`] value has passed [`Settings::validate`], the sampling and
//! recording paths never reject configuration.

use serde::Serialize;

use crate::error::{ProfilingError, Result};

/// Smallest accepted stack depth per sample.
pub const MIN_MAX_FRAMES: u16 = 5;

/// Largest accepted stack depth per sample.
pub const MAX_MAX_FRAMES: u16 = 10_000;

/// Wall-time overhead target applied when none is configured, in percent.
pub const DEFAULT_OVERHEAD_TARGET_PERCENTAGE: f64 = 2.0;

/// Options accepted by the profiling core.
///
/// The user-facing configuration surface (env vars, programmatic setup) is
/// the embedder's concern; this struct is the already-resolved form.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Record per-thread cpu-time deltas.
    pub cpu_time_enabled: bool,
    /// Record weighted allocation samples.
    pub alloc_samples_enabled: bool,
    /// Track allocations for heap-liveness samples.
    pub heap_samples_enabled: bool,
    /// Also record the byte size of live tracked objects.
    pub heap_size_enabled: bool,
    /// Keep one out of every N allocation samples for heap tracking.
    pub heap_sample_every: u32,
    /// Attach epoch timestamps to samples for timeline rendering.
    pub timeline_enabled: bool,
    /// Resolve endpoint names from the tracer for root spans.
    pub endpoint_collection_enabled: bool,
    /// Attach allocation class names to allocation samples.
    pub allocation_type_enabled: bool,
    /// Per-sample stack depth limit. Frames beyond this are replaced by an
    /// `N frames omitted` placeholder.
    pub max_frames: u16,
    /// Thread-local key under which the tracer stores its active context,
    /// when a tracer is installed.
    pub tracer_context_key: Option<String>,
    /// Wall-time fraction the samplers are allowed to consume, in percent.
    pub overhead_target_percentage: f64,
    /// Deadline handed to the exporter, carried here so the whole
    /// configuration validates in one place.
    pub upload_timeout_seconds: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cpu_time_enabled: true,
            alloc_samples_enabled: true,
            heap_samples_enabled: true,
            heap_size_enabled: true,
            heap_sample_every: 1,
            timeline_enabled: true,
            endpoint_collection_enabled: true,
            allocation_type_enabled: true,
            max_frames: 400,
            tracer_context_key: None,
            overhead_target_percentage: DEFAULT_OVERHEAD_TARGET_PERCENTAGE,
            upload_timeout_seconds: 30,
        }
    }
}

impl Settings {
    /// Check every option, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        check_max_frames(self.max_frames)?;

        if self.heap_sample_every == 0 {
            return Err(ProfilingError::invalid_config(
                "heap_sample_every: value must be >= 1",
            ));
        }

        if !(self.overhead_target_percentage > 0.0 && self.overhead_target_percentage <= 100.0) {
            return Err(ProfilingError::invalid_config(format!(
                "overhead_target_percentage: value must be in ]0, 100], was {}",
                self.overhead_target_percentage
            )));
        }

        if self.upload_timeout_seconds == 0 {
            return Err(ProfilingError::invalid_config(
                "upload_timeout_seconds: value must be > 0",
            ));
        }

        if self.heap_size_enabled && !self.heap_samples_enabled {
            return Err(ProfilingError::invalid_config(
                "heap_size_enabled requires heap_samples_enabled",
            ));
        }

        Ok(())
    }

    /// True when any heap-related value type is enabled, i.e. when a heap
    /// tracker needs to exist.
    pub fn heap_tracking_enabled(&self) -> bool {
        self.heap_samples_enabled || self.heap_size_enabled
    }
}

/// Validate a requested `max_frames` value on its own.
///
/// Shared by [`Settings::validate`] and by sampling-buffer construction so
/// that a buffer can never be built with an out-of-range depth.
pub fn check_max_frames(max_frames: u16) -> Result<u16> {
    if max_frames < MIN_MAX_FRAMES {
        return Err(ProfilingError::invalid_config(format!(
            "max_frames: value must be >= {MIN_MAX_FRAMES}"
        )));
    }
    if max_frames > MAX_MAX_FRAMES {
        return Err(ProfilingError::invalid_config(format!(
            "max_frames: value must be <= {MAX_MAX_FRAMES}"
        )));
    }
    Ok(max_frames)
}
