//! Continuous sampling profiler core for GIL-based managed runtimes.
//!
//! gilscope observes a running managed process in-band, on a timer, and
//! emits a compact pprof-compatible profile stream that attributes
//! cpu-time, wall-time, heap allocations, heap liveness and GC pauses to
//! call stacks. The embedding runtime supplies frame walking, thread
//! enumeration, clocks and hooks through the traits in [`runtime`]; the
//! crate supplies the sampling engine:
//!
//! - [`collectors::sampler_worker::SamplerWorker`]: background thread that
//!   delivers periodic signals to force on-GIL sampling, and fans GC and
//!   allocation events into the collector.
//! - [`collectors::thread_context::ThreadContextCollector`]: walks live
//!   threads on each tick, charges cpu/wall deltas, classifies waits,
//!   attaches trace-correlation labels.
//! - [`collectors::stack`]: turns a thread's frame chain into location
//!   records, with template-suffix trimming and truncation placeholders.
//! - [`recorder::StackRecorder`]: double-buffered profile sink with an
//!   integrated heap-liveness tracker, serialized to gzipped pprof.
//!
//! The exporter that ships the profile stream, the crash reporter, and
//! the user-facing configuration surface live outside this crate.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod collectors;
pub mod config;
pub mod error;
pub mod pprof;
pub mod recorder;
pub mod runtime;
pub mod signal;
pub mod time;

// Re-export the main types for easier use.
pub use collectors::sampler_worker::SamplerWorker;
pub use collectors::thread_context::ThreadContextCollector;
pub use config::Settings;
pub use error::{ProfilingError, Result};
pub use recorder::StackRecorder;

/// Initialize gilscope's diagnostics.
///
/// Sets up a `tracing` subscriber honoring `RUST_LOG`, so the profiler's
/// own debug output can be turned on without touching the host
/// application's logging. Call early, once; calling again is harmless.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_thread_names(true)
        .try_init();
}
