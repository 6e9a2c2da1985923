//! Per-thread sampling state and the main sampling routine.
//!
//! Triggered by external events -- the periodic sampling timer, GC
//! begin/end transitions and object allocations -- all delivered by the
//! sampler worker. On each tick this collector walks the live thread list,
//! charges per-thread cpu/wall-time deltas, composes identity and trace
//! correlation labels and hands each thread to the stack collector.
//!
//! ## Cpu and wall time spent in garbage collection
//!
//! A thread can be in a special "doing GC" state, entered at
//! [`ThreadContextCollector::on_gc_start`] by recording the thread's
//! current cpu/wall timestamps. While that state is set, regular samples
//! stop accounting cpu-time past the recorded timestamp: that time belongs
//! to GC and is blamed separately. Wall-time accounting is unaffected (60
//! seconds of wall time get recorded every 60 seconds, GC or not).
//!
//! [`ThreadContextCollector::on_gc_finish`] moves the elapsed cpu/wall
//! time into a collector-wide accumulator and advances the thread's
//! previous-sample cpu timestamp so nothing is double-charged. Because the
//! runtime breaks collections into very many small steps, finish events
//! are coalesced: the accumulator is only flushed -- as one synthetic
//! `Garbage Collection` placeholder sample, via
//! [`ThreadContextCollector::sample_after_gc`] -- every 10 ms or when a
//! major collection completes. `on_gc_start`/`on_gc_finish` run inside the
//! collector and must never allocate; `sample_after_gc` runs later, at a
//! safe point, where allocation is fine.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::collectors::stack::{self, state, SamplingBuffer};
use crate::config::Settings;
use crate::error::{ProfilingError, Result};
use crate::pprof::Label;
use crate::recorder::{SampleLabels, SampleValues, StackRecorder};
use crate::runtime::{
    CpuClockId, ObjectHandle, RuntimeHooks, ThreadHandle, TraceRef, ValueKind,
};
use crate::time::{MonotonicToSystemEpoch, INVALID_TIME, MILLIS_AS_NS};

/// Coalescing window for GC events: accumulated GC time is flushed at most
/// this often (or when a major collection completes).
const TIME_BETWEEN_GC_EVENTS_NS: i64 = 10 * MILLIS_AS_NS;

/// Regular samples between sweeps of dead-thread contexts.
const SAMPLES_BETWEEN_CONTEXT_CLEANUPS: u32 = 100;

/// A thread-creation monkey patch makes every invoke location point at
/// this file; such locations identify the patch, not the thread.
const LOGGING_GEM_PATH_SUFFIX: &str = "/lib/logging/diagnostic_context.rb";

const IS_WALL_TIME: bool = true;
const IS_NOT_WALL_TIME: bool = false;

/// Filename of the placeholder stack flushed by `sample_after_gc`.
pub const GARBAGE_COLLECTION_PLACEHOLDER: &str = "Garbage Collection";

/// Filename of the placeholder stack for dropped allocation samples.
pub const SKIPPED_SAMPLES_PLACEHOLDER: &str = "Skipped Samples";

#[derive(Debug)]
struct PerThreadContext {
    thread_id: Arc<str>,
    invoke_location: Arc<str>,
    cpu_clock: Option<CpuClockId>,
    /// INVALID_TIME until the first sample, or after a failed clock read.
    cpu_time_at_previous_sample_ns: i64,
    /// INVALID_TIME until the first sample.
    wall_time_at_previous_sample_ns: i64,
    /// Set by on_gc_start, cleared by on_gc_finish. INVALID_TIME outside
    /// that window.
    gc_cpu_time_at_start_ns: i64,
    gc_wall_time_at_start_ns: i64,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ThreadContextStats {
    /// Garbage-collection placeholder samples emitted.
    pub gc_samples: u32,
    /// GC start events dropped because the thread had no context yet
    /// (contexts cannot be allocated inside the GC hooks).
    pub gc_samples_missed_due_to_missing_context: u32,
}

/// Collector-wide GC accumulator state.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GcTracking {
    /// Cpu time accumulated since the last flushed GC event.
    pub accumulated_cpu_time_ns: u64,
    /// Wall time accumulated since the last flushed GC event.
    pub accumulated_wall_time_ns: u64,
    /// Wall timestamp of the latest finished GC step; INVALID_TIME when
    /// nothing is accumulated.
    pub wall_time_at_previous_gc_ns: i64,
    /// Wall timestamp of the last flushed GC event. Starts at 0.
    pub wall_time_at_last_flushed_gc_event_ns: i64,
}

impl Default for GcTracking {
    fn default() -> Self {
        Self {
            accumulated_cpu_time_ns: 0,
            accumulated_wall_time_ns: 0,
            wall_time_at_previous_gc_ns: INVALID_TIME,
            wall_time_at_last_flushed_gc_event_ns: 0,
        }
    }
}

/// Trace identifiers resolved for a thread, if its tracer context carries
/// an active trace.
#[derive(Debug, Clone)]
struct TraceIdentifiers {
    local_root_span_id: u64,
    span_id: u64,
    trace_endpoint: Option<Arc<str>>,
}

/// Owns the per-thread context map and drives stack collection.
pub struct ThreadContextCollector {
    hooks: RuntimeHooks,
    recorder: Arc<StackRecorder>,

    max_frames: u16,
    contexts: HashMap<ThreadHandle, PerThreadContext>,
    /// Frame/location scratch per thread, kept separate from the timing
    /// state so overhead samples can borrow another thread's buffer.
    buffers: HashMap<ThreadHandle, SamplingBuffer>,

    tracer_context_key_present: bool,
    endpoint_collection_enabled: bool,
    timeline_enabled: bool,
    allocation_type_enabled: bool,

    /// Regular samples taken; drives the periodic context sweep.
    sample_count: u32,
    thread_list_buffer: Vec<ThreadHandle>,
    time_converter: MonotonicToSystemEpoch,
    main_thread: ThreadHandle,

    stats: ThreadContextStats,
    gc_tracking: GcTracking,
}

impl ThreadContextCollector {
    /// Build a collector. Settings must already have passed validation.
    pub fn new(
        settings: &Settings,
        recorder: Arc<StackRecorder>,
        hooks: RuntimeHooks,
    ) -> Result<Self> {
        settings.validate()?;
        let main_thread = hooks.roster.main_thread();
        Ok(Self {
            hooks,
            recorder,
            max_frames: settings.max_frames,
            contexts: HashMap::new(),
            buffers: HashMap::new(),
            tracer_context_key_present: settings.tracer_context_key.is_some(),
            endpoint_collection_enabled: settings.endpoint_collection_enabled,
            timeline_enabled: settings.timeline_enabled,
            allocation_type_enabled: settings.allocation_type_enabled,
            sample_count: 0,
            thread_list_buffer: Vec::new(),
            time_converter: MonotonicToSystemEpoch::new(),
            main_thread,
            stats: ThreadContextStats::default(),
            gc_tracking: GcTracking::default(),
        })
    }

    /// Sample every live thread.
    ///
    /// Must be called with the GIL held, never from a signal handler, and
    /// never reentrantly. `profiler_overhead_stack_thread` supplies the
    /// stack for the trailing self-sample that makes profiler overhead
    /// visible without polluting user threads' frame caches.
    pub fn sample(
        &mut self,
        current_monotonic_wall_time_ns: i64,
        profiler_overhead_stack_thread: ThreadHandle,
    ) -> Result<()> {
        let current_thread = self.hooks.roster.current_thread();
        self.ensure_context(current_thread);
        // Cpu time for the current thread is captured on entry, so the
        // cost of the sampling pass itself lands on the overhead sample
        // below instead of whatever the thread runs next.
        let cpu_time_at_sample_start = self.cpu_time_now_ns(current_thread);

        let mut threads = std::mem::take(&mut self.thread_list_buffer);
        self.hooks.roster.live_threads(&mut threads);

        let mut result = Ok(());
        for &thread in &threads {
            self.ensure_context(thread);
            let current_cpu_time_ns = if thread == current_thread {
                cpu_time_at_sample_start
            } else {
                self.cpu_time_now_ns(thread)
            };

            result = self.update_metrics_and_sample(
                thread,
                thread,
                current_cpu_time_ns,
                current_monotonic_wall_time_ns,
            );
            if result.is_err() {
                break;
            }
        }
        self.thread_list_buffer = threads;
        result?;

        self.sample_count = self.sample_count.wrapping_add(1);
        if self.sample_count % SAMPLES_BETWEEN_CONTEXT_CLEANUPS == 0 {
            self.remove_context_for_dead_threads();
        }

        // Second sample of the caller thread: its own timing state, but a
        // stack borrowed from the overhead thread, plus a marker label.
        self.ensure_context(profiler_overhead_stack_thread);
        let cpu_now = self.cpu_time_now_ns(current_thread);
        let wall_now = self.hooks.clocks.monotonic_wall_time_ns();
        self.update_metrics_and_sample(current_thread, profiler_overhead_stack_thread, cpu_now, wall_now)
    }

    fn update_metrics_and_sample(
        &mut self,
        thread_being_sampled: ThreadHandle,
        stack_from_thread: ThreadHandle,
        current_cpu_time_ns: i64,
        current_monotonic_wall_time_ns: i64,
    ) -> Result<()> {
        let (cpu_time_elapsed_ns, wall_time_elapsed_ns) = {
            let context = self
                .contexts
                .get_mut(&thread_being_sampled)
                .expect("context exists for sampled thread");

            let cpu = update_time_since_previous_sample(
                &mut context.cpu_time_at_previous_sample_ns,
                current_cpu_time_ns,
                context.gc_cpu_time_at_start_ns,
                IS_NOT_WALL_TIME,
            )?;
            // Wall-time accounting is explicitly unaffected by GC, hence
            // the INVALID_TIME for the gc start argument.
            let wall = update_time_since_previous_sample(
                &mut context.wall_time_at_previous_sample_ns,
                current_monotonic_wall_time_ns,
                INVALID_TIME,
                IS_WALL_TIME,
            )?;
            (cpu, wall)
        };

        self.trigger_sample_for_thread(
            thread_being_sampled,
            stack_from_thread,
            SampleValues {
                cpu_time_ns: cpu_time_elapsed_ns,
                cpu_or_wall_samples: 1,
                wall_time_ns: wall_time_elapsed_ns,
                ..Default::default()
            },
            current_monotonic_wall_time_ns,
            None,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn trigger_sample_for_thread(
        &mut self,
        thread: ThreadHandle,
        stack_from_thread: ThreadHandle,
        values: SampleValues,
        current_monotonic_wall_time_ns: i64,
        vm_type: Option<&'static str>,
        class_name: Option<Arc<str>>,
    ) -> Result<()> {
        let mut labels = Vec::with_capacity(8);

        let (thread_id, invoke_location) = {
            let context = self
                .contexts
                .get(&thread)
                .expect("context exists for sampled thread");
            (Arc::clone(&context.thread_id), Arc::clone(&context.invoke_location))
        };

        labels.push(Label {
            key: Arc::from("thread id"),
            value: crate::pprof::LabelValue::Str(thread_id),
        });

        let thread_name = self.hooks.roster.thread_name(thread);
        let name_value: Arc<str> = match thread_name {
            Some(name) => name,
            // Threads are often unnamed; the main thread gets a nice
            // fallback, others get their invoke location (possibly empty).
            None if thread == self.main_thread => Arc::from("main"),
            None => invoke_location,
        };
        labels.push(Label {
            key: Arc::from("thread name"),
            value: crate::pprof::LabelValue::Str(name_value),
        });

        if let Some(identifiers) = self.trace_identifiers_for(thread) {
            labels.push(Label::num("local root span id", identifiers.local_root_span_id));
            labels.push(Label::num("span id", identifiers.span_id));

            if let Some(endpoint) = identifiers.trace_endpoint {
                // The endpoint is mutable in the tracer and can change
                // mid-trace, so it is not attached as a per-sample label;
                // the recorder keeps the latest value per root span id and
                // applies it to all matching samples at serialize time.
                self.recorder
                    .record_endpoint(identifiers.local_root_span_id, &endpoint)?;
            }
        }

        if thread != stack_from_thread {
            labels.push(Label::num("profiler overhead", 1));
        }

        if let Some(vm_type) = vm_type {
            labels.push(Label::str("ruby vm type", vm_type));
        }

        if let Some(class_name) = class_name {
            labels.push(Label {
                key: Arc::from("allocation class"),
                value: crate::pprof::LabelValue::Str(class_name),
            });
        }

        // The state label exists only on cpu/wall samples. It starts as
        // "unknown"; the stack collector may replace it with something
        // more interesting.
        let state_label = if values.cpu_or_wall_samples > 0 {
            labels.push(Label::str("state", state::UNKNOWN));
            Some(labels.len() - 1)
        } else {
            None
        };

        let end_timestamp_ns =
            if self.timeline_enabled && current_monotonic_wall_time_ns != INVALID_TIME {
                self.time_converter.convert(current_monotonic_wall_time_ns)
            } else {
                0
            };

        let mut sample_labels = SampleLabels {
            labels,
            state_label,
            end_timestamp_ns,
        };

        let recorder = Arc::clone(&self.recorder);
        let walker = Arc::clone(&self.hooks.walker);
        let buffer = self
            .buffers
            .get_mut(&stack_from_thread)
            .expect("buffer exists for stack thread");

        stack::sample_thread(
            stack_from_thread,
            buffer,
            &recorder,
            walker.as_ref(),
            &values,
            &mut sample_labels,
        )
    }

    /// Record that the current thread is about to run a GC step.
    ///
    /// Runs inside the collector: must not allocate, never fails. Threads
    /// never sampled before are skipped (and counted), because creating
    /// their context here would allocate.
    pub fn on_gc_start(&mut self) {
        let thread = self.hooks.roster.current_thread();
        let wall_now = self.hooks.clocks.monotonic_wall_time_ns();
        let Some(context) = self.contexts.get_mut(&thread) else {
            self.stats.gc_samples_missed_due_to_missing_context += 1;
            return;
        };

        // Wall is recorded first here and second in on_gc_finish, so a
        // measured wall duration can never come out below the cpu one.
        context.gc_wall_time_at_start_ns = wall_now;
        context.gc_cpu_time_at_start_ns = cpu_time_now(
            self.hooks.clocks.as_ref(),
            context,
        );
    }

    /// Record that the current thread finished a GC step.
    ///
    /// Runs inside the collector: must not allocate, never fails. Returns
    /// true when the accumulated GC time should be flushed with
    /// [`Self::sample_after_gc`] (from a safe point, not from here).
    pub fn on_gc_finish(&mut self) -> bool {
        let thread = self.hooks.roster.current_thread();
        let clocks = Arc::clone(&self.hooks.clocks);
        let Some(context) = self.contexts.get_mut(&thread) else {
            return false;
        };

        let cpu_time_at_start_ns = context.gc_cpu_time_at_start_ns;
        let wall_time_at_start_ns = context.gc_wall_time_at_start_ns;

        if cpu_time_at_start_ns == INVALID_TIME && wall_time_at_start_ns == INVALID_TIME {
            // on_gc_start never ran for this thread (or ran without a
            // context); nothing to attribute.
            return false;
        }

        context.gc_cpu_time_at_start_ns = INVALID_TIME;
        context.gc_wall_time_at_start_ns = INVALID_TIME;

        // Wall is read second here (and first in on_gc_start) so a
        // measured wall duration can never come out below the cpu one.
        let cpu_time_at_finish_ns = cpu_time_now(clocks.as_ref(), context);
        let wall_time_at_finish_ns = clocks.monotonic_wall_time_ns();
        if wall_time_at_finish_ns == 0 {
            return false;
        }

        // Clamped at zero: the system clock can move and cpu clocks can
        // glitch; negative GC durations are noise, not data.
        let gc_cpu_time_elapsed_ns = (cpu_time_at_finish_ns - cpu_time_at_start_ns).max(0);
        let gc_wall_time_elapsed_ns = (wall_time_at_finish_ns - wall_time_at_start_ns).max(0);

        if self.gc_tracking.wall_time_at_previous_gc_ns == INVALID_TIME {
            self.gc_tracking.accumulated_cpu_time_ns = 0;
            self.gc_tracking.accumulated_wall_time_ns = 0;
        }

        self.gc_tracking.accumulated_cpu_time_ns += gc_cpu_time_elapsed_ns as u64;
        self.gc_tracking.accumulated_wall_time_ns += gc_wall_time_elapsed_ns as u64;
        self.gc_tracking.wall_time_at_previous_gc_ns = wall_time_at_finish_ns;

        // The next regular sample must not re-charge the cpu time that was
        // just attributed to GC. Wall time is left alone on purpose.
        if context.cpu_time_at_previous_sample_ns != INVALID_TIME {
            context.cpu_time_at_previous_sample_ns += gc_cpu_time_elapsed_ns;
        }

        let over_flush_time_threshold = (wall_time_at_finish_ns
            - self.gc_tracking.wall_time_at_last_flushed_gc_event_ns)
            >= TIME_BETWEEN_GC_EVENTS_NS;

        over_flush_time_threshold || self.hooks.gc.has_major_gc_finished()
    }

    /// Flush accumulated GC cpu/wall time as one `Garbage Collection`
    /// placeholder sample.
    ///
    /// Runs at a safe point on the GIL-holding thread, after
    /// [`Self::on_gc_finish`] asked for a flush; allocation is allowed.
    pub fn sample_after_gc(&mut self) -> Result<()> {
        if self.gc_tracking.wall_time_at_previous_gc_ns == INVALID_TIME {
            return Err(ProfilingError::InvariantViolated(
                "sample_after_gc called without valid GC information".into(),
            ));
        }

        let labels: Vec<Label> = self
            .hooks
            .gc
            .metadata_labels()
            .into_iter()
            .map(|(key, value)| Label {
                key,
                value: crate::pprof::LabelValue::Str(value),
            })
            .collect();

        let end_timestamp_ns = if self.timeline_enabled {
            self.time_converter
                .convert(self.gc_tracking.wall_time_at_previous_gc_ns)
        } else {
            0
        };

        // The event carries both a regular cpu/wall duration (so it shows
        // up as a stack in the flamegraph) and a timeline duration.
        let values = SampleValues {
            cpu_time_ns: self.gc_tracking.accumulated_cpu_time_ns as i64,
            cpu_or_wall_samples: 1,
            wall_time_ns: self.gc_tracking.accumulated_wall_time_ns as i64,
            timeline_wall_time_ns: self.gc_tracking.accumulated_wall_time_ns as i64,
            ..Default::default()
        };

        let sample_labels = SampleLabels {
            labels,
            state_label: None,
            end_timestamp_ns,
        };

        stack::record_placeholder_stack(
            &self.recorder,
            &values,
            &sample_labels,
            GARBAGE_COLLECTION_PLACEHOLDER,
        )?;

        self.gc_tracking.wall_time_at_last_flushed_gc_event_ns =
            self.gc_tracking.wall_time_at_previous_gc_ns;
        self.gc_tracking.wall_time_at_previous_gc_ns = INVALID_TIME;
        self.stats.gc_samples += 1;

        Ok(())
    }

    /// Record a weighted allocation sample for a newly allocated object
    /// and register it with the heap tracker.
    pub fn sample_allocation(&mut self, sample_weight: u32, new_object: ObjectHandle) -> Result<()> {
        let current_thread = self.hooks.roster.current_thread();
        let kind = self.hooks.inspector.value_kind(new_object);

        let vm_type = kind.type_tag();

        let class_name: Option<Arc<str>> = if self.allocation_type_enabled {
            Some(self.derive_class_name(kind, new_object))
        } else {
            None
        };

        self.recorder
            .track_object(new_object, sample_weight, class_name.clone());

        self.ensure_context(current_thread);

        self.trigger_sample_for_thread(
            current_thread,
            current_thread,
            SampleValues {
                alloc_samples: sample_weight as i64,
                alloc_samples_unscaled: 1,
                heap_sample: true,
                ..Default::default()
            },
            // Allocation events carry no timeline timestamps.
            INVALID_TIME,
            Some(vm_type),
            class_name,
        )
    }

    /// Emit one placeholder sample accounting for `skipped_samples`
    /// allocation events the profiler observed but could not sample, so
    /// the drop stays visible in the profile.
    pub fn sample_skipped_allocation_samples(&mut self, skipped_samples: u32) -> Result<()> {
        let labels = vec![
            Label::str("thread id", "SS"),
            Label::str("thread name", "Skipped Samples"),
            Label::str("allocation class", "(Skipped Samples)"),
        ];

        stack::record_placeholder_stack(
            &self.recorder,
            &SampleValues {
                alloc_samples: skipped_samples as i64,
                ..Default::default()
            },
            &SampleLabels {
                labels,
                state_label: None,
                end_timestamp_ns: 0,
            },
            SKIPPED_SAMPLES_PLACEHOLDER,
        )
    }

    /// Clear all per-thread and GC state after a fork, and forward the
    /// reset to the recorder. No sampling may be in flight.
    pub fn reset_after_fork(&mut self) -> Result<()> {
        self.contexts.clear();
        self.buffers.clear();
        self.stats = ThreadContextStats::default();
        self.gc_tracking = GcTracking::default();
        self.time_converter.reset();
        self.recorder.reset_after_fork()
    }

    /// Current counters.
    pub fn stats(&self) -> ThreadContextStats {
        self.stats
    }

    /// Current GC accumulator state.
    pub fn gc_tracking(&self) -> GcTracking {
        self.gc_tracking
    }

    /// Number of per-thread contexts currently retained.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Whether a context exists for `thread`. Used by tests to observe the
    /// dead-thread sweep.
    pub fn has_context_for(&self, thread: ThreadHandle) -> bool {
        self.contexts.contains_key(&thread)
    }

    /// The thread-id label value a context carries, for tests.
    pub fn thread_id_for(&self, thread: ThreadHandle) -> Option<Arc<str>> {
        self.contexts
            .get(&thread)
            .map(|context| Arc::clone(&context.thread_id))
    }

    fn ensure_context(&mut self, thread: ThreadHandle) {
        if self.contexts.contains_key(&thread) {
            return;
        }

        let roster = &self.hooks.roster;
        let thread_id: Arc<str> = Arc::from(format!(
            "{} ({})",
            roster.native_thread_id(thread),
            roster.object_id(thread)
        ));

        let invoke_location: Arc<str> = match roster.invoke_location(thread) {
            Some((filename, _)) if filename.ends_with(LOGGING_GEM_PATH_SUFFIX) => {
                Arc::from("(Unnamed thread)")
            }
            Some((filename, line)) => Arc::from(format!("{filename}:{line}")),
            // A thread whose first function is native code has no invoke
            // location at all.
            None if thread != self.main_thread => Arc::from("(Unnamed thread from native code)"),
            None => Arc::from(""),
        };

        let cpu_clock = self.hooks.clocks.cpu_clock_id_for(thread);
        if cpu_clock.is_none() {
            tracing::debug!(
                thread = thread.0,
                "no per-thread cpu clock available; cpu-time will read as zero"
            );
        }

        self.contexts.insert(
            thread,
            PerThreadContext {
                thread_id,
                invoke_location,
                cpu_clock,
                cpu_time_at_previous_sample_ns: INVALID_TIME,
                wall_time_at_previous_sample_ns: INVALID_TIME,
                gc_cpu_time_at_start_ns: INVALID_TIME,
                gc_wall_time_at_start_ns: INVALID_TIME,
            },
        );
        self.buffers.insert(
            thread,
            SamplingBuffer::new(self.max_frames).expect("max_frames was validated"),
        );
    }

    fn cpu_time_now_ns(&mut self, thread: ThreadHandle) -> i64 {
        let clocks = Arc::clone(&self.hooks.clocks);
        let Some(context) = self.contexts.get_mut(&thread) else {
            return 0;
        };
        cpu_time_now(clocks.as_ref(), context)
    }

    fn remove_context_for_dead_threads(&mut self) {
        let roster = Arc::clone(&self.hooks.roster);
        self.contexts.retain(|thread, _| roster.is_alive(*thread));
        self.buffers.retain(|thread, _| roster.is_alive(*thread));
    }

    fn derive_class_name(&self, kind: ValueKind, new_object: ObjectHandle) -> Arc<str> {
        if kind.has_user_visible_class() {
            // Some internal objects are allocated with no class at all;
            // fall back to the canonical per-type name for those.
            match self.hooks.inspector.class_name(new_object) {
                Some(name) if !name.is_empty() => name,
                _ => Arc::from(kind.canonical_class_name()),
            }
        } else if kind == ValueKind::Imemo {
            match self.hooks.inspector.imemo_kind(new_object) {
                Some(imemo_kind) => Arc::from(format!("(VM Internal, T_IMEMO, {imemo_kind})")),
                None => Arc::from("(VM Internal, T_IMEMO)"),
            }
        } else {
            // Other VM internals are described by their raw type tag.
            Arc::from(kind.type_tag())
        }
    }

    fn trace_identifiers_for(&self, thread: ThreadHandle) -> Option<TraceIdentifiers> {
        if !self.tracer_context_key_present {
            return None;
        }
        let tracer = self.hooks.tracer.as_ref()?;

        let context = tracer.context_for(thread)?;
        let mut active_trace = tracer.active_trace(context)?;
        let mut root_span = tracer.root_span(active_trace);
        let active_span = tracer.active_span(active_trace);
        let mut numeric_span_id: Option<u64> = None;

        // Traces created on behalf of OpenTelemetry spans form a linked
        // list (each OTel span links back to a tracer trace); the local
        // root span lives on the trace at the end of that list.
        let otel_trace = tracer.otel_linked_trace(active_trace).is_some()
            || (active_span.is_none() && tracer.parent_span_id(active_trace).is_some());
        if otel_trace {
            let resolved_numeric_span_id = match active_span {
                Some(span) => tracer.span_id(span),
                // For traces started from otel spans the active span is
                // empty and the parent span id holds the right value.
                None => tracer.parent_span_id(active_trace),
            }?;

            let mut current_trace: TraceRef = active_trace;
            while let Some(next_trace) = tracer.otel_linked_trace(current_trace) {
                current_trace = next_trace;
            }

            root_span = tracer.root_span(current_trace);
            active_trace = current_trace;
            numeric_span_id = Some(resolved_numeric_span_id);
        }

        let root_span = root_span?;
        if active_span.is_none() && numeric_span_id.is_none() {
            return None;
        }

        let local_root_span_id = tracer.span_id(root_span)?;
        let span_id = match numeric_span_id {
            Some(id) => id,
            None => tracer.span_id(active_span?)?,
        };

        let mut identifiers = TraceIdentifiers {
            local_root_span_id,
            span_id,
            trace_endpoint: None,
        };

        if !self.endpoint_collection_enabled || !self.should_collect_resource(root_span) {
            return Some(identifiers);
        }

        identifiers.trace_endpoint = tracer
            .trace_resource(active_trace)
            .or_else(|| tracer.span_resource(root_span));

        Some(identifiers)
    }

    // Resources are only collected for span types representing work units
    // whose name is safe to aggregate: web requests ('web', and 'proxy'
    // for request-queuing setups) and background jobs ('worker').
    fn should_collect_resource(&self, root_span: crate::runtime::SpanRef) -> bool {
        let Some(tracer) = self.hooks.tracer.as_ref() else {
            return false;
        };
        match tracer.span_type(root_span) {
            Some(span_type) => {
                matches!(span_type.as_ref(), "web" | "proxy" | "worker")
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ThreadContextCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContextCollector")
            .field("max_frames", &self.max_frames)
            .field("contexts", &self.contexts.len())
            .field("sample_count", &self.sample_count)
            .field("timeline_enabled", &self.timeline_enabled)
            .field("endpoint_collection_enabled", &self.endpoint_collection_enabled)
            .field("allocation_type_enabled", &self.allocation_type_enabled)
            .field("stats", &self.stats)
            .field("gc_tracking", &self.gc_tracking)
            .finish()
    }
}

/// Charge the time elapsed since the previous sample and advance the
/// previous-sample timestamp.
///
/// When the thread is inside a GC step (`gc_start_time_ns` valid), only
/// the time up to the GC start is charged here; the rest is attributed to
/// GC by `sample_after_gc`, and the previous-sample timestamp parks at the
/// GC start so nothing is counted twice.
fn update_time_since_previous_sample(
    time_at_previous_sample_ns: &mut i64,
    current_time_ns: i64,
    gc_start_time_ns: i64,
    is_wall_time: bool,
) -> Result<i64> {
    if *time_at_previous_sample_ns == INVALID_TIME {
        *time_at_previous_sample_ns = current_time_ns;
    }

    let is_thread_doing_gc = gc_start_time_ns != INVALID_TIME;

    let elapsed_time_ns = if is_thread_doing_gc {
        let elapsed = if gc_start_time_ns <= *time_at_previous_sample_ns {
            // The previous sample already happened during this GC window;
            // the whole interval belongs to GC.
            0
        } else {
            gc_start_time_ns - *time_at_previous_sample_ns
        };
        *time_at_previous_sample_ns = gc_start_time_ns;
        elapsed
    } else {
        let elapsed = current_time_ns - *time_at_previous_sample_ns;
        *time_at_previous_sample_ns = current_time_ns;
        elapsed
    };

    if elapsed_time_ns < 0 {
        if is_wall_time {
            // Wall time legitimately goes backwards on clock adjustments
            // (and spuriously on some platforms); clamp rather than fail.
            return Ok(0);
        }
        return Err(ProfilingError::InvariantViolated(
            "unexpected negative elapsed time between samples".into(),
        ));
    }

    Ok(elapsed_time_ns)
}

/// Read a thread's cpu clock; a failed read invalidates the previous
/// sample timestamp so the next delta starts from two good readings.
fn cpu_time_now(clocks: &dyn crate::runtime::ClockProvider, context: &mut PerThreadContext) -> i64 {
    let reading = context.cpu_clock.and_then(|clock| clocks.cpu_time_ns(clock));
    match reading {
        Some(cpu_time_ns) => cpu_time_ns,
        None => {
            context.cpu_time_at_previous_sample_ns = INVALID_TIME;
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sim::SimRuntime;
    use crate::runtime::ObjectInspector;

    fn collector_with(
        sim: &Arc<SimRuntime>,
        configure: impl FnOnce(&mut Settings),
    ) -> ThreadContextCollector {
        let mut settings = Settings::default();
        settings.max_frames = 10;
        settings.tracer_context_key = Some("datadog_context".into());
        configure(&mut settings);
        let recorder = Arc::new(
            StackRecorder::new(&settings, Arc::clone(sim) as Arc<dyn ObjectInspector>).unwrap(),
        );
        ThreadContextCollector::new(&settings, recorder, sim.hooks()).unwrap()
    }

    fn default_collector(sim: &Arc<SimRuntime>) -> ThreadContextCollector {
        collector_with(sim, |_| {})
    }

    fn give_stack(sim: &SimRuntime, thread: crate::runtime::ThreadHandle, name: &str) {
        let frame = sim.runtime_frame(name, "app.rb", 1);
        sim.set_stack(thread, vec![frame]);
    }

    fn serialized(collector: &ThreadContextCollector) -> crate::pprof::proto::Profile {
        crate::pprof::decode(&collector.recorder.serialize().unwrap()).unwrap()
    }

    fn find_label_str<'p>(
        profile: &'p crate::pprof::proto::Profile,
        sample: &crate::pprof::proto::Sample,
        key: &str,
    ) -> Option<&'p str> {
        let key_id = profile.string_table.iter().position(|s| s == key)? as i64;
        let label = sample.label.iter().find(|l| l.key == key_id)?;
        Some(profile.string_table[label.str as usize].as_str())
    }

    fn find_label_num(
        profile: &crate::pprof::proto::Profile,
        sample: &crate::pprof::proto::Sample,
        key: &str,
    ) -> Option<i64> {
        let key_id = profile.string_table.iter().position(|s| s == key)? as i64;
        sample.label.iter().find(|l| l.key == key_id).map(|l| l.num)
    }

    #[test]
    fn test_first_sample_establishes_baseline_deltas() {
        let sim = Arc::new(SimRuntime::new());
        let mut collector = default_collector(&sim);
        let main = sim.main_thread_handle();
        give_stack(&sim, main, "main_loop");

        collector.sample(sim.wall_time_ns(), main).unwrap();

        // First sample: no previous timestamps, so both deltas are zero.
        let profile = serialized(&collector);
        // main-thread sample + profiler overhead sample.
        assert_eq!(profile.sample.len(), 2);
        assert!(profile.sample[0].value.iter().take(3).all(|v| *v == 0 || *v == 1));
    }

    #[test]
    fn test_deltas_accumulate_between_samples() {
        let sim = Arc::new(SimRuntime::new());
        let mut collector = default_collector(&sim);
        let main = sim.main_thread_handle();
        give_stack(&sim, main, "main_loop");

        collector.sample(sim.wall_time_ns(), main).unwrap();
        sim.advance_wall_time(60_000_000);
        sim.advance_cpu_time(main, 10_000_000);
        collector.sample(sim.wall_time_ns(), main).unwrap();

        let profile = serialized(&collector);
        // Find a sample charging the advanced wall time.
        let charged: Vec<_> = profile
            .sample
            .iter()
            .filter(|s| s.value.contains(&60_000_000))
            .collect();
        assert!(!charged.is_empty(), "a sample charges the wall delta");
        assert!(charged
            .iter()
            .any(|s| s.value.contains(&10_000_000)), "cpu delta charged too");
    }

    #[test]
    fn test_main_thread_gets_fallback_name() {
        let sim = Arc::new(SimRuntime::new());
        let mut collector = default_collector(&sim);
        let main = sim.main_thread_handle();
        give_stack(&sim, main, "main_loop");

        collector.sample(sim.wall_time_ns(), main).unwrap();

        let profile = serialized(&collector);
        assert_eq!(
            find_label_str(&profile, &profile.sample[0], "thread name"),
            Some("main")
        );
    }

    #[test]
    fn test_unnamed_thread_uses_invoke_location() {
        let sim = Arc::new(SimRuntime::new());
        let mut collector = default_collector(&sim);
        let main = sim.main_thread_handle();
        give_stack(&sim, main, "main_loop");

        let worker = sim.spawn_thread(None);
        sim.set_invoke_location(worker, "workers/poller.rb", 17);
        give_stack(&sim, worker, "poll");

        collector.sample(sim.wall_time_ns(), main).unwrap();

        let profile = serialized(&collector);
        let names: Vec<_> = profile
            .sample
            .iter()
            .filter_map(|s| find_label_str(&profile, s, "thread name"))
            .collect();
        assert!(names.contains(&"workers/poller.rb:17"), "names: {names:?}");
    }

    #[test]
    fn test_native_entry_thread_gets_placeholder_name() {
        let sim = Arc::new(SimRuntime::new());
        let mut collector = default_collector(&sim);
        let main = sim.main_thread_handle();
        give_stack(&sim, main, "main_loop");

        let native = sim.spawn_thread(None);
        give_stack(&sim, native, "embedded");

        collector.sample(sim.wall_time_ns(), main).unwrap();

        let profile = serialized(&collector);
        let names: Vec<_> = profile
            .sample
            .iter()
            .filter_map(|s| find_label_str(&profile, s, "thread name"))
            .collect();
        assert!(names.contains(&"(Unnamed thread from native code)"));
    }

    #[test]
    fn test_monkey_patched_invoke_location_is_suppressed() {
        let sim = Arc::new(SimRuntime::new());
        let mut collector = default_collector(&sim);
        let main = sim.main_thread_handle();
        give_stack(&sim, main, "main_loop");

        let patched = sim.spawn_thread(None);
        sim.set_invoke_location(
            patched,
            "/gems/logging-2.3.0/lib/logging/diagnostic_context.rb",
            20,
        );
        give_stack(&sim, patched, "work");

        collector.sample(sim.wall_time_ns(), main).unwrap();

        let profile = serialized(&collector);
        let names: Vec<_> = profile
            .sample
            .iter()
            .filter_map(|s| find_label_str(&profile, s, "thread name"))
            .collect();
        assert!(names.contains(&"(Unnamed thread)"));
    }

    #[test]
    fn test_profiler_overhead_sample_is_labelled() {
        let sim = Arc::new(SimRuntime::new());
        let mut collector = default_collector(&sim);
        let main = sim.main_thread_handle();
        give_stack(&sim, main, "main_loop");

        let overhead_thread = sim.spawn_thread(Some("profiler"));
        give_stack(&sim, overhead_thread, "sampling_loop");

        collector.sample(sim.wall_time_ns(), overhead_thread).unwrap();

        let profile = serialized(&collector);
        let overhead_samples: Vec<_> = profile
            .sample
            .iter()
            .filter(|s| find_label_num(&profile, s, "profiler overhead") == Some(1))
            .collect();
        assert_eq!(overhead_samples.len(), 1);
    }

    #[test]
    fn test_dead_thread_contexts_swept_every_100_samples() {
        let sim = Arc::new(SimRuntime::new());
        let mut collector = default_collector(&sim);
        let main = sim.main_thread_handle();
        give_stack(&sim, main, "main_loop");

        let doomed = sim.spawn_thread(Some("doomed"));
        give_stack(&sim, doomed, "dying");

        collector.sample(sim.wall_time_ns(), main).unwrap();
        assert!(collector.has_context_for(doomed));

        sim.kill_thread(doomed);
        for _ in 0..SAMPLES_BETWEEN_CONTEXT_CLEANUPS {
            sim.advance_wall_time(1_000_000);
            collector.sample(sim.wall_time_ns(), main).unwrap();
        }

        assert!(!collector.has_context_for(doomed));
    }

    #[test]
    fn test_thread_id_label_format() {
        let sim = Arc::new(SimRuntime::new());
        let mut collector = default_collector(&sim);
        let main = sim.main_thread_handle();
        give_stack(&sim, main, "main_loop");

        collector.sample(sim.wall_time_ns(), main).unwrap();

        let thread_id = collector.thread_id_for(main).unwrap();
        let expected = format!(
            "{} ({})",
            crate::runtime::ThreadRoster::native_thread_id(sim.as_ref(), main),
            crate::runtime::ThreadRoster::object_id(sim.as_ref(), main),
        );
        assert_eq!(thread_id.as_ref(), expected);
    }

    #[test]
    fn test_missing_cpu_clock_degrades_to_zero_cpu() {
        let sim = Arc::new(SimRuntime::new());
        let mut collector = default_collector(&sim);
        let main = sim.main_thread_handle();
        give_stack(&sim, main, "main_loop");

        let clockless = sim.spawn_thread(Some("clockless"));
        sim.disable_cpu_clock(clockless);
        give_stack(&sim, clockless, "busy");

        collector.sample(sim.wall_time_ns(), main).unwrap();
        sim.advance_wall_time(50_000_000);
        collector.sample(sim.wall_time_ns(), main).unwrap();

        let profile = serialized(&collector);
        let clockless_samples: Vec<_> = profile
            .sample
            .iter()
            .filter(|s| {
                find_label_str(&profile, s, "thread name") == Some("clockless")
            })
            .collect();
        assert!(!clockless_samples.is_empty());
        // cpu-time is position 0 in the default schema; always zero here.
        assert!(clockless_samples.iter().all(|s| s.value[0] == 0));
    }

    mod gc {
        use super::*;

        #[test]
        fn test_gc_start_without_context_counts_a_miss() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);

            collector.on_gc_start();

            assert_eq!(collector.stats().gc_samples_missed_due_to_missing_context, 1);
        }

        #[test]
        fn test_gc_finish_without_start_is_a_noop() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);
            let main = sim.main_thread_handle();
            give_stack(&sim, main, "main_loop");
            collector.sample(sim.wall_time_ns(), main).unwrap();

            assert!(!collector.on_gc_finish());
        }

        #[test]
        fn test_gc_steps_coalesce_until_threshold() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);
            let main = sim.main_thread_handle();
            give_stack(&sim, main, "main_loop");
            collector.sample(sim.wall_time_ns(), main).unwrap();

            // 1 ms GC steps: the first 9 stay under the 10 ms flush
            // threshold (measured from the last flushed event at 0... the
            // sim clock starts at 1s so the very first step crosses it).
            // Use explicit bookkeeping instead: after one flush, steps
            // coalesce again until 10 ms more have passed.
            let mut flushes = 0;
            for _ in 0..50 {
                collector.on_gc_start();
                sim.advance_wall_time(1_000_000);
                sim.advance_cpu_time(main, 500_000);
                if collector.on_gc_finish() {
                    collector.sample_after_gc().unwrap();
                    flushes += 1;
                }
            }

            // 50 ms of 1 ms steps with a 10 ms coalescing window: a
            // handful of flushes, not 50.
            assert!(flushes >= 4 && flushes <= 6, "flushes: {flushes}");
            assert_eq!(collector.stats().gc_samples, flushes);
        }

        #[test]
        fn test_gc_sample_carries_accumulated_times() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);
            let main = sim.main_thread_handle();
            give_stack(&sim, main, "main_loop");
            collector.sample(sim.wall_time_ns(), main).unwrap();

            collector.on_gc_start();
            sim.advance_wall_time(12_000_000);
            sim.advance_cpu_time(main, 3_000_000);
            assert!(collector.on_gc_finish());
            collector.sample_after_gc().unwrap();

            let profile = serialized(&collector);
            let gc_sample = profile
                .sample
                .iter()
                .find(|s| {
                    s.location_id.len() == 1
                        && profile
                            .location
                            .iter()
                            .find(|l| l.id == s.location_id[0])
                            .map(|l| {
                                profile
                                    .function
                                    .iter()
                                    .find(|f| f.id == l.line[0].function_id)
                                    .map(|f| {
                                        profile.string_table[f.filename as usize]
                                            == GARBAGE_COLLECTION_PLACEHOLDER
                                    })
                                    .unwrap_or(false)
                            })
                            .unwrap_or(false)
                })
                .expect("GC placeholder sample present");

            // cpu-time, cpu-samples, wall-time are the first three values.
            assert_eq!(gc_sample.value[0], 3_000_000);
            assert_eq!(gc_sample.value[1], 1);
            assert_eq!(gc_sample.value[2], 12_000_000);
        }

        #[test]
        fn test_gc_time_not_double_charged_to_regular_samples() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);
            let main = sim.main_thread_handle();
            give_stack(&sim, main, "main_loop");
            collector.sample(sim.wall_time_ns(), main).unwrap();

            collector.on_gc_start();
            sim.advance_wall_time(15_000_000);
            sim.advance_cpu_time(main, 15_000_000);
            assert!(collector.on_gc_finish());
            collector.sample_after_gc().unwrap();

            // Next regular sample: cpu was all spent in GC, so the regular
            // sample must charge zero cpu (wall is charged normally).
            collector.sample(sim.wall_time_ns(), main).unwrap();

            let profile = serialized(&collector);
            let regular: Vec<_> = profile
                .sample
                .iter()
                .filter(|s| find_label_str(&profile, s, "thread name") == Some("main"))
                .collect();
            assert!(regular.iter().all(|s| s.value[0] == 0));
            // But wall time includes the GC window.
            assert!(regular.iter().any(|s| s.value[2] == 15_000_000));
        }

        #[test]
        fn test_major_gc_forces_early_flush() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);
            let main = sim.main_thread_handle();
            give_stack(&sim, main, "main_loop");
            collector.sample(sim.wall_time_ns(), main).unwrap();
            // Drain the initial flush-threshold crossing.
            collector.on_gc_start();
            sim.advance_wall_time(100_000);
            collector.on_gc_finish();
            if collector.gc_tracking().wall_time_at_previous_gc_ns != INVALID_TIME {
                let _ = collector.sample_after_gc();
            }

            sim.set_major_gc_finished(true);
            collector.on_gc_start();
            sim.advance_wall_time(100_000);
            // Way below the 10 ms threshold, but a major GC finished.
            assert!(collector.on_gc_finish());
        }

        #[test]
        fn test_sample_after_gc_without_data_is_a_bug() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);
            assert!(matches!(
                collector.sample_after_gc(),
                Err(ProfilingError::InvariantViolated(_))
            ));
        }

        #[test]
        fn test_latest_gc_start_wins() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);
            let main = sim.main_thread_handle();
            give_stack(&sim, main, "main_loop");
            collector.sample(sim.wall_time_ns(), main).unwrap();

            collector.on_gc_start();
            sim.advance_wall_time(5_000_000);
            // A second start overwrites the window; only time after it is
            // attributed when the finish arrives.
            collector.on_gc_start();
            sim.advance_wall_time(2_000_000);
            collector.on_gc_finish();

            assert_eq!(collector.gc_tracking().accumulated_wall_time_ns, 2_000_000);
        }
    }

    mod allocations {
        use super::*;

        #[test]
        fn test_allocation_sample_carries_weight_and_class() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);
            let main = sim.main_thread_handle();
            give_stack(&sim, main, "allocation_site");

            let obj = sim.new_object(ValueKind::String, Some("String"));
            collector.sample_allocation(30, obj).unwrap();

            let profile = serialized(&collector);
            let sample = &profile.sample[0];
            // Default schema: alloc-samples at position 3, unscaled at 4.
            assert_eq!(sample.value[3], 30);
            assert_eq!(sample.value[4], 1);
            assert_eq!(
                find_label_str(&profile, sample, "allocation class"),
                Some("String")
            );
            assert_eq!(
                find_label_str(&profile, sample, "ruby vm type"),
                Some("T_STRING")
            );
            // Allocation samples carry no state label.
            assert_eq!(find_label_str(&profile, sample, "state"), None);
        }

        #[test]
        fn test_classless_object_uses_canonical_name() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);
            let main = sim.main_thread_handle();
            give_stack(&sim, main, "allocation_site");

            let obj = sim.new_object(ValueKind::Array, None);
            collector.sample_allocation(1, obj).unwrap();

            let profile = serialized(&collector);
            assert_eq!(
                find_label_str(&profile, &profile.sample[0], "allocation class"),
                Some("Array")
            );
        }

        #[test]
        fn test_imemo_objects_are_tagged_with_kind() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);
            let main = sim.main_thread_handle();
            give_stack(&sim, main, "allocation_site");

            let obj = sim.new_object(ValueKind::Imemo, None);
            sim.set_imemo_kind(obj, "ment");
            collector.sample_allocation(1, obj).unwrap();

            let profile = serialized(&collector);
            assert_eq!(
                find_label_str(&profile, &profile.sample[0], "allocation class"),
                Some("(VM Internal, T_IMEMO, ment)")
            );
        }

        #[test]
        fn test_allocation_type_can_be_disabled() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = collector_with(&sim, |settings| {
                settings.allocation_type_enabled = false;
            });
            let main = sim.main_thread_handle();
            give_stack(&sim, main, "allocation_site");

            let obj = sim.new_object(ValueKind::String, Some("String"));
            collector.sample_allocation(1, obj).unwrap();

            let profile = serialized(&collector);
            assert_eq!(
                find_label_str(&profile, &profile.sample[0], "allocation class"),
                None
            );
        }

        #[test]
        fn test_skipped_allocation_samples_placeholder() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);

            collector.sample_skipped_allocation_samples(123).unwrap();

            let profile = serialized(&collector);
            let sample = &profile.sample[0];
            assert_eq!(sample.value[3], 123);
            assert_eq!(
                find_label_str(&profile, sample, "thread name"),
                Some("Skipped Samples")
            );
            assert_eq!(
                find_label_str(&profile, sample, "allocation class"),
                Some("(Skipped Samples)")
            );
            assert!(profile
                .string_table
                .iter()
                .any(|s| s == SKIPPED_SAMPLES_PLACEHOLDER));
        }
    }

    mod tracing_integration {
        use super::*;

        fn sample_main(
            sim: &Arc<SimRuntime>,
            collector: &mut ThreadContextCollector,
        ) -> crate::pprof::proto::Profile {
            let main = sim.main_thread_handle();
            give_stack(sim, main, "handler");
            collector.sample(sim.wall_time_ns(), main).unwrap();
            serialized(collector)
        }

        #[test]
        fn test_span_ids_attached_when_trace_active() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);

            let root = sim.tracer_new_span(Some(42), Some("web"), None);
            let active = sim.tracer_new_span(Some(77), None, None);
            let trace = sim.tracer_new_trace(Some(root), Some(active), Some("GET /users"));
            sim.tracer_attach(sim.main_thread_handle(), trace);

            let profile = sample_main(&sim, &mut collector);
            let sample = profile
                .sample
                .iter()
                .find(|s| find_label_num(&profile, s, "local root span id").is_some())
                .expect("trace-correlated sample");
            assert_eq!(find_label_num(&profile, sample, "local root span id"), Some(42));
            assert_eq!(find_label_num(&profile, sample, "span id"), Some(77));
            // The web root span's trace resource became the endpoint.
            assert_eq!(
                find_label_str(&profile, sample, crate::pprof::TRACE_ENDPOINT_LABEL),
                Some("GET /users")
            );
        }

        #[test]
        fn test_non_web_root_span_collects_no_endpoint() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);

            let root = sim.tracer_new_span(Some(42), Some("custom"), None);
            let active = sim.tracer_new_span(Some(77), None, None);
            let trace = sim.tracer_new_trace(Some(root), Some(active), Some("my.operation"));
            sim.tracer_attach(sim.main_thread_handle(), trace);

            let profile = sample_main(&sim, &mut collector);
            let sample = profile
                .sample
                .iter()
                .find(|s| find_label_num(&profile, s, "local root span id").is_some())
                .unwrap();
            assert_eq!(
                find_label_str(&profile, sample, crate::pprof::TRACE_ENDPOINT_LABEL),
                None
            );
        }

        #[test]
        fn test_otel_chain_resolves_outermost_trace() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = default_collector(&sim);

            // Outermost tracer trace, holding the local root span.
            let outer_root = sim.tracer_new_span(Some(1000), Some("web"), Some("GET /api"));
            let outer_trace = sim.tracer_new_trace(Some(outer_root), None, None);

            // Innermost trace, created on behalf of an otel span; it has
            // no active span, only a parent span id, and links outward.
            let inner_root = sim.tracer_new_span(Some(2000), None, None);
            let inner_trace = sim.tracer_new_trace(Some(inner_root), None, None);
            sim.tracer_set_otel_link(inner_trace, Some(outer_trace), Some(555));

            sim.tracer_attach(sim.main_thread_handle(), inner_trace);

            let profile = sample_main(&sim, &mut collector);
            let sample = profile
                .sample
                .iter()
                .find(|s| find_label_num(&profile, s, "local root span id").is_some())
                .expect("otel-linked sample resolves");
            // Root span id comes from the end of the chain; span id from
            // the inner trace's parent span id.
            assert_eq!(
                find_label_num(&profile, sample, "local root span id"),
                Some(1000)
            );
            assert_eq!(find_label_num(&profile, sample, "span id"), Some(555));
        }

        #[test]
        fn test_no_tracer_context_key_disables_lookup() {
            let sim = Arc::new(SimRuntime::new());
            let mut collector = collector_with(&sim, |settings| {
                settings.tracer_context_key = None;
            });

            let root = sim.tracer_new_span(Some(42), Some("web"), None);
            let active = sim.tracer_new_span(Some(77), None, None);
            let trace = sim.tracer_new_trace(Some(root), Some(active), None);
            sim.tracer_attach(sim.main_thread_handle(), trace);

            let profile = sample_main(&sim, &mut collector);
            assert!(profile
                .sample
                .iter()
                .all(|s| find_label_num(&profile, s, "local root span id").is_none()));
        }
    }

    #[test]
    fn test_reset_after_fork_clears_contexts_and_recorder() {
        let sim = Arc::new(SimRuntime::new());
        let mut collector = default_collector(&sim);
        let main = sim.main_thread_handle();
        give_stack(&sim, main, "main_loop");

        collector.sample(sim.wall_time_ns(), main).unwrap();
        assert!(collector.context_count() > 0);

        collector.reset_after_fork().unwrap();

        assert_eq!(collector.context_count(), 0);
        assert_eq!(collector.stats().gc_samples, 0);
        let profile = serialized(&collector);
        assert!(profile.sample.is_empty());
    }

    mod update_delta {
        use super::*;

        #[test]
        fn test_first_call_charges_nothing() {
            let mut prev = INVALID_TIME;
            let elapsed =
                update_time_since_previous_sample(&mut prev, 500, INVALID_TIME, IS_WALL_TIME)
                    .unwrap();
            assert_eq!(elapsed, 0);
            assert_eq!(prev, 500);
        }

        #[test]
        fn test_regular_delta_advances_prev() {
            let mut prev = 100;
            let elapsed =
                update_time_since_previous_sample(&mut prev, 350, INVALID_TIME, IS_NOT_WALL_TIME)
                    .unwrap();
            assert_eq!(elapsed, 250);
            assert_eq!(prev, 350);
        }

        #[test]
        fn test_gc_window_claims_the_interval() {
            // Previous sample happened after GC started: everything since
            // belongs to GC.
            let mut prev = 200;
            let elapsed = update_time_since_previous_sample(&mut prev, 400, 150, IS_NOT_WALL_TIME)
                .unwrap();
            assert_eq!(elapsed, 0);
            assert_eq!(prev, 150);
        }

        #[test]
        fn test_gc_window_charges_up_to_gc_start() {
            let mut prev = 100;
            let elapsed = update_time_since_previous_sample(&mut prev, 400, 250, IS_NOT_WALL_TIME)
                .unwrap();
            assert_eq!(elapsed, 150);
            assert_eq!(prev, 250);
        }

        #[test]
        fn test_wall_time_clamps_negative_to_zero() {
            let mut prev = 1000;
            let elapsed =
                update_time_since_previous_sample(&mut prev, 800, INVALID_TIME, IS_WALL_TIME)
                    .unwrap();
            assert_eq!(elapsed, 0);
        }

        #[test]
        fn test_negative_cpu_delta_is_a_bug() {
            let mut prev = 1000;
            let result =
                update_time_since_previous_sample(&mut prev, 800, INVALID_TIME, IS_NOT_WALL_TIME);
            assert!(matches!(result, Err(ProfilingError::InvariantViolated(_))));
        }
    }
}
