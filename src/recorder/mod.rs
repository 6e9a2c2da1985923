//! Double-buffered sample recording.
//!
//! The recorder's state is accessed in parallel by two threads: the
//! **sampler thread** (whoever holds the GIL when a sample fires; there is
//! only ever one at a time) and the **serializer thread**. The sampler has
//! absolute priority and must never block while recording.
//!
//! To get there, the recorder keeps two profile slots, each behind its own
//! mutex. The **active** slot is the one whose mutex is unlocked: the
//! sampler probes with `try_lock` (slot one first, then slot two, then one
//! retry round in case a flip raced in between) and records into whichever
//! it manages to grab. The **inactive** slot's mutex stays locked -- its
//! guard is owned by the recorder -- until the serializer is ready to work,
//! at which point it flips: release the inactive slot (making it active),
//! then acquire the previously-active slot (possibly blocking briefly on an
//! in-progress sample), and serialize it. A sample that lands in between
//! the two flip steps goes to either window; both outcomes are correct.
//!
//! An `active_slot` number is kept as a convenience for the serializer and
//! for the testing hooks. The sampler path never reads it.

pub mod heap;

use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use serde::Serialize;

use crate::config::Settings;
use crate::error::{ProfilingError, Result};
use crate::pprof::{EncodedProfile, Label, Location, ProfileWindow};
use crate::runtime::{ObjectHandle, ObjectInspector};
use crate::time::system_epoch_now_ns;
use heap::{HeapRecorder, HeapRecorderStats};

/// Position of each value type in the full (unpacked) schema.
mod value_id {
    pub const CPU_TIME: usize = 0;
    pub const CPU_SAMPLES: usize = 1;
    pub const WALL_TIME: usize = 2;
    pub const ALLOC_SAMPLES: usize = 3;
    pub const ALLOC_SAMPLES_UNSCALED: usize = 4;
    pub const TIMELINE: usize = 5;
    pub const HEAP_SAMPLES: usize = 6;
    pub const HEAP_SIZE: usize = 7;
}

/// The full value-type schema, in canonical position order.
const ALL_VALUE_TYPES: [(&str, &str); 8] = [
    ("cpu-time", "nanoseconds"),
    ("cpu-samples", "count"),
    ("wall-time", "nanoseconds"),
    ("alloc-samples", "count"),
    ("alloc-samples-unscaled", "count"),
    ("timeline", "nanoseconds"),
    ("heap-live-samples", "count"),
    ("heap-live-size", "bytes"),
];

const ALL_VALUE_TYPES_COUNT: usize = ALL_VALUE_TYPES.len();

/// Raw values for one sample, before packing to the enabled schema.
///
/// `heap_sample` marks allocation samples that should also commit the
/// in-flight heap recording; it is never transmitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleValues {
    /// Cpu time consumed since the thread's previous sample.
    pub cpu_time_ns: i64,
    /// 1 for cpu/wall-time samples, 0 otherwise.
    pub cpu_or_wall_samples: i64,
    /// Wall time elapsed since the thread's previous sample.
    pub wall_time_ns: i64,
    /// Weighted allocation count represented by this sample.
    pub alloc_samples: i64,
    /// Unweighted allocation count (1 per sampled allocation event).
    pub alloc_samples_unscaled: i64,
    /// Wall duration attributed to this sample on the timeline.
    pub timeline_wall_time_ns: i64,
    /// Route this sample's stack into the heap tracker commit.
    pub heap_sample: bool,
}

/// Labels attached to one sample.
///
/// `state_label` indexes the designated mutable `state` slot, which the
/// stack collector may overwrite with a wait-state classification. State
/// values are static strings, so no write-barrier concerns arise.
#[derive(Debug, Clone, Default)]
pub struct SampleLabels {
    /// All labels, string- and numeric-valued.
    pub labels: Vec<Label>,
    /// Index of the `state` label within `labels`, when present.
    pub state_label: Option<usize>,
    /// Epoch timestamp for timeline rendering; 0 when absent.
    pub end_timestamp_ns: i64,
}

impl SampleLabels {
    /// Overwrite the designated state label, if one exists.
    pub fn set_state(&mut self, state: &'static str) {
        if let Some(index) = self.state_label {
            if let Some(label) = self.labels.get_mut(index) {
                label.value = crate::pprof::LabelValue::Str(Arc::from(state));
            }
        }
    }

    /// Current value of the state label, for tests and diagnostics.
    pub fn state(&self) -> Option<&str> {
        let index = self.state_label?;
        match &self.labels.get(index)?.value {
            crate::pprof::LabelValue::Str(value) => Some(value.as_ref()),
            crate::pprof::LabelValue::Num(_) => None,
        }
    }
}

type Slot = Arc<Mutex<ProfileWindow>>;
type SlotGuard = ArcMutexGuard<RawMutex, ProfileWindow>;

struct SerializerState {
    /// Guard for the inactive slot. `Some` is the at-rest invariant:
    /// exactly one slot locked. Only `None` transiently inside a flip.
    inactive_guard: Option<SlotGuard>,
    /// 1 or 2. For the serializer and testing hooks only.
    active_slot: u8,
}

/// Counters and gauges describing recorder state.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RecorderStats {
    /// Completed serializations since construction or fork.
    pub serializations: u64,
    /// Samples recorded into the currently active window so far.
    pub active_window_samples: usize,
    /// Heap recorder counters, when heap tracking is enabled.
    pub heap: Option<HeapRecorderStats>,
}

/// The profiler's double-buffered sample sink.
pub struct StackRecorder {
    slots: [Slot; 2],
    serializer: Mutex<SerializerState>,
    serializations: std::sync::atomic::AtomicU64,

    position_for: [usize; ALL_VALUE_TYPES_COUNT],
    enabled_values_count: usize,

    heap: Option<Mutex<HeapRecorder>>,
    inspector: Arc<dyn ObjectInspector>,
}

impl StackRecorder {
    /// Build a recorder for the given settings. The settings must already
    /// have passed validation.
    pub fn new(settings: &Settings, inspector: Arc<dyn ObjectInspector>) -> Result<Self> {
        settings.validate()?;

        let (position_for, enabled_values_count, enabled_types) = build_positions(settings);

        let start = system_epoch_now_ns();
        let slots = [
            Arc::new(Mutex::new(ProfileWindow::new(enabled_types.clone(), start))),
            Arc::new(Mutex::new(ProfileWindow::new(enabled_types, start))),
        ];

        // A new recorder starts with slot one active, so slot two's lock is
        // taken and kept.
        let inactive_guard = slots[1]
            .try_lock_arc()
            .ok_or_else(|| ProfilingError::InvariantViolated("fresh slot two mutex was locked".into()))?;

        let heap = if settings.heap_tracking_enabled() {
            let mut heap = HeapRecorder::new();
            heap.set_sample_rate(settings.heap_sample_every);
            heap.set_size_enabled(settings.heap_size_enabled);
            Some(Mutex::new(heap))
        } else {
            None
        };

        Ok(Self {
            slots,
            serializer: Mutex::new(SerializerState {
                inactive_guard: Some(inactive_guard),
                active_slot: 1,
            }),
            serializations: std::sync::atomic::AtomicU64::new(0),
            position_for,
            enabled_values_count,
            heap,
            inspector,
        })
    }

    /// Record one sample into the active slot.
    ///
    /// Called with the GIL held, from the single sampler thread. Never
    /// blocks: the active slot is found with `try_lock` probes.
    pub fn record_sample(
        &self,
        locations: &[Location],
        values: &SampleValues,
        labels: &SampleLabels,
    ) -> Result<()> {
        let mut active = self.sampler_lock_active_profile()?;

        let mut metric_values = [0i64; ALL_VALUE_TYPES_COUNT];
        metric_values[self.position_for[value_id::CPU_TIME]] = values.cpu_time_ns;
        metric_values[self.position_for[value_id::CPU_SAMPLES]] = values.cpu_or_wall_samples;
        metric_values[self.position_for[value_id::WALL_TIME]] = values.wall_time_ns;
        metric_values[self.position_for[value_id::ALLOC_SAMPLES]] = values.alloc_samples;
        metric_values[self.position_for[value_id::ALLOC_SAMPLES_UNSCALED]] =
            values.alloc_samples_unscaled;
        metric_values[self.position_for[value_id::TIMELINE]] = values.timeline_wall_time_ns;

        if values.alloc_samples != 0 {
            // An allocation sample's stack doubles as the allocation site
            // of the in-flight heap recording; commit it now.
            if let Some(heap) = &self.heap {
                heap.lock().end_heap_allocation_recording(locations);
            }
        }

        active.add_sample(
            locations,
            &metric_values[..self.enabled_values_count],
            &labels.labels,
            labels.end_timestamp_ns,
        )
    }

    /// Register an in-flight heap allocation for the object. The stack is
    /// supplied by the next allocation sample (see [`Self::record_sample`]).
    pub fn track_object(&self, obj: ObjectHandle, weight: u32, class_name: Option<Arc<str>>) {
        if let Some(heap) = &self.heap {
            let alloc_generation = self.inspector.gc_count();
            heap.lock()
                .track_object(obj, weight, class_name, alloc_generation);
        }
    }

    /// Record that `obj` was freed, releasing its heap tracking state.
    pub fn record_heap_free(&self, obj: ObjectHandle) {
        if let Some(heap) = &self.heap {
            heap.lock().record_heap_free(obj);
        }
    }

    /// Remember the latest endpoint for a local root span id on the active
    /// slot. Applied to matching samples when that window serializes.
    pub fn record_endpoint(&self, local_root_span_id: u64, endpoint: &str) -> Result<()> {
        let mut active = self.sampler_lock_active_profile()?;
        active.set_endpoint(local_root_span_id, endpoint);
        Ok(())
    }

    /// Serialize the closing window and open a new one.
    ///
    /// Called with the GIL held; the caller may drop the GIL for the
    /// duration of the heap drain and encoding (nothing here touches
    /// runtime state once the heap snapshot is prepared).
    pub fn serialize(&self) -> Result<EncodedProfile> {
        let mut serializer = self.serializer.lock();

        let finish_timestamp = system_epoch_now_ns();

        // Before making the inactive profile active, reset it so the next
        // window starts at this serialization's finish timestamp.
        if let Some(guard) = serializer.inactive_guard.as_mut() {
            guard.reset(finish_timestamp);
        } else {
            return Err(ProfilingError::InvariantViolated(
                "serialize called with no inactive slot guard held".into(),
            ));
        }

        // Heap iteration preparation must happen while the GIL is held.
        let heap_snapshot = self
            .heap
            .as_ref()
            .map(|heap| heap.lock().prepare_iteration(self.inspector.as_ref()));

        let mut inactive = self.flip_active_and_inactive_slots(&mut serializer)?;

        // From here on we only touch the flipped-out window and the
        // snapshot; this part runs without the GIL in the embedder.
        let result = self.build_and_encode(&mut inactive, heap_snapshot.as_ref(), finish_timestamp);

        // The window is reset whether or not encoding succeeded, so a
        // failed serialization does not poison the next one.
        inactive.reset(finish_timestamp);
        serializer.inactive_guard = Some(inactive);

        if let (Some(heap), Some(snapshot)) = (&self.heap, heap_snapshot) {
            heap.lock().finish_iteration(snapshot);
        }

        if result.is_ok() {
            self.serializations
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        result
    }

    /// Reset all state after a fork. Must not race any sampler or
    /// serializer activity; the caller stops those first.
    pub fn reset_after_fork(&self) -> Result<()> {
        let mut serializer = self.serializer.lock();

        // The fork may have happened halfway through a flip; drop whatever
        // guard is held so both slots are unlocked before rebuilding the
        // at-rest state.
        serializer.inactive_guard = None;

        let start = system_epoch_now_ns();
        for slot in &self.slots {
            match slot.try_lock() {
                Some(mut window) => window.reset(start),
                None => {
                    return Err(ProfilingError::InvariantViolated(
                        "slot locked during reset_after_fork".into(),
                    ))
                }
            }
        }

        serializer.inactive_guard = Some(self.slots[1].try_lock_arc().ok_or_else(|| {
            ProfilingError::InvariantViolated("slot two locked during reset_after_fork".into())
        })?);
        serializer.active_slot = 1;

        if let Some(heap) = &self.heap {
            heap.lock().reset_after_fork();
        }
        self.serializations
            .store(0, std::sync::atomic::Ordering::Relaxed);

        Ok(())
    }

    /// Current recorder counters.
    pub fn stats(&self) -> RecorderStats {
        let active_window_samples = self
            .sampler_lock_active_profile()
            .map(|window| window.sample_count())
            .unwrap_or(0);
        RecorderStats {
            serializations: self.serializations.load(std::sync::atomic::Ordering::Relaxed),
            active_window_samples,
            heap: self.heap.as_ref().map(|heap| heap.lock().stats()),
        }
    }

    /// Which slot is currently active (1 or 2). Serializer-side view,
    /// meant for tests and diagnostics only.
    pub fn active_slot(&self) -> u8 {
        self.serializer.lock().active_slot
    }

    /// Whether slot one's mutex is currently locked. Testing hook.
    pub fn slot_one_mutex_locked(&self) -> bool {
        self.probe_slot_locked(0)
    }

    /// Whether slot two's mutex is currently locked. Testing hook.
    pub fn slot_two_mutex_locked(&self) -> bool {
        self.probe_slot_locked(1)
    }

    fn probe_slot_locked(&self, index: usize) -> bool {
        // Like Heisenberg, we can't observe without affecting: probe by
        // try-locking and releasing.
        match self.slots[index].try_lock() {
            Some(guard) => {
                drop(guard);
                false
            }
            None => true,
        }
    }

    fn sampler_lock_active_profile(&self) -> Result<SlotGuard> {
        // Two rounds: the serializer may flip between our two probes, but
        // it only does so once per serialization, so a second round always
        // finds an unlocked slot in a correctly functioning recorder.
        for _attempt in 0..2 {
            for slot in &self.slots {
                if let Some(guard) = slot.try_lock_arc() {
                    return Ok(guard);
                }
            }
        }
        Err(ProfilingError::InvariantViolated(
            "failed to grab either slot mutex in sampler_lock_active_profile".into(),
        ))
    }

    fn flip_active_and_inactive_slots(
        &self,
        serializer: &mut SerializerState,
    ) -> Result<SlotGuard> {
        let previously_active = serializer.active_slot;
        if previously_active != 1 && previously_active != 2 {
            return Err(ProfilingError::InvariantViolated(format!(
                "unexpected active_slot state {previously_active} during flip"
            )));
        }

        // Release the inactive slot's lock, making it active for samplers.
        serializer.inactive_guard = None;

        // Grab the previously-active slot; may block briefly on a sample.
        let guard = self.slots[previously_active as usize - 1].lock_arc();

        serializer.active_slot = if previously_active == 1 { 2 } else { 1 };

        Ok(guard)
    }

    fn build_and_encode(
        &self,
        window: &mut SlotGuard,
        heap_snapshot: Option<&heap::HeapSnapshot>,
        finish_timestamp: i64,
    ) -> Result<EncodedProfile> {
        if let Some(snapshot) = heap_snapshot {
            let mut failure: Option<ProfilingError> = None;

            snapshot.for_each_live_object(|entry| {
                let mut metric_values = [0i64; ALL_VALUE_TYPES_COUNT];
                let weight = entry.data.weight as i64;
                metric_values[self.position_for[value_id::HEAP_SAMPLES]] = weight;
                metric_values[self.position_for[value_id::HEAP_SIZE]] =
                    entry.data.size.unwrap_or(0) as i64 * weight;

                let mut labels = Vec::with_capacity(2);
                if let Some(class_name) = &entry.data.class_name {
                    labels.push(Label::str("allocation class", Arc::clone(class_name)));
                }
                labels.push(Label::num(
                    "gc gen age",
                    snapshot.generation.saturating_sub(entry.data.alloc_generation),
                ));

                match window.add_sample(
                    &entry.locations,
                    &metric_values[..self.enabled_values_count],
                    &labels,
                    0,
                ) {
                    Ok(()) => true,
                    Err(error) => {
                        failure = Some(error);
                        false
                    }
                }
            });

            if let Some(error) = failure {
                return Err(ProfilingError::SerializeError(format!(
                    "failure during heap profile building: {error}"
                )));
            }
        }

        window.encode(finish_timestamp)
    }
}

impl std::fmt::Debug for StackRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackRecorder")
            .field("active_slot", &self.active_slot())
            .field("enabled_values_count", &self.enabled_values_count)
            .field("heap_tracking", &self.heap.is_some())
            .finish()
    }
}

/// Compute the position-mapping table for the enabled options.
///
/// With everything enabled (the default) every value type sits at its
/// canonical position. When some types are disabled, enabled types are
/// packed into a prefix -- the two always-on types first, the rest in
/// schema order -- and disabled types get positions past the enabled
/// count, so writes to them never reach the transmitted prefix.
fn build_positions(
    settings: &Settings,
) -> ([usize; ALL_VALUE_TYPES_COUNT], usize, Vec<(&'static str, &'static str)>) {
    let enabled_flags: [(usize, bool); ALL_VALUE_TYPES_COUNT] = [
        (value_id::CPU_SAMPLES, true),
        (value_id::WALL_TIME, true),
        (value_id::CPU_TIME, settings.cpu_time_enabled),
        (value_id::ALLOC_SAMPLES, settings.alloc_samples_enabled),
        (value_id::ALLOC_SAMPLES_UNSCALED, settings.alloc_samples_enabled),
        (value_id::TIMELINE, settings.timeline_enabled),
        (value_id::HEAP_SAMPLES, settings.heap_samples_enabled),
        (value_id::HEAP_SIZE, settings.heap_size_enabled),
    ];

    let enabled_count = enabled_flags.iter().filter(|(_, enabled)| *enabled).count();

    if enabled_count == ALL_VALUE_TYPES_COUNT {
        let mut position_for = [0usize; ALL_VALUE_TYPES_COUNT];
        for (id, position) in position_for.iter_mut().enumerate() {
            *position = id;
        }
        return (position_for, enabled_count, ALL_VALUE_TYPES.to_vec());
    }

    let mut position_for = [0usize; ALL_VALUE_TYPES_COUNT];
    let mut enabled_types = Vec::with_capacity(enabled_count);
    let mut next_enabled = 0usize;
    let mut next_disabled = enabled_count;

    for (id, enabled) in enabled_flags {
        if enabled {
            position_for[id] = next_enabled;
            enabled_types.push(ALL_VALUE_TYPES[id]);
            next_enabled += 1;
        } else {
            position_for[id] = next_disabled;
            next_disabled += 1;
        }
    }

    (position_for, enabled_count, enabled_types)
}
