//! Heap allocation liveness tracking.
//!
//! The heap recorder keeps a record for every sampled allocation whose free
//! has not yet been observed. Records are deduplicated by allocation-site
//! stack: a `HeapRecord` owns one interned stack and a count of the live
//! objects allocated there, and lives in an arena addressed by integer
//! handles so object records can reference it without any ownership cycle.
//!
//! A heap recording happens in two parts, mirroring the allocation sampling
//! path that produces it: [`HeapRecorder::track_object`] registers the
//! in-flight allocation, and the next recorded sample with a nonzero
//! alloc-samples value commits it with the sampled stack via
//! [`HeapRecorder::end_heap_allocation_recording`].
//!
//! Iteration over live objects is a three-step protocol: a snapshot is
//! built while holding the GIL ([`HeapRecorder::prepare_iteration`]),
//! consumed lock-free by the serializer
//! ([`HeapSnapshot::for_each_live_object`]), and retired under the GIL
//! again ([`HeapRecorder::finish_iteration`]).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::MAX_MAX_FRAMES;
use crate::pprof::Location;
use crate::runtime::{ObjectHandle, ObjectInspector};

/// Objects younger than this many GC generations at snapshot time are left
/// out of iterations: they have not survived a collection yet and are
/// mostly trash about to be reclaimed.
const ITERATION_MIN_AGE: u64 = 1;

/// A compact stack frame for a heap allocation: interned name/filename ids
/// plus a line. Equality and hashing use all three fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HeapFrame {
    name: u32,
    filename: u32,
    line: i32,
}

/// A deduplicated allocation-site stack, newest frame first.
type HeapStack = Arc<[HeapFrame]>;

/// Handle into the heap-record arena.
type HeapRecordHandle = u32;

#[derive(Debug)]
struct HeapRecord {
    /// Stack shared with the dedup index key; frames are interned ids.
    stack: HeapStack,
    /// How many live object records currently point at this record. The
    /// record and its stack are reclaimed when this drops to zero.
    num_tracked_objects: u32,
}

/// Data carried by each tracked live object.
#[derive(Debug, Clone)]
pub struct LiveObjectData {
    /// Sampling weight: how many allocations this object stands for.
    pub weight: u32,
    /// Class of the allocated object, when classification is enabled.
    pub class_name: Option<Arc<str>>,
    /// GC generation counter at allocation time.
    pub alloc_generation: u64,
    /// Byte size, filled in at snapshot time when size collection is on.
    pub size: Option<u64>,
}

#[derive(Debug)]
struct ObjectRecord {
    heap_record: HeapRecordHandle,
    data: LiveObjectData,
}

#[derive(Debug)]
enum ActiveRecording {
    /// The allocation was selected; commit it with the next sampled stack.
    Pending { obj: ObjectHandle, data: LiveObjectData },
    /// The allocation was seen but rejected by the 1-in-N gate; the next
    /// commit is a no-op.
    Skipped,
}

/// Interned string storage backing heap frames.
///
/// Strings accumulate for the recorder's lifetime; allocation-site names
/// and filenames form a small, heavily repeated set so this stays bounded
/// in practice.
#[derive(Debug, Default)]
struct StringTable {
    strings: Vec<Arc<str>>,
    index: HashMap<Arc<str>, u32>,
}

impl StringTable {
    fn intern(&mut self, value: &Arc<str>) -> u32 {
        if let Some(id) = self.index.get(value.as_ref()) {
            return *id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(Arc::clone(value));
        self.index.insert(Arc::clone(value), id);
        id
    }

    fn resolve(&self, id: u32) -> Arc<str> {
        self.strings
            .get(id as usize)
            .cloned()
            .unwrap_or_else(|| Arc::from(""))
    }
}

/// Counters describing the heap recorder's behavior, refreshed on every
/// snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HeapRecorderStats {
    /// Objects found alive during the last snapshot.
    pub objects_alive: u64,
    /// Objects found dead and reclaimed during the last snapshot.
    pub objects_dead: u64,
    /// Objects left out of the last snapshot for being too young.
    pub objects_skipped: u64,
    /// Allocations rejected by the 1-in-N sampling gate, total.
    pub recordings_skipped: u64,
    /// In-flight recordings dropped instead of committed, total.
    pub recordings_dropped: u64,
}

/// One entry of a prepared heap snapshot.
#[derive(Debug)]
pub struct HeapSnapshotEntry {
    /// Allocation-site stack, newest frame first.
    pub locations: Vec<Location>,
    /// Weight, class, age and (optionally) size of the live object.
    pub data: LiveObjectData,
}

/// An immutable view over the live objects captured by
/// [`HeapRecorder::prepare_iteration`]. Safe to consume without the GIL:
/// it shares nothing with the recorder's mutable state.
#[derive(Debug)]
pub struct HeapSnapshot {
    entries: Vec<HeapSnapshotEntry>,
    /// GC generation at which this snapshot was prepared.
    pub generation: u64,
}

impl HeapSnapshot {
    /// Visit every snapshot entry. The callback returns false to cancel.
    pub fn for_each_live_object(&self, mut callback: impl FnMut(&HeapSnapshotEntry) -> bool) -> bool {
        for entry in &self.entries {
            if !callback(entry) {
                return false;
            }
        }
        true
    }

    /// Number of live objects captured.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the snapshot captured nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Tracks a collection of live heap objects keyed by object id.
pub struct HeapRecorder {
    size_enabled: bool,
    sample_rate: u32,

    strings: StringTable,

    /// Arena of heap records; freed slots are recycled through `free_list`.
    records: Vec<Option<HeapRecord>>,
    free_list: Vec<HeapRecordHandle>,
    /// Dedup index: allocation-site stack -> arena handle. Shares the
    /// stack allocation with the record it points to.
    records_by_stack: HashMap<HeapStack, HeapRecordHandle>,

    /// Live objects by object id.
    object_records: HashMap<u64, ObjectRecord>,

    active_recording: Option<ActiveRecording>,
    recordings_seen: u64,

    stats: HeapRecorderStats,
}

impl HeapRecorder {
    /// A recorder keeping every allocation sample (`sample_rate` 1) with
    /// size collection off.
    pub fn new() -> Self {
        Self {
            size_enabled: false,
            sample_rate: 1,
            strings: StringTable::default(),
            records: Vec::new(),
            free_list: Vec::new(),
            records_by_stack: HashMap::new(),
            object_records: HashMap::new(),
            active_recording: None,
            recordings_seen: 0,
            stats: HeapRecorderStats::default(),
        }
    }

    /// Enable or disable size collection. Sizes are only read at snapshot
    /// time so this never affects the allocation path.
    pub fn set_size_enabled(&mut self, enabled: bool) {
        self.size_enabled = enabled;
    }

    /// Keep one out of every `rate` allocation samples.
    pub fn set_sample_rate(&mut self, rate: u32) {
        self.sample_rate = rate.max(1);
    }

    /// Start tracking a newly allocated object.
    ///
    /// The recording stays in-flight until the next sample with a nonzero
    /// alloc-samples value commits it. A previous uncommitted recording is
    /// overwritten.
    pub fn track_object(&mut self, obj: ObjectHandle, weight: u32, class_name: Option<Arc<str>>, alloc_generation: u64) {
        self.recordings_seen += 1;

        if self.sample_rate > 1 && self.recordings_seen % self.sample_rate as u64 != 0 {
            self.stats.recordings_skipped += 1;
            self.active_recording = Some(ActiveRecording::Skipped);
            return;
        }

        if matches!(self.active_recording, Some(ActiveRecording::Pending { .. })) {
            // A start without a matching commit; the old one is lost.
            self.stats.recordings_dropped += 1;
        }

        self.active_recording = Some(ActiveRecording::Pending {
            obj,
            data: LiveObjectData {
                weight: weight.saturating_mul(self.sample_rate),
                class_name,
                alloc_generation,
                size: None,
            },
        });
    }

    /// Commit the in-flight recording with the stack that was sampled for
    /// its allocation. No-op when nothing is pending (or the pending
    /// recording was rejected by the sampling gate).
    pub fn end_heap_allocation_recording(&mut self, locations: &[Location]) {
        let recording = match self.active_recording.take() {
            Some(ActiveRecording::Pending { obj, data }) => (obj, data),
            Some(ActiveRecording::Skipped) | None => return,
        };
        let (obj, data) = recording;

        if locations.is_empty() || locations.len() > MAX_MAX_FRAMES as usize {
            self.stats.recordings_dropped += 1;
            return;
        }

        let stack: HeapStack = locations
            .iter()
            .map(|location| HeapFrame {
                name: self.strings.intern(&location.name),
                filename: self.strings.intern(&location.filename),
                line: location.line,
            })
            .collect::<Vec<_>>()
            .into();

        let handle = self.intern_heap_record(stack);
        if let Some(record) = self.records[handle as usize].as_mut() {
            record.num_tracked_objects += 1;
        }

        // A re-used object id means we missed the free; the old record is
        // replaced and its heap record released.
        if let Some(previous) = self.object_records.insert(
            obj.0,
            ObjectRecord {
                heap_record: handle,
                data,
            },
        ) {
            self.release_heap_record(previous.heap_record);
        }
    }

    /// Record that `obj` was collected. No-op for untracked objects.
    ///
    /// Runs during GC: it never allocates and never fails.
    pub fn record_heap_free(&mut self, obj: ObjectHandle) {
        if let Some(record) = self.object_records.remove(&obj.0) {
            self.release_heap_record(record.heap_record);
        }
    }

    /// Build a snapshot of live, old-enough objects. Must be called with
    /// the GIL held; dead objects found along the way are reclaimed.
    pub fn prepare_iteration(&mut self, inspector: &dyn ObjectInspector) -> HeapSnapshot {
        let generation = inspector.gc_count();

        let mut dead = Vec::new();
        let mut entries = Vec::new();
        let mut skipped: u64 = 0;

        for (obj_id, record) in &self.object_records {
            if !inspector.is_alive(ObjectHandle(*obj_id)) {
                dead.push(*obj_id);
                continue;
            }

            let age = generation.saturating_sub(record.data.alloc_generation);
            if age < ITERATION_MIN_AGE {
                skipped += 1;
                continue;
            }

            let Some(heap_record) = self
                .records
                .get(record.heap_record as usize)
                .and_then(|slot| slot.as_ref())
            else {
                // An object record pointing at a freed heap record is a
                // bookkeeping bug; skip it rather than crash a serialize.
                tracing::error!(object_id = *obj_id, "live object references a freed heap record");
                continue;
            };

            let mut data = record.data.clone();
            if self.size_enabled {
                data.size = inspector.size_of(ObjectHandle(*obj_id));
            }

            let locations = heap_record
                .stack
                .iter()
                .map(|frame| Location {
                    name: self.strings.resolve(frame.name),
                    filename: self.strings.resolve(frame.filename),
                    line: frame.line,
                })
                .collect();

            entries.push(HeapSnapshotEntry { locations, data });
        }

        self.stats.objects_dead += dead.len() as u64;
        for obj_id in dead {
            if let Some(record) = self.object_records.remove(&obj_id) {
                self.release_heap_record(record.heap_record);
            }
        }

        self.stats.objects_alive = entries.len() as u64;
        self.stats.objects_skipped = skipped;

        HeapSnapshot {
            entries,
            generation,
        }
    }

    /// Retire a snapshot. Must be called with the GIL held.
    pub fn finish_iteration(&mut self, snapshot: HeapSnapshot) {
        drop(snapshot);
    }

    /// Drop every tracked object and in-flight recording. Object ids are
    /// not valid across a fork.
    pub fn reset_after_fork(&mut self) {
        self.object_records.clear();
        self.records.clear();
        self.free_list.clear();
        self.records_by_stack.clear();
        self.active_recording = None;
        self.stats = HeapRecorderStats::default();
    }

    /// Current counters.
    pub fn stats(&self) -> HeapRecorderStats {
        self.stats
    }

    /// Number of objects currently tracked.
    pub fn tracked_object_count(&self) -> usize {
        self.object_records.len()
    }

    /// Number of distinct allocation-site stacks currently retained.
    pub fn heap_record_count(&self) -> usize {
        self.records.iter().filter(|slot| slot.is_some()).count()
    }

    /// Live-object count for the record tracking `locations`, if any.
    /// Exists to let tests check the dedup invariants.
    pub fn live_count_for_stack(&self, locations: &[Location]) -> Option<u32> {
        let mut frames = Vec::with_capacity(locations.len());
        for location in locations {
            let name = *self.strings.index.get(location.name.as_ref())?;
            let filename = *self.strings.index.get(location.filename.as_ref())?;
            frames.push(HeapFrame {
                name,
                filename,
                line: location.line,
            });
        }
        let stack: HeapStack = frames.into();
        let handle = *self.records_by_stack.get(&stack)?;
        self.records[handle as usize]
            .as_ref()
            .map(|record| record.num_tracked_objects)
    }

    fn intern_heap_record(&mut self, stack: HeapStack) -> HeapRecordHandle {
        if let Some(handle) = self.records_by_stack.get(&stack) {
            return *handle;
        }

        let record = HeapRecord {
            stack: Arc::clone(&stack),
            num_tracked_objects: 0,
        };

        let handle = match self.free_list.pop() {
            Some(handle) => {
                self.records[handle as usize] = Some(record);
                handle
            }
            None => {
                self.records.push(Some(record));
                (self.records.len() - 1) as HeapRecordHandle
            }
        };

        self.records_by_stack.insert(stack, handle);
        handle
    }

    fn release_heap_record(&mut self, handle: HeapRecordHandle) {
        let Some(slot) = self.records.get_mut(handle as usize) else {
            return;
        };
        let Some(record) = slot.as_mut() else { return };

        record.num_tracked_objects = record.num_tracked_objects.saturating_sub(1);
        if record.num_tracked_objects == 0 {
            let stack = Arc::clone(&record.stack);
            *slot = None;
            self.records_by_stack.remove(&stack);
            self.free_list.push(handle);
        }
    }
}

impl Default for HeapRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HeapRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRecorder")
            .field("tracked_objects", &self.object_records.len())
            .field("heap_records", &self.heap_record_count())
            .field("sample_rate", &self.sample_rate)
            .field("size_enabled", &self.size_enabled)
            .field("stats", &self.stats)
            .finish()
    }
}
