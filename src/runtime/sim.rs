//! Deterministic in-memory runtime used to drive the collectors in tests.
//!
//! `SimRuntime` implements every collaborator trait over plain tables, so
//! the sampling engine can be exercised with hand-built threads, stacks,
//! clocks, heap objects and tracer state, without a managed runtime in the
//! process. All mutation helpers take `&self`; state lives behind a mutex
//! so the same instance can be shared as the various `Arc<dyn ...>` hooks.
//!
//! One deliberate simplification: the [`GilProbe`] and [`PostponedJobs`]
//! implementations take the state mutex, which a real runtime's
//! async-signal-safe implementations must not. Tests that run the live
//! signal loop block SIGPROF on threads that touch the sim directly.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    ClockProvider, CodeInfo, CodeRef, CpuClockId, FrameKind, FrameRecord, FrameWalk, FrameWalker,
    GcMonitor, GilProbe, MethodRef, ObjectHandle, ObjectInspector, PostponedJobKind,
    PostponedJobs, RuntimeHooks, SpanRef, ThreadHandle, ThreadRoster, TraceContextRef, TraceRef,
    TracerBridge, ValueKind,
};

#[derive(Debug, Clone)]
struct SimThread {
    alive: bool,
    name: Option<Arc<str>>,
    invoke_location: Option<(Arc<str>, u32)>,
    object_id: u64,
    native_id: u64,
    /// Captured frames, newest first (walk order).
    frames: Vec<FrameRecord>,
    cpu_time_ns: i64,
    cpu_clock_available: bool,
}

#[derive(Debug, Clone, Default)]
struct SimObject {
    kind: Option<ValueKind>,
    class_name: Option<Arc<str>>,
    imemo_kind: Option<Arc<str>>,
    alive: bool,
    size: Option<u64>,
}

#[derive(Debug, Clone, Default)]
struct SimTrace {
    root_span: Option<SpanRef>,
    active_span: Option<SpanRef>,
    otel_linked_trace: Option<TraceRef>,
    parent_span_id: Option<u64>,
    resource: Option<Arc<str>>,
}

#[derive(Debug, Clone, Default)]
struct SimSpan {
    id: Option<u64>,
    span_type: Option<Arc<str>>,
    resource: Option<Arc<str>>,
}

#[derive(Default)]
struct SimState {
    next_token: u64,
    threads: HashMap<ThreadHandle, SimThread>,
    thread_order: Vec<ThreadHandle>,
    main_thread: Option<ThreadHandle>,
    current_thread: Option<ThreadHandle>,
    code: HashMap<CodeRef, CodeInfo>,
    methods: HashMap<MethodRef, Arc<str>>,
    objects: HashMap<ObjectHandle, SimObject>,
    gc_count: u64,
    wall_time_ns: i64,
    major_gc_finished: bool,
    gc_metadata: Vec<(Arc<str>, Arc<str>)>,
    holds_gil: bool,
    accept_postponed_jobs: bool,
    postponed_jobs: Vec<PostponedJobKind>,
    contexts: HashMap<ThreadHandle, TraceContextRef>,
    context_traces: HashMap<u64, TraceRef>,
    traces: HashMap<u64, SimTrace>,
    spans: HashMap<u64, SimSpan>,
}

/// In-memory stand-in for the managed runtime.
pub struct SimRuntime {
    state: Mutex<SimState>,
}

impl Default for SimRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRuntime {
    /// A fresh runtime with a single main thread that also holds the GIL.
    pub fn new() -> Self {
        let sim = Self {
            state: Mutex::new(SimState {
                holds_gil: true,
                accept_postponed_jobs: true,
                // An arbitrary nonzero origin, so 0 keeps meaning "failed
                // clock read" in code under test.
                wall_time_ns: 1_000_000_000,
                ..Default::default()
            }),
        };
        let main = sim.spawn_thread(Some("main"));
        {
            let mut state = sim.state.lock();
            state.main_thread = Some(main);
            state.current_thread = Some(main);
            // The main thread carries no user-assigned name; the collector
            // provides the "main" fallback itself.
            state.threads.get_mut(&main).unwrap().name = None;
        }
        sim
    }

    /// Bundle this runtime into the hooks struct the collectors consume.
    pub fn hooks(self: &Arc<Self>) -> RuntimeHooks {
        RuntimeHooks {
            walker: Arc::clone(self) as Arc<dyn FrameWalker>,
            roster: Arc::clone(self) as Arc<dyn ThreadRoster>,
            clocks: Arc::clone(self) as Arc<dyn ClockProvider>,
            gil: Arc::clone(self) as Arc<dyn GilProbe>,
            postponed_jobs: Arc::clone(self) as Arc<dyn PostponedJobs>,
            inspector: Arc::clone(self) as Arc<dyn ObjectInspector>,
            gc: Arc::clone(self) as Arc<dyn GcMonitor>,
            tracer: Some(Arc::clone(self) as Arc<dyn TracerBridge>),
        }
    }

    fn mint(state: &mut SimState) -> u64 {
        state.next_token += 1;
        state.next_token
    }

    /// Create a live thread. `name` is the user-assigned thread name.
    pub fn spawn_thread(&self, name: Option<&str>) -> ThreadHandle {
        let mut state = self.state.lock();
        let token = Self::mint(&mut state);
        let handle = ThreadHandle(token);
        state.threads.insert(
            handle,
            SimThread {
                alive: true,
                name: name.map(Arc::from),
                invoke_location: None,
                object_id: 1000 + token,
                native_id: 2000 + token,
                frames: Vec::new(),
                cpu_time_ns: 0,
                cpu_clock_available: true,
            },
        );
        state.thread_order.push(handle);
        handle
    }

    /// The main thread, without needing the [`ThreadRoster`] trait in
    /// scope.
    pub fn main_thread_handle(&self) -> ThreadHandle {
        self.state.lock().main_thread.expect("sim has a main thread")
    }

    /// Mark a thread dead (it stays visible to lookups, like a collected
    /// thread object, but disappears from the live list).
    pub fn kill_thread(&self, thread: ThreadHandle) {
        let mut state = self.state.lock();
        if let Some(t) = state.threads.get_mut(&thread) {
            t.alive = false;
        }
        state.thread_order.retain(|other| *other != thread);
    }

    /// Point the "current thread" (GIL holder) at `thread`.
    pub fn set_current_thread(&self, thread: ThreadHandle) {
        self.state.lock().current_thread = Some(thread);
    }

    /// Set the first source location of the thread's entry block.
    pub fn set_invoke_location(&self, thread: ThreadHandle, filename: &str, line: u32) {
        if let Some(t) = self.state.lock().threads.get_mut(&thread) {
            t.invoke_location = Some((Arc::from(filename), line));
        }
    }

    /// Replace the thread's captured stack. `frames` is given oldest first
    /// (call order); it is stored newest first, the way walks report it.
    pub fn set_stack(&self, thread: ThreadHandle, frames: Vec<FrameRecord>) {
        if let Some(t) = self.state.lock().threads.get_mut(&thread) {
            t.frames = frames.into_iter().rev().collect();
        }
    }

    /// Clear the thread's stack, making walks report `InNativeCode`.
    pub fn clear_stack(&self, thread: ThreadHandle) {
        if let Some(t) = self.state.lock().threads.get_mut(&thread) {
            t.frames.clear();
        }
    }

    /// Build a runtime (bytecode) frame record.
    pub fn runtime_frame(&self, name: &str, filename: &str, line: i32) -> FrameRecord {
        let mut state = self.state.lock();
        let code = CodeRef(Self::mint(&mut state));
        state.code.insert(
            code,
            CodeInfo {
                name: Arc::from(name),
                filename: Arc::from(filename),
            },
        );
        FrameRecord {
            kind: FrameKind::Runtime { code, line },
            same_frame: false,
        }
    }

    /// Build a native frame record.
    pub fn native_frame(&self, method_name: &str) -> FrameRecord {
        let mut state = self.state.lock();
        let method = MethodRef(Self::mint(&mut state));
        state.methods.insert(method, Arc::from(method_name));
        FrameRecord {
            kind: FrameKind::Native { method },
            same_frame: false,
        }
    }

    /// Advance the simulated monotonic wall clock.
    pub fn advance_wall_time(&self, delta_ns: i64) {
        self.state.lock().wall_time_ns += delta_ns;
    }

    /// Current simulated monotonic wall clock.
    pub fn wall_time_ns(&self) -> i64 {
        self.state.lock().wall_time_ns
    }

    /// Advance a thread's cpu clock.
    pub fn advance_cpu_time(&self, thread: ThreadHandle, delta_ns: i64) {
        if let Some(t) = self.state.lock().threads.get_mut(&thread) {
            t.cpu_time_ns += delta_ns;
        }
    }

    /// Make cpu clock discovery fail for a thread, simulating platforms
    /// without per-thread cpu clocks.
    pub fn disable_cpu_clock(&self, thread: ThreadHandle) {
        if let Some(t) = self.state.lock().threads.get_mut(&thread) {
            t.cpu_clock_available = false;
        }
    }

    /// Register a live heap object of the given kind.
    pub fn new_object(&self, kind: ValueKind, class_name: Option<&str>) -> ObjectHandle {
        let mut state = self.state.lock();
        let handle = ObjectHandle(Self::mint(&mut state));
        state.objects.insert(
            handle,
            SimObject {
                kind: Some(kind),
                class_name: class_name.map(Arc::from),
                imemo_kind: None,
                alive: true,
                size: None,
            },
        );
        handle
    }

    /// Set the imemo sub-kind reported for an object.
    pub fn set_imemo_kind(&self, obj: ObjectHandle, kind: &str) {
        if let Some(o) = self.state.lock().objects.get_mut(&obj) {
            o.imemo_kind = Some(Arc::from(kind));
        }
    }

    /// Set the byte size reported for an object.
    pub fn set_object_size(&self, obj: ObjectHandle, size: u64) {
        if let Some(o) = self.state.lock().objects.get_mut(&obj) {
            o.size = Some(size);
        }
    }

    /// Mark an object collected.
    pub fn free_object(&self, obj: ObjectHandle) {
        if let Some(o) = self.state.lock().objects.get_mut(&obj) {
            o.alive = false;
        }
    }

    /// Advance the GC generation counter by `generations`.
    pub fn run_gc(&self, generations: u64) {
        self.state.lock().gc_count += generations;
    }

    /// Current GC generation counter.
    pub fn gc_generation(&self) -> u64 {
        self.state.lock().gc_count
    }

    /// Control the "a major GC has finished" probe.
    pub fn set_major_gc_finished(&self, finished: bool) {
        self.state.lock().major_gc_finished = finished;
    }

    /// Set the metadata labels describing the last GC.
    pub fn set_gc_metadata(&self, labels: Vec<(&str, &str)>) {
        self.state.lock().gc_metadata = labels
            .into_iter()
            .map(|(k, v)| (Arc::from(k), Arc::from(v)))
            .collect();
    }

    /// Control whether the simulated GIL is held by the calling thread.
    pub fn set_holds_gil(&self, holds: bool) {
        self.state.lock().holds_gil = holds;
    }

    /// Control whether the postponed-job queue accepts new entries.
    pub fn set_accept_postponed_jobs(&self, accept: bool) {
        self.state.lock().accept_postponed_jobs = accept;
    }

    /// Take every queued postponed job, in enqueue order.
    pub fn drain_postponed_jobs(&self) -> Vec<PostponedJobKind> {
        std::mem::take(&mut self.state.lock().postponed_jobs)
    }

    // --- tracer state builders ---

    /// Create a span. Every attribute is optional, like on the real thing.
    pub fn tracer_new_span(
        &self,
        id: Option<u64>,
        span_type: Option<&str>,
        resource: Option<&str>,
    ) -> SpanRef {
        let mut state = self.state.lock();
        let token = Self::mint(&mut state);
        state.spans.insert(
            token,
            SimSpan {
                id,
                span_type: span_type.map(Arc::from),
                resource: resource.map(Arc::from),
            },
        );
        SpanRef(token)
    }

    /// Create a trace with the given root and active spans.
    pub fn tracer_new_trace(
        &self,
        root_span: Option<SpanRef>,
        active_span: Option<SpanRef>,
        resource: Option<&str>,
    ) -> TraceRef {
        let mut state = self.state.lock();
        let token = Self::mint(&mut state);
        state.traces.insert(
            token,
            SimTrace {
                root_span,
                active_span,
                otel_linked_trace: None,
                parent_span_id: None,
                resource: resource.map(Arc::from),
            },
        );
        TraceRef(token)
    }

    /// Record that `trace` was created on behalf of an OTel span linking
    /// back to `linked`, and carries `parent_span_id`.
    pub fn tracer_set_otel_link(
        &self,
        trace: TraceRef,
        linked: Option<TraceRef>,
        parent_span_id: Option<u64>,
    ) {
        if let Some(t) = self.state.lock().traces.get_mut(&trace.0) {
            t.otel_linked_trace = linked;
            t.parent_span_id = parent_span_id;
        }
    }

    /// Install `trace` as the thread's active trace.
    pub fn tracer_attach(&self, thread: ThreadHandle, trace: TraceRef) {
        let mut state = self.state.lock();
        let token = Self::mint(&mut state);
        state.contexts.insert(thread, TraceContextRef(token));
        state.context_traces.insert(token, trace);
    }
}

impl FrameWalker for SimRuntime {
    fn walk(&self, thread: ThreadHandle, start_depth: usize, out: &mut [FrameRecord]) -> FrameWalk {
        let state = self.state.lock();
        let Some(t) = state.threads.get(&thread) else {
            return FrameWalk::InNativeCode;
        };
        if t.frames.is_empty() {
            return FrameWalk::InNativeCode;
        }
        let available = t.frames.len().saturating_sub(start_depth);
        let captured = available.min(out.len());
        out[..captured].copy_from_slice(&t.frames[start_depth..start_depth + captured]);
        FrameWalk::Frames(captured)
    }

    fn stack_depth(&self, thread: ThreadHandle) -> usize {
        self.state
            .lock()
            .threads
            .get(&thread)
            .map(|t| t.frames.len())
            .unwrap_or(0)
    }

    fn code_info(&self, code: CodeRef) -> CodeInfo {
        self.state
            .lock()
            .code
            .get(&code)
            .cloned()
            .unwrap_or_else(|| CodeInfo {
                name: Arc::from(""),
                filename: Arc::from(""),
            })
    }

    fn method_name(&self, method: MethodRef) -> Arc<str> {
        self.state
            .lock()
            .methods
            .get(&method)
            .cloned()
            .unwrap_or_else(|| Arc::from(""))
    }
}

impl ThreadRoster for SimRuntime {
    fn live_threads(&self, out: &mut Vec<ThreadHandle>) {
        let state = self.state.lock();
        out.clear();
        out.extend(
            state
                .thread_order
                .iter()
                .filter(|t| state.threads.get(t).map(|t| t.alive).unwrap_or(false)),
        );
    }

    fn current_thread(&self) -> ThreadHandle {
        self.state.lock().current_thread.expect("sim has a current thread")
    }

    fn main_thread(&self) -> ThreadHandle {
        self.state.lock().main_thread.expect("sim has a main thread")
    }

    fn is_alive(&self, thread: ThreadHandle) -> bool {
        self.state
            .lock()
            .threads
            .get(&thread)
            .map(|t| t.alive)
            .unwrap_or(false)
    }

    fn thread_name(&self, thread: ThreadHandle) -> Option<Arc<str>> {
        self.state.lock().threads.get(&thread)?.name.clone()
    }

    fn invoke_location(&self, thread: ThreadHandle) -> Option<(Arc<str>, u32)> {
        self.state.lock().threads.get(&thread)?.invoke_location.clone()
    }

    fn object_id(&self, thread: ThreadHandle) -> u64 {
        self.state
            .lock()
            .threads
            .get(&thread)
            .map(|t| t.object_id)
            .unwrap_or(0)
    }

    fn native_thread_id(&self, thread: ThreadHandle) -> u64 {
        self.state
            .lock()
            .threads
            .get(&thread)
            .map(|t| t.native_id)
            .unwrap_or(0)
    }
}

impl ClockProvider for SimRuntime {
    fn cpu_clock_id_for(&self, thread: ThreadHandle) -> Option<CpuClockId> {
        let state = self.state.lock();
        let t = state.threads.get(&thread)?;
        if t.cpu_clock_available {
            Some(CpuClockId(thread.0 as i32))
        } else {
            None
        }
    }

    fn cpu_time_ns(&self, clock: CpuClockId) -> Option<i64> {
        let state = self.state.lock();
        let t = state.threads.get(&ThreadHandle(clock.0 as u64))?;
        if t.alive {
            Some(t.cpu_time_ns)
        } else {
            None
        }
    }

    fn monotonic_wall_time_ns(&self) -> i64 {
        self.state.lock().wall_time_ns
    }
}

impl GilProbe for SimRuntime {
    fn current_thread_holds_gil(&self) -> bool {
        self.state.lock().holds_gil
    }
}

impl PostponedJobs for SimRuntime {
    fn enqueue(&self, kind: PostponedJobKind) -> bool {
        let mut state = self.state.lock();
        if !state.accept_postponed_jobs {
            return false;
        }
        // Like the real queue, a duplicate pending job is not enqueued twice.
        if !state.postponed_jobs.contains(&kind) {
            state.postponed_jobs.push(kind);
        }
        true
    }
}

impl ObjectInspector for SimRuntime {
    fn value_kind(&self, obj: ObjectHandle) -> ValueKind {
        self.state
            .lock()
            .objects
            .get(&obj)
            .and_then(|o| o.kind)
            .unwrap_or(ValueKind::Internal("T_NONE"))
    }

    fn class_name(&self, obj: ObjectHandle) -> Option<Arc<str>> {
        self.state.lock().objects.get(&obj)?.class_name.clone()
    }

    fn imemo_kind(&self, obj: ObjectHandle) -> Option<Arc<str>> {
        self.state.lock().objects.get(&obj)?.imemo_kind.clone()
    }

    fn is_alive(&self, obj: ObjectHandle) -> bool {
        self.state
            .lock()
            .objects
            .get(&obj)
            .map(|o| o.alive)
            .unwrap_or(false)
    }

    fn size_of(&self, obj: ObjectHandle) -> Option<u64> {
        self.state.lock().objects.get(&obj)?.size
    }

    fn gc_count(&self) -> u64 {
        self.state.lock().gc_count
    }
}

impl GcMonitor for SimRuntime {
    fn has_major_gc_finished(&self) -> bool {
        self.state.lock().major_gc_finished
    }

    fn metadata_labels(&self) -> Vec<(Arc<str>, Arc<str>)> {
        self.state.lock().gc_metadata.clone()
    }
}

impl TracerBridge for SimRuntime {
    fn context_for(&self, thread: ThreadHandle) -> Option<TraceContextRef> {
        self.state.lock().contexts.get(&thread).copied()
    }

    fn active_trace(&self, context: TraceContextRef) -> Option<TraceRef> {
        self.state.lock().context_traces.get(&context.0).copied()
    }

    fn root_span(&self, trace: TraceRef) -> Option<SpanRef> {
        self.state.lock().traces.get(&trace.0)?.root_span
    }

    fn active_span(&self, trace: TraceRef) -> Option<SpanRef> {
        self.state.lock().traces.get(&trace.0)?.active_span
    }

    fn otel_linked_trace(&self, trace: TraceRef) -> Option<TraceRef> {
        self.state.lock().traces.get(&trace.0)?.otel_linked_trace
    }

    fn span_id(&self, span: SpanRef) -> Option<u64> {
        self.state.lock().spans.get(&span.0)?.id
    }

    fn parent_span_id(&self, trace: TraceRef) -> Option<u64> {
        self.state.lock().traces.get(&trace.0)?.parent_span_id
    }

    fn span_type(&self, span: SpanRef) -> Option<Arc<str>> {
        self.state.lock().spans.get(&span.0)?.span_type.clone()
    }

    fn trace_resource(&self, trace: TraceRef) -> Option<Arc<str>> {
        self.state.lock().traces.get(&trace.0)?.resource.clone()
    }

    fn span_resource(&self, span: SpanRef) -> Option<Arc<str>> {
        self.state.lock().spans.get(&span.0)?.resource.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_reports_newest_first() {
        let sim = SimRuntime::new();
        let thread = sim.spawn_thread(Some("worker"));
        let outer = sim.runtime_frame("outer", "app.rb", 1);
        let inner = sim.runtime_frame("inner", "app.rb", 2);
        sim.set_stack(thread, vec![outer, inner]);

        let mut buffer = vec![sim.native_frame("scratch"); 4];
        let walk = sim.walk(thread, 0, &mut buffer);
        assert_eq!(walk, FrameWalk::Frames(2));

        // Newest (inner) first.
        match buffer[0].kind {
            FrameKind::Runtime { code, line } => {
                assert_eq!(sim.code_info(code).name.as_ref(), "inner");
                assert_eq!(line, 2);
            }
            _ => panic!("expected runtime frame"),
        }
    }

    #[test]
    fn test_empty_stack_walks_as_native_code() {
        let sim = SimRuntime::new();
        let thread = sim.spawn_thread(None);
        let mut buffer = vec![sim.native_frame("scratch"); 4];
        assert_eq!(sim.walk(thread, 0, &mut buffer), FrameWalk::InNativeCode);
    }

    #[test]
    fn test_dead_threads_leave_the_live_list() {
        let sim = SimRuntime::new();
        let thread = sim.spawn_thread(Some("doomed"));

        let mut live = Vec::new();
        sim.live_threads(&mut live);
        assert!(live.contains(&thread));

        sim.kill_thread(thread);
        sim.live_threads(&mut live);
        assert!(!live.contains(&thread));
        assert!(!ThreadRoster::is_alive(&sim, thread));
    }

    #[test]
    fn test_postponed_jobs_dedupe_pending_entries() {
        let sim = SimRuntime::new();
        assert!(sim.enqueue(PostponedJobKind::Sample));
        assert!(sim.enqueue(PostponedJobKind::Sample));
        assert_eq!(sim.drain_postponed_jobs(), vec![PostponedJobKind::Sample]);
    }
}
