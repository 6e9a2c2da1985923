//! Collaborator traits through which the profiling core observes the
//! managed runtime.
//!
//! The sampling engine never sees runtime-specific types. The embedding
//! runtime mints opaque tokens ([`ThreadHandle`], [`ObjectHandle`],
//! [`CodeRef`], [`MethodRef`]) and implements the traits in this module to
//! let the core walk frames, enumerate threads, read clocks, inspect
//! objects and reach the tracer. Unless stated otherwise, every method is
//! called with the runtime's global interpreter lock (GIL) held.
//!
//! [`sim::SimRuntime`] provides a deterministic in-memory implementation
//! used by the test suites.

pub mod sim;

use std::sync::Arc;

/// Opaque token identifying a runtime thread, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadHandle(pub u64);

/// Opaque token identifying a managed heap object.
///
/// Derived from the runtime's object id; not valid across a fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u64);

/// Opaque token identifying a unit of managed bytecode (an "iseq"): a
/// runtime frame resolves through it to a name, a filename and a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeRef(pub u64);

/// Opaque token identifying a native method, resolving to a name only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodRef(pub u64);

/// Per-thread cpu clock id, as understood by `clock_gettime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuClockId(pub i32);

/// One captured stack frame, newest-first in walk order.
#[derive(Debug, Clone, Copy)]
pub struct FrameRecord {
    /// What kind of frame this is and how to resolve its symbols.
    pub kind: FrameKind,
    /// Advisory flag: the runtime believes this frame is unchanged since
    /// the previous walk of the same thread. Purely a cache hint.
    pub same_frame: bool,
}

/// Discriminates managed-bytecode frames from native-code frames.
#[derive(Debug, Clone, Copy)]
pub enum FrameKind {
    /// A frame executing managed bytecode; carries its code handle and the
    /// currently-executing line.
    Runtime {
        /// Handle resolving to name/filename via [`FrameWalker::code_info`].
        code: CodeRef,
        /// Line number within the code's file.
        line: i32,
    },
    /// A frame executing native code, identified by method only.
    Native {
        /// Handle resolving to a name via [`FrameWalker::method_name`].
        method: MethodRef,
    },
}

/// Result of walking a thread's frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameWalk {
    /// The walk captured this many frames into the caller's buffer.
    Frames(usize),
    /// The thread is alive but has no introspectable frames: it either has
    /// not started running managed code yet, or is blocked inside a native
    /// call. Callers record a placeholder stack instead.
    InNativeCode,
}

/// Resolved symbols for a unit of managed bytecode.
#[derive(Debug, Clone)]
pub struct CodeInfo {
    /// The code's base label (method or block name). Empty when unknown.
    pub name: Arc<str>,
    /// Path of the source file the code was loaded from.
    pub filename: Arc<str>,
}

/// Walks the internal frame chain of a runtime thread.
///
/// The walker is not thread-safe for the target thread; callers guarantee
/// the GIL is held. Implementations must never allocate managed memory.
pub trait FrameWalker: Send + Sync {
    /// Write at most `out.len()` frame records for `thread`, newest first,
    /// starting `start_depth` frames below the top.
    fn walk(&self, thread: ThreadHandle, start_depth: usize, out: &mut [FrameRecord]) -> FrameWalk;

    /// The thread's true stack depth, used to size the omitted-frames
    /// placeholder when a capture fills the buffer.
    fn stack_depth(&self, thread: ThreadHandle) -> usize;

    /// Resolve a runtime frame's name and filename.
    fn code_info(&self, code: CodeRef) -> CodeInfo;

    /// Resolve a native frame's method name.
    fn method_name(&self, method: MethodRef) -> Arc<str>;
}

/// Enumerates and describes the runtime's live threads.
pub trait ThreadRoster: Send + Sync {
    /// Clear `out` and fill it with every live thread.
    fn live_threads(&self, out: &mut Vec<ThreadHandle>);

    /// The thread currently holding the GIL (the caller's thread).
    fn current_thread(&self) -> ThreadHandle;

    /// The process main thread.
    fn main_thread(&self) -> ThreadHandle;

    /// Whether the thread is still alive.
    fn is_alive(&self, thread: ThreadHandle) -> bool;

    /// The user-assigned thread name, if any.
    fn thread_name(&self, thread: ThreadHandle) -> Option<Arc<str>>;

    /// First source location of the block the thread was started with, if
    /// the thread was started from managed code.
    fn invoke_location(&self, thread: ThreadHandle) -> Option<(Arc<str>, u32)>;

    /// The runtime-level object id of the thread object.
    fn object_id(&self, thread: ThreadHandle) -> u64;

    /// The OS-level thread id.
    fn native_thread_id(&self, thread: ThreadHandle) -> u64;
}

/// Per-thread cpu clock discovery and reading.
///
/// On systems without per-thread cpu clocks, `cpu_clock_id_for` returns
/// `None` and the collector degrades cpu-time to zero.
pub trait ClockProvider: Send + Sync {
    /// Discover the cpu clock id for a thread. Cached by the collector at
    /// context creation.
    fn cpu_clock_id_for(&self, thread: ThreadHandle) -> Option<CpuClockId>;

    /// Read a previously discovered cpu clock. `None` means the reading
    /// failed (e.g. the thread exited) and the caller must invalidate its
    /// previous reading.
    fn cpu_time_ns(&self, clock: CpuClockId) -> Option<i64>;

    /// Monotonic wall clock, in nanoseconds. The default reads the system
    /// monotonic clock; simulated runtimes override it to control time.
    fn monotonic_wall_time_ns(&self) -> i64 {
        crate::time::monotonic_now_ns()
    }
}

/// Answers "does the calling thread hold the GIL right now?".
///
/// Consulted from the SIGPROF handler, so implementations must be
/// async-signal-safe: no allocation, no locks.
pub trait GilProbe: Send + Sync {
    /// True when the calling OS thread currently holds the GIL.
    fn current_thread_holds_gil(&self) -> bool;
}

/// Kinds of work the core defers onto the GIL-holding thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostponedJobKind {
    /// Run a regular sampling pass.
    Sample,
    /// Flush accumulated GC time as a placeholder sample.
    SampleAfterGc,
}

/// The runtime's deferred-execution mechanism ("postponed jobs"): work
/// enqueued here runs at the next safe point on the GIL-holding thread,
/// via [`crate::collectors::sampler_worker::SamplerWorker::run_postponed_job`].
pub trait PostponedJobs: Send + Sync {
    /// Enqueue a job. Returns false when the runtime cannot accept one
    /// right now; the caller simply drops the request.
    ///
    /// Must be async-signal-safe: it is called from the SIGPROF handler.
    fn enqueue(&self, kind: PostponedJobKind) -> bool;
}

/// Coarse classification of a managed value, mirroring the runtime's
/// internal type tags. Drives allocation class-name derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ValueKind {
    Object,
    Class,
    Module,
    Float,
    String,
    Regexp,
    Array,
    Hash,
    Struct,
    Integer,
    File,
    Data,
    Match,
    Complex,
    Rational,
    Nil,
    True,
    False,
    Symbol,
    /// A VM-internal value of the "imemo" family.
    Imemo,
    /// Any other VM-internal value, described by its raw type tag.
    Internal(&'static str),
}

impl ValueKind {
    /// Canonical class name used when the object carries no usable class.
    pub fn canonical_class_name(self) -> &'static str {
        match self {
            ValueKind::Object => "Object",
            ValueKind::Class => "Class",
            ValueKind::Module => "Module",
            ValueKind::Float => "Float",
            ValueKind::String => "String",
            ValueKind::Regexp => "Regexp",
            ValueKind::Array => "Array",
            ValueKind::Hash => "Hash",
            ValueKind::Struct => "Struct",
            ValueKind::Integer => "Integer",
            ValueKind::File => "File",
            ValueKind::Data => "(VM Internal, T_DATA)",
            ValueKind::Match => "MatchData",
            ValueKind::Complex => "Complex",
            ValueKind::Rational => "Rational",
            ValueKind::Nil => "NilClass",
            ValueKind::True => "TrueClass",
            ValueKind::False => "FalseClass",
            ValueKind::Symbol => "Symbol",
            ValueKind::Imemo | ValueKind::Internal(_) => "(VM Internal, Missing class)",
        }
    }

    /// The raw type-tag string, used for the `ruby vm type` label.
    pub fn type_tag(self) -> &'static str {
        match self {
            ValueKind::Object => "T_OBJECT",
            ValueKind::Class => "T_CLASS",
            ValueKind::Module => "T_MODULE",
            ValueKind::Float => "T_FLOAT",
            ValueKind::String => "T_STRING",
            ValueKind::Regexp => "T_REGEXP",
            ValueKind::Array => "T_ARRAY",
            ValueKind::Hash => "T_HASH",
            ValueKind::Struct => "T_STRUCT",
            ValueKind::Integer => "T_FIXNUM",
            ValueKind::File => "T_FILE",
            ValueKind::Data => "T_DATA",
            ValueKind::Match => "T_MATCH",
            ValueKind::Complex => "T_COMPLEX",
            ValueKind::Rational => "T_RATIONAL",
            ValueKind::Nil => "T_NIL",
            ValueKind::True => "T_TRUE",
            ValueKind::False => "T_FALSE",
            ValueKind::Symbol => "T_SYMBOL",
            ValueKind::Imemo => "T_IMEMO",
            ValueKind::Internal(tag) => tag,
        }
    }

    /// True for the common kinds whose class slot is worth reading from
    /// the object itself before falling back to the canonical name.
    pub fn has_user_visible_class(self) -> bool {
        !matches!(self, ValueKind::Imemo | ValueKind::Internal(_))
    }
}

/// Inspection of managed heap objects, used by allocation sampling and the
/// heap tracker.
pub trait ObjectInspector: Send + Sync {
    /// The object's runtime type classification.
    fn value_kind(&self, obj: ObjectHandle) -> ValueKind;

    /// The object's class name, when it has a named class.
    fn class_name(&self, obj: ObjectHandle) -> Option<Arc<str>>;

    /// For imemo values, the imemo sub-kind name.
    fn imemo_kind(&self, obj: ObjectHandle) -> Option<Arc<str>>;

    /// Whether the object is still alive (not collected).
    fn is_alive(&self, obj: ObjectHandle) -> bool;

    /// Approximate byte size of the object. Queried only at heap-snapshot
    /// time, never on the allocation path.
    fn size_of(&self, obj: ObjectHandle) -> Option<u64>;

    /// The runtime's GC generation counter (total collections so far).
    fn gc_count(&self) -> u64;
}

/// Access to GC cycle metadata for the post-GC placeholder sample.
pub trait GcMonitor: Send + Sync {
    /// True when a major GC finished since the last flushed GC event.
    fn has_major_gc_finished(&self) -> bool;

    /// Labels describing the most recent GC (cause, type, generation...).
    /// Called only from `sample_after_gc`, where allocation is allowed.
    fn metadata_labels(&self) -> Vec<(Arc<str>, Arc<str>)>;
}

/// Opaque token for a tracer thread-local context object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContextRef(pub u64);

/// Opaque token for a tracer trace object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRef(pub u64);

/// Opaque token for a tracer span object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanRef(pub u64);

/// Attribute-level access to the installed tracer's objects.
///
/// The chain-following logic (OTel spans linking back to tracer traces)
/// and endpoint gating live in the collector; this trait only reads
/// attributes off individual objects, mirroring the instance-variable
/// reads the original runtime integration performs.
pub trait TracerBridge: Send + Sync {
    /// The tracer context stored in the thread's locals under the
    /// configured context key, if any.
    fn context_for(&self, thread: ThreadHandle) -> Option<TraceContextRef>;

    /// The context's currently active trace.
    fn active_trace(&self, context: TraceContextRef) -> Option<TraceRef>;

    /// The trace's local root span.
    fn root_span(&self, trace: TraceRef) -> Option<SpanRef>;

    /// The trace's currently active span.
    fn active_span(&self, trace: TraceRef) -> Option<SpanRef>;

    /// When the trace was created on behalf of an OpenTelemetry span, the
    /// tracer trace that OTel span links back to; `None` ends the chain.
    fn otel_linked_trace(&self, trace: TraceRef) -> Option<TraceRef>;

    /// Numeric id of a span.
    fn span_id(&self, span: SpanRef) -> Option<u64>;

    /// The trace's parent span id, used for traces started from OTel spans
    /// where the active span is absent.
    fn parent_span_id(&self, trace: TraceRef) -> Option<u64>;

    /// The `type` attribute of a span (`web`, `proxy`, `worker`, ...).
    fn span_type(&self, span: SpanRef) -> Option<Arc<str>>;

    /// The trace's resource name, if set.
    fn trace_resource(&self, trace: TraceRef) -> Option<Arc<str>>;

    /// The span's resource name, if set.
    fn span_resource(&self, span: SpanRef) -> Option<Arc<str>>;
}

/// Bundle of every collaborator the collectors need, so constructors take
/// one argument instead of eight.
#[derive(Clone)]
pub struct RuntimeHooks {
    /// Frame chain access.
    pub walker: Arc<dyn FrameWalker>,
    /// Thread enumeration and identity.
    pub roster: Arc<dyn ThreadRoster>,
    /// Per-thread cpu clocks.
    pub clocks: Arc<dyn ClockProvider>,
    /// GIL ownership probe for the signal handler.
    pub gil: Arc<dyn GilProbe>,
    /// Deferred execution onto the GIL-holding thread.
    pub postponed_jobs: Arc<dyn PostponedJobs>,
    /// Heap object inspection.
    pub inspector: Arc<dyn ObjectInspector>,
    /// GC cycle metadata.
    pub gc: Arc<dyn GcMonitor>,
    /// Tracer attribute access, when a tracer is installed.
    pub tracer: Option<Arc<dyn TracerBridge>>,
}

impl std::fmt::Debug for RuntimeHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHooks")
            .field("tracer", &self.tracer.is_some())
            .finish_non_exhaustive()
    }
}
