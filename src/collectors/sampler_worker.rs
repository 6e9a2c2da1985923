//! Background worker that triggers periodic on-GIL sampling.
//!
//! This is the fiddly part of the profiler: it deals with a background
//! thread, a signal handler and process-global state. The flow for one
//! periodic sample is:
//!
//! 1. The worker thread (no GIL, ever) decides it is time and sends
//!    SIGPROF to the process. The worker blocks SIGPROF on itself, so the
//!    kernel delivers it to some other thread.
//! 2. The signal handler checks whether the interrupted thread holds the
//!    GIL. If not, nothing happens until the worker tries again; if yes,
//!    it enqueues a postponed job -- the runtime's mechanism for running
//!    code at the next safe point on the GIL-holding thread. The handler
//!    itself touches nothing else: no allocation, no locks.
//! 3. The runtime drains the job by calling
//!    [`SamplerWorker::run_postponed_job`], which consults the dynamic
//!    sampling rate and, when due, runs the thread-context collector
//!    under a supervisor that captures the first failure and stops the
//!    loop.
//!
//! GC begin/end tracepoints and allocation events also arrive here (from
//! the embedder) and are fanned into the collector, with the post-GC
//! flush deferred through the same postponed-job mechanism.
//!
//! Only one worker may be active per process: the signal handler needs a
//! process-global place to find it.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use crate::collectors::discrete_dynamic_sampler::DiscreteDynamicSampler;
use crate::collectors::dynamic_sampling_rate::DynamicSamplingRate;
use crate::collectors::thread_context::ThreadContextCollector;
use crate::config::Settings;
use crate::error::{ProfilingError, Result};
use crate::runtime::{ObjectHandle, PostponedJobKind, RuntimeHooks, ThreadHandle};
use crate::signal;

/// A single sampled allocation never stands for more events than this;
/// one long stall must not produce an absurd extrapolation.
const MAX_ALLOC_WEIGHT: usize = 65_535;

/// Minimum pause between two SIGPROF deliveries, so a missing GIL holder
/// cannot turn the trigger loop into a busy spin.
const TIME_BETWEEN_SIGNALS: Duration = Duration::from_millis(1);

/// Process-global registration of the active sampler, read by the signal
/// handler. Set and cleared only while no signals are in flight from this
/// worker; the `WorkerShared` it points to is kept alive by the
/// registration itself (a leaked `Arc` reclaimed on clear).
static ACTIVE_SAMPLER: AtomicPtr<WorkerShared> = AtomicPtr::new(std::ptr::null_mut());

/// Counters describing worker activity.
#[derive(Debug, Default, Serialize)]
pub struct WorkerStats {
    /// SIGPROF signals sent by the trigger loop.
    pub signals_sent: u64,
    /// Signals that landed on a GIL-holding thread and enqueued a job.
    pub postponed_jobs_enqueued: u64,
    /// Signals dropped because the job queue refused a new entry.
    pub postponed_jobs_dropped: u64,
    /// Signals that landed on a thread without the GIL.
    pub signals_on_non_gil_threads: u64,
    /// Sampling passes actually executed.
    pub samples_triggered: u64,
    /// Sampling passes skipped by the dynamic sampling rate.
    pub samples_skipped_by_dynamic_rate: u64,
    /// Post-GC flush samples executed.
    pub gc_flushes: u64,
    /// Allocation events sampled.
    pub allocations_sampled: u64,
}

#[derive(Default)]
struct AtomicWorkerStats {
    signals_sent: AtomicU64,
    postponed_jobs_enqueued: AtomicU64,
    postponed_jobs_dropped: AtomicU64,
    signals_on_non_gil_threads: AtomicU64,
    samples_triggered: AtomicU64,
    samples_skipped_by_dynamic_rate: AtomicU64,
    gc_flushes: AtomicU64,
    allocations_sampled: AtomicU64,
}

impl AtomicWorkerStats {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            signals_sent: self.signals_sent.load(Ordering::Relaxed),
            postponed_jobs_enqueued: self.postponed_jobs_enqueued.load(Ordering::Relaxed),
            postponed_jobs_dropped: self.postponed_jobs_dropped.load(Ordering::Relaxed),
            signals_on_non_gil_threads: self.signals_on_non_gil_threads.load(Ordering::Relaxed),
            samples_triggered: self.samples_triggered.load(Ordering::Relaxed),
            samples_skipped_by_dynamic_rate: self
                .samples_skipped_by_dynamic_rate
                .load(Ordering::Relaxed),
            gc_flushes: self.gc_flushes.load(Ordering::Relaxed),
            allocations_sampled: self.allocations_sampled.load(Ordering::Relaxed),
        }
    }
}

struct WorkerShared {
    /// Plain flag, not a synchronization point: the mutators hold the GIL
    /// and the trigger loop only ever reads it to decide whether to keep
    /// going.
    should_run: AtomicBool,
    gc_tracepoint_enabled: AtomicBool,
    /// Reentrancy guard for collector entry points; also how allocation
    /// events detect that sampling is already in progress.
    during_sample: AtomicBool,

    collector: Mutex<ThreadContextCollector>,
    hooks: RuntimeHooks,
    overhead_stack_thread: ThreadHandle,

    dynamic_sampling_rate: DynamicSamplingRate,
    allocation_sampler: Mutex<DiscreteDynamicSampler>,
    alloc_samples_enabled: bool,

    /// Allocation events that should have been sampled but could not be;
    /// flushed as one `Skipped Samples` placeholder later.
    skipped_allocations: AtomicU32,

    /// First failure captured by the supervisor; re-surfaced on stop.
    failure: Mutex<Option<ProfilingError>>,

    stop_sender: Sender<()>,
    stop_receiver: Receiver<()>,

    stats: AtomicWorkerStats,
}

/// Drives sampling: owns the trigger thread, the signal handler
/// registration and the dynamic sampling controllers.
pub struct SamplerWorker {
    shared: Arc<WorkerShared>,
    trigger_loop: Option<JoinHandle<()>>,
}

impl SamplerWorker {
    /// Build a worker around a collector. `overhead_stack_thread` is the
    /// profiler-owned thread whose stack represents profiler overhead in
    /// the output.
    pub fn new(
        settings: &Settings,
        collector: ThreadContextCollector,
        hooks: RuntimeHooks,
        overhead_stack_thread: ThreadHandle,
    ) -> Result<Self> {
        settings.validate()?;
        let (stop_sender, stop_receiver) = bounded(1);
        Ok(Self {
            shared: Arc::new(WorkerShared {
                should_run: AtomicBool::new(false),
                gc_tracepoint_enabled: AtomicBool::new(false),
                during_sample: AtomicBool::new(false),
                collector: Mutex::new(collector),
                hooks,
                overhead_stack_thread,
                dynamic_sampling_rate: DynamicSamplingRate::new(
                    settings.overhead_target_percentage,
                ),
                allocation_sampler: Mutex::new(DiscreteDynamicSampler::new("allocation")),
                alloc_samples_enabled: settings.alloc_samples_enabled,
                skipped_allocations: AtomicU32::new(0),
                failure: Mutex::new(None),
                stop_sender,
                stop_receiver,
                stats: AtomicWorkerStats::default(),
            }),
            trigger_loop: None,
        })
    }

    /// Install the signal handler, register this worker as the process
    /// sampler, subscribe to GC events and start the trigger loop.
    pub fn start(&mut self) -> Result<()> {
        if self.trigger_loop.is_some() {
            return Err(ProfilingError::invalid_config(
                "this sampler worker is already running",
            ));
        }

        // Only one sampler may be active process-wide: the signal handler
        // has exactly one global slot to find it through.
        let registration = Arc::into_raw(Arc::clone(&self.shared)) as *mut WorkerShared;
        if ACTIVE_SAMPLER
            .compare_exchange(
                std::ptr::null_mut(),
                registration,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Reclaim the Arc we just leaked.
            unsafe { drop(Arc::from_raw(registration)) };
            return Err(ProfilingError::invalid_config(
                "there's already another sampler worker active in this process",
            ));
        }

        if let Err(error) = signal::install_sigprof_signal_handler(handle_sampling_signal) {
            Self::clear_registration();
            return Err(error);
        }

        self.shared.should_run.store(true, Ordering::SeqCst);
        self.shared
            .gc_tracepoint_enabled
            .store(true, Ordering::SeqCst);
        // Drain any stale stop request from a previous run.
        while self.shared.stop_receiver.try_recv().is_ok() {}

        let shared = Arc::clone(&self.shared);
        let trigger_loop = std::thread::Builder::new()
            .name("gilscope-sampler".into())
            .spawn(move || {
                // The trigger loop must never handle its own signals.
                signal::block_sigprof_signal_handler_from_running_in_current_thread();
                run_sampling_trigger_loop(&shared);
            })
            .map_err(|error| {
                ProfilingError::sampling_fault(format!("could not spawn trigger loop: {error}"))
            });

        match trigger_loop {
            Ok(handle) => {
                self.trigger_loop = Some(handle);
                tracing::debug!("sampler worker started");
                Ok(())
            }
            Err(error) => {
                self.shared.should_run.store(false, Ordering::SeqCst);
                let _ = signal::remove_sigprof_signal_handler();
                Self::clear_registration();
                Err(error)
            }
        }
    }

    /// Stop the trigger loop, unsubscribe from GC events, remove the
    /// signal handler and clear the process registration. Returns the
    /// first failure captured during sampling, if any.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.trigger_loop.take() else {
            // Never started (or already stopped): don't touch the signal
            // handler or the registration, they may belong to another
            // worker by now.
            return self.shared.failure.lock().take().map_or(Ok(()), Err);
        };

        self.shared.should_run.store(false, Ordering::SeqCst);
        let _ = self.shared.stop_sender.try_send(());
        let _ = handle.join();

        self.shared
            .gc_tracepoint_enabled
            .store(false, Ordering::SeqCst);
        signal::remove_sigprof_signal_handler()?;
        Self::clear_registration();
        tracing::debug!("sampler worker stopped");

        self.shared.failure.lock().take().map_or(Ok(()), Err)
    }

    /// Whether this worker is the process-registered sampler and its
    /// trigger loop is alive.
    pub fn is_running(&self) -> bool {
        let registered = ACTIVE_SAMPLER.load(Ordering::Acquire);
        !registered.is_null()
            && std::ptr::eq(registered as *const WorkerShared, Arc::as_ptr(&self.shared))
            && self.trigger_loop.is_some()
    }

    /// Run a job the runtime dequeued at a safe point on the GIL-holding
    /// thread. Not reentrant; the runtime serializes postponed jobs.
    pub fn run_postponed_job(&self, kind: PostponedJobKind) {
        run_postponed_job_on(&self.shared, kind);
    }

    /// GC begin tracepoint. Must not allocate.
    pub fn on_gc_start(&self) {
        if !self.shared.gc_tracepoint_enabled.load(Ordering::Relaxed) {
            return;
        }
        self.shared.collector.lock().on_gc_start();
    }

    /// GC end tracepoint. Must not allocate; defers the flush sample to a
    /// postponed job.
    pub fn on_gc_finish(&self) {
        if !self.shared.gc_tracepoint_enabled.load(Ordering::Relaxed) {
            return;
        }
        let should_flush = self.shared.collector.lock().on_gc_finish();
        if should_flush {
            self.shared
                .hooks
                .postponed_jobs
                .enqueue(PostponedJobKind::SampleAfterGc);
        }
    }

    /// Allocation event: consult the discrete sampler and, when selected,
    /// charge a weighted allocation sample for `new_object`.
    pub fn on_allocation(&self, new_object: ObjectHandle) {
        let shared = &self.shared;
        if !shared.alloc_samples_enabled || !shared.should_run.load(Ordering::Relaxed) {
            return;
        }

        let now = shared.hooks.clocks.monotonic_wall_time_ns();
        let weight = {
            let mut sampler = shared.allocation_sampler.lock();
            if !sampler.should_sample(now) {
                return;
            }
            sampler.events_since_last_sample().min(MAX_ALLOC_WEIGHT) as u32
        };

        if shared
            .during_sample
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // A sampling pass is already on the stack (e.g. an allocation
            // made by the profiler itself); dropping the sample is the
            // only option, but the drop is kept visible. The sampler's
            // event counter is closed out so these events are not counted
            // again into the next sample's weight.
            shared
                .skipped_allocations
                .fetch_add(weight, Ordering::Relaxed);
            shared.allocation_sampler.lock().after_sample(now);
            return;
        }

        let skipped = shared.skipped_allocations.swap(0, Ordering::Relaxed);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let mut collector = shared.collector.lock();
            if skipped > 0 {
                collector.sample_skipped_allocation_samples(skipped)?;
            }
            collector.sample_allocation(weight, new_object)
        }));
        shared.during_sample.store(false, Ordering::Release);

        match flatten_supervised(result) {
            Ok(()) => {
                shared.stats.allocations_sampled.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => handle_sampling_failure(shared, error),
        }

        let after = shared.hooks.clocks.monotonic_wall_time_ns();
        shared.allocation_sampler.lock().after_sample(after);
    }

    /// Snapshot of the worker's counters.
    pub fn stats(&self) -> WorkerStats {
        self.shared.stats.snapshot()
    }

    /// The first failure captured by the supervisor, if sampling stopped.
    pub fn failure(&self) -> Option<ProfilingError> {
        self.shared.failure.lock().clone()
    }

    /// Access the collector under its lock (GIL-holding callers only).
    pub fn with_collector<T>(&self, f: impl FnOnce(&mut ThreadContextCollector) -> T) -> T {
        f(&mut self.shared.collector.lock())
    }

    fn clear_registration() {
        let previous = ACTIVE_SAMPLER.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !previous.is_null() {
            unsafe { drop(Arc::from_raw(previous as *const WorkerShared)) };
        }
    }
}

impl Drop for SamplerWorker {
    fn drop(&mut self) {
        if self.trigger_loop.is_some() {
            let _ = self.stop();
        }
    }
}

impl std::fmt::Debug for SamplerWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerWorker")
            .field("running", &self.trigger_loop.is_some())
            .field("should_run", &self.shared.should_run.load(Ordering::Relaxed))
            .field("stats", &self.shared.stats.snapshot())
            .finish()
    }
}

/// The trigger loop body. Runs on the worker's own OS thread, without the
/// GIL, and performs no runtime access whatsoever.
fn run_sampling_trigger_loop(shared: &WorkerShared) {
    while shared.should_run.load(Ordering::SeqCst) {
        let now = crate::time::monotonic_now_ns();
        let sleep_ns = shared.dynamic_sampling_rate.get_sleep(now);

        let wait = if sleep_ns > 0 {
            Duration::from_nanos(sleep_ns as u64)
        } else {
            signal::send_sigprof_to_process();
            shared.stats.signals_sent.fetch_add(1, Ordering::Relaxed);
            TIME_BETWEEN_SIGNALS
        };

        // The sleep doubles as the cancellation point.
        if shared.stop_receiver.recv_timeout(wait).is_ok() {
            break;
        }
    }
}

/// SIGPROF handler. Runs on whichever thread the kernel picked; touches
/// only the global registration, the GIL probe and the postponed-job
/// queue. No allocation, no locks.
extern "C" fn handle_sampling_signal(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    let registration = ACTIVE_SAMPLER.load(Ordering::Acquire);
    if registration.is_null() {
        return;
    }
    // Safety: the registration keeps its WorkerShared alive until cleared,
    // and it is only cleared after the trigger loop (the signal source)
    // has been joined.
    let shared = unsafe { &*registration };

    if !shared.hooks.gil.current_thread_holds_gil() {
        // Not safe to enqueue from here; the worker will try again.
        shared
            .stats
            .signals_on_non_gil_threads
            .fetch_add(1, Ordering::Relaxed);
        return;
    }

    // There are no concurrent or nested runs of this handler: the kernel
    // does not interrupt a SIGPROF handler with a second SIGPROF.
    if shared.hooks.postponed_jobs.enqueue(PostponedJobKind::Sample) {
        shared
            .stats
            .postponed_jobs_enqueued
            .fetch_add(1, Ordering::Relaxed);
    } else {
        shared
            .stats
            .postponed_jobs_dropped
            .fetch_add(1, Ordering::Relaxed);
    }
}

fn run_postponed_job_on(shared: &Arc<WorkerShared>, kind: PostponedJobKind) {
    if !shared.should_run.load(Ordering::SeqCst) {
        // The worker stopped while the job sat in the queue; nothing to do.
        return;
    }

    match kind {
        PostponedJobKind::Sample => {
            let wall_time_ns_before_sample = shared.hooks.clocks.monotonic_wall_time_ns();
            if !shared
                .dynamic_sampling_rate
                .should_sample(wall_time_ns_before_sample)
            {
                shared
                    .stats
                    .samples_skipped_by_dynamic_rate
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }

            if shared
                .during_sample
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                shared.collector.lock().sample(
                    wall_time_ns_before_sample,
                    shared.overhead_stack_thread,
                )
            }));
            shared.during_sample.store(false, Ordering::Release);

            let wall_time_ns_after_sample = shared.hooks.clocks.monotonic_wall_time_ns();
            shared.dynamic_sampling_rate.after_sample(
                wall_time_ns_after_sample,
                (wall_time_ns_after_sample - wall_time_ns_before_sample).max(0),
            );

            match flatten_supervised(result) {
                Ok(()) => {
                    shared.stats.samples_triggered.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => handle_sampling_failure(shared, error),
            }
        }
        PostponedJobKind::SampleAfterGc => {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                shared.collector.lock().sample_after_gc()
            }));
            match flatten_supervised(result) {
                Ok(()) => {
                    shared.stats.gc_flushes.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => handle_sampling_failure(shared, error),
            }
        }
    }
}

/// Collapse a `catch_unwind` around a fallible sampling call into one
/// error channel.
fn flatten_supervised(
    result: std::thread::Result<Result<()>>,
) -> Result<()> {
    match result {
        Ok(inner) => inner,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "sampling panicked".to_string());
            Err(ProfilingError::sampling_fault(message))
        }
    }
}

/// The supervisor: record the first failure and stop the sampling loop.
/// The failure is re-surfaced to the embedder by [`SamplerWorker::stop`].
fn handle_sampling_failure(shared: &WorkerShared, error: ProfilingError) {
    tracing::error!(%error, "sampling failed; stopping the sampler worker");
    let mut failure = shared.failure.lock();
    if failure.is_none() {
        *failure = Some(error);
    }
    shared.should_run.store(false, Ordering::SeqCst);
    let _ = shared.stop_sender.try_send(());
}
