//! End-to-end tests driving the full sampling pipeline -- worker-level
//! entry points, thread-context collector, stack collector, recorder and
//! pprof encoding -- against the in-memory simulated runtime.

use std::sync::Arc;

use gilscope::pprof::{self, proto};
use gilscope::runtime::sim::SimRuntime;
use gilscope::runtime::{ObjectInspector, PostponedJobKind, ValueKind};
use gilscope::{Settings, StackRecorder, ThreadContextCollector};

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.max_frames = 10;
    settings.tracer_context_key = Some("datadog_context".into());
    settings
}

fn build_pipeline(sim: &Arc<SimRuntime>) -> (Arc<StackRecorder>, ThreadContextCollector) {
    let settings = test_settings();
    let recorder = Arc::new(
        StackRecorder::new(&settings, Arc::clone(sim) as Arc<dyn ObjectInspector>)
            .expect("recorder builds"),
    );
    let collector = ThreadContextCollector::new(&settings, Arc::clone(&recorder), sim.hooks())
        .expect("collector builds");
    (recorder, collector)
}

fn serialize(recorder: &StackRecorder) -> proto::Profile {
    pprof::decode(&recorder.serialize().expect("serialize")).expect("decode")
}

fn label_str<'p>(
    profile: &'p proto::Profile,
    sample: &proto::Sample,
    key: &str,
) -> Option<&'p str> {
    let key_id = profile.string_table.iter().position(|s| s == key)? as i64;
    let label = sample.label.iter().find(|l| l.key == key_id)?;
    Some(profile.string_table[label.str as usize].as_str())
}

fn sample_filenames(profile: &proto::Profile, sample: &proto::Sample) -> Vec<String> {
    sample
        .location_id
        .iter()
        .map(|id| {
            let location = profile.location.iter().find(|l| l.id == *id).unwrap();
            let function = profile
                .function
                .iter()
                .find(|f| f.id == location.line[0].function_id)
                .unwrap();
            profile.string_table[function.filename as usize].clone()
        })
        .collect()
}

#[test]
fn test_sleeping_thread_end_to_end() {
    let sim = Arc::new(SimRuntime::new());
    let (recorder, mut collector) = build_pipeline(&sim);

    let main = sim.main_thread_handle();
    let frame = sim.runtime_frame("main_loop", "app.rb", 1);
    sim.set_stack(main, vec![frame]);

    let sleeper = sim.spawn_thread(Some("background-sleeper"));
    let sleep_frame = sim.native_frame("sleep");
    sim.set_stack(sleeper, vec![sleep_frame]);

    // First tick establishes baselines; the second charges 100ms of wall
    // time with zero cpu to the sleeper.
    collector.sample(sim.wall_time_ns(), main).unwrap();
    sim.advance_wall_time(100_000_000);
    collector.sample(sim.wall_time_ns(), main).unwrap();

    let profile = serialize(&recorder);
    let sleeper_sample = profile
        .sample
        .iter()
        .find(|s| {
            label_str(&profile, s, "thread name") == Some("background-sleeper")
                && s.value[2] == 100_000_000
        })
        .expect("sleeper sample with wall time");

    assert_eq!(label_str(&profile, sleeper_sample, "state"), Some("sleeping"));
}

#[test]
fn test_truncated_deep_stack_end_to_end() {
    let sim = Arc::new(SimRuntime::new());
    let (recorder, mut collector) = build_pipeline(&sim);

    let main = sim.main_thread_handle();
    let frames: Vec<_> = (0..15)
        .map(|i| sim.runtime_frame(&format!("level_{i}"), "deep.rb", i))
        .collect();
    sim.set_stack(main, frames);

    collector.sample(sim.wall_time_ns(), main).unwrap();

    let profile = serialize(&recorder);
    let truncated = profile
        .sample
        .iter()
        .find(|s| s.location_id.len() == 10)
        .expect("truncated sample");
    let filenames = sample_filenames(&profile, truncated);
    assert_eq!(filenames.last().map(String::as_str), Some("6 frames omitted"));
}

#[test]
fn test_serialized_sample_count_matches_recorded_work() {
    let sim = Arc::new(SimRuntime::new());
    let (recorder, mut collector) = build_pipeline(&sim);

    let main = sim.main_thread_handle();
    let frame = sim.runtime_frame("work", "app.rb", 1);
    sim.set_stack(main, vec![frame]);

    // 3 ticks, each producing one main-thread sample plus the profiler
    // overhead sample.
    for _ in 0..3 {
        sim.advance_wall_time(10_000_000);
        collector.sample(sim.wall_time_ns(), main).unwrap();
    }

    // One allocation sample whose object stays live, plus one GC flush.
    let obj = sim.new_object(ValueKind::Array, Some("Array"));
    collector.sample_allocation(10, obj).unwrap();
    sim.run_gc(1);

    collector.on_gc_start();
    sim.advance_wall_time(12_000_000);
    assert!(collector.on_gc_finish());
    collector.sample_after_gc().unwrap();

    let profile = serialize(&recorder);
    // 3 ticks * 2 samples + 1 allocation sample + 1 GC placeholder
    // + 1 heap-live snapshot entry.
    assert_eq!(profile.sample.len(), 3 * 2 + 1 + 1 + 1);
}

#[test]
fn test_endpoint_attribution_end_to_end() {
    let sim = Arc::new(SimRuntime::new());
    let (recorder, mut collector) = build_pipeline(&sim);

    let main = sim.main_thread_handle();
    let frame = sim.runtime_frame("handler", "app.rb", 7);
    sim.set_stack(main, vec![frame]);

    let root = sim.tracer_new_span(Some(42), Some("web"), None);
    let active = sim.tracer_new_span(Some(77), None, None);
    let trace = sim.tracer_new_trace(Some(root), Some(active), Some("GET /users"));
    sim.tracer_attach(main, trace);

    collector.sample(sim.wall_time_ns(), main).unwrap();

    // The endpoint is renamed mid-trace; the latest name must win for
    // every sample sharing the root span id.
    let renamed = sim.tracer_new_trace(Some(root), Some(active), Some("GET /users/:id"));
    sim.tracer_attach(main, renamed);
    sim.advance_wall_time(5_000_000);
    collector.sample(sim.wall_time_ns(), main).unwrap();

    let profile = serialize(&recorder);
    let correlated: Vec<_> = profile
        .sample
        .iter()
        .filter(|s| label_str(&profile, s, "trace endpoint").is_some())
        .collect();
    assert!(correlated.len() >= 2);
    for sample in correlated {
        assert_eq!(
            label_str(&profile, sample, "trace endpoint"),
            Some("GET /users/:id")
        );
    }
}

#[test]
fn test_worker_postponed_job_pipeline() {
    use gilscope::SamplerWorker;

    // The simulated runtime's GIL probe takes a lock, which a real signal
    // handler interrupting this thread mid-sim-call would deadlock on;
    // keep SIGPROF away from this thread like the GIL-holding runtime
    // thread never being the one that manipulates profiler internals.
    gilscope::signal::block_sigprof_signal_handler_from_running_in_current_thread();

    let sim = Arc::new(SimRuntime::new());
    let settings = test_settings();
    let recorder = Arc::new(
        StackRecorder::new(&settings, Arc::clone(&sim) as Arc<dyn ObjectInspector>).unwrap(),
    );
    let collector =
        ThreadContextCollector::new(&settings, Arc::clone(&recorder), sim.hooks()).unwrap();

    let main = sim.main_thread_handle();
    let frame = sim.runtime_frame("main_loop", "app.rb", 1);
    sim.set_stack(main, vec![frame]);

    let overhead_thread = sim.spawn_thread(Some("profiler"));
    let overhead_frame = sim.runtime_frame("trigger_sample", "profiler.rb", 9);
    sim.set_stack(overhead_thread, vec![overhead_frame]);

    let mut worker = SamplerWorker::new(&settings, collector, sim.hooks(), overhead_thread).unwrap();
    worker.start().unwrap();

    // Simulate the runtime draining a postponed Sample job on the
    // GIL-holding thread.
    worker.run_postponed_job(PostponedJobKind::Sample);
    worker.stop().unwrap();

    assert_eq!(worker.stats().samples_triggered, 1);
    let profile = serialize(&recorder);
    assert!(profile.sample.len() >= 2);
    let overhead_key = profile
        .string_table
        .iter()
        .position(|s| s == "profiler overhead");
    assert!(overhead_key.is_some(), "overhead sample was recorded");
}

#[test]
fn test_fork_reset_yields_empty_profile() {
    let sim = Arc::new(SimRuntime::new());
    let (recorder, mut collector) = build_pipeline(&sim);

    let main = sim.main_thread_handle();
    let frame = sim.runtime_frame("work", "app.rb", 1);
    sim.set_stack(main, vec![frame]);
    collector.sample(sim.wall_time_ns(), main).unwrap();

    let obj = sim.new_object(ValueKind::String, Some("String"));
    collector.sample_allocation(5, obj).unwrap();

    collector.reset_after_fork().unwrap();

    let profile = serialize(&recorder);
    assert!(profile.sample.is_empty());

    // And the pipeline still works after the reset.
    sim.advance_wall_time(1_000_000);
    collector.sample(sim.wall_time_ns(), main).unwrap();
    let profile = serialize(&recorder);
    assert!(!profile.sample.is_empty());
}

#[test]
fn test_two_window_roundtrip_law() {
    let sim = Arc::new(SimRuntime::new());
    let (recorder, mut collector) = build_pipeline(&sim);

    let main = sim.main_thread_handle();
    let frame = sim.runtime_frame("first_window", "app.rb", 1);
    sim.set_stack(main, vec![frame]);
    collector.sample(sim.wall_time_ns(), main).unwrap();

    let first = serialize(&recorder);
    assert!(!first.sample.is_empty());

    let frame = sim.runtime_frame("second_window", "app.rb", 2);
    sim.set_stack(main, vec![frame]);
    sim.advance_wall_time(1_000_000);
    collector.sample(sim.wall_time_ns(), main).unwrap();

    let second = serialize(&recorder);
    // The second window contains only second-window samples.
    assert!(second.string_table.iter().any(|s| s == "second_window"));
    assert!(!second.string_table.iter().any(|s| s == "first_window"));
}
