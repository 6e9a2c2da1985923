//! GC time attribution: begin/end transitions accumulate cpu/wall time,
//! coalesce into periodic `Garbage Collection` placeholder samples, and
//! never double-charge the same interval to regular samples.

use std::sync::Arc;

use gilscope::pprof::{self, proto};
use gilscope::runtime::sim::SimRuntime;
use gilscope::runtime::ObjectInspector;
use gilscope::{Settings, StackRecorder, ThreadContextCollector};

fn build_pipeline(sim: &Arc<SimRuntime>) -> (Arc<StackRecorder>, ThreadContextCollector) {
    let mut settings = Settings::default();
    settings.max_frames = 10;
    let recorder = Arc::new(
        StackRecorder::new(&settings, Arc::clone(sim) as Arc<dyn ObjectInspector>).unwrap(),
    );
    let collector =
        ThreadContextCollector::new(&settings, Arc::clone(&recorder), sim.hooks()).unwrap();
    (recorder, collector)
}

fn serialize(recorder: &StackRecorder) -> proto::Profile {
    pprof::decode(&recorder.serialize().unwrap()).unwrap()
}

fn gc_placeholder_samples<'p>(profile: &'p proto::Profile) -> Vec<&'p proto::Sample> {
    profile
        .sample
        .iter()
        .filter(|s| {
            s.location_id.len() == 1
                && profile
                    .location
                    .iter()
                    .find(|l| l.id == s.location_id[0])
                    .and_then(|l| {
                        profile
                            .function
                            .iter()
                            .find(|f| f.id == l.line[0].function_id)
                    })
                    .map(|f| profile.string_table[f.filename as usize] == "Garbage Collection")
                    .unwrap_or(false)
        })
        .collect()
}

fn prime_main_thread(sim: &Arc<SimRuntime>, collector: &mut ThreadContextCollector) {
    let main = sim.main_thread_handle();
    let frame = sim.runtime_frame("main_loop", "app.rb", 1);
    sim.set_stack(main, vec![frame]);
    collector.sample(sim.wall_time_ns(), main).unwrap();
}

#[test]
fn test_fifty_small_gc_steps_coalesce() {
    let sim = Arc::new(SimRuntime::new());
    let (recorder, mut collector) = build_pipeline(&sim);
    prime_main_thread(&sim, &mut collector);
    let main = sim.main_thread_handle();

    // 50 consecutive 1ms GC steps. Without coalescing this would emit 50
    // events; the 10ms flush threshold keeps it to a handful, and the
    // flushed wall times must add up to the full 50ms.
    let mut flushes = 0;
    for _ in 0..50 {
        collector.on_gc_start();
        sim.advance_wall_time(1_000_000);
        sim.advance_cpu_time(main, 400_000);
        if collector.on_gc_finish() {
            collector.sample_after_gc().unwrap();
            flushes += 1;
        }
    }
    // Flush whatever is still accumulated so the sum below is complete.
    if collector.gc_tracking().wall_time_at_previous_gc_ns != gilscope::time::INVALID_TIME {
        collector.sample_after_gc().unwrap();
        flushes += 1;
    }

    assert!(flushes < 50, "coalescing collapsed the events: {flushes}");

    let profile = serialize(&recorder);
    let gc_samples = gc_placeholder_samples(&profile);
    assert_eq!(gc_samples.len(), flushes);

    let total_gc_wall: i64 = gc_samples.iter().map(|s| s.value[2]).sum();
    let total_gc_cpu: i64 = gc_samples.iter().map(|s| s.value[0]).sum();
    assert_eq!(total_gc_wall, 50 * 1_000_000);
    assert_eq!(total_gc_cpu, 50 * 400_000);
}

#[test]
fn test_regular_samples_do_not_recharge_gc_cpu_time() {
    let sim = Arc::new(SimRuntime::new());
    let (recorder, mut collector) = build_pipeline(&sim);
    prime_main_thread(&sim, &mut collector);
    let main = sim.main_thread_handle();

    // 20ms of GC on the main thread, all of its cpu time included.
    collector.on_gc_start();
    sim.advance_wall_time(20_000_000);
    sim.advance_cpu_time(main, 20_000_000);
    assert!(collector.on_gc_finish());
    collector.sample_after_gc().unwrap();

    // The next regular tick must charge zero cpu to the thread itself.
    collector.sample(sim.wall_time_ns(), main).unwrap();

    let profile = serialize(&recorder);
    let gc_samples = gc_placeholder_samples(&profile);
    assert_eq!(gc_samples.len(), 1);
    assert_eq!(gc_samples[0].value[0], 20_000_000);

    // All cpu time in the window belongs to the GC placeholder: summing
    // over every sample yields exactly the GC cpu time.
    let total_cpu: i64 = profile.sample.iter().map(|s| s.value[0]).sum();
    assert_eq!(total_cpu, 20_000_000);
}

#[test]
fn test_gc_placeholder_carries_metadata_labels() {
    let sim = Arc::new(SimRuntime::new());
    let (recorder, mut collector) = build_pipeline(&sim);
    prime_main_thread(&sim, &mut collector);
    sim.set_gc_metadata(vec![("gc cause", "object allocation"), ("gc type", "minor")]);

    collector.on_gc_start();
    sim.advance_wall_time(12_000_000);
    assert!(collector.on_gc_finish());
    collector.sample_after_gc().unwrap();

    let profile = serialize(&recorder);
    let gc_sample = gc_placeholder_samples(&profile)[0];

    let cause_key = profile
        .string_table
        .iter()
        .position(|s| s == "gc cause")
        .expect("metadata label key interned") as i64;
    let cause = gc_sample
        .label
        .iter()
        .find(|l| l.key == cause_key)
        .expect("metadata label attached");
    assert_eq!(
        profile.string_table[cause.str as usize],
        "object allocation"
    );
}

#[test]
fn test_gc_wall_time_does_not_reduce_regular_wall_time() {
    let sim = Arc::new(SimRuntime::new());
    let (recorder, mut collector) = build_pipeline(&sim);
    prime_main_thread(&sim, &mut collector);
    let main = sim.main_thread_handle();

    collector.on_gc_start();
    sim.advance_wall_time(30_000_000);
    assert!(collector.on_gc_finish());
    collector.sample_after_gc().unwrap();

    sim.advance_wall_time(30_000_000);
    collector.sample(sim.wall_time_ns(), main).unwrap();

    let profile = serialize(&recorder);
    // The regular sample sees the full 60ms of wall time: GC does not
    // steal wall time from threads, only cpu time.
    let full_window = profile
        .sample
        .iter()
        .find(|s| s.value[2] == 60_000_000);
    assert!(full_window.is_some());
}
