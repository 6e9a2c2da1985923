//! Turns a runtime thread's frame chain into recorded samples.
//!
//! Frames come out of the walker newest-first. Building locations walks
//! them oldest-first instead, because native frames carry no path/line of
//! their own: by convention they inherit the filename and line of the
//! nearest runtime frame below them, which is easiest to track in that
//! direction.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::check_max_frames;
use crate::error::{ProfilingError, Result};
use crate::pprof::Location;
use crate::recorder::{SampleLabels, SampleValues, StackRecorder};
use crate::runtime::{FrameKind, FrameRecord, FrameWalk, FrameWalker, MethodRef, ThreadHandle};

/// Filename of the placeholder frame recorded for alive threads with no
/// introspectable stack.
pub const IN_NATIVE_CODE_PLACEHOLDER: &str = "In native code";

/// Wait states the collector can attach to an only-wall-time sample.
pub mod state {
    /// Nothing was inferred about the thread's wait.
    pub const UNKNOWN: &str = "unknown";
    /// The thread consumed cpu during the sampled period.
    pub const HAD_CPU: &str = "had cpu";
    /// Blocked in a timed sleep.
    pub const SLEEPING: &str = "sleeping";
    /// Waiting on a select/queue-style wakeup.
    pub const WAITING: &str = "waiting";
    /// Blocked acquiring a lock or joining a thread.
    pub const BLOCKED: &str = "blocked";
    /// Waiting for a socket to become readable.
    pub const NETWORK: &str = "network";
}

/// Source filename of the runtime's internal queue implementation; a
/// runtime-level `pop` from here means the thread is waiting on a queue.
const THREAD_SYNC_INTERNAL_FILE: &str = "<internal:thread_sync>";

/// Scratch space reused across samples of one thread.
///
/// Holds the frame capture buffer and the location array handed to the
/// recorder, both sized to `max_frames` exactly once so the sampling path
/// itself performs no buffer growth.
#[derive(Debug)]
pub struct SamplingBuffer {
    max_frames: usize,
    frames: Vec<FrameRecord>,
    locations: Vec<Location>,
}

impl SamplingBuffer {
    /// Build a buffer for at most `max_frames` frames per sample.
    pub fn new(max_frames: u16) -> Result<Self> {
        let max_frames = check_max_frames(max_frames)? as usize;
        let filler = FrameRecord {
            kind: FrameKind::Native {
                method: MethodRef(0),
            },
            same_frame: false,
        };
        Ok(Self {
            max_frames,
            frames: vec![filler; max_frames],
            locations: Vec::with_capacity(max_frames),
        })
    }

    /// The buffer's frame capacity.
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }
}

/// Sample one thread's stack into the recorder.
///
/// Expects the GIL to be held. `labels` is mutable so the designated state
/// slot can be overwritten with a wait-state classification. Recorder
/// errors are fatal to the sampling pass and surface to the caller.
pub fn sample_thread(
    thread: ThreadHandle,
    buffer: &mut SamplingBuffer,
    recorder: &StackRecorder,
    walker: &dyn FrameWalker,
    values: &SampleValues,
    labels: &mut SampleLabels,
) -> Result<()> {
    let captured = match walker.walk(thread, 0, &mut buffer.frames) {
        FrameWalk::InNativeCode => {
            return record_placeholder_stack(recorder, values, labels, IN_NATIVE_CODE_PLACEHOLDER);
        }
        FrameWalk::Frames(captured) => captured.min(buffer.max_frames),
    };

    let cpu_or_wall_sample = values.cpu_or_wall_samples > 0;
    let has_cpu_time = cpu_or_wall_sample && values.cpu_time_ns > 0;
    let only_wall_time =
        cpu_or_wall_sample && values.cpu_time_ns == 0 && values.wall_time_ns > 0;

    if cpu_or_wall_sample && labels.state_label.is_none() {
        return Err(ProfilingError::InvariantViolated(
            "unexpected missing state label on cpu/wall sample".into(),
        ));
    }

    if has_cpu_time {
        labels.set_state(state::HAD_CPU);
    }

    buffer.locations.clear();
    buffer.locations.resize(
        captured,
        Location::new(Arc::from(""), Arc::from(""), 0),
    );

    // Runtime frames update these as we go so native frames above them can
    // inherit a useful position.
    let mut last_runtime_filename: Arc<str> = Arc::from("");
    let mut last_runtime_line: i32 = 0;

    for i in (0..captured).rev() {
        let (name, filename, line, is_runtime_frame) = match buffer.frames[i].kind {
            FrameKind::Runtime { code, line } => {
                let info = walker.code_info(code);
                last_runtime_filename = Arc::clone(&info.filename);
                last_runtime_line = line;
                (info.name, info.filename, line, true)
            }
            FrameKind::Native { method } => (
                walker.method_name(method),
                Arc::clone(&last_runtime_filename),
                last_runtime_line,
                false,
            ),
        };

        let name = maybe_trim_template_random_ids(name, &filename);

        let top_of_the_stack = i == 0;

        // A sample with wall-time but no cpu-time means the thread sat
        // waiting for the whole period; the top of the stack is a rough
        // but useful hint for what it was waiting on.
        if top_of_the_stack && only_wall_time {
            if !is_runtime_frame {
                // These names are known to be implemented natively; a
                // same-named method in a runtime frame is probably an
                // unrelated user method and is ignored.
                match name.as_ref() {
                    "sleep" => labels.set_state(state::SLEEPING),
                    "select" => labels.set_state(state::WAITING),
                    "synchronize" | "lock" | "join" => labels.set_state(state::BLOCKED),
                    "wait_readable" => labels.set_state(state::NETWORK),
                    _ => {}
                }
            } else if name.as_ref() == "pop" && filename.as_ref() == THREAD_SYNC_INTERNAL_FILE {
                labels.set_state(state::WAITING);
            }
        }

        buffer.locations[i] = Location::new(name, filename, line);
    }

    // A full buffer may mean frames were dropped; if so, the bottom
    // location is replaced with a placeholder reporting how many.
    if captured == buffer.max_frames {
        maybe_add_placeholder_frames_omitted(thread, buffer, walker);
    }

    recorder.record_sample(&buffer.locations[..captured], values, labels)
}

/// Record a sample whose stack is a single synthetic frame carrying
/// `placeholder_text` as its filename. Used for GC, native-code and
/// skipped-samples events.
pub fn record_placeholder_stack(
    recorder: &StackRecorder,
    values: &SampleValues,
    labels: &SampleLabels,
    placeholder_text: &str,
) -> Result<()> {
    let placeholder_location = Location::new(Arc::from(""), Arc::from(placeholder_text), 0);
    recorder.record_sample(std::slice::from_ref(&placeholder_location), values, labels)
}

fn maybe_add_placeholder_frames_omitted(
    thread: ThreadHandle,
    buffer: &mut SamplingBuffer,
    walker: &dyn FrameWalker,
) {
    let true_depth = walker.stack_depth(thread);
    let mut frames_omitted = true_depth.saturating_sub(buffer.max_frames);

    if frames_omitted == 0 {
        // Perfect fit.
        return;
    }

    // The placeholder itself takes over a slot, so one more real frame is
    // lost than the depth difference alone suggests.
    frames_omitted += 1;

    buffer.locations[buffer.max_frames - 1] = Location::new(
        Arc::from(""),
        Arc::from(format!("{frames_omitted} frames omitted").as_str()),
        0,
    );
}

/// Suffix pattern of template-engine-generated method names: a hash and an
/// id joined by underscores, with either two or three leading underscores.
fn template_suffix_regex() -> &'static Regex {
    static TEMPLATE_SUFFIX: OnceLock<Regex> = OnceLock::new();
    TEMPLATE_SUFFIX.get_or_init(|| {
        Regex::new(r"___?[0-9]+_[0-9]+$").expect("template suffix pattern compiles")
    })
}

/// Trim template-engine id suffixes from generated method names.
///
/// Template engines generate method names that are unique per template
/// compilation (e.g. `_app_views_layouts_explore_html_haml__2304485752546535910_211320`),
/// which poisons aggregation across processes and deploys. Filenames with
/// the runtime source suffix (`.rb`) are exempt: those are user methods
/// that merely look similar. Names longer than 1024 bytes are left alone.
fn maybe_trim_template_random_ids(name: Arc<str>, filename: &str) -> Arc<str> {
    if filename.len() < 3 || filename.ends_with(".rb") {
        return name;
    }
    if name.len() > 1024 {
        return name;
    }

    if let Some(matched) = template_suffix_regex().find(name.as_ref()) {
        // Something must remain before the suffix for the trim to apply.
        if matched.start() > 0 {
            return Arc::from(&name[..matched.start()]);
        }
    }

    name
}
