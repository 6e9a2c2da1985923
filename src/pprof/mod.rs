//! In-memory pprof profile building and encoding.
//!
//! This module is the recorder's serialization backend: it owns the string
//! table, function/location deduplication, the per-window sample list and
//! the span-id → endpoint map, and turns a profile window into a gzipped
//! `perftools.profiles.Profile` byte stream.
//!
//! Samples are kept in commit order and never merged, so the encoded
//! profile's sample count always equals the number of successful
//! `add_sample` calls in the window.

pub mod proto;

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use prost::Message;

use crate::error::{ProfilingError, Result};

/// Label key carrying the trace root-span correlation id.
pub const LOCAL_ROOT_SPAN_ID_LABEL: &str = "local root span id";

/// Label key the endpoint map writes at encode time.
pub const TRACE_ENDPOINT_LABEL: &str = "trace endpoint";

/// Label key carrying the timeline timestamp of a sample.
const END_TIMESTAMP_LABEL: &str = "end_timestamp_ns";

/// A resolved stack frame as recorded into a profile: function name,
/// source file and line. Identity is by content; an empty mapping is
/// implied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Function or block name. May be empty for placeholder frames.
    pub name: Arc<str>,
    /// Source file path, or the placeholder text for synthetic frames.
    pub filename: Arc<str>,
    /// Line number; 0 when not applicable.
    pub line: i32,
}

impl Location {
    /// Convenience constructor used all over the collectors.
    pub fn new(name: Arc<str>, filename: Arc<str>, line: i32) -> Self {
        Self {
            name,
            filename,
            line,
        }
    }
}

/// The value attached to a [`Label`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelValue {
    /// A short byte-string value.
    Str(Arc<str>),
    /// A 64-bit numeric value.
    Num(u64),
}

/// A (key, value) pair attached to a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    /// Label key.
    pub key: Arc<str>,
    /// String or numeric value.
    pub value: LabelValue,
}

impl Label {
    /// A string-valued label.
    pub fn str(key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) -> Self {
        Self {
            key: key.into(),
            value: LabelValue::Str(value.into()),
        }
    }

    /// A numeric label.
    pub fn num(key: impl Into<Arc<str>>, value: u64) -> Self {
        Self {
            key: key.into(),
            value: LabelValue::Num(value),
        }
    }
}

/// The encoded result of serializing one profile window.
#[derive(Debug, Clone)]
pub struct EncodedProfile {
    /// Window start, nanoseconds since the epoch.
    pub start_ns: i64,
    /// Window finish, nanoseconds since the epoch.
    pub finish_ns: i64,
    /// Gzip-compressed `perftools.profiles.Profile` bytes.
    pub bytes: Vec<u8>,
}

/// One profile window under construction.
///
/// Strings are interned on first use; functions and locations dedupe by
/// content. [`ProfileWindow::reset`] drops everything except the value-type
/// schema, which is fixed for the recorder's lifetime.
pub struct ProfileWindow {
    sample_types: Vec<(&'static str, &'static str)>,
    start_time_ns: i64,
    strings: Vec<String>,
    string_index: HashMap<String, i64>,
    functions: Vec<proto::Function>,
    function_index: HashMap<(i64, i64), u64>,
    locations: Vec<proto::Location>,
    location_index: HashMap<(u64, i64), u64>,
    samples: Vec<proto::Sample>,
    endpoints: HashMap<u64, String>,
}

impl ProfileWindow {
    /// Create a window for the given (type, unit) schema.
    pub fn new(sample_types: Vec<(&'static str, &'static str)>, start_time_ns: i64) -> Self {
        let mut window = Self {
            sample_types,
            start_time_ns,
            strings: Vec::new(),
            string_index: HashMap::new(),
            functions: Vec::new(),
            function_index: HashMap::new(),
            locations: Vec::new(),
            location_index: HashMap::new(),
            samples: Vec::new(),
            endpoints: HashMap::new(),
        };
        // string_table[0] must always be "".
        window.intern("");
        window
    }

    fn intern(&mut self, value: &str) -> i64 {
        if let Some(id) = self.string_index.get(value) {
            return *id;
        }
        let id = self.strings.len() as i64;
        self.strings.push(value.to_string());
        self.string_index.insert(value.to_string(), id);
        id
    }

    fn function_id(&mut self, name: &str, filename: &str) -> u64 {
        let name_id = self.intern(name);
        let filename_id = self.intern(filename);
        if let Some(id) = self.function_index.get(&(name_id, filename_id)) {
            return *id;
        }
        let id = self.functions.len() as u64 + 1;
        self.functions.push(proto::Function {
            id,
            name: name_id,
            system_name: name_id,
            filename: filename_id,
            start_line: 0,
        });
        self.function_index.insert((name_id, filename_id), id);
        id
    }

    fn location_id(&mut self, location: &Location) -> u64 {
        let function_id = self.function_id(&location.name, &location.filename);
        let key = (function_id, location.line as i64);
        if let Some(id) = self.location_index.get(&key) {
            return *id;
        }
        let id = self.locations.len() as u64 + 1;
        self.locations.push(proto::Location {
            id,
            mapping_id: 0,
            address: 0,
            line: vec![proto::Line {
                function_id,
                line: location.line as i64,
            }],
        });
        self.location_index.insert(key, id);
        id
    }

    /// Append a sample. `values` must already be packed to the enabled
    /// schema length; `end_timestamp_ns` of 0 means "no timeline event".
    pub fn add_sample(
        &mut self,
        locations: &[Location],
        values: &[i64],
        labels: &[Label],
        end_timestamp_ns: i64,
    ) -> Result<()> {
        if values.len() != self.sample_types.len() {
            return Err(ProfilingError::SerializeError(format!(
                "sample has {} values but profile records {} value types",
                values.len(),
                self.sample_types.len()
            )));
        }

        let location_ids = locations
            .iter()
            .map(|location| self.location_id(location))
            .collect();

        let mut proto_labels = Vec::with_capacity(labels.len() + 1);
        for label in labels {
            let key = self.intern(&label.key);
            proto_labels.push(match &label.value {
                LabelValue::Str(value) => {
                    let value = self.intern(value);
                    proto::Label {
                        key,
                        str: value,
                        num: 0,
                        num_unit: 0,
                    }
                }
                LabelValue::Num(value) => proto::Label {
                    key,
                    str: 0,
                    num: *value as i64,
                    num_unit: 0,
                },
            });
        }

        if end_timestamp_ns != 0 {
            let key = self.intern(END_TIMESTAMP_LABEL);
            proto_labels.push(proto::Label {
                key,
                str: 0,
                num: end_timestamp_ns,
                num_unit: 0,
            });
        }

        self.samples.push(proto::Sample {
            location_id: location_ids,
            value: values.to_vec(),
            label: proto_labels,
        });

        Ok(())
    }

    /// Remember the latest endpoint seen for a local root span id. Applied
    /// to every matching sample at encode time.
    pub fn set_endpoint(&mut self, local_root_span_id: u64, endpoint: &str) {
        self.endpoints
            .insert(local_root_span_id, endpoint.to_string());
    }

    /// Number of samples committed to this window so far.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Window start timestamp (ns since epoch).
    pub fn start_time_ns(&self) -> i64 {
        self.start_time_ns
    }

    /// Drop all recorded data and start a new window at `start_time_ns`.
    pub fn reset(&mut self, start_time_ns: i64) {
        let sample_types = std::mem::take(&mut self.sample_types);
        *self = ProfileWindow::new(sample_types, start_time_ns);
    }

    /// Encode this window as a gzipped pprof byte stream.
    ///
    /// Endpoint labels are attached here: any sample carrying a
    /// `local root span id` label whose id has a recorded endpoint gains a
    /// `trace endpoint` label with the most recently seen value.
    pub fn encode(&mut self, finish_time_ns: i64) -> Result<EncodedProfile> {
        self.apply_endpoints();

        let sample_type = self
            .sample_types
            .clone()
            .into_iter()
            .map(|(type_, unit)| proto::ValueType {
                r#type: self.intern(type_),
                unit: self.intern(unit),
            })
            .collect();

        let profile = proto::Profile {
            sample_type,
            sample: self.samples.clone(),
            mapping: Vec::new(),
            location: self.locations.clone(),
            function: self.functions.clone(),
            string_table: self.strings.clone(),
            time_nanos: self.start_time_ns,
            duration_nanos: (finish_time_ns - self.start_time_ns).max(0),
            period_type: None,
            period: 0,
        };

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(&profile.encode_to_vec())
            .and_then(|_| encoder.finish())
            .map(|bytes| EncodedProfile {
                start_ns: self.start_time_ns,
                finish_ns: finish_time_ns,
                bytes,
            })
            .map_err(|error| ProfilingError::SerializeError(error.to_string()))
    }

    fn apply_endpoints(&mut self) {
        if self.endpoints.is_empty() {
            return;
        }
        let Some(span_id_key) = self.string_index.get(LOCAL_ROOT_SPAN_ID_LABEL).copied() else {
            // No sample ever carried a span id label; nothing to attach.
            return;
        };
        let endpoint_key = self.intern(TRACE_ENDPOINT_LABEL);

        let endpoints = std::mem::take(&mut self.endpoints);
        let mut endpoint_string_ids: HashMap<u64, i64> = HashMap::new();
        for (span_id, endpoint) in &endpoints {
            let id = self.intern(endpoint);
            endpoint_string_ids.insert(*span_id, id);
        }

        for sample in &mut self.samples {
            let span_id = sample
                .label
                .iter()
                .find(|label| label.key == span_id_key)
                .map(|label| label.num as u64);
            let Some(span_id) = span_id else { continue };
            if let Some(endpoint_string) = endpoint_string_ids.get(&span_id) {
                sample.label.push(proto::Label {
                    key: endpoint_key,
                    str: *endpoint_string,
                    num: 0,
                    num_unit: 0,
                });
            }
        }
    }
}

impl std::fmt::Debug for ProfileWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileWindow")
            .field("samples", &self.samples.len())
            .field("locations", &self.locations.len())
            .field("functions", &self.functions.len())
            .field("strings", &self.strings.len())
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

/// Decode helper used by tests: ungzip + parse an encoded profile.
pub fn decode(encoded: &EncodedProfile) -> Result<proto::Profile> {
    use std::io::Read;

    let mut decoder = flate2::read::GzDecoder::new(encoded.bytes.as_slice());
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|error| ProfilingError::SerializeError(error.to_string()))?;
    proto::Profile::decode(raw.as_slice())
        .map_err(|error| ProfilingError::SerializeError(error.to_string()))
}
