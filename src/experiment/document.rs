//! Run documents
//!
//! Bluesky-style documents describing one flyscan for the run catalog:
//!
//! ```text
//! StartDoc (1, metadata incl. file paths and link templates)
//!    │
//!    ├── DescriptorDoc (1, "primary" stream)
//!    │       └── EventDoc (one per path point)
//!    │
//!    ├── ResourceDoc (1 per detector file)
//!    │       └── DatumDoc (one per frame, datum_id = {resource}/{point_number})
//!    │
//! StopDoc (1)
//! ```
//!
//! Documents are published on a [`DocumentBus`]; the catalog itself is an
//! external subscriber.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::experiment::metadata::RunMetadata;
use crate::hardware::capabilities::FrameRecord;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Document types for a flyscan run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Run start - intent and metadata
    Start(StartDoc),
    /// Data stream descriptor
    Descriptor(DescriptorDoc),
    /// One path point
    Event(EventDoc),
    /// One external file
    Resource(ResourceDoc),
    /// One frame inside an external file
    Datum(DatumDoc),
    /// Run stop - completion status
    Stop(StopDoc),
}

impl Document {
    /// Get the run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.run_uid,
            Document::Event(d) => &d.run_uid,
            Document::Resource(d) => &d.run_uid,
            Document::Datum(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }

    /// Document kind as a short string
    pub fn kind(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Event(_) => "event",
            Document::Resource(_) => "resource",
            Document::Datum(_) => "datum",
            Document::Stop(_) => "stop",
        }
    }
}

/// Start document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    /// Plan that generated this run
    pub plan_name: String,
    /// Scan number
    pub scan_id: u64,
    /// Merged run metadata
    pub metadata: RunMetadata,
    /// Timestamp when run started
    pub time_ns: u64,
}

impl StartDoc {
    /// Start a run
    pub fn new(plan_name: &str, scan_id: u64, metadata: RunMetadata) -> Self {
        Self {
            uid: new_uid(),
            plan_name: plan_name.to_string(),
            scan_id,
            metadata,
            time_ns: now_ns(),
        }
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type: "number", "integer", "string"
    pub dtype: String,
    /// Source device or channel
    pub source: String,
    /// Data lives in an external file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
}

impl DataKey {
    /// Scalar number read from `source`
    pub fn scalar(source: &str) -> Self {
        Self {
            dtype: "number".to_string(),
            source: source.to_string(),
            external: None,
        }
    }

    /// Frames stored in a file
    pub fn external(source: &str) -> Self {
        Self {
            dtype: "array".to_string(),
            source: source.to_string(),
            external: Some("FILESTORE:".to_string()),
        }
    }
}

/// Descriptor document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique id
    pub uid: String,
    /// Start document this belongs to
    pub run_uid: String,
    /// Stream name
    pub name: String,
    /// Fields recorded in this stream
    pub data_keys: BTreeMap<String, DataKey>,
    /// Creation time, ns since the epoch
    pub time_ns: u64,
}

impl DescriptorDoc {
    /// Descriptor of stream `name`
    pub fn new(run_uid: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            name: name.to_string(),
            data_keys: BTreeMap::new(),
            time_ns: now_ns(),
        }
    }

    /// Add a field
    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }
}

/// Event document: one path point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique id
    pub uid: String,
    /// Start document this belongs to
    pub run_uid: String,
    /// Descriptor this event belongs to
    pub descriptor_uid: String,
    /// Sequence number, starting at 1
    pub seq_num: u64,
    /// Creation time, ns since the epoch
    pub time_ns: u64,
    /// Scalar readings
    pub data: BTreeMap<String, f64>,
    /// Motor positions at this point
    pub positions: BTreeMap<String, f64>,
}

impl EventDoc {
    /// Event number `seq_num`
    pub fn new(run_uid: &str, descriptor_uid: &str, seq_num: u64) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num,
            time_ns: now_ns(),
            data: BTreeMap::new(),
            positions: BTreeMap::new(),
        }
    }

    /// Record a scalar reading
    pub fn with_datum(mut self, field: &str, value: f64) -> Self {
        self.data.insert(field.to_string(), value);
        self
    }

    /// Record a motor position
    pub fn with_position(mut self, axis: &str, position: f64) -> Self {
        self.positions.insert(axis.to_string(), position);
        self
    }
}

/// Resource document: one file written by one detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDoc {
    /// Unique id
    pub uid: String,
    /// Start document this belongs to
    pub run_uid: String,
    /// Detector that writes the file
    pub device: String,
    /// File format handler, e.g. "AD_HDF5"
    pub spec: String,
    /// Data root the path is relative to
    pub root: String,
    /// File path relative to `root`
    pub resource_path: String,
}

/// Datum document: one frame inside a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatumDoc {
    /// `{resource}/{point_number}`
    pub datum_id: String,
    /// Resource uid
    pub resource: String,
    /// Start document this belongs to
    pub run_uid: String,
    /// Frame location inside the file (`point_number`)
    pub datum_kwargs: BTreeMap<String, serde_json::Value>,
}

impl DatumDoc {
    /// Datum for a frame of `resource`
    pub fn from_frame(run_uid: &str, resource: &str, frame: &FrameRecord) -> Self {
        Self {
            datum_id: format!("{}/{}", resource, frame.point_number),
            resource: resource.to_string(),
            run_uid: run_uid.to_string(),
            datum_kwargs: frame.extra.clone(),
        }
    }
}

/// Stop document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique id
    pub uid: String,
    /// Start document this belongs to
    pub run_uid: String,
    /// Exit status: "success", "abort", "fail"
    pub exit_status: String,
    /// Reason for abort/failure
    pub reason: String,
    /// Creation time, ns since the epoch
    pub time_ns: u64,
    /// Events emitted in the primary stream
    pub num_events: u64,
}

impl StopDoc {
    fn with_status(run_uid: &str, status: &str, reason: &str, num_events: u64) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: status.to_string(),
            reason: reason.to_string(),
            time_ns: now_ns(),
            num_events,
        }
    }

    /// Run finished normally
    pub fn success(run_uid: &str, num_events: u64) -> Self {
        Self::with_status(run_uid, "success", "", num_events)
    }

    /// Run aborted with `reason`
    pub fn abort(run_uid: &str, reason: &str, num_events: u64) -> Self {
        Self::with_status(run_uid, "abort", reason, num_events)
    }

    /// Run failed with `reason`
    pub fn fail(run_uid: &str, reason: &str, num_events: u64) -> Self {
        Self::with_status(run_uid, "fail", reason, num_events)
    }
}

/// Fan-out of run documents to any number of subscribers
#[derive(Debug, Clone)]
pub struct DocumentBus {
    tx: broadcast::Sender<Document>,
}

impl Default for DocumentBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl DocumentBus {
    /// Bus buffering up to `capacity` documents per slow subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a document; having no subscribers is not an error
    pub fn emit(&self, doc: Document) {
        let _ = self.tx.send(doc);
    }

    /// Receive documents emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.tx.subscribe()
    }
}
