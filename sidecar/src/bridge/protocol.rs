//! Wire protocol between the bridge and the remote execution context.
//!
//! Every message carries a correlation id. Frames are JSON text so that the
//! two sides share nothing but the channel.
//!
//! # Message Shapes
//!
//! ```text
//! Request   { "id": 4, "type": "init" | "<task name>" | "abort", "payload": ..., "timestamp": ... }
//! Response  { "id": 4, "success": true, "data": ... }
//!           { "id": 4, "success": false, "error": "out of memory" }
//! Progress  { "id": 4, "progress": 42.0, "status": "loading", "message": "...", "loaded": ..., "total": ..., "eta": ... }
//! ```
//!
//! Progress events are told apart from terminal responses by the presence of
//! the `progress` field.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::unix_millis;

/// Message type of the handshake request.
pub const INIT_MESSAGE: &str = "init";

/// Message type of the out-of-band abort notification.
pub const ABORT_MESSAGE: &str = "abort";

// =============================================================================
// Request Id
// =============================================================================

/// Correlation id linking a request to its progress events and response.
///
/// Ids are allocated from a monotonically increasing counter owned by the
/// bridge and are never reused, so a late response can never be delivered
/// to a newer request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Creates a request id from its raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Outbound (bridge -> worker)
// =============================================================================

/// A request sent from the bridge to the worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Correlation id. For `abort`, the id of the request being aborted.
    pub id: RequestId,

    /// `"init"`, `"abort"`, or a task name.
    #[serde(rename = "type")]
    pub message_type: String,

    /// Task payload (`null` for `init` and `abort`).
    #[serde(default)]
    pub payload: Value,

    /// Send time in milliseconds since the UNIX epoch.
    pub timestamp: u64,
}

/// Borrowed view of an outbound message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind<'a> {
    /// Handshake request.
    Init,
    /// Best-effort cancellation of a running request.
    Abort,
    /// A named task.
    Task(&'a str),
}

impl OutboundMessage {
    /// Creates the handshake request.
    pub fn init(id: RequestId) -> Self {
        Self::build(id, INIT_MESSAGE, Value::Null)
    }

    /// Creates a task request.
    pub fn task(id: RequestId, task_name: &str, payload: Value) -> Self {
        Self::build(id, task_name, payload)
    }

    /// Creates an abort notification targeting `id`.
    pub fn abort(id: RequestId) -> Self {
        Self::build(id, ABORT_MESSAGE, Value::Null)
    }

    fn build(id: RequestId, message_type: &str, payload: Value) -> Self {
        Self {
            id,
            message_type: message_type.to_string(),
            payload,
            timestamp: unix_millis(),
        }
    }

    /// Classifies the message type.
    pub fn kind(&self) -> MessageKind<'_> {
        match self.message_type.as_str() {
            INIT_MESSAGE => MessageKind::Init,
            ABORT_MESSAGE => MessageKind::Abort,
            name => MessageKind::Task(name),
        }
    }

    /// Encodes the message as a JSON frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a JSON frame.
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

// =============================================================================
// Inbound (worker -> bridge)
// =============================================================================

/// Terminal outcome of a request. Exactly one is expected per id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: RequestId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResponse {
    /// Creates a success response.
    pub fn ok(id: RequestId, data: Value) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Creates a failure response.
    pub fn failed(id: RequestId, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Intermediate progress for a request. Zero or more precede the response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: RequestId,
    /// Percentage in `0.0..=100.0`.
    pub progress: f32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    /// Bytes transferred so far, for download-style stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded: Option<u64>,
    /// Total bytes expected, for download-style stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Estimated seconds remaining.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
}

impl ProgressEvent {
    /// Creates a progress event, clamping `progress` into `0..=100`.
    pub fn new(
        id: RequestId,
        progress: f32,
        status: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id,
            progress: progress.clamp(0.0, 100.0),
            status: status.into(),
            message: message.into(),
            loaded: None,
            total: None,
            eta: None,
        }
    }

    /// Attaches byte counters.
    pub fn with_bytes(mut self, loaded: u64, total: u64) -> Self {
        self.loaded = Some(loaded);
        self.total = Some(total);
        self
    }

    /// Attaches an estimated time remaining.
    pub fn with_eta(mut self, eta_secs: f64) -> Self {
        self.eta = Some(eta_secs);
        self
    }
}

/// Any message received from the worker.
///
/// `Progress` is listed first: untagged decoding tries variants in order
/// and only progress events carry a `progress` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    Progress(ProgressEvent),
    Response(TaskResponse),
}

impl InboundMessage {
    /// Returns the correlation id.
    pub fn id(&self) -> RequestId {
        match self {
            Self::Progress(event) => event.id,
            Self::Response(response) => response.id,
        }
    }

    /// Encodes the message as a JSON frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a JSON frame.
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

impl From<ProgressEvent> for InboundMessage {
    fn from(event: ProgressEvent) -> Self {
        Self::Progress(event)
    }
}

impl From<TaskResponse> for InboundMessage {
    fn from(response: TaskResponse) -> Self {
        Self::Response(response)
    }
}
