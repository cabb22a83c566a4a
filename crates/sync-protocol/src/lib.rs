// sync-protocol: wire envelopes, event grammar, and frame codec.
//
// Every protocol message is one UTF-8 text frame holding a single JSON
// object `{"type": "...", "data": ...}`.  Event types are namespaced by the
// registration key of the unit they belong to, e.g. `NOTES:SET` or
// `NOTES:ACTION:RENAME`.  A few event types are paired with the next binary
// frame on the same transport; the envelope then carries the metadata and
// the binary frame carries the payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One transport frame: either a text frame (an encoded [`Envelope`]) or a
/// binary frame belonging to the preceding `BIN_META` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The `{type, data}` record carried in one text frame.
///
/// `data` is absent on the wire for events that carry none (`GET`,
/// `TASK_CANCEL`); it deserializes to `Value::Null` in that case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Codec failures when turning text frames into envelopes and back.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object with a string `type` field")]
    NotAnEnvelope,
}

/// Serialize an envelope into the text-frame payload.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Parse a text-frame payload into an envelope.
///
/// The frame must be a single JSON object with a string `type`; anything
/// else is a protocol error at the session layer.
pub fn decode(text: &str) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(ref obj) = value else {
        return Err(CodecError::NotAnEnvelope);
    };
    if !obj.get("type").is_some_and(Value::is_string) {
        return Err(CodecError::NotAnEnvelope);
    }
    Ok(serde_json::from_value(value)?)
}

// ---------------------------------------------------------------------------
// Registration keys
// ---------------------------------------------------------------------------

/// Reject registration keys that don't fit the wire grammar.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("registration key must not be empty")]
    Empty,
    #[error("registration key `{0}` contains invalid characters (allowed: A-Z, 0-9, _)")]
    InvalidChars(String),
}

/// Validate a registration key: non-empty, uppercase ASCII letters, digits,
/// and underscores only.
pub fn validate_key(key: &str) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(KeyError::InvalidChars(key.to_owned()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Event grammar
// ---------------------------------------------------------------------------

/// The operation part of an event type, after the key prefix is stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Wholesale state assignment (both directions).
    Set,
    /// Client request for an immediate full `SET`.
    Get,
    /// RFC 6902 delta (both directions).
    Patch,
    /// Invoke a short sequential action.
    Action(String),
    /// Spawn a long-running task.
    TaskStart(String),
    /// Cancel a running task.
    TaskCancel(String),
    /// Server notification that a task terminated.
    TaskDone(String),
    /// The next binary frame carries this field's payload.
    BinMeta(String),
    /// Handler or validation failure report.
    Error(Option<String>),
}

/// A fully parsed event type: registration key plus operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventName {
    pub key: String,
    pub kind: EventKind,
}

impl EventName {
    pub fn new(key: impl Into<String>, kind: EventKind) -> Self {
        Self {
            key: key.into(),
            kind,
        }
    }

    /// Parse `K:OP` / `K:OP:NAME` event strings.
    ///
    /// Returns `None` for anything outside the grammar: bad key, unknown
    /// operation, missing or extra segments.
    pub fn parse(event: &str) -> Option<Self> {
        let mut parts = event.splitn(3, ':');
        let key = parts.next()?;
        validate_key(key).ok()?;
        let op = parts.next()?;
        let name = parts.next();

        let kind = match (op, name) {
            ("SET", None) => EventKind::Set,
            ("GET", None) => EventKind::Get,
            ("PATCH", None) => EventKind::Patch,
            ("ACTION", Some(n)) if !n.is_empty() => EventKind::Action(n.to_owned()),
            ("TASK_START", Some(n)) if !n.is_empty() => EventKind::TaskStart(n.to_owned()),
            ("TASK_CANCEL", Some(n)) if !n.is_empty() => EventKind::TaskCancel(n.to_owned()),
            ("TASK_DONE", Some(n)) if !n.is_empty() => EventKind::TaskDone(n.to_owned()),
            ("BIN_META", Some(n)) if !n.is_empty() => EventKind::BinMeta(n.to_owned()),
            ("ERROR", None) => EventKind::Error(None),
            ("ERROR", Some(n)) if !n.is_empty() => EventKind::Error(Some(n.to_owned())),
            _ => return None,
        };
        Some(Self {
            key: key.to_owned(),
            kind,
        })
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            EventKind::Set => write!(f, "{}:SET", self.key),
            EventKind::Get => write!(f, "{}:GET", self.key),
            EventKind::Patch => write!(f, "{}:PATCH", self.key),
            EventKind::Action(n) => write!(f, "{}:ACTION:{}", self.key, n),
            EventKind::TaskStart(n) => write!(f, "{}:TASK_START:{}", self.key, n),
            EventKind::TaskCancel(n) => write!(f, "{}:TASK_CANCEL:{}", self.key, n),
            EventKind::TaskDone(n) => write!(f, "{}:TASK_DONE:{}", self.key, n),
            EventKind::BinMeta(n) => write!(f, "{}:BIN_META:{}", self.key, n),
            EventKind::Error(None) => write!(f, "{}:ERROR", self.key),
            EventKind::Error(Some(n)) => write!(f, "{}:ERROR:{}", self.key, n),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

/// Metadata for a paired binary transfer.
///
/// Sent as the `data` of a `BIN_META` envelope; the next binary frame on the
/// same transport carries `size` bytes of payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinMeta {
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

/// Terminal classification of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Error,
}

/// `data` of a `TASK_DONE` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDone {
    pub outcome: TaskOutcome,
    /// Safe error description; present only when `outcome` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `data` of an `ERROR` envelope.
///
/// `path` is an RFC 6901 pointer to the offending field for validation
/// failures; absent for handler errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

// ---------------------------------------------------------------------------
// Name casing
// ---------------------------------------------------------------------------

/// `first_name` -> `firstName`.  Used for the opt-in camelCase transform on
/// projected field names and, when enabled, on action/task names.
pub fn to_lower_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// `add_note` -> `ADD_NOTE`.  Default casing for action and task names
/// derived from method names.
pub fn to_upper_snake(name: &str) -> String {
    name.to_ascii_uppercase()
}
