use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// How a delta names its source: a small integer index into the Meta event's
/// source list, or a textual id for sources registered after Meta went out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceRef {
    Index(usize),
    Id(String),
}

impl From<usize> for SourceRef {
    fn from(i: usize) -> Self {
        SourceRef::Index(i)
    }
}

impl From<&str> for SourceRef {
    fn from(s: &str) -> Self {
        SourceRef::Id(s.to_string())
    }
}

/// Incremental payload of a delta — plain text or structured JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeltaPayload {
    Text(String),
    Json(Value),
}

impl DeltaPayload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DeltaPayload::Text(s) => Some(s),
            DeltaPayload::Json(_) => None,
        }
    }
}

/// An advisory status event shown in the client UI alongside the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,
}

impl StatusEvent {
    /// An in-progress status with the given id and summary.
    pub fn running(id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            summary: summary.into(),
            message: None,
            icon: None,
            in_progress: true,
            animated: Some(true),
            sticky: None,
            data_source: None,
        }
    }

    /// The matching terminal status for a previously running id.
    pub fn done(id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            summary: summary.into(),
            message: None,
            icon: None,
            in_progress: false,
            animated: None,
            sticky: None,
            data_source: None,
        }
    }
}

/// Canonical stream event union. Everything the gateway sends downstream is
/// one of these, encoded as a newline-terminated `data: <JSON>\n` record.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Sent exactly once before any delta; carries the index → source-id map.
    Meta { sources: Vec<String> },
    /// One incremental chunk of output from a named source.
    Delta {
        source: SourceRef,
        payload: DeltaPayload,
    },
    /// Advisory progress information.
    Status(StatusEvent),
    /// A named state patch pushed to the client (citations panel, pending
    /// client-side tool calls, assistant routing info).
    State(serde_json::Map<String, Value>),
    /// Single terminal result for non-streaming workflows.
    Result { value: Value },
    /// A source (or, with no source, the whole stream) has finished.
    End { source: Option<SourceRef> },
    /// Fatal for the stream.
    Error { status_code: u16, status_text: String },
}

impl StreamEvent {
    pub fn state_patch(key: impl Into<String>, value: Value) -> Self {
        let mut map = serde_json::Map::new();
        map.insert(key.into(), value);
        StreamEvent::State(map)
    }

    pub fn end() -> Self {
        StreamEvent::End { source: None }
    }

    /// The JSON body of the wire record (without the `data: ` framing).
    pub fn to_json(&self) -> Value {
        match self {
            StreamEvent::Meta { sources } => json!({ "s": sources }),
            StreamEvent::Delta { source, payload } => json!({ "s": source, "d": payload }),
            StreamEvent::Status(st) => json!({ "st": st }),
            StreamEvent::State(patch) => json!({ "state": patch }),
            StreamEvent::Result { value } => json!({ "result": value }),
            StreamEvent::End { source: None } => json!({ "type": "end" }),
            StreamEvent::End { source: Some(s) } => json!({ "type": "end", "s": s }),
            StreamEvent::Error {
                status_code,
                status_text,
            } => json!({
                "type": "error",
                "status_code": status_code,
                "status_text": status_text,
            }),
        }
    }

    /// Newline-terminated SSE record.
    pub fn to_wire(&self) -> String {
        format!("data: {}\n", self.to_json())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::End { source: None } | StreamEvent::Error { .. }
        )
    }
}
