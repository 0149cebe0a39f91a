//! Input messages and published notifications
//! One JSON object per line in both directions. Input that does not match
//! the expected shape is dropped, never an error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Slack allowed on future-dated message timestamps.
pub const FUTURE_MARGIN: i64 = 5 * 60;

/// The fields of a monitoring message the tracker reads. Everything else
/// on the line is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub time: i64,
    pub aspect: String,
    pub location: Map<String, Value>,
    #[serde(default)]
    pub interval: Option<i64>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
}

impl Message {
    /// Parse one input line; anything malformed is `None`.
    ///
    /// The location must be an object of string tags.
    pub fn parse(line: &str) -> Option<Message> {
        Message::from_value(serde_json::from_str(line).ok()?)
    }

    /// Extract a message from already-decoded JSON. The main loop decodes
    /// lines itself so it can tell invalid JSON (fatal for stdin) apart
    /// from a well-formed object that is not a monitoring message
    /// (silently dropped).
    pub fn from_value(value: Value) -> Option<Message> {
        let message: Message = serde_json::from_value(value).ok()?;
        if message.location.values().any(|v| !v.is_string()) {
            return None;
        }
        Some(message)
    }
}

/// Internal per-flow status. Flapping is derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Missing,
}

/// Severity carried inside a published info object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoSeverity {
    Expected,
    Warning,
    Error,
}

/// The published `info` object of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusInfo {
    Ok {
        state: String,
        severity: InfoSeverity,
    },
    Degraded {
        state: String,
        severity: InfoSeverity,
    },
    Flapping {
        window: u32,
        changes: u32,
    },
    Missing {
        last_seen: i64,
    },
}

/// Map a message's state and severity onto a status and the info object
/// that would be published for it.
///
/// `warning_expected` turns warnings into an ok status instead of a
/// degradation. Unrecognized severities count as errors.
pub fn classify(state: &str, severity: Option<&str>, warning_expected: bool) -> (Status, StatusInfo) {
    match severity {
        None | Some("expected") => (
            Status::Ok,
            StatusInfo::Ok {
                state: state.to_string(),
                severity: InfoSeverity::Expected,
            },
        ),
        Some("warning") if warning_expected => (
            Status::Ok,
            StatusInfo::Ok {
                state: state.to_string(),
                severity: InfoSeverity::Warning,
            },
        ),
        Some("warning") => (
            Status::Error,
            StatusInfo::Degraded {
                state: state.to_string(),
                severity: InfoSeverity::Warning,
            },
        ),
        Some(_) => (
            Status::Error,
            StatusInfo::Degraded {
                state: state.to_string(),
                severity: InfoSeverity::Error,
            },
        ),
    }
}

/// Identity of a stream: the aspect plus the canonical JSON rendering of
/// its location object (sorted keys, no whitespace).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId {
    pub aspect: String,
    pub location: String,
}

impl FlowId {
    pub fn new(aspect: &str, location: &Map<String, Value>) -> FlowId {
        // serde_json's map is ordered by key, so this is already the
        // canonical form
        FlowId {
            aspect: aspect.to_string(),
            location: Value::Object(location.clone()).to_string(),
        }
    }

    pub fn location_object(&self) -> Map<String, Value> {
        serde_json::from_str(&self.location).unwrap_or_default()
    }
}

/// One emitted notification line.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub time: i64,
    pub aspect: String,
    pub location: Map<String, Value>,
    pub info: StatusInfo,
    pub previous: Option<StatusInfo>,
}
