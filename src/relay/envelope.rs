//! Wire envelope shared by initiators and responders.
//!
//! Every frame is a JSON object discriminated by `type`:
//! `cmd` (initiator → responder), `result` and `event` (responder → initiator).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code: malformed JSON or unknown envelope type.
pub const ERROR_CODE_INVALID_ENVELOPE: &str = "invalid_envelope";
/// Error code: envelope kind not accepted on this connection role.
pub const ERROR_CODE_UNEXPECTED_ENVELOPE: &str = "unexpected_envelope";

/// Action name an initiator uses to cancel an in-flight command.
pub const CANCEL_ACTION: &str = "cancel";

/// Event name a relay uses for stream chunks sent to initiators.
pub const CHUNK_EVENT: &str = "chunk";

/// Event name that terminates a stream regardless of its payload.
pub const STREAM_END_EVENT: &str = "end";

/// A relay frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// A command to be executed by the responder.
    #[serde(rename = "cmd")]
    Command(Command),
    /// The final answer to a command.
    #[serde(rename = "result")]
    Result(CommandResult),
    /// A stream chunk or an uncorrelated notification.
    #[serde(rename = "event")]
    Event(EventMessage),
}

impl Envelope {
    /// Correlation id carried by the frame.
    pub fn id(&self) -> &str {
        match self {
            Self::Command(c) => &c.id,
            Self::Result(r) => &r.id,
            Self::Event(e) => &e.id,
        }
    }

    /// Parse a frame from JSON text.
    ///
    /// # Errors
    ///
    /// Returns the serde error for malformed JSON, unknown `type` values or
    /// missing required fields.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serialize the frame to JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error only if a payload value cannot be serialized.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// `cmd` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Correlation id, unique among the session's in-flight commands.
    pub id: String,
    /// Action name, e.g. `read_file`.
    pub action: String,
    /// Action arguments.
    #[serde(default = "empty_object")]
    pub args: Value,
    /// Whether the responder answers with a stream of chunks.
    #[serde(default, skip_serializing_if = "is_false")]
    pub stream: bool,
}

impl Command {
    /// Build a one-shot command.
    pub fn new(id: impl Into<String>, action: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            args,
            stream: false,
        }
    }

    /// Mark the command as streaming.
    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Token cost charged against the rate limiter (`args.max_tokens`, or 0).
    pub fn token_cost(&self) -> u64 {
        self.args
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// String argument by name.
    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }
}

/// Result status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// The command succeeded; `data` holds the payload.
    Ok,
    /// The command failed; `error` describes why.
    Error,
}

/// Error body of a failed result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// `result` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Id of the command this answers.
    pub id: String,
    /// Success or failure.
    pub status: ResultStatus,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl CommandResult {
    /// Successful result.
    pub fn ok(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            status: ResultStatus::Ok,
            data: Some(data),
            error: None,
        }
    }

    /// Failed result.
    pub fn error(
        id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            status: ResultStatus::Error,
            data: None,
            error: Some(RemoteError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Convert into the outcome handed to a one-shot caller.
    pub fn into_outcome(self) -> CommandOutcome {
        match self.status {
            ResultStatus::Ok => CommandOutcome::Ok(self.data.unwrap_or(Value::Null)),
            ResultStatus::Error => CommandOutcome::Error(self.error.unwrap_or(RemoteError {
                code: "unknown".to_owned(),
                message: "responder reported an error without details".to_owned(),
            })),
        }
    }
}

/// `event` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Correlation id (stream chunks) or notification id.
    pub id: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

impl EventMessage {
    /// Build an event frame.
    pub fn new(id: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            event: event.into(),
            data,
        }
    }

    /// Whether this chunk ends its stream: a non-null `finish_reason`
    /// in the payload, or the `end` event.
    pub fn is_terminal(&self) -> bool {
        self.event == STREAM_END_EVENT
            || self
                .data
                .get("finish_reason")
                .is_some_and(|reason| !reason.is_null())
    }
}

/// What a one-shot caller receives when the responder answers.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// `status: "ok"` with its payload.
    Ok(Value),
    /// `status: "error"` with its error body.
    Error(RemoteError),
}
