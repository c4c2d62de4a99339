//! Typed records carried on the wire.

use crate::commands::SUMMARY_STATE_EVENT;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Command, event and telemetry parameters.
///
/// A `BTreeMap` keeps key order stable so encoded messages are reproducible.
pub type Parameters = BTreeMap<String, serde_json::Value>;

/// Token linking an issued command to its replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    /// Wrap a raw id.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw id.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The id that follows this one.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `category` field of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Cmd,
    Ack,
    Noack,
    Complete,
    Failed,
    ErrorCode,
    Evt,
    Tel,
}

impl Category {
    /// Parse the wire name of a category.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "cmd" => Some(Category::Cmd),
            "ack" => Some(Category::Ack),
            "noack" => Some(Category::Noack),
            "complete" => Some(Category::Complete),
            "failed" => Some(Category::Failed),
            "error_code" => Some(Category::ErrorCode),
            "evt" => Some(Category::Evt),
            "tel" => Some(Category::Tel),
            _ => None,
        }
    }

    /// Wire name of this category.
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Cmd => "cmd",
            Category::Ack => "ack",
            Category::Noack => "noack",
            Category::Complete => "complete",
            Category::Failed => "failed",
            Category::ErrorCode => "error_code",
            Category::Evt => "evt",
            Category::Tel => "tel",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse operational state of the controlled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SummaryState {
    Standby,
    Disabled,
    Enabled,
    Fault,
    Offline,
}

impl SummaryState {
    /// Upper-case name used on the wire and in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            SummaryState::Standby => "STANDBY",
            SummaryState::Disabled => "DISABLED",
            SummaryState::Enabled => "ENABLED",
            SummaryState::Fault => "FAULT",
            SummaryState::Offline => "OFFLINE",
        }
    }

    /// Numeric code used by the SAL state enumeration.
    pub fn code(self) -> i64 {
        match self {
            SummaryState::Disabled => 1,
            SummaryState::Enabled => 2,
            SummaryState::Fault => 3,
            SummaryState::Offline => 4,
            SummaryState::Standby => 5,
        }
    }

    /// Parse a numeric SAL state code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(SummaryState::Disabled),
            2 => Some(SummaryState::Enabled),
            3 => Some(SummaryState::Fault),
            4 => Some(SummaryState::Offline),
            5 => Some(SummaryState::Standby),
            _ => None,
        }
    }

    /// Parse a state name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "STANDBY" => Some(SummaryState::Standby),
            "DISABLED" => Some(SummaryState::Disabled),
            "ENABLED" => Some(SummaryState::Enabled),
            "FAULT" => Some(SummaryState::Fault),
            "OFFLINE" => Some(SummaryState::Offline),
            _ => None,
        }
    }

    /// Parse a state from either its name or its numeric code.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(name) => Self::from_name(name),
            serde_json::Value::Number(n) => n.as_i64().and_then(Self::from_code),
            _ => None,
        }
    }
}

impl fmt::Display for SummaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SummaryState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SummaryState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_value(&value)
            .ok_or_else(|| D::Error::custom(format!("invalid summary state: {value}")))
    }
}

/// Command sent to the remote controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub correlation_id: CorrelationId,
    #[serde(default)]
    pub parameters: Parameters,
}

impl Command {
    /// Create a command without parameters.
    pub fn new(name: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self {
            name: name.into(),
            correlation_id,
            parameters: Parameters::new(),
        }
    }

    /// Create a command with parameters.
    pub fn with_parameters(
        name: impl Into<String>,
        correlation_id: CorrelationId,
        parameters: Parameters,
    ) -> Self {
        Self {
            name: name.into(),
            correlation_id,
            parameters,
        }
    }
}

/// Which reply category a [`Reply`] arrived as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReplyKind {
    #[default]
    Ack,
    Noack,
    Complete,
    Failed,
    ErrorCode,
}

impl ReplyKind {
    /// Category this reply kind is sent as.
    pub fn category(self) -> Category {
        match self {
            ReplyKind::Ack => Category::Ack,
            ReplyKind::Noack => Category::Noack,
            ReplyKind::Complete => Category::Complete,
            ReplyKind::Failed => Category::Failed,
            ReplyKind::ErrorCode => Category::ErrorCode,
        }
    }
}

/// Reply from the remote controller to an issued command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(skip)]
    pub kind: ReplyKind,
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl Reply {
    fn new(kind: ReplyKind, correlation_id: CorrelationId, message: Option<String>) -> Self {
        Self {
            kind,
            correlation_id,
            message,
            code: None,
        }
    }

    pub fn ack(correlation_id: CorrelationId) -> Self {
        Self::new(ReplyKind::Ack, correlation_id, None)
    }

    pub fn noack(correlation_id: CorrelationId, reason: Option<String>) -> Self {
        Self::new(ReplyKind::Noack, correlation_id, reason)
    }

    pub fn complete(correlation_id: CorrelationId) -> Self {
        Self::new(ReplyKind::Complete, correlation_id, None)
    }

    pub fn failed(correlation_id: CorrelationId, reason: Option<String>) -> Self {
        Self::new(ReplyKind::Failed, correlation_id, reason)
    }

    pub fn error_code(correlation_id: CorrelationId, code: i64, description: &str) -> Self {
        Self {
            kind: ReplyKind::ErrorCode,
            correlation_id,
            message: Some(description.to_string()),
            code: Some(code),
        }
    }

    /// The outcome this reply reports for its command.
    ///
    /// An `error_code` reply is a terminal failure whose message carries
    /// the code.
    pub fn outcome(&self) -> CommandOutcome {
        match self.kind {
            ReplyKind::Ack => CommandOutcome::new(CommandStatus::Ack, self.message.clone()),
            ReplyKind::Noack => CommandOutcome::new(CommandStatus::Noack, self.message.clone()),
            ReplyKind::Complete => CommandOutcome::new(CommandStatus::Complete, self.message.clone()),
            ReplyKind::Failed => CommandOutcome::new(CommandStatus::Failed, self.message.clone()),
            ReplyKind::ErrorCode => {
                let message = match (self.code, self.message.as_deref()) {
                    (Some(code), Some(description)) => format!("error code {code}: {description}"),
                    (Some(code), None) => format!("error code {code}"),
                    (None, Some(description)) => description.to_string(),
                    (None, None) => "error code reply without details".to_string(),
                };
                CommandOutcome::failed(message)
            }
        }
    }
}

/// Progress of a command as reported by the remote controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandStatus {
    /// Accepted for execution.
    Ack,
    /// Rejected before execution (bad name or parameters).
    Noack,
    /// Executed successfully.
    Complete,
    /// Execution failed.
    Failed,
}

impl CommandStatus {
    /// Only COMPLETE and FAILED end a command.
    pub fn is_terminal(self) -> bool {
        match self {
            CommandStatus::Ack | CommandStatus::Noack => false,
            CommandStatus::Complete | CommandStatus::Failed => true,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandStatus::Ack => "ACK",
            CommandStatus::Noack => "NOACK",
            CommandStatus::Complete => "COMPLETE",
            CommandStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Status plus optional human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    pub message: Option<String>,
}

impl CommandOutcome {
    pub fn new(status: CommandStatus, message: Option<String>) -> Self {
        Self { status, message }
    }

    pub fn complete() -> Self {
        Self::new(CommandStatus::Complete, None)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(CommandStatus::Failed, Some(message.into()))
    }

    /// True for a COMPLETE outcome.
    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Complete
    }
}

/// Discrete event emitted by the remote controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub sequence_number: u64,
}

impl Event {
    pub fn new(name: impl Into<String>, parameters: Parameters, sequence_number: u64) -> Self {
        Self {
            name: name.into(),
            parameters,
            sequence_number,
        }
    }

    /// Build a summary-state event, optionally carrying a fault cause.
    pub fn summary_state(state: SummaryState, cause: Option<&str>, sequence_number: u64) -> Self {
        let mut parameters = Parameters::new();
        parameters.insert(
            "state".to_string(),
            serde_json::Value::String(state.as_str().to_string()),
        );
        if let Some(cause) = cause {
            parameters.insert(
                "cause".to_string(),
                serde_json::Value::String(cause.to_string()),
            );
        }
        Self::new(SUMMARY_STATE_EVENT, parameters, sequence_number)
    }

    /// The state reported by a summary-state event.
    ///
    /// `None` for other events, and for summary-state events whose `state`
    /// is missing or invalid.
    pub fn reported_summary_state(&self) -> Option<SummaryState> {
        if self.name != SUMMARY_STATE_EVENT {
            return None;
        }
        self.parameters.get("state").and_then(SummaryState::from_value)
    }

    /// Fetch a string parameter.
    pub fn str_parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

/// Telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub topic: String,
    #[serde(default)]
    pub parameters: Parameters,
    /// Seconds since the Unix epoch, as stamped by the producer.
    pub timestamp: f64,
}

impl TelemetryFrame {
    pub fn new(topic: impl Into<String>, parameters: Parameters, timestamp: f64) -> Self {
        Self {
            topic: topic.into(),
            parameters,
            timestamp,
        }
    }
}

/// A decoded message of any category.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command(Command),
    Reply(Reply),
    Event(Event),
    Telemetry(TelemetryFrame),
}

impl Message {
    /// Category this message is sent as.
    pub fn category(&self) -> Category {
        match self {
            Message::Command(_) => Category::Cmd,
            Message::Reply(reply) => reply.kind.category(),
            Message::Event(_) => Category::Evt,
            Message::Telemetry(_) => Category::Tel,
        }
    }
}
